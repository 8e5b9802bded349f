use crate::broadcast::EventBroadcaster;
use crate::config::PollerConfig;
use crate::driver::{AutomationDriver, Selector};
use crate::errors::{DriverError, Result};
use crate::navigation::bounded;
use crate::parser;
use crate::session::SessionStatus;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What a single sampling tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// New content was classified and broadcast.
    Published,
    /// Text identical to the previous sample.
    Unchanged,
    /// The widget was emptied.
    Cleared,
    /// The read failed; the snapshot was left alone.
    Skipped,
    /// The page or browser is gone.
    Fatal(String),
}

/// Samples the serial monitor widget and forwards changes to the
/// broadcaster.
pub struct SerialPoller<D: AutomationDriver> {
    driver: Arc<D>,
    handle: Arc<D::Handle>,
    selector: Selector,
    config: PollerConfig,
    broadcaster: EventBroadcaster,
    status: Arc<SessionStatus>,
    snapshot: String,
}

impl<D: AutomationDriver> SerialPoller<D> {
    pub fn new(
        driver: Arc<D>,
        handle: Arc<D::Handle>,
        selector: Selector,
        config: PollerConfig,
        broadcaster: EventBroadcaster,
        status: Arc<SessionStatus>,
    ) -> Self {
        Self {
            driver,
            handle,
            selector,
            config,
            broadcaster,
            status,
            snapshot: String::new(),
        }
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    /// Sample until `stop` is raised or the session leaves `Monitoring`.
    ///
    /// `stop` is only looked at between ticks, so a read in progress always
    /// finishes first.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.config.interval_ms, selector = %self.selector, "Serial poller started");

        loop {
            let sender_gone = tokio::select! {
                _ = ticker.tick() => false,
                changed = stop.changed() => changed.is_err(),
            };
            if sender_gone || *stop.borrow() {
                debug!("Stop signal received");
                break;
            }
            if !self.status.state().is_monitoring() {
                debug!("Session left monitoring state");
                break;
            }

            if let TickOutcome::Fatal(reason) = self.tick().await {
                error!(error = %reason, "Monitor page closed, failing session");
                if self.status.fail_if_monitoring(&reason) {
                    if let Err(err) = self.driver.close(&*self.handle).await {
                        warn!(error = %err, "Failed to release browser after target closed");
                    }
                }
                break;
            }
        }

        info!("Serial poller stopped");
    }

    /// Take one sample and publish it if it changed.
    pub async fn tick(&mut self) -> TickOutcome {
        match self.sample().await {
            Ok(text) => {
                self.status.record_sample(Utc::now());
                self.observe(text)
            }
            Err(err) if err.is_fatal() => TickOutcome::Fatal(err.to_string()),
            Err(err) => {
                warn!(error = %err, "Skipping serial sample");
                TickOutcome::Skipped
            }
        }
    }

    async fn sample(&self) -> Result<String> {
        let timeout = self.config.read_timeout();
        bounded(timeout, async {
            let element = self
                .driver
                .wait_for_element(&*self.handle, &self.selector, timeout)
                .await?;
            self.driver.read_text(&element).await
        })
        .await
        .map_err(DriverError::into_sampling_error)
    }

    fn observe(&mut self, text: String) -> TickOutcome {
        if text == self.snapshot {
            return TickOutcome::Unchanged;
        }

        if text.is_empty() {
            self.snapshot.clear();
            debug!("Serial output cleared");
            return TickOutcome::Cleared;
        }

        let content = new_content(&self.snapshot, &text).to_string();
        self.snapshot = text;

        let event = parser::parse(&content);
        debug!(kind = event.kind(), "New serial output");
        self.status.record_published();
        let delivered = self.broadcaster.publish(event);
        debug!(delivered, "Serial event broadcast");
        TickOutcome::Published
    }
}

/// The part of `current` not already seen in `previous`.
///
/// The widget normally only grows, in which case just the appended lines are
/// new. Anything else (scrollback trimmed, widget reset, only line breaks
/// appended) counts as entirely new text.
fn new_content<'a>(previous: &str, current: &'a str) -> &'a str {
    if !previous.is_empty() {
        if let Some(appended) = current.strip_prefix(previous) {
            let appended = appended.trim_matches(|c| c == '\r' || c == '\n');
            if !appended.is_empty() {
                return appended;
            }
        }
    }
    current
}
