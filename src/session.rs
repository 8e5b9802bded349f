//! The single bridge session: lifecycle, exclusivity and status.

use crate::broadcast::{EventBroadcaster, Subscription};
use crate::config::BridgeConfig;
use crate::driver::AutomationDriver;
use crate::errors::{BridgeError, Result};
use crate::navigation::NavigationStateMachine;
use crate::poller::SerialPoller;
use crate::steps::StepVars;
use crate::types::{CommandOutcome, SessionState, StatusReport};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

/// Shared, lock-protected view of the session used by `status()`.
///
/// Critical sections are short and never span an `.await`.
#[derive(Default)]
pub struct SessionStatus {
    inner: Mutex<StatusInner>,
}

#[derive(Default)]
struct StatusInner {
    state: SessionState,
    session_id: Option<Uuid>,
    connected_at: Option<DateTime<Utc>>,
    last_sample_at: Option<DateTime<Utc>>,
    events_published: u64,
}

impl SessionStatus {
    pub fn state(&self) -> SessionState {
        self.inner.lock().state.clone()
    }

    pub fn set_state(&self, state: SessionState) {
        self.inner.lock().state = state;
    }

    /// Start a fresh session record in `Launching`.
    pub fn begin(&self, session_id: Uuid) {
        let mut inner = self.inner.lock();
        *inner = StatusInner {
            state: SessionState::Launching,
            session_id: Some(session_id),
            ..StatusInner::default()
        };
    }

    pub fn mark_connected(&self, at: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.state = SessionState::Monitoring;
        inner.connected_at = Some(at);
    }

    pub fn record_sample(&self, at: DateTime<Utc>) {
        self.inner.lock().last_sample_at = Some(at);
    }

    pub fn record_published(&self) {
        self.inner.lock().events_published += 1;
    }

    /// Move `Monitoring` to `Failed`. Returns false when the session was
    /// already elsewhere, e.g. being torn down by `disconnect`.
    pub fn fail_if_monitoring(&self, reason: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_monitoring() {
            inner.state = SessionState::Failed {
                reason: reason.to_string(),
            };
            true
        } else {
            false
        }
    }

    pub fn reset(&self) {
        *self.inner.lock() = StatusInner::default();
    }

    pub fn report(&self) -> StatusReport {
        let inner = self.inner.lock();
        StatusReport {
            state: inner.state.clone(),
            connected: inner.state.is_monitoring(),
            session_id: inner.session_id,
            connected_at: inner.connected_at,
            last_sample_at: inner.last_sample_at,
            events_published: inner.events_published,
        }
    }
}

struct ActiveSession<D: AutomationDriver> {
    id: Uuid,
    handle: Arc<D::Handle>,
    poller: Option<PollerTask>,
}

struct PollerTask {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the one allowed bridge session.
///
/// `connect` and `disconnect` are serialized by a lifecycle lock; `status`
/// only touches [`SessionStatus`] and never waits on them.
pub struct SessionOrchestrator<D: AutomationDriver> {
    driver: Arc<D>,
    config: Arc<BridgeConfig>,
    broadcaster: EventBroadcaster,
    status: Arc<SessionStatus>,
    lifecycle: tokio::sync::Mutex<Option<ActiveSession<D>>>,
    abort: Mutex<Option<watch::Sender<bool>>>,
}

impl<D: AutomationDriver> SessionOrchestrator<D> {
    pub fn new(driver: D, config: BridgeConfig) -> Self {
        Self {
            driver: Arc::new(driver),
            config: Arc::new(config),
            broadcaster: EventBroadcaster::new(),
            status: Arc::new(SessionStatus::default()),
            lifecycle: tokio::sync::Mutex::new(None),
            abort: Mutex::new(None),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    /// Listen for serial events published from now on.
    pub fn subscribe(&self) -> Subscription {
        self.broadcaster.subscribe()
    }

    pub fn status(&self) -> StatusReport {
        self.status.report()
    }

    /// Launch a browser, walk the editor to the serial monitor and start
    /// sampling.
    ///
    /// This is slow: it can take as long as every step timeout plus every
    /// retry delay in the step table. Fails fast with
    /// [`BridgeError::AlreadyConnected`] while another session is live or a
    /// connect/disconnect is in flight.
    pub async fn connect(&self) -> Result<Uuid> {
        let mut slot = self
            .lifecycle
            .try_lock()
            .map_err(|_| BridgeError::AlreadyConnected)?;
        if !self.status.state().accepts_connect() {
            return Err(BridgeError::AlreadyConnected);
        }
        if let Some(stale) = slot.take() {
            info!(session_id = %stale.id, "Releasing resources of failed session");
            self.teardown(stale).await;
        }

        let session_id = Uuid::new_v4();
        let (abort_tx, mut abort_rx) = watch::channel(false);
        *self.abort.lock() = Some(abort_tx);
        self.status.begin(session_id);

        let span = tracing::info_span!("session", %session_id);
        let result = self
            .establish(session_id, &mut abort_rx)
            .instrument(span)
            .await;
        self.abort.lock().take();

        match result {
            Ok(session) => {
                *slot = Some(session);
                Ok(session_id)
            }
            Err(BridgeError::Aborted) => {
                info!(%session_id, "Connect aborted by disconnect");
                self.status.reset();
                Err(BridgeError::Aborted)
            }
            Err(err) => {
                error!(%session_id, error = %err, "Connect failed");
                self.status.set_state(SessionState::Failed {
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn establish(
        &self,
        session_id: Uuid,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<ActiveSession<D>> {
        info!("Launching browser");
        let handle = self
            .driver
            .launch(&self.config.browser)
            .await
            .map_err(|e| BridgeError::LaunchFailed(e.to_string()))?;
        let handle = Arc::new(handle);

        let vars = StepVars::from_config(&self.config);
        let navigation = NavigationStateMachine::new(
            self.driver.as_ref(),
            &self.config.steps,
            &self.config.navigation,
            &vars,
            &self.status,
        );
        if let Err(err) = navigation.run(&*handle, abort).await {
            self.release(&*handle).await;
            return Err(err);
        }

        self.status.mark_connected(Utc::now());
        info!("Monitoring serial output");

        let (stop, stop_rx) = watch::channel(false);
        let poller = SerialPoller::new(
            Arc::clone(&self.driver),
            Arc::clone(&handle),
            self.config.steps.output_selector.clone(),
            self.config.poller.clone(),
            self.broadcaster.clone(),
            Arc::clone(&self.status),
        );
        let task = tokio::spawn(
            poller
                .run(stop_rx)
                .instrument(tracing::info_span!("poller", %session_id)),
        );

        Ok(ActiveSession {
            id: session_id,
            handle,
            poller: Some(PollerTask { stop, task }),
        })
    }

    /// Stop sampling, release the browser and return to `Idle`.
    ///
    /// Safe to call in any state. An in-flight `connect` is aborted first.
    /// Returns [`BridgeError::NotConnected`] when there was nothing to tear
    /// down; state is `Idle` afterwards either way.
    pub async fn disconnect(&self) -> Result<()> {
        let interrupted = match self.abort.lock().as_ref() {
            Some(abort) => abort.send(true).is_ok(),
            None => false,
        };

        let mut slot = self.lifecycle.lock().await;
        let had_session =
            interrupted || slot.is_some() || !matches!(self.status.state(), SessionState::Idle);

        if let Some(session) = slot.take() {
            self.status.set_state(SessionState::Disconnecting);
            info!(session_id = %session.id, "Disconnecting");
            self.teardown(session).await;
        }
        self.status.reset();

        if had_session {
            info!("Disconnected successfully");
            Ok(())
        } else {
            Err(BridgeError::NotConnected)
        }
    }

    async fn teardown(&self, mut session: ActiveSession<D>) {
        if let Some(poller) = session.poller.take() {
            let _ = poller.stop.send(true);
            if let Err(err) = poller.task.await {
                warn!(error = %err, "Serial poller task ended abnormally");
            }
        }
        self.release(&*session.handle).await;
    }

    async fn release(&self, handle: &D::Handle) {
        if let Err(err) = self.driver.close(handle).await {
            warn!(error = %err, "Failed to release browser");
        }
    }

    /// [`connect`](Self::connect) as a `{success, message}` payload.
    pub async fn connect_outcome(&self) -> CommandOutcome {
        match self.connect().await {
            Ok(_) => CommandOutcome::success("Connected successfully"),
            Err(err) => CommandOutcome::failure(err.to_string()),
        }
    }

    /// [`disconnect`](Self::disconnect) as a `{success, message}` payload.
    /// Disconnecting with nothing connected still succeeds.
    pub async fn disconnect_outcome(&self) -> CommandOutcome {
        match self.disconnect().await {
            Ok(()) => CommandOutcome::success("Disconnected successfully"),
            Err(BridgeError::NotConnected) => CommandOutcome::success("Not connected"),
            Err(err) => CommandOutcome::failure(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DriverError;
    use crate::testing::ScriptedDriver;
    use crate::types::SerialEvent;
    use std::time::Duration;

    fn orchestrator(driver: ScriptedDriver) -> Arc<SessionOrchestrator<ScriptedDriver>> {
        let mut config = BridgeConfig::default();
        config.device.sketch_id = "sketch-1".to_string();
        Arc::new(SessionOrchestrator::new(driver, config))
    }

    #[tokio::test(start_paused = true)]
    async fn connect_reaches_monitoring_and_streams_events() {
        let driver = ScriptedDriver::new();
        driver.push_text("Enrolled fingerprint ID: 9");
        let bridge = orchestrator(driver);
        let mut events = bridge.subscribe();

        let session_id = tokio_test::assert_ok!(bridge.connect().await);

        let report = bridge.status();
        assert_eq!(report.state, SessionState::Monitoring);
        assert!(report.connected);
        assert_eq!(report.session_id, Some(session_id));

        let event = events.recv().await.unwrap();
        assert!(matches!(event, SerialEvent::Enrollment { ref id, .. } if id == "9"));
        assert!(bridge.status().last_sample_at.is_some());

        tokio_test::assert_ok!(bridge.disconnect().await);
    }

    #[tokio::test(start_paused = true)]
    async fn second_connect_is_rejected() {
        let bridge = orchestrator(ScriptedDriver::new());
        let first = bridge.connect().await.unwrap();

        let second = bridge.connect().await;
        assert!(matches!(second, Err(BridgeError::AlreadyConnected)));

        let report = bridge.status();
        assert_eq!(report.state, SessionState::Monitoring);
        assert_eq!(report.session_id, Some(first));
        assert_eq!(bridge.driver().launches(), 1);
        assert_eq!(bridge.driver().closes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_connecting_is_rejected() {
        let bridge = orchestrator(ScriptedDriver::new().with_latency(Duration::from_millis(100)));

        let background = Arc::clone(&bridge);
        let first = tokio::spawn(async move { background.connect().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            bridge.connect().await,
            Err(BridgeError::AlreadyConnected)
        ));
        assert!(first.await.unwrap().is_ok());
        assert_eq!(bridge.driver().launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_navigation_fails_then_disconnect_recovers() {
        let driver = ScriptedDriver::new();
        driver.fail_always(
            "._x-small_wmean_200",
            DriverError::ElementNotFound("baud menu".to_string()),
        );
        let bridge = orchestrator(driver);

        let err = bridge.connect().await.unwrap_err();
        assert!(matches!(err, BridgeError::NavigationFailed { ref step, .. } if step == "select-baud-rate"));
        assert!(bridge.status().state.is_failed());
        assert_eq!(bridge.driver().closes(), 1);

        let outcome = bridge.disconnect_outcome().await;
        assert!(outcome.success);
        assert_eq!(bridge.status().state, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn target_closed_fails_without_retrying() {
        let driver = ScriptedDriver::new();
        driver.fail_times(
            "https://app.arduino.cc/sketches",
            DriverError::TargetClosed("browser killed".to_string()),
            1,
        );
        let bridge = orchestrator(driver);

        let started = tokio::time::Instant::now();
        let err = bridge.connect().await.unwrap_err();

        assert!(err.is_fatal());
        assert!(bridge.status().state.is_failed());
        assert_eq!(bridge.driver().lookups("https://app.arduino.cc/sketches"), 1);
        // no retry delay was slept
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(bridge.driver().closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failure_is_reported() {
        let driver = ScriptedDriver::new();
        driver.fail_launch(DriverError::Launch("chrome not found".to_string()));
        let bridge = orchestrator(driver);

        let outcome = bridge.connect_outcome().await;
        assert!(!outcome.success);
        assert!(outcome.message.starts_with("Failed to setup browser"));
        assert!(bridge.status().state.is_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_session_can_reconnect() {
        let driver = ScriptedDriver::new();
        driver.fail_times(
            "https://app.arduino.cc/login",
            DriverError::TargetClosed("crash".to_string()),
            1,
        );
        let bridge = orchestrator(driver);

        assert!(bridge.connect().await.is_err());
        assert!(bridge.connect().await.is_ok());
        assert_eq!(bridge.status().state, SessionState::Monitoring);
        assert_eq!(bridge.driver().launches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let bridge = orchestrator(ScriptedDriver::new());
        bridge.connect().await.unwrap();

        tokio_test::assert_ok!(bridge.disconnect().await);
        assert_eq!(bridge.status().state, SessionState::Idle);
        assert_eq!(bridge.driver().closes(), 1);

        assert!(matches!(
            bridge.disconnect().await,
            Err(BridgeError::NotConnected)
        ));
        assert_eq!(bridge.disconnect_outcome().await.message, "Not connected");
        assert_eq!(bridge.driver().closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_aborts_in_flight_connect() {
        let driver = ScriptedDriver::new();
        driver.fail_always(
            "._device-name_12ggg_205",
            DriverError::Timeout("picker hidden".to_string()),
        );
        let bridge = orchestrator(driver);

        let background = Arc::clone(&bridge);
        let connecting = tokio::spawn(async move { background.connect().await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        tokio_test::assert_ok!(bridge.disconnect().await);
        assert!(matches!(
            connecting.await.unwrap(),
            Err(BridgeError::Aborted)
        ));
        assert_eq!(bridge.status().state, SessionState::Idle);
        assert_eq!(bridge.driver().closes(), 1);
        assert_eq!(bridge.driver().lookups("._device-name_12ggg_205"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_page_while_monitoring_fails_session() {
        let driver = ScriptedDriver::new();
        driver.push_text("boot ok");
        driver.push_reading(Err(DriverError::TargetClosed("tab crashed".to_string())));
        let bridge = orchestrator(driver);

        bridge.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(bridge.status().state.is_failed());
        assert!(!bridge.status().connected);
        assert_eq!(bridge.driver().closes(), 1);

        tokio_test::assert_ok!(bridge.disconnect().await);
        assert_eq!(bridge.status().state, SessionState::Idle);
    }
}
