//! A scripted [`AutomationDriver`] for exercising the bridge without a
//! browser.

use crate::config::BrowserConfig;
use crate::driver::{AutomationDriver, Selector, WaitPolicy};
use crate::errors::{DriverError, DriverResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

#[derive(Debug)]
pub struct ScriptedHandle {
    pub id: u64,
}

#[derive(Debug)]
pub struct ScriptedElement {
    handle_id: u64,
    selector: String,
}

#[derive(Default)]
struct Script {
    launch_error: Option<DriverError>,
    fail_times: HashMap<String, VecDeque<DriverError>>,
    fail_always: HashMap<String, DriverError>,
    readings: VecDeque<DriverResult<String>>,
    last_reading: String,
    closed: HashSet<u64>,
    next_handle: u64,
    launches: usize,
    closes: usize,
    reads: usize,
    actions: Vec<String>,
}

/// Driver whose page is a script: failures are injected per selector or URL
/// and the monitor widget returns queued readings.
#[derive(Default)]
pub struct ScriptedDriver {
    script: Mutex<Script>,
    latency: Duration,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every navigation and element wait by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn fail_launch(&self, error: DriverError) {
        self.script.lock().launch_error = Some(error);
    }

    /// Fail the next `times` lookups of `key` (a selector or resolved URL).
    pub fn fail_times(&self, key: &str, error: DriverError, times: usize) {
        let mut script = self.script.lock();
        let queue = script.fail_times.entry(key.to_string()).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Fail every lookup of `key`.
    pub fn fail_always(&self, key: &str, error: DriverError) {
        self.script
            .lock()
            .fail_always
            .insert(key.to_string(), error);
    }

    /// Queue a reading for the monitor widget. Once the queue is empty the
    /// last successful reading repeats.
    pub fn push_reading(&self, reading: DriverResult<String>) {
        self.script.lock().readings.push_back(reading);
    }

    pub fn push_text(&self, text: &str) {
        self.push_reading(Ok(text.to_string()));
    }

    pub fn launches(&self) -> usize {
        self.script.lock().launches
    }

    pub fn closes(&self) -> usize {
        self.script.lock().closes
    }

    pub fn reads(&self) -> usize {
        self.script.lock().reads
    }

    pub fn actions(&self) -> Vec<String> {
        self.script.lock().actions.clone()
    }

    /// How many times `key` was looked up (navigated to or waited for).
    pub fn lookups(&self, key: &str) -> usize {
        let needle = format!(" {}", key);
        self.script
            .lock()
            .actions
            .iter()
            .filter(|a| {
                (a.starts_with("navigate") || a.starts_with("wait")) && a.ends_with(&needle)
            })
            .count()
    }

    fn check(&self, handle_id: u64, action: String, key: &str) -> DriverResult<()> {
        let mut script = self.script.lock();
        script.actions.push(action);

        if script.closed.contains(&handle_id) {
            return Err(DriverError::TargetClosed(format!(
                "handle {} was closed",
                handle_id
            )));
        }
        if let Some(err) = script.fail_always.get(key) {
            return Err(err.clone());
        }
        if let Some(err) = script.fail_times.get_mut(key).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(())
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl AutomationDriver for ScriptedDriver {
    type Handle = ScriptedHandle;
    type Element = ScriptedElement;

    async fn launch(&self, _config: &BrowserConfig) -> DriverResult<ScriptedHandle> {
        let mut script = self.script.lock();
        script.launches += 1;
        if let Some(err) = script.launch_error.clone() {
            return Err(err);
        }
        script.next_handle += 1;
        Ok(ScriptedHandle {
            id: script.next_handle,
        })
    }

    async fn navigate(
        &self,
        handle: &ScriptedHandle,
        url: &str,
        _wait: WaitPolicy,
    ) -> DriverResult<()> {
        self.pause().await;
        self.check(handle.id, format!("navigate {}", url), url)
    }

    async fn wait_for_navigation(
        &self,
        handle: &ScriptedHandle,
        _timeout: Duration,
    ) -> DriverResult<()> {
        self.check(handle.id, "settle navigation".to_string(), "")
    }

    async fn wait_for_element(
        &self,
        handle: &ScriptedHandle,
        selector: &Selector,
        _timeout: Duration,
    ) -> DriverResult<ScriptedElement> {
        self.pause().await;
        let key = selector.as_str();
        self.check(handle.id, format!("wait {}", key), key)?;
        Ok(ScriptedElement {
            handle_id: handle.id,
            selector: key.to_string(),
        })
    }

    async fn click(&self, element: &ScriptedElement) -> DriverResult<()> {
        self.check(
            element.handle_id,
            format!("click {}", element.selector),
            "",
        )
    }

    async fn type_text(&self, element: &ScriptedElement, text: &str) -> DriverResult<()> {
        self.check(
            element.handle_id,
            format!("type {} {}", element.selector, text),
            "",
        )
    }

    async fn press_key(&self, element: &ScriptedElement, key: &str) -> DriverResult<()> {
        self.check(
            element.handle_id,
            format!("press {} {}", element.selector, key),
            "",
        )
    }

    async fn read_text(&self, element: &ScriptedElement) -> DriverResult<String> {
        let mut script = self.script.lock();
        script.reads += 1;
        if script.closed.contains(&element.handle_id) {
            return Err(DriverError::TargetClosed("page is gone".to_string()));
        }
        match script.readings.pop_front() {
            Some(Ok(text)) => {
                script.last_reading = text.clone();
                Ok(text)
            }
            Some(Err(err)) => Err(err),
            None => Ok(script.last_reading.clone()),
        }
    }

    async fn close(&self, handle: &ScriptedHandle) -> DriverResult<()> {
        let mut script = self.script.lock();
        script.closes += 1;
        script.closed.insert(handle.id);
        Ok(())
    }
}
