use crate::config::NavigationConfig;
use crate::driver::{AutomationDriver, Selector};
use crate::errors::{BridgeError, DriverError, DriverResult, Result};
use crate::session::SessionStatus;
use crate::steps::{NavigationStep, StepAction, StepTable, StepVars};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Walks a [`StepTable`] on a live handle until the serial monitor is
/// streaming.
pub struct NavigationStateMachine<'a, D: AutomationDriver> {
    driver: &'a D,
    table: &'a StepTable,
    config: &'a NavigationConfig,
    vars: &'a StepVars,
    status: &'a SessionStatus,
}

impl<'a, D: AutomationDriver> NavigationStateMachine<'a, D> {
    pub fn new(
        driver: &'a D,
        table: &'a StepTable,
        config: &'a NavigationConfig,
        vars: &'a StepVars,
        status: &'a SessionStatus,
    ) -> Self {
        Self {
            driver,
            table,
            config,
            vars,
            status,
        }
    }

    /// Run every step in order.
    ///
    /// Transient failures retry the whole step after the configured delay,
    /// bounded per step by `max_attempts` and per call by
    /// `max_total_retries`. A closed target ends the walk at once. Raising
    /// `abort` stops the walk at the next suspension point with
    /// [`BridgeError::Aborted`].
    pub async fn run(&self, handle: &D::Handle, abort: &mut watch::Receiver<bool>) -> Result<()> {
        let mut retries_used = 0u32;

        for step in &self.table.steps {
            self.status.set_state(step.phase.into());
            info!(step = %step.name, table = %self.table.version, "Starting navigation step");

            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match abortable(abort, self.execute(handle, step)).await? {
                    Ok(()) => {
                        debug!(step = %step.name, attempt, "Navigation step completed");
                        break;
                    }
                    Err(err) if err.is_fatal() => {
                        error!(step = %step.name, error = %err, "Browser target closed during navigation");
                        return Err(err);
                    }
                    Err(err) => {
                        let last_error = err.to_string();
                        if attempt >= self.config.max_attempts
                            || retries_used >= self.config.max_total_retries
                        {
                            warn!(step = %step.name, attempt, error = %last_error, "Retry budget exhausted");
                            return Err(BridgeError::NavigationFailed {
                                step: step.name.clone(),
                                last_error,
                            });
                        }

                        retries_used += 1;
                        warn!(
                            step = %step.name,
                            attempt,
                            error = %last_error,
                            "Navigation step failed, retrying in {:?}",
                            self.config.retry_delay()
                        );
                        abortable(abort, tokio::time::sleep(self.config.retry_delay())).await?;
                    }
                }
            }
        }

        info!("Serial monitor reached");
        Ok(())
    }

    async fn execute(&self, handle: &D::Handle, step: &NavigationStep) -> Result<()> {
        for action in &step.actions {
            debug!(step = %step.name, action = %action.describe(), "Performing action");
            self.perform(handle, step.timeout(), action)
                .await
                .map_err(DriverError::into_navigation_error)?;
        }
        Ok(())
    }

    async fn perform(
        &self,
        handle: &D::Handle,
        timeout: Duration,
        action: &StepAction,
    ) -> DriverResult<()> {
        match action {
            StepAction::Navigate { url, wait } => {
                let url = self.vars.resolve_url(url).map_err(DriverError::Other)?;
                bounded(timeout, self.driver.navigate(handle, &url, *wait)).await
            }
            StepAction::WaitForNavigation => {
                bounded(timeout, self.driver.wait_for_navigation(handle, timeout)).await
            }
            StepAction::WaitFor { selector } => {
                self.locate(handle, selector, timeout).await.map(|_| ())
            }
            StepAction::Click { selector } => {
                let element = self.locate(handle, selector, timeout).await?;
                bounded(timeout, self.driver.click(&element)).await
            }
            StepAction::Type { selector, text } => {
                let element = self.locate(handle, selector, timeout).await?;
                let text = self.vars.render(text);
                bounded(timeout, self.driver.type_text(&element, &text)).await
            }
            StepAction::PressKey { selector, key } => {
                let element = self.locate(handle, selector, timeout).await?;
                bounded(timeout, self.driver.press_key(&element, key)).await
            }
        }
    }

    async fn locate(
        &self,
        handle: &D::Handle,
        selector: &Selector,
        timeout: Duration,
    ) -> DriverResult<D::Element> {
        let selector = self.vars.render_selector(selector);
        bounded(
            timeout,
            self.driver.wait_for_element(handle, &selector, timeout),
        )
        .await
    }
}

/// Cap a driver call at `limit`, reporting overruns as timeouts.
pub(crate) async fn bounded<T, F>(limit: Duration, fut: F) -> DriverResult<T>
where
    F: Future<Output = DriverResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout(format!(
            "no response within {}ms",
            limit.as_millis()
        ))),
    }
}

/// Run `fut` unless `abort` is raised first.
async fn abortable<F: Future>(abort: &mut watch::Receiver<bool>, fut: F) -> Result<F::Output> {
    if *abort.borrow() {
        return Err(BridgeError::Aborted);
    }
    tokio::select! {
        output = fut => Ok(output),
        _ = aborted(abort) => Err(BridgeError::Aborted),
    }
}

async fn aborted(abort: &mut watch::Receiver<bool>) {
    loop {
        if abort.changed().await.is_err() {
            // sender gone, nobody can abort any more
            std::future::pending::<()>().await;
        }
        if *abort.borrow() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::testing::ScriptedDriver;
    use crate::types::SessionState;
    use crate::AutomationDriver;

    const SERIAL_BUTTON: &str = "._open-serial-monitor-button_1y7x9_356";

    struct Fixture {
        driver: ScriptedDriver,
        config: BridgeConfig,
        vars: StepVars,
        status: SessionStatus,
    }

    impl Fixture {
        fn new() -> Self {
            let mut config = BridgeConfig::default();
            config.credentials.email = "ops@example.com".to_string();
            config.credentials.password = "hunter2".to_string();
            config.device.sketch_id = "sketch-1".to_string();
            let vars = StepVars::from_config(&config);
            Self {
                driver: ScriptedDriver::new(),
                config,
                vars,
                status: SessionStatus::default(),
            }
        }

        async fn run(&self) -> Result<()> {
            let handle = self.driver.launch(&self.config.browser).await.unwrap();
            let (_tx, mut abort) = watch::channel(false);
            NavigationStateMachine::new(
                &self.driver,
                &self.config.steps,
                &self.config.navigation,
                &self.vars,
                &self.status,
            )
            .run(&handle, &mut abort)
            .await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_walks_every_step() {
        let fixture = Fixture::new();
        tokio_test::assert_ok!(fixture.run().await);

        let actions = fixture.driver.actions();
        assert_eq!(actions.first().unwrap(), "navigate https://app.arduino.cc/login");
        assert!(actions.contains(&"type input[name='password'] hunter2".to_string()));
        assert!(actions
            .contains(&"type input[placeholder*='Search'] DOIT ESP32 DEVKIT V1".to_string()));
        assert!(actions.contains(&"press input[placeholder*='Search'] ArrowDown".to_string()));
        assert!(actions.contains(&"wait //button[normalize-space(.)='115200']".to_string()));
        assert_eq!(
            actions.last().unwrap(),
            "click button._play-pause-button_1akfd_177"
        );
        // last step's phase is left for the orchestrator to advance
        assert_eq!(fixture.status.state(), SessionState::OpeningMonitor);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let fixture = Fixture::new();
        fixture.driver.fail_times(
            SERIAL_BUTTON,
            DriverError::ElementNotFound(SERIAL_BUTTON.to_string()),
            2,
        );

        tokio_test::assert_ok!(fixture.run().await);
        assert_eq!(fixture.driver.lookups(SERIAL_BUTTON), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_name_the_step() {
        let fixture = Fixture::new();
        fixture
            .driver
            .fail_always(SERIAL_BUTTON, DriverError::Timeout("never visible".to_string()));

        match fixture.run().await {
            Err(BridgeError::NavigationFailed { step, last_error }) => {
                assert_eq!(step, "open-serial-monitor");
                assert!(last_error.contains("never visible"));
            }
            other => panic!("expected NavigationFailed, got {:?}", other),
        }
        assert_eq!(
            fixture.driver.lookups(SERIAL_BUTTON),
            fixture.config.navigation.max_attempts as usize
        );
    }

    #[tokio::test(start_paused = true)]
    async fn total_retry_budget_spans_steps() {
        let mut fixture = Fixture::new();
        fixture.config.navigation.max_attempts = 5;
        fixture.config.navigation.max_total_retries = 2;
        fixture.driver.fail_times(
            "https://app.arduino.cc/sketches",
            DriverError::Timeout("slow".to_string()),
            2,
        );
        fixture.driver.fail_times(
            SERIAL_BUTTON,
            DriverError::Timeout("slow".to_string()),
            1,
        );

        let err = fixture.run().await.unwrap_err();
        assert!(matches!(err, BridgeError::NavigationFailed { ref step, .. } if step == "open-serial-monitor"));
    }

    #[tokio::test(start_paused = true)]
    async fn target_closed_short_circuits() {
        let fixture = Fixture::new();
        fixture.driver.fail_times(
            "._device-name_12ggg_205",
            DriverError::TargetClosed("browser crashed".to_string()),
            1,
        );

        let err = fixture.run().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(fixture.driver.lookups("._device-name_12ggg_205"), 1);
        assert_eq!(fixture.status.state(), SessionState::SelectingDevice);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_driver_call_times_out() {
        let mut fixture = Fixture::new();
        fixture.driver = ScriptedDriver::new().with_latency(Duration::from_secs(120));
        fixture.config.navigation.max_attempts = 1;

        match fixture.run().await {
            Err(BridgeError::NavigationFailed { step, last_error }) => {
                assert_eq!(step, "authenticate");
                assert!(last_error.contains("no response within 60000ms"));
            }
            other => panic!("expected NavigationFailed, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abort_stops_retry_delay() {
        let fixture = Fixture::new();
        fixture
            .driver
            .fail_always(SERIAL_BUTTON, DriverError::Timeout("hidden".to_string()));
        let handle = fixture.driver.launch(&fixture.config.browser).await.unwrap();
        let (tx, mut abort) = watch::channel(false);

        let machine = NavigationStateMachine::new(
            &fixture.driver,
            &fixture.config.steps,
            &fixture.config.navigation,
            &fixture.vars,
            &fixture.status,
        );
        let (result, _) = tokio::join!(machine.run(&handle, &mut abort), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send(true).unwrap();
        });

        assert!(matches!(result, Err(BridgeError::Aborted)));
        assert_eq!(fixture.driver.lookups(SERIAL_BUTTON), 1);
    }
}
