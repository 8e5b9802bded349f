use crate::config::BrowserConfig;
use crate::driver::{AutomationDriver, Selector, WaitPolicy};
use crate::errors::{DriverError, DriverResult};
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use parking_lot::Mutex;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Keep the DevTools connection alive for long monitoring sessions.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// [`AutomationDriver`] backed by a local Chrome via `headless_chrome`.
///
/// `headless_chrome` is synchronous, so every call runs on the blocking
/// pool.
#[derive(Debug, Default)]
pub struct ChromeDriver;

pub struct ChromeHandle {
    browser: Mutex<Option<Browser>>,
    tab: Arc<Tab>,
}

pub struct ChromeElement {
    tab: Arc<Tab>,
    selector: Selector,
}

impl ChromeDriver {
    pub fn new() -> Self {
        Self
    }
}

async fn blocking<T, F>(f: F) -> DriverResult<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DriverError::Other(format!("driver task failed: {}", e)))?
        .map_err(classify)
}

/// Sort a `headless_chrome` error into the driver taxonomy.
///
/// The crate reports most failures as opaque `anyhow` errors, so this goes by
/// message text.
pub fn classify(err: anyhow::Error) -> DriverError {
    let message = format!("{:#}", err);
    let lower = message.to_lowercase();

    if lower.contains("connection is closed")
        || lower.contains("target closed")
        || lower.contains("no target with given id")
        || lower.contains("crashed")
        || lower.contains("channel closed")
    {
        DriverError::TargetClosed(message)
    } else if lower.contains("never came") || lower.contains("timeout") || lower.contains("timed out")
    {
        DriverError::Timeout(message)
    } else if lower.contains("no element") || lower.contains("couldn't find") || lower.contains("not found")
    {
        DriverError::ElementNotFound(message)
    } else {
        DriverError::Other(message)
    }
}

fn find<'a>(tab: &'a Tab, selector: &Selector) -> anyhow::Result<headless_chrome::Element<'a>> {
    match selector {
        Selector::Css(css) => tab.find_element(css),
        Selector::XPath(xpath) => tab.find_element_by_xpath(xpath),
    }
}

#[async_trait]
impl AutomationDriver for ChromeDriver {
    type Handle = ChromeHandle;
    type Element = ChromeElement;

    async fn launch(&self, config: &BrowserConfig) -> DriverResult<ChromeHandle> {
        let config = config.clone();
        let launch_timeout = Duration::from_millis(config.launch_timeout_ms);

        let launching = blocking(move || {
            let window_size_arg = format!(
                "--window-size={},{}",
                config.viewport.width, config.viewport.height
            );
            let user_agent_arg = config
                .user_agent
                .as_ref()
                .map(|ua| format!("--user-agent={}", ua));

            let mut args: Vec<&OsStr> = config.args.iter().map(OsStr::new).collect();
            args.push(OsStr::new(&window_size_arg));
            if let Some(ref ua_arg) = user_agent_arg {
                args.push(OsStr::new(ua_arg));
            }

            let launch_options = LaunchOptions::default_builder()
                .headless(config.headless)
                .args(args)
                .idle_browser_timeout(IDLE_BROWSER_TIMEOUT)
                .build()
                .map_err(|e| anyhow::anyhow!("invalid launch options: {}", e))?;

            let browser = Browser::new(launch_options)?;
            let tab = browser.new_tab()?;
            Ok(ChromeHandle {
                browser: Mutex::new(Some(browser)),
                tab,
            })
        });

        match tokio::time::timeout(launch_timeout, launching).await {
            Ok(Ok(handle)) => {
                debug!("Chrome launched");
                Ok(handle)
            }
            Ok(Err(err)) => Err(DriverError::Launch(err.to_string())),
            Err(_) => Err(DriverError::Launch(format!(
                "browser did not start within {}ms",
                launch_timeout.as_millis()
            ))),
        }
    }

    async fn navigate(&self, handle: &ChromeHandle, url: &str, wait: WaitPolicy) -> DriverResult<()> {
        let tab = Arc::clone(&handle.tab);
        let url = url.to_string();
        blocking(move || {
            tab.navigate_to(&url)?;
            // CDP has no network-idle signal; a finished load is the closest
            if wait != WaitPolicy::Commit {
                tab.wait_until_navigated()?;
            }
            Ok(())
        })
        .await
    }

    async fn wait_for_navigation(&self, handle: &ChromeHandle, _timeout: Duration) -> DriverResult<()> {
        let tab = Arc::clone(&handle.tab);
        blocking(move || {
            tab.wait_until_navigated()?;
            Ok(())
        })
        .await
    }

    async fn wait_for_element(
        &self,
        handle: &ChromeHandle,
        selector: &Selector,
        timeout: Duration,
    ) -> DriverResult<ChromeElement> {
        let tab = Arc::clone(&handle.tab);
        let wanted = selector.clone();
        blocking(move || {
            match &wanted {
                Selector::Css(css) => tab.wait_for_element_with_custom_timeout(css, timeout)?,
                Selector::XPath(xpath) => tab.wait_for_xpath_with_custom_timeout(xpath, timeout)?,
            };
            Ok(ChromeElement {
                tab: Arc::clone(&tab),
                selector: wanted.clone(),
            })
        })
        .await
    }

    async fn click(&self, element: &ChromeElement) -> DriverResult<()> {
        let tab = Arc::clone(&element.tab);
        let selector = element.selector.clone();
        blocking(move || {
            find(&tab, &selector)?.click()?;
            Ok(())
        })
        .await
    }

    async fn type_text(&self, element: &ChromeElement, text: &str) -> DriverResult<()> {
        let tab = Arc::clone(&element.tab);
        let selector = element.selector.clone();
        let text = text.to_string();
        blocking(move || {
            let found = find(&tab, &selector)?;
            found.click()?;
            found.type_into(&text)?;
            Ok(())
        })
        .await
    }

    async fn press_key(&self, element: &ChromeElement, key: &str) -> DriverResult<()> {
        let tab = Arc::clone(&element.tab);
        let selector = element.selector.clone();
        let key = key.to_string();
        blocking(move || {
            find(&tab, &selector)?.click()?;
            tab.press_key(&key)?;
            Ok(())
        })
        .await
    }

    async fn read_text(&self, element: &ChromeElement) -> DriverResult<String> {
        let tab = Arc::clone(&element.tab);
        let selector = element.selector.clone();
        blocking(move || find(&tab, &selector)?.get_inner_text()).await
    }

    async fn close(&self, handle: &ChromeHandle) -> DriverResult<()> {
        let Some(browser) = handle.browser.lock().take() else {
            debug!("Chrome already closed");
            return Ok(());
        };

        let tab = Arc::clone(&handle.tab);
        blocking(move || {
            if let Err(err) = tab.close(true) {
                warn!(error = %err, "Failed to close tab");
            }
            // dropping the browser kills the chrome process
            drop(browser);
            Ok(())
        })
        .await
    }
}
