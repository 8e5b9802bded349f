use crate::config::BrowserConfig;
use crate::errors::DriverResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How to locate an element on the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Selector {
    Css(String),
    XPath(String),
}

impl Selector {
    pub fn css(selector: impl Into<String>) -> Self {
        Selector::Css(selector.into())
    }

    pub fn xpath(selector: impl Into<String>) -> Self {
        Selector::XPath(selector.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Selector::Css(s) | Selector::XPath(s) => s,
        }
    }

    pub fn map<F: FnOnce(&str) -> String>(&self, f: F) -> Self {
        match self {
            Selector::Css(s) => Selector::Css(f(s)),
            Selector::XPath(s) => Selector::XPath(f(s)),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Css(s) => write!(f, "css={}", s),
            Selector::XPath(s) => write!(f, "xpath={}", s),
        }
    }
}

/// What `navigate` waits for before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitPolicy {
    /// Return as soon as the navigation was issued.
    Commit,
    Load,
    #[default]
    NetworkIdle,
}

/// Browser capability the bridge drives.
///
/// Implementations must make `close` safe to call repeatedly and must report
/// an externally destroyed page or browser as
/// [`DriverError::TargetClosed`](crate::errors::DriverError::TargetClosed).
#[async_trait]
pub trait AutomationDriver: Send + Sync + 'static {
    /// A live browser process plus the page being driven.
    type Handle: Send + Sync + 'static;

    /// A located element, valid for the handle it came from.
    type Element: Send + Sync;

    /// Launch a browser and open a page
    async fn launch(&self, config: &BrowserConfig) -> DriverResult<Self::Handle>;

    async fn navigate(&self, handle: &Self::Handle, url: &str, wait: WaitPolicy)
        -> DriverResult<()>;

    /// Wait for a navigation started by a previous action to settle
    async fn wait_for_navigation(&self, handle: &Self::Handle, timeout: Duration)
        -> DriverResult<()>;

    async fn wait_for_element(
        &self,
        handle: &Self::Handle,
        selector: &Selector,
        timeout: Duration,
    ) -> DriverResult<Self::Element>;

    async fn click(&self, element: &Self::Element) -> DriverResult<()>;

    async fn type_text(&self, element: &Self::Element, text: &str) -> DriverResult<()>;

    async fn press_key(&self, element: &Self::Element, key: &str) -> DriverResult<()>;

    async fn read_text(&self, element: &Self::Element) -> DriverResult<String>;

    /// Close the page and stop the browser process
    async fn close(&self, handle: &Self::Handle) -> DriverResult<()>;
}
