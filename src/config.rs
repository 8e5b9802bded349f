use crate::errors::{BridgeError, Result};
use crate::steps::StepTable;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use url::Url;

pub const EMAIL_ENV: &str = "SERIAL_BRIDGE_EMAIL";
pub const PASSWORD_ENV: &str = "SERIAL_BRIDGE_PASSWORD";
pub const SKETCH_ID_ENV: &str = "SERIAL_BRIDGE_SKETCH_ID";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub browser: BrowserConfig,
    pub navigation: NavigationConfig,
    pub poller: PollerConfig,
    pub device: DeviceConfig,
    pub editor: EditorConfig,
    pub credentials: Credentials,
    pub steps: StepTable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub viewport: Viewport,
    pub user_agent: Option<String>,
    pub args: Vec<String>,
    pub launch_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    pub retry_delay_ms: u64,
    pub max_attempts: u32,
    pub max_total_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_ms: u64,
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    pub baud_rate: u32,
    pub sketch_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    pub base_url: String,
}

/// Login material for the editor. Never printed.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &redact(&self.email))
            .field("password", &redact(&self.password))
            .finish()
    }
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            browser: BrowserConfig::default(),
            navigation: NavigationConfig::default(),
            poller: PollerConfig::default(),
            device: DeviceConfig::default(),
            editor: EditorConfig::default(),
            credentials: Credentials::default(),
            steps: StepTable::arduino_cloud(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            viewport: Viewport::default(),
            user_agent: None,
            args: vec![
                "--no-sandbox".to_string(),
                "--disable-dev-shm-usage".to_string(),
                "--disable-gpu".to_string(),
                "--disable-software-rasterizer".to_string(),
                "--disable-setuid-sandbox".to_string(),
            ],
            launch_timeout_ms: 30000,
        }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 5000,
            max_attempts: 3,
            max_total_retries: 10,
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            read_timeout_ms: 900,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "DOIT ESP32 DEVKIT V1".to_string(),
            baud_rate: 115200,
            sketch_id: String::new(),
        }
    }
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://app.arduino.cc/".to_string(),
        }
    }
}

impl NavigationConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl BridgeConfig {
    /// Load the configuration from an optional JSON file, then apply
    /// environment overrides and validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                serde_json::from_str::<BridgeConfig>(&raw)?
            }
            None => BridgeConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from the environment. `lookup` is injected so the
    /// overlay can be tested without touching the process environment.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(email) = lookup(EMAIL_ENV) {
            self.credentials.email = email;
        }
        if let Some(password) = lookup(PASSWORD_ENV) {
            self.credentials.password = password;
        }
        if let Some(sketch_id) = lookup(SKETCH_ID_ENV) {
            self.device.sketch_id = sketch_id;
        }
    }

    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.editor.base_url).map_err(|e| {
            BridgeError::Configuration(format!(
                "invalid editor base_url '{}': {}",
                self.editor.base_url, e
            ))
        })?;

        if self.navigation.max_attempts == 0 {
            return Err(BridgeError::Configuration(
                "navigation.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.poller.interval_ms == 0 {
            return Err(BridgeError::Configuration(
                "poller.interval_ms must be positive".to_string(),
            ));
        }
        if self.poller.read_timeout_ms > self.poller.interval_ms {
            return Err(BridgeError::Configuration(format!(
                "poller.read_timeout_ms ({}) exceeds poller.interval_ms ({})",
                self.poller.read_timeout_ms, self.poller.interval_ms
            )));
        }

        self.steps.validate()
    }
}
