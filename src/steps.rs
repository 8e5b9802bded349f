//! Data-driven description of the UI walk from the login page to a streaming
//! serial monitor.
//!
//! Selectors for the editor are tied to its current markup. They live here as
//! data so a markup change means editing (or overriding in config) the table,
//! not the navigation code. Strings may contain `{placeholder}`s which are
//! filled from [`StepVars`] right before an action runs.

use crate::config::BridgeConfig;
use crate::driver::{Selector, WaitPolicy};
use crate::errors::{BridgeError, Result};
use crate::types::SessionState;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use url::Url;

pub const PLACEHOLDERS: &[&str] = &[
    "email",
    "password",
    "device_name",
    "baud_rate",
    "sketch_id",
    "base_url",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTable {
    pub version: String,
    /// Element holding the rendered serial output once monitoring.
    pub output_selector: Selector,
    pub steps: Vec<NavigationStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationStep {
    pub name: String,
    pub phase: StepPhase,
    pub timeout_ms: u64,
    pub actions: Vec<StepAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Authenticating,
    NavigatingEditor,
    SelectingDevice,
    OpeningMonitor,
    SettingBaudRate,
}

impl From<StepPhase> for SessionState {
    fn from(phase: StepPhase) -> Self {
        match phase {
            StepPhase::Authenticating => SessionState::Authenticating,
            StepPhase::NavigatingEditor => SessionState::NavigatingEditor,
            StepPhase::SelectingDevice => SessionState::SelectingDevice,
            StepPhase::OpeningMonitor => SessionState::OpeningMonitor,
            StepPhase::SettingBaudRate => SessionState::SettingBaudRate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    /// `url` may be relative to the editor base URL.
    Navigate {
        url: String,
        #[serde(default)]
        wait: WaitPolicy,
    },
    WaitForNavigation,
    WaitFor { selector: Selector },
    Click { selector: Selector },
    Type { selector: Selector, text: String },
    PressKey { selector: Selector, key: String },
}

impl StepAction {
    pub fn describe(&self) -> String {
        match self {
            StepAction::Navigate { url, .. } => format!("navigate {}", url),
            StepAction::WaitForNavigation => "wait for navigation".to_string(),
            StepAction::WaitFor { selector } => format!("wait for {}", selector),
            StepAction::Click { selector } => format!("click {}", selector),
            // typed text may hold credentials
            StepAction::Type { selector, .. } => format!("type into {}", selector),
            StepAction::PressKey { selector, key } => format!("press {} on {}", key, selector),
        }
    }

    fn templates(&self) -> Vec<&str> {
        match self {
            StepAction::Navigate { url, .. } => vec![url.as_str()],
            StepAction::WaitForNavigation => vec![],
            StepAction::WaitFor { selector } | StepAction::Click { selector } => {
                vec![selector.as_str()]
            }
            StepAction::Type { selector, text } => vec![selector.as_str(), text.as_str()],
            StepAction::PressKey { selector, key } => vec![selector.as_str(), key.as_str()],
        }
    }
}

impl NavigationStep {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn new(name: &str, phase: StepPhase, timeout_ms: u64, actions: Vec<StepAction>) -> Self {
        Self {
            name: name.to_string(),
            phase,
            timeout_ms,
            actions,
        }
    }
}

fn navigate(url: &str) -> StepAction {
    StepAction::Navigate {
        url: url.to_string(),
        wait: WaitPolicy::NetworkIdle,
    }
}

fn click(selector: Selector) -> StepAction {
    StepAction::Click { selector }
}

impl StepTable {
    /// Walk for the Arduino Cloud web editor as of mid 2024.
    pub fn arduino_cloud() -> Self {
        let search = Selector::css("input[placeholder*='Search']");

        Self {
            version: "arduino-cloud/2024-06".to_string(),
            output_selector: Selector::css(".serial-output"),
            steps: vec![
                NavigationStep::new(
                    "authenticate",
                    StepPhase::Authenticating,
                    60000,
                    vec![
                        navigate("login"),
                        StepAction::Type {
                            selector: Selector::css("input[name='email']"),
                            text: "{email}".to_string(),
                        },
                        StepAction::Type {
                            selector: Selector::css("input[name='password']"),
                            text: "{password}".to_string(),
                        },
                        click(Selector::css("button[type='submit']")),
                        StepAction::WaitForNavigation,
                    ],
                ),
                NavigationStep::new(
                    "open-editor",
                    StepPhase::NavigatingEditor,
                    30000,
                    vec![navigate("sketches")],
                ),
                NavigationStep::new(
                    "open-sketch",
                    StepPhase::NavigatingEditor,
                    30000,
                    vec![navigate("sketches/{sketch_id}?nav=Files")],
                ),
                NavigationStep::new(
                    "toggle-monitor",
                    StepPhase::SelectingDevice,
                    30000,
                    vec![click(Selector::css(
                        "button._icon-button_1mzvx_160._play-pause-button_1akfd_177",
                    ))],
                ),
                NavigationStep::new(
                    "select-device",
                    StepPhase::SelectingDevice,
                    30000,
                    vec![
                        click(Selector::css("._device-name_12ggg_205")),
                        StepAction::Type {
                            selector: search.clone(),
                            text: "{device_name}".to_string(),
                        },
                        StepAction::PressKey {
                            selector: search.clone(),
                            key: "ArrowDown".to_string(),
                        },
                        StepAction::PressKey {
                            selector: search,
                            key: "Enter".to_string(),
                        },
                    ],
                ),
                NavigationStep::new(
                    "open-serial-monitor",
                    StepPhase::OpeningMonitor,
                    30000,
                    vec![click(Selector::css("._open-serial-monitor-button_1y7x9_356"))],
                ),
                NavigationStep::new(
                    "select-baud-rate",
                    StepPhase::SettingBaudRate,
                    30000,
                    vec![
                        click(Selector::css("._x-small_wmean_200")),
                        click(Selector::xpath(
                            "//button[normalize-space(.)='{baud_rate}']",
                        )),
                    ],
                ),
                NavigationStep::new(
                    "open-monitor-view",
                    StepPhase::OpeningMonitor,
                    30000,
                    vec![navigate("sketches/monitor")],
                ),
                NavigationStep::new(
                    "start-stream",
                    StepPhase::OpeningMonitor,
                    30000,
                    vec![click(Selector::css("button._play-pause-button_1akfd_177"))],
                ),
            ],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(BridgeError::Configuration(
                "step table version is empty".to_string(),
            ));
        }
        if self.steps.is_empty() {
            return Err(BridgeError::Configuration(
                "step table has no steps".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(BridgeError::Configuration(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
            if step.actions.is_empty() {
                return Err(BridgeError::Configuration(format!(
                    "step '{}' has no actions",
                    step.name
                )));
            }
            if step.timeout_ms == 0 {
                return Err(BridgeError::Configuration(format!(
                    "step '{}' has a zero timeout",
                    step.name
                )));
            }
            for template in step.actions.iter().flat_map(|a| a.templates()) {
                if let Some(unknown) = unknown_placeholder(template) {
                    return Err(BridgeError::Configuration(format!(
                        "step '{}' uses unknown placeholder '{{{}}}'",
                        step.name, unknown
                    )));
                }
            }
        }

        Ok(())
    }
}

fn unknown_placeholder(template: &str) -> Option<String> {
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        let end = after.find('}')?;
        let name = &after[..end];
        if !PLACEHOLDERS.contains(&name) {
            return Some(name.to_string());
        }
        rest = &after[end + 1..];
    }
    None
}

/// Values substituted into step table templates.
#[derive(Clone)]
pub struct StepVars {
    base_url: String,
    values: Vec<(&'static str, String)>,
}

impl fmt::Debug for StepVars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepVars")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl StepVars {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            base_url: config.editor.base_url.clone(),
            values: vec![
                ("email", config.credentials.email.clone()),
                ("password", config.credentials.password.clone()),
                ("device_name", config.device.name.clone()),
                ("baud_rate", config.device.baud_rate.to_string()),
                ("sketch_id", config.device.sketch_id.clone()),
                ("base_url", config.editor.base_url.clone()),
            ],
        }
    }

    /// Substitute `{name}` placeholders in one left-to-right pass; inserted
    /// values are never rescanned. Unknown names are left as written.
    pub fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let value = after.find('}').and_then(|end| {
                let name = &after[..end];
                self.value(name).map(|value| (value, end))
            });
            match value {
                Some((value, end)) => {
                    out.push_str(value);
                    rest = &after[end + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn value(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn render_selector(&self, selector: &Selector) -> Selector {
        selector.map(|s| self.render(s))
    }

    /// Render `template` and resolve it against the editor base URL.
    pub fn resolve_url(&self, template: &str) -> std::result::Result<String, String> {
        let base = Url::parse(&self.base_url).map_err(|e| e.to_string())?;
        base.join(&self.render(template))
            .map(String::from)
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> StepVars {
        let mut config = BridgeConfig::default();
        config.credentials.email = "ops@example.com".to_string();
        config.credentials.password = "hunter2".to_string();
        config.device.sketch_id = "9dde49f6".to_string();
        StepVars::from_config(&config)
    }

    #[test]
    fn default_table_is_valid_and_ordered() {
        let table = StepTable::arduino_cloud();
        assert!(table.validate().is_ok());

        let names: Vec<&str> = table.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "authenticate",
                "open-editor",
                "open-sketch",
                "toggle-monitor",
                "select-device",
                "open-serial-monitor",
                "select-baud-rate",
                "open-monitor-view",
                "start-stream",
            ]
        );
    }

    #[test]
    fn relative_urls_resolve_against_base() {
        let vars = vars();
        assert_eq!(
            vars.resolve_url("sketches/{sketch_id}?nav=Files").unwrap(),
            "https://app.arduino.cc/sketches/9dde49f6?nav=Files"
        );
        assert_eq!(
            vars.resolve_url("https://example.com/x").unwrap(),
            "https://example.com/x"
        );
    }

    #[test]
    fn substituted_values_are_not_rendered_again() {
        let mut config = BridgeConfig::default();
        config.credentials.password = "p{device_name}{baud_rate}".to_string();
        let vars = StepVars::from_config(&config);

        assert_eq!(vars.render("{password}"), "p{device_name}{baud_rate}");
        assert_eq!(
            vars.render("{baud_rate} {unknown} {"),
            "115200 {unknown} {"
        );
    }

    #[test]
    fn selectors_are_rendered() {
        let rendered =
            vars().render_selector(&Selector::xpath("//button[normalize-space(.)='{baud_rate}']"));
        assert_eq!(rendered, Selector::xpath("//button[normalize-space(.)='115200']"));
    }

    #[test]
    fn unknown_placeholders_are_rejected() {
        let mut table = StepTable::arduino_cloud();
        table.steps[1].actions = vec![navigate("sketches/{sketch}")];
        let err = table.validate().unwrap_err();
        assert!(err.to_string().contains("{sketch}"));
    }

    #[test]
    fn duplicate_step_names_are_rejected() {
        let mut table = StepTable::arduino_cloud();
        table.steps[2].name = "open-editor".to_string();
        assert!(table.validate().is_err());
    }

    #[test]
    fn typed_text_is_not_described() {
        let action = StepAction::Type {
            selector: Selector::css("input[name='password']"),
            text: "{password}".to_string(),
        };
        assert!(!action.describe().contains("password}"));
    }

    #[test]
    fn vars_debug_hides_credentials() {
        let printed = format!("{:?}", vars());
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn table_round_trips_through_json() {
        let table = StepTable::arduino_cloud();
        let json = serde_json::to_string(&table).unwrap();
        let back: StepTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back.steps.len(), table.steps.len());
        assert_eq!(back.output_selector, table.output_selector);
    }
}
