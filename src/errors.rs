use thiserror::Error;

/// Failures reported by an [`AutomationDriver`](crate::driver::AutomationDriver).
///
/// Only [`DriverError::TargetClosed`] is fatal; every other category is
/// something a later attempt may get past.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Browser launch failed: {0}")]
    Launch(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Target closed: {0}")]
    TargetClosed(String),

    #[error("Driver error: {0}")]
    Other(String),
}

impl DriverError {
    pub fn is_target_closed(&self) -> bool {
        matches!(self, DriverError::TargetClosed(_))
    }

    /// Reclassify a failure that happened while walking the step table.
    pub fn into_navigation_error(self) -> BridgeError {
        match self {
            DriverError::TargetClosed(detail) => BridgeError::FatalDriver(detail),
            other => BridgeError::TransientUi(other.to_string()),
        }
    }

    /// Reclassify a failure that happened while sampling the monitor widget.
    pub fn into_sampling_error(self) -> BridgeError {
        match self {
            DriverError::TargetClosed(detail) => BridgeError::FatalDriver(detail),
            other => BridgeError::Sampling(other.to_string()),
        }
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("UI not ready: {0}")]
    TransientUi(String),

    #[error("Browser target closed: {0}")]
    FatalDriver(String),

    #[error("Sampling failed: {0}")]
    Sampling(String),

    #[error("Navigation failed at step '{step}': {last_error}")]
    NavigationFailed { step: String, last_error: String },

    #[error("Failed to setup browser: {0}")]
    LaunchFailed(String),

    #[error("Connect aborted by disconnect")]
    Aborted,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl BridgeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::FatalDriver(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

pub type DriverResult<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_closed_is_fatal_everywhere() {
        let err = DriverError::TargetClosed("page crashed".to_string());
        assert!(err.clone().into_navigation_error().is_fatal());
        assert!(err.into_sampling_error().is_fatal());
    }

    #[test]
    fn timeouts_are_recoverable() {
        let err = DriverError::Timeout(".serial-output".to_string());
        assert!(matches!(
            err.clone().into_navigation_error(),
            BridgeError::TransientUi(_)
        ));
        assert!(matches!(err.into_sampling_error(), BridgeError::Sampling(_)));
    }

    #[test]
    fn navigation_failure_names_the_step() {
        let err = BridgeError::NavigationFailed {
            step: "select-device".to_string(),
            last_error: "Timed out: device list".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Navigation failed at step 'select-device': Timed out: device list"
        );
    }
}
