use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of the single bridge session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Launching,
    Authenticating,
    NavigatingEditor,
    SelectingDevice,
    OpeningMonitor,
    SettingBaudRate,
    Monitoring,
    Disconnecting,
    Failed { reason: String },
}

impl SessionState {
    /// States from which a new `connect` may start.
    pub fn accepts_connect(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Failed { .. })
    }

    pub fn is_monitoring(&self) -> bool {
        matches!(self, SessionState::Monitoring)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SessionState::Failed { .. })
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Idle
    }
}

/// A classified sample of the device's serial output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SerialEvent {
    #[serde(rename = "fingerprint_scan")]
    FingerprintScan { id: String, timestamp: DateTime<Utc> },

    #[serde(rename = "enrollment")]
    Enrollment { id: String, timestamp: DateTime<Utc> },

    #[serde(rename = "status")]
    StatusCount { count: u64, timestamp: DateTime<Utc> },

    #[serde(rename = "raw")]
    Raw { text: String, timestamp: DateTime<Utc> },

    #[serde(rename = "error")]
    ParseError { detail: String, timestamp: DateTime<Utc> },
}

impl SerialEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            SerialEvent::FingerprintScan { timestamp, .. }
            | SerialEvent::Enrollment { timestamp, .. }
            | SerialEvent::StatusCount { timestamp, .. }
            | SerialEvent::Raw { timestamp, .. }
            | SerialEvent::ParseError { timestamp, .. } => *timestamp,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SerialEvent::FingerprintScan { .. } => "fingerprint_scan",
            SerialEvent::Enrollment { .. } => "enrollment",
            SerialEvent::StatusCount { .. } => "status",
            SerialEvent::Raw { .. } => "raw",
            SerialEvent::ParseError { .. } => "error",
        }
    }
}

/// Snapshot returned by `SessionOrchestrator::status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub state: SessionState,
    pub connected: bool,
    pub session_id: Option<Uuid>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub events_published: u64,
}

/// `{success, message}` payload handed to the front door.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
}

impl CommandOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_wire_type_tags() {
        let timestamp = Utc::now();
        let event = SerialEvent::StatusCount {
            count: 7,
            timestamp,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["count"], 7);

        let raw = SerialEvent::Raw {
            text: "boot ok".to_string(),
            timestamp,
        };
        assert_eq!(serde_json::to_value(&raw).unwrap()["type"], raw.kind());
    }

    #[test]
    fn failed_state_carries_reason() {
        let state = SessionState::Failed {
            reason: "Target closed".to_string(),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"], "Target closed");
        assert!(state.accepts_connect());
        assert!(!SessionState::Monitoring.accepts_connect());
    }
}
