//! Classification of serial monitor text into [`SerialEvent`]s.

use crate::types::SerialEvent;
use chrono::{DateTime, Utc};

pub const FINGERPRINT_MARKER: &str = "Fingerprint ID:";
pub const ENROLLMENT_MARKER: &str = "Enrolled fingerprint ID:";
pub const STATUS_COUNT_MARKER: &str = "Total fingerprints:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    FingerprintScan,
    Enrollment,
    StatusCount,
}

impl Marker {
    /// Checked in order, first match wins.
    const ALL: [Marker; 3] = [Marker::FingerprintScan, Marker::Enrollment, Marker::StatusCount];

    fn text(self) -> &'static str {
        match self {
            Marker::FingerprintScan => FINGERPRINT_MARKER,
            Marker::Enrollment => ENROLLMENT_MARKER,
            Marker::StatusCount => STATUS_COUNT_MARKER,
        }
    }

    fn build(self, token: &str, timestamp: DateTime<Utc>) -> Result<SerialEvent, String> {
        match self {
            Marker::FingerprintScan => Ok(SerialEvent::FingerprintScan {
                id: token.to_string(),
                timestamp,
            }),
            Marker::Enrollment => Ok(SerialEvent::Enrollment {
                id: token.to_string(),
                timestamp,
            }),
            Marker::StatusCount => token
                .parse::<u64>()
                .map(|count| SerialEvent::StatusCount { count, timestamp })
                .map_err(|e| format!("invalid count '{}' after '{}': {}", token, self.text(), e)),
        }
    }
}

/// Classify `text`, stamping the event with the current time.
pub fn parse(text: &str) -> SerialEvent {
    parse_at(text, Utc::now())
}

/// Classify `text` with an explicit timestamp.
///
/// Never fails: a recognised marker without a usable value becomes
/// [`SerialEvent::ParseError`], and unrecognised text becomes
/// [`SerialEvent::Raw`] carrying the input unchanged.
pub fn parse_at(text: &str, timestamp: DateTime<Utc>) -> SerialEvent {
    let Some((marker, rest)) = Marker::ALL
        .iter()
        .find_map(|m| text.split_once(m.text()).map(|(_, rest)| (*m, rest)))
    else {
        return SerialEvent::Raw {
            text: text.to_string(),
            timestamp,
        };
    };

    let outcome = match rest.split_whitespace().next() {
        Some(token) => marker.build(token, timestamp),
        None => Err(format!("no value after '{}'", marker.text())),
    };

    outcome.unwrap_or_else(|detail| SerialEvent::ParseError { detail, timestamp })
}
