//! Safety event payload parsing
//!
//! Sensors publish either plain UTF-8 sentences ("A child has been alone in
//! the room for over 15 seconds!") or JSON objects of the form
//! `{"type": "child-alone", "subject": "room-1", "message": "..."}`.

use crate::subscriptions::InboundEvent;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of safety situation reported by a sensor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    ChildAlone,
    ApplianceDisabled,
    Alert,
    Other(String),
}

impl EventKind {
    /// Map a JSON `type` value onto a kind
    pub fn from_type(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "child-alone" => EventKind::ChildAlone,
            "appliance-disabled" => EventKind::ApplianceDisabled,
            "alert" => EventKind::Alert,
            other => EventKind::Other(other.to_string()),
        }
    }

    /// Classify a plain-text sensor message
    pub fn classify(text: &str) -> Self {
        let lower = text.to_lowercase();
        if lower.contains("alone") {
            EventKind::ChildAlone
        } else if lower.contains("appliance") || lower.contains("plug") {
            EventKind::ApplianceDisabled
        } else {
            EventKind::Alert
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::ChildAlone => "child-alone",
            EventKind::ApplianceDisabled => "appliance-disabled",
            EventKind::Alert => "alert",
            EventKind::Other(kind) => kind,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a payload could not be turned into a [`SafetyEvent`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventParseError {
    #[error("Payload is empty")]
    Empty,
    #[error("Payload is not valid UTF-8")]
    NotUtf8,
    #[error("Payload is not a valid JSON event: {0}")]
    InvalidJson(String),
    #[error("JSON event is missing '{0}'")]
    MissingField(&'static str),
}

#[derive(Deserialize)]
struct JsonEvent {
    #[serde(rename = "type")]
    kind: Option<String>,
    subject: Option<String>,
    message: Option<String>,
}

/// A parsed safety event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafetyEvent {
    pub kind: EventKind,
    /// Room, device or sensor the event is about
    pub subject: String,
    pub message: String,
    /// Normalized text of a plain-text payload; part of the dedup key
    pub fingerprint: Option<String>,
}

impl SafetyEvent {
    /// Parse an inbound payload; `subject` defaults to the topic
    pub fn parse(event: &InboundEvent) -> Result<Self, EventParseError> {
        let text = std::str::from_utf8(&event.payload).map_err(|_| EventParseError::NotUtf8)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(EventParseError::Empty);
        }

        if text.starts_with('{') {
            return Self::parse_json(text, &event.topic);
        }

        Ok(Self {
            kind: EventKind::classify(text),
            subject: event.topic.clone(),
            message: text.to_string(),
            fingerprint: Some(fingerprint(text)),
        })
    }

    fn parse_json(text: &str, topic: &str) -> Result<Self, EventParseError> {
        let raw: JsonEvent =
            serde_json::from_str(text).map_err(|e| EventParseError::InvalidJson(e.to_string()))?;

        let kind = non_blank(raw.kind).ok_or(EventParseError::MissingField("type"))?;
        let message = non_blank(raw.message).ok_or(EventParseError::MissingField("message"))?;
        let subject = non_blank(raw.subject).unwrap_or_else(|| topic.to_string());

        Ok(Self {
            kind: EventKind::from_type(&kind),
            subject,
            message,
            fingerprint: None,
        })
    }

    /// Dedup key: kind plus subject, plus the text for plain-text events
    pub fn event_key(&self) -> String {
        match &self.fingerprint {
            Some(text) => format!("{}:{}:{}", self.kind, self.subject, text),
            None => format!("{}:{}", self.kind, self.subject),
        }
    }
}

fn fingerprint(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;

    fn inbound(payload: &'static [u8]) -> InboundEvent {
        InboundEvent::new("iot/notifications", payload, QoS::AtLeastOnce)
    }

    #[test]
    fn test_plain_text_child_alone() {
        let event = SafetyEvent::parse(&inbound(
            b"A child has been alone in the room for over 15 seconds!",
        ))
        .unwrap();

        assert_eq!(event.kind, EventKind::ChildAlone);
        assert_eq!(event.subject, "iot/notifications");
        assert_eq!(
            event.event_key(),
            "child-alone:iot/notifications:a child has been alone in the room for over 15 seconds!"
        );
    }

    #[test]
    fn test_plain_text_key_follows_content() {
        let door = SafetyEvent::parse(&inbound(b"The front door was opened")).unwrap();
        let smoke = SafetyEvent::parse(&inbound(b"Smoke detected in the kitchen")).unwrap();
        let door_again = SafetyEvent::parse(&inbound(b"  The front   door was OPENED ")).unwrap();

        assert_ne!(door.event_key(), smoke.event_key());
        assert_eq!(door.event_key(), door_again.event_key());
        assert_eq!(door.message, "The front door was opened");
    }

    #[test]
    fn test_plain_text_appliance() {
        let event =
            SafetyEvent::parse(&inbound(b"An appliance has been disabled for safety.")).unwrap();
        assert_eq!(event.kind, EventKind::ApplianceDisabled);
    }

    #[test]
    fn test_plain_text_fallback_kind() {
        let event = SafetyEvent::parse(&inbound(b"  Door opened  ")).unwrap();
        assert_eq!(event.kind, EventKind::Alert);
        assert_eq!(event.message, "Door opened");
    }

    #[test]
    fn test_json_event() {
        let event = SafetyEvent::parse(&inbound(
            br#"{"type": "child_alone", "subject": "kitchen", "message": "Child alone"}"#,
        ))
        .unwrap();

        assert_eq!(event.kind, EventKind::ChildAlone);
        assert_eq!(event.subject, "kitchen");
        assert_eq!(event.event_key(), "child-alone:kitchen");
    }

    #[test]
    fn test_json_unknown_type_is_kept() {
        let event = SafetyEvent::parse(&inbound(
            br#"{"type": "smoke", "message": "Smoke detected"}"#,
        ))
        .unwrap();

        assert_eq!(event.kind, EventKind::Other("smoke".to_string()));
        assert_eq!(event.subject, "iot/notifications");
    }

    #[test]
    fn test_json_missing_fields() {
        assert_eq!(
            SafetyEvent::parse(&inbound(br#"{"subject": "kitchen", "message": "x"}"#)),
            Err(EventParseError::MissingField("type"))
        );
        assert_eq!(
            SafetyEvent::parse(&inbound(br#"{"type": "alert", "message": "  "}"#)),
            Err(EventParseError::MissingField("message"))
        );
    }

    #[test]
    fn test_malformed_payloads() {
        assert_eq!(SafetyEvent::parse(&inbound(b"")), Err(EventParseError::Empty));
        assert_eq!(SafetyEvent::parse(&inbound(b"   ")), Err(EventParseError::Empty));
        assert_eq!(
            SafetyEvent::parse(&inbound(&[0xff, 0xfe, 0x00])),
            Err(EventParseError::NotUtf8)
        );
        assert!(matches!(
            SafetyEvent::parse(&inbound(b"{not json")),
            Err(EventParseError::InvalidJson(_))
        ));
    }
}
