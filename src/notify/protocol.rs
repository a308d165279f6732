//! Protocol definitions for notify messages
//!
//! The same JSON shapes travel over both transports: hooks POST an [`Event`]
//! to `/notify`, and the broker forwards it verbatim over the WebSocket
//! alongside a couple of housekeeping frames ([`ControlMessage`]).

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of hook events that may be broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Claude Code is asking for permission to use a tool
    PermissionPrompt,
    /// Claude Code has been waiting for input
    IdlePrompt,
    /// The task finished
    Stop,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::PermissionPrompt,
        EventKind::IdlePrompt,
        EventKind::Stop,
    ];

    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PermissionPrompt => "permission_prompt",
            EventKind::IdlePrompt => "idle_prompt",
            EventKind::Stop => "stop",
        }
    }

    /// Parse a wire name. Unlike workspace statuses there is no fallback:
    /// anything outside the closed set is `None`.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single notification-worthy event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Optional human readable text; receivers substitute a per-kind default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// ISO-8601 UTC timestamp
    pub timestamp: String,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn now(kind: EventKind, message: Option<String>) -> Self {
        Self {
            kind,
            message,
            timestamp: format_timestamp(Utc::now()),
        }
    }
}

/// Format a timestamp the way browsers' `Date.toISOString()` does
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Housekeeping frames sent by the broker. These are never domain events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Welcome frame sent to a single connection right after the handshake
    Connected { message: String, timestamp: String },
    /// Reply to a client ping
    Pong { timestamp: String },
}

impl ControlMessage {
    pub fn connected() -> Self {
        ControlMessage::Connected {
            message: "Connected to Claude Code notification server".to_string(),
            timestamp: format_timestamp(Utc::now()),
        }
    }

    pub fn pong() -> Self {
        ControlMessage::Pong {
            timestamp: format_timestamp(Utc::now()),
        }
    }
}

/// Anything the broker may send down the WebSocket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Control(ControlMessage),
    Event(Event),
}

/// Frames sent by listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keepalive
    Ping,
}

/// Body returned by `POST /notify`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyResponse {
    pub success: bool,
    pub clients_notified: usize,
}

/// Body returned by `GET /health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub connected_clients: usize,
    pub uptime: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_event_omits_missing_message() {
        let event = Event {
            kind: EventKind::IdlePrompt,
            message: None,
            timestamp: "2025-01-01T00:00:00.000Z".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"idle_prompt","timestamp":"2025-01-01T00:00:00.000Z"}"#
        );
    }

    #[test]
    fn test_serialize_event_field_order() {
        let event = Event {
            kind: EventKind::Stop,
            message: Some("done".to_string()),
            timestamp: "2025-01-01T00:00:00.000Z".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(
            json,
            r#"{"type":"stop","message":"done","timestamp":"2025-01-01T00:00:00.000Z"}"#
        );
    }

    #[test]
    fn test_parse_kind_is_closed() {
        assert_eq!(EventKind::parse("stop"), Some(EventKind::Stop));
        assert_eq!(
            EventKind::parse("permission_prompt"),
            Some(EventKind::PermissionPrompt)
        );
        assert_eq!(EventKind::parse("Stop"), None);
        assert_eq!(EventKind::parse("working"), None);
    }

    #[test]
    fn test_server_message_distinguishes_control_frames() {
        let pong: ServerMessage =
            serde_json::from_str(r#"{"type":"pong","timestamp":"t"}"#).unwrap();
        assert!(matches!(pong, ServerMessage::Control(ControlMessage::Pong { .. })));

        let welcome: ServerMessage =
            serde_json::from_str(r#"{"type":"connected","message":"hi","timestamp":"t"}"#)
                .unwrap();
        assert!(matches!(
            welcome,
            ServerMessage::Control(ControlMessage::Connected { .. })
        ));

        let event: ServerMessage =
            serde_json::from_str(r#"{"type":"permission_prompt","timestamp":"t"}"#).unwrap();
        match event {
            ServerMessage::Event(e) => assert_eq!(e.kind, EventKind::PermissionPrompt),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_client_ping_shape() {
        let json = serde_json::to_string(&ClientMessage::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
    }

    #[test]
    fn test_response_bodies_are_camel_case() {
        let json = serde_json::to_string(&NotifyResponse {
            success: true,
            clients_notified: 1,
        })
        .unwrap();
        assert_eq!(json, r#"{"success":true,"clientsNotified":1}"#);
    }

    #[test]
    fn test_format_timestamp_millis_utc() {
        let at = DateTime::parse_from_rfc3339("2025-03-04T05:06:07.891Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_timestamp(at), "2025-03-04T05:06:07.891Z");
    }
}
