//! Decides whether and how an incoming event becomes a notification

use serde::Serialize;

use super::session::{ClientSession, ConnectionStatus, NotificationRecord};
use crate::notify::protocol::{Event, EventKind};

/// Notification urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Normal,
    High,
}

/// Fixed presentation per event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindProfile {
    pub title: &'static str,
    pub default_message: &'static str,
    pub urgency: Urgency,
    /// Stays until dismissed instead of expiring
    pub persistent: bool,
    pub badge_color: &'static str,
}

/// Look up the profile for `kind`
pub fn profile(kind: EventKind) -> KindProfile {
    match kind {
        EventKind::PermissionPrompt => KindProfile {
            title: "Permission Required",
            default_message: "Claude Code needs your permission to continue",
            urgency: Urgency::High,
            persistent: true,
            badge_color: "#FF9800",
        },
        EventKind::IdlePrompt => KindProfile {
            title: "Waiting for Input",
            default_message: "Claude Code is waiting for your input",
            urgency: Urgency::Normal,
            persistent: false,
            badge_color: "#2196F3",
        },
        EventKind::Stop => KindProfile {
            title: "Task Complete",
            default_message: "Claude Code has finished the task",
            urgency: Urgency::Normal,
            persistent: false,
            badge_color: "#4CAF50",
        },
    }
}

/// A notification ready to be shown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Same id as the matching [`NotificationRecord`]
    pub id: String,
    pub kind: EventKind,
    pub title: String,
    pub message: String,
    pub urgency: Urgency,
    pub persistent: bool,
}

impl Notification {
    fn from_record(record: &NotificationRecord) -> Self {
        let profile = profile(record.event.kind);
        Self {
            id: record.id.clone(),
            kind: record.event.kind,
            title: profile.title.to_string(),
            message: record
                .event
                .message
                .clone()
                .unwrap_or_else(|| profile.default_message.to_string()),
            urgency: profile.urgency,
            persistent: profile.persistent,
        }
    }

    /// Sample shown by the test-notification request
    pub fn sample() -> Self {
        let profile = profile(EventKind::Stop);
        Self {
            id: format!("test-{}", uuid::Uuid::new_v4()),
            kind: EventKind::Stop,
            title: "Test Notification".to_string(),
            message: "Notifications are working".to_string(),
            urgency: profile.urgency,
            persistent: profile.persistent,
        }
    }
}

/// Why an event was recorded but not shown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    /// The per-kind toggle is off
    KindDisabled,
    /// The global toggle is off
    NotificationsDisabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Show(Notification),
    Suppressed(Suppression),
}

/// Run one domain event through the gate: record it, apply the user's
/// toggles, and count it as unread when shown.
pub fn process(session: &mut ClientSession, event: Event) -> GateDecision {
    let record = NotificationRecord::new(event);
    let kind = record.event.kind;
    let notification = Notification::from_record(&record);
    session.recent.push(record);

    let kind_enabled = match kind {
        EventKind::PermissionPrompt => true,
        EventKind::IdlePrompt => session.settings.notify_on_idle,
        EventKind::Stop => session.settings.notify_on_stop,
    };
    if !kind_enabled {
        return GateDecision::Suppressed(Suppression::KindDisabled);
    }
    if !session.settings.enabled {
        return GateDecision::Suppressed(Suppression::NotificationsDisabled);
    }

    session.mark_unread(kind);
    GateDecision::Show(notification)
}

/// Toolbar-style badge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Badge {
    pub text: String,
    pub color: &'static str,
}

impl Badge {
    /// Unread count in the newest unread kind's color, otherwise the
    /// connection status
    pub fn for_session(session: &ClientSession) -> Self {
        match (session.unread, session.last_unread_kind) {
            (unread, Some(kind)) if unread > 0 => Self {
                text: if unread > 99 {
                    "99+".to_string()
                } else {
                    unread.to_string()
                },
                color: profile(kind).badge_color,
            },
            _ => Self::for_status(session.status),
        }
    }

    pub fn for_status(status: ConnectionStatus) -> Self {
        let (text, color) = match status {
            ConnectionStatus::Connected => ("", "#4CAF50"),
            ConnectionStatus::Connecting => ("...", "#FFC107"),
            ConnectionStatus::Disconnected => ("OFF", "#9E9E9E"),
            ConnectionStatus::Error => ("ERR", "#F44336"),
        };
        Self {
            text: text.to_string(),
            color,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::settings::Settings;
    use std::time::Duration;

    fn session_with(settings: Settings) -> ClientSession {
        ClientSession::new(10, Duration::from_secs(1), Duration::from_secs(30), settings)
    }

    fn event(kind: EventKind, message: Option<&str>) -> Event {
        Event {
            kind,
            message: message.map(str::to_string),
            timestamp: "2025-01-01T00:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn test_permission_prompt_is_persistent_and_urgent() {
        let mut session = session_with(Settings::default());
        let decision = process(&mut session, event(EventKind::PermissionPrompt, None));
        match decision {
            GateDecision::Show(n) => {
                assert!(n.persistent);
                assert_eq!(n.urgency, Urgency::High);
                assert_eq!(n.title, "Permission Required");
                assert_eq!(n.message, "Claude Code needs your permission to continue");
                assert_eq!(n.id, session.recent.iter().next().unwrap().id);
            }
            other => panic!("expected Show, got {:?}", other),
        }
        assert_eq!(session.unread, 1);
    }

    #[test]
    fn test_transient_kinds_use_caller_message() {
        let mut session = session_with(Settings::default());
        for kind in [EventKind::IdlePrompt, EventKind::Stop] {
            match process(&mut session, event(kind, Some("custom"))) {
                GateDecision::Show(n) => {
                    assert!(!n.persistent);
                    assert_eq!(n.urgency, Urgency::Normal);
                    assert_eq!(n.message, "custom");
                }
                other => panic!("expected Show, got {:?}", other),
            }
        }
        assert_eq!(session.unread, 2);
    }

    #[test]
    fn test_kind_toggles_suppress_but_record() {
        let mut session = session_with(Settings {
            notify_on_idle: false,
            notify_on_stop: false,
            ..Settings::default()
        });

        assert_eq!(
            process(&mut session, event(EventKind::IdlePrompt, None)),
            GateDecision::Suppressed(Suppression::KindDisabled)
        );
        assert_eq!(
            process(&mut session, event(EventKind::Stop, None)),
            GateDecision::Suppressed(Suppression::KindDisabled)
        );
        // No toggle for permission prompts
        assert!(matches!(
            process(&mut session, event(EventKind::PermissionPrompt, None)),
            GateDecision::Show(_)
        ));

        assert_eq!(session.recent.len(), 3);
        assert_eq!(session.unread, 1);
    }

    #[test]
    fn test_global_toggle_suppresses_everything() {
        let mut session = session_with(Settings {
            enabled: false,
            ..Settings::default()
        });
        for kind in EventKind::ALL {
            assert_eq!(
                process(&mut session, event(kind, None)),
                GateDecision::Suppressed(Suppression::NotificationsDisabled)
            );
        }
        assert_eq!(session.recent.len(), 3);
        assert_eq!(session.unread, 0);
    }

    #[test]
    fn test_badge_tracks_unread_then_status() {
        let mut session = session_with(Settings::default());
        session.status = ConnectionStatus::Connected;
        assert_eq!(Badge::for_session(&session), Badge::for_status(ConnectionStatus::Connected));

        process(&mut session, event(EventKind::Stop, None));
        process(&mut session, event(EventKind::PermissionPrompt, None));
        let badge = Badge::for_session(&session);
        assert_eq!(badge.text, "2");
        assert_eq!(badge.color, "#FF9800");

        session.acknowledge();
        assert_eq!(Badge::for_session(&session).text, "");
        session.status = ConnectionStatus::Error;
        assert_eq!(Badge::for_session(&session).text, "ERR");
    }

    #[test]
    fn test_badge_caps_large_counts() {
        let mut session = session_with(Settings::default());
        for _ in 0..150 {
            session.mark_unread(EventKind::IdlePrompt);
        }
        assert_eq!(Badge::for_session(&session).text, "99+");
    }
}
