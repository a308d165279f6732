//! Per-listener session state
//!
//! Owned by the listener task alone; nothing here is shared or locked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use uuid::Uuid;

use super::backoff::Backoff;
use super::settings::Settings;
use crate::notify::protocol::{Event, EventKind};

/// Connection status shown to the user (badge, status request)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        }
    }
}

/// A received event as remembered for the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    #[serde(flatten)]
    pub event: Event,
    pub received_at: DateTime<Utc>,
}

impl NotificationRecord {
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event,
            received_at: Utc::now(),
        }
    }
}

/// Bounded, most-recent-first list of received events
#[derive(Debug, Clone)]
pub struct RecentNotifications {
    capacity: usize,
    items: VecDeque<NotificationRecord>,
}

impl RecentNotifications {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Insert at the front, dropping the oldest on overflow
    pub fn push(&mut self, record: NotificationRecord) {
        self.items.push_front(record);
        self.items.truncate(self.capacity);
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|record| record.id != id);
        self.items.len() != before
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NotificationRecord> {
        self.items.iter()
    }

    pub fn to_vec(&self) -> Vec<NotificationRecord> {
        self.items.iter().cloned().collect()
    }
}

/// Everything the listener knows about itself
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub status: ConnectionStatus,
    pub backoff: Backoff,
    pub recent: RecentNotifications,
    pub unread: usize,
    /// Kind of the newest event counted in `unread`
    pub last_unread_kind: Option<EventKind>,
    pub settings: Settings,
}

impl ClientSession {
    pub fn new(
        recent_capacity: usize,
        reconnect_floor: Duration,
        reconnect_ceiling: Duration,
        settings: Settings,
    ) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            backoff: Backoff::new(reconnect_floor, reconnect_ceiling),
            recent: RecentNotifications::new(recent_capacity),
            unread: 0,
            last_unread_kind: None,
            settings,
        }
    }

    /// Count one more unread notification
    pub fn mark_unread(&mut self, kind: EventKind) {
        self.unread += 1;
        self.last_unread_kind = Some(kind);
    }

    /// The user looked: unread goes back to zero, history stays
    pub fn acknowledge(&mut self) {
        self.unread = 0;
        self.last_unread_kind = None;
    }
}
