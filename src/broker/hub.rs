//! Registry of live listener connections and event fan-out
//!
//! The hub is the only owner of each connection's outbound queue. Connection
//! tasks hold just their [`ConnectionId`] and the receiving half, so once a
//! connection is unregistered its queue closes and its writer task ends.
//!
//! The idle-shutdown timer lives here as well: arming, cancelling and firing
//! are decided under the same lock as register/unregister, using a
//! generation counter so a timer that lost a race simply does nothing.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use super::lifecycle::{ShutdownHandle, ShutdownReason};
use crate::notify::protocol::{Event, ServerMessage};

/// Opaque handle of a registered connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Frames queued for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: &'static str },
}

/// Lifecycle of a registered connection. `Connecting` and `Closed` are
/// never stored: before registration and after unregistration the hub
/// doesn't know the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("broker is shutting down")]
    ShuttingDown,
}

/// Returned by [`BroadcastHub::register`]
#[derive(Debug)]
pub struct Registration {
    pub id: ConnectionId,
    pub outbound: mpsc::Receiver<Outbound>,
}

struct Slot {
    peer: String,
    connected_at: DateTime<Utc>,
    state: ConnectionState,
    tx: mpsc::Sender<Outbound>,
}

struct HubState {
    connections: HashMap<ConnectionId, Slot>,
    /// Cleared once shutdown begins; registration is refused afterwards
    accepting: bool,
    idle_generation: u64,
    idle_timer: Option<JoinHandle<()>>,
}

impl HubState {
    fn cancel_idle_timer(&mut self) {
        self.idle_generation += 1;
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

pub struct BroadcastHub {
    state: Mutex<HubState>,
    next_id: AtomicU64,
    queue_capacity: usize,
    idle_grace: Duration,
    shutdown: ShutdownHandle,
}

impl BroadcastHub {
    pub fn new(queue_capacity: usize, idle_grace: Duration, shutdown: ShutdownHandle) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState {
                connections: HashMap::new(),
                accepting: true,
                idle_generation: 0,
                idle_timer: None,
            }),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            idle_grace,
            shutdown,
        })
    }

    /// Add a freshly handshaken connection. Cancels a pending idle shutdown.
    pub fn register(self: &Arc<Self>, peer: impl Into<String>) -> Result<Registration, HubError> {
        let peer = peer.into();
        let (tx, outbound) = mpsc::channel(self.queue_capacity);
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut state = self.state.lock();
        if !state.accepting || self.shutdown.is_shutting_down() {
            return Err(HubError::ShuttingDown);
        }
        if state.idle_timer.is_some() {
            tracing::info!("Listener connected, idle shutdown cancelled");
        }
        state.cancel_idle_timer();
        state.connections.insert(
            id,
            Slot {
                peer: peer.clone(),
                connected_at: Utc::now(),
                state: ConnectionState::Open,
                tx,
            },
        );
        tracing::info!(%id, %peer, total = state.connections.len(), "Listener registered");

        Ok(Registration { id, outbound })
    }

    /// Stop counting a connection as open; broadcasts skip it from now on
    pub fn mark_closing(&self, id: ConnectionId) {
        if let Some(slot) = self.state.lock().connections.get_mut(&id) {
            slot.state = ConnectionState::Closing;
        }
    }

    /// Remove a connection. Idempotent: returns `false` if it was already gone.
    /// Arms the idle timer when the last connection leaves.
    pub fn unregister(self: &Arc<Self>, id: ConnectionId) -> bool {
        let mut state = self.state.lock();
        let Some(slot) = state.connections.remove(&id) else {
            return false;
        };
        let lifetime = Utc::now() - slot.connected_at;
        tracing::info!(
            %id,
            peer = %slot.peer,
            connected_secs = lifetime.num_seconds(),
            remaining = state.connections.len(),
            "Listener unregistered"
        );
        if state.connections.is_empty() && state.accepting {
            self.arm_idle_timer_locked(&mut state);
        }
        true
    }

    /// Arm the idle timer if nobody is connected (used at startup)
    pub fn arm_idle_timer(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.connections.is_empty() && state.accepting {
            self.arm_idle_timer_locked(&mut state);
        }
    }

    fn arm_idle_timer_locked(self: &Arc<Self>, state: &mut HubState) {
        state.cancel_idle_timer();
        let generation = state.idle_generation;
        let grace = self.idle_grace;
        let hub: Weak<Self> = Arc::downgrade(self);

        tracing::info!(grace_secs = grace.as_secs_f64(), "No listeners connected, idle shutdown armed");
        state.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(hub) = hub.upgrade() {
                hub.idle_timer_fired(generation);
            }
        }));
    }

    fn idle_timer_fired(&self, generation: u64) {
        let fire = {
            let mut state = self.state.lock();
            if state.idle_generation == generation
                && state.connections.is_empty()
                && state.accepting
            {
                state.accepting = false;
                state.idle_timer = None;
                true
            } else {
                false
            }
        };
        if fire {
            tracing::info!("Idle grace period elapsed without listeners");
            self.shutdown.trigger(ShutdownReason::Idle);
        }
    }

    /// Whether an idle shutdown is pending
    pub fn idle_timer_armed(&self) -> bool {
        self.state.lock().idle_timer.is_some()
    }

    /// Queue `event` for every open connection without waiting on any of
    /// them. Returns how many connections accepted it.
    pub fn broadcast(&self, event: &Event) -> usize {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to serialize event: {}", e);
                return 0;
            }
        };

        let targets: Vec<(ConnectionId, mpsc::Sender<Outbound>)> = {
            let state = self.state.lock();
            state
                .connections
                .iter()
                .filter(|(_, slot)| slot.state == ConnectionState::Open)
                .map(|(id, slot)| (*id, slot.tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (id, tx) in targets {
            match tx.try_send(Outbound::Text(payload.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(%id, "Listener queue full, event skipped");
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(%id, "Listener writer gone, event skipped");
                }
            }
        }

        tracing::info!(kind = %event.kind, delivered, "Event broadcast");
        delivered
    }

    /// Queue a message for a single connection (welcome, pong)
    pub fn send_to(&self, id: ConnectionId, message: &ServerMessage) -> bool {
        let tx = match self.state.lock().connections.get(&id) {
            Some(slot) => slot.tx.clone(),
            None => return false,
        };
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return false;
            }
        };
        match tx.try_send(Outbound::Text(payload)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(%id, "Failed to queue message: {}", e);
                false
            }
        }
    }

    /// Refuse new registrations and ask every connection to close.
    /// Returns how many close frames were queued.
    pub fn close_all(&self, code: u16, reason: &'static str) -> usize {
        let targets: Vec<mpsc::Sender<Outbound>> = {
            let mut state = self.state.lock();
            state.accepting = false;
            state.cancel_idle_timer();
            state
                .connections
                .values_mut()
                .map(|slot| {
                    slot.state = ConnectionState::Closing;
                    slot.tx.clone()
                })
                .collect()
        };

        targets
            .into_iter()
            .filter(|tx| tx.try_send(Outbound::Close { code, reason }).is_ok())
            .count()
    }

    /// Current number of registered connections
    pub fn size(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Number of connections currently open
    pub fn open_count(&self) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .filter(|slot| slot.state == ConnectionState::Open)
            .count()
    }

    /// Wait (polling) until every connection has unregistered
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.size() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        true
    }
}

impl Drop for BroadcastHub {
    fn drop(&mut self) {
        self.state.get_mut().cancel_idle_timer();
    }
}
