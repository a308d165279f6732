//! Notification listener: the client side of the broker's WebSocket

pub mod backoff;
pub mod gate;
pub mod notifier;
pub mod runner;
pub mod session;
pub mod settings;

pub use backoff::{next_delay, Backoff};
pub use gate::{Badge, GateDecision, Notification, Urgency};
pub use notifier::{ConsoleNotifier, Notifier};
pub use runner::{Ack, Listener, ListenerHandle, StatusResponse};
pub use session::{ClientSession, ConnectionStatus, NotificationRecord, RecentNotifications};
pub use settings::{FileStore, KeyValueStore, MemoryStore, Settings};
