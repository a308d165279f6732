//! Local notification broker
//!
//! Accepts events on `POST /notify` and fans them out to every WebSocket
//! listener connected on the same port. Exits on SIGINT/SIGTERM or after a
//! grace period with no listeners.

pub mod connection;
pub mod hub;
pub mod lifecycle;
pub mod server;
pub mod submission;

pub use hub::{BroadcastHub, ConnectionId, HubError};
pub use lifecycle::{Broker, PidFile, ShutdownHandle, ShutdownReason};
pub use submission::{parse_submission, SubmitError};
