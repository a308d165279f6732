//! Notification module shared by hooks, the broker and listeners
//!
//! AI CLI hooks (Claude Code's `Notification` / `Stop` hooks) submit events
//! through [`client`], which also makes sure a broker is running first.

pub mod client;
pub mod protocol;

pub use client::{ensure_broker_running, send_notification, BrokerClient};
pub use protocol::{
    ClientMessage, ControlMessage, Event, EventKind, HealthResponse, NotifyResponse,
    ServerMessage,
};

use std::path::PathBuf;

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "claude-notify-bridge")
}

/// Runtime directory for PID and lock files
pub fn runtime_dir() -> PathBuf {
    project_dirs()
        .map(|d| d.runtime_dir().unwrap_or(d.data_dir()).to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("claude-notify-bridge"))
}

/// Data directory for logs and the listener store
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("claude-notify-bridge"))
}

/// Default PID file of the broker
pub fn pid_file_path() -> PathBuf {
    runtime_dir().join("broker.pid")
}

/// Lock file taken while a hook launches the broker
pub fn lock_file_path() -> PathBuf {
    runtime_dir().join("broker.lock")
}

/// Default listener key-value store
pub fn store_path() -> PathBuf {
    data_dir().join("listener.json")
}
