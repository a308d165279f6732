//! Process lifecycle: PID file, shutdown signalling, and the broker entry point

use anyhow::{Context, Result};
use axum::extract::ws::close_code;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;

use super::hub::BroadcastHub;
use super::server::{self, BrokerState};
use crate::app::BrokerConfig;

/// How long to wait for listeners to acknowledge the close frames
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Why the broker stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// No listener connected for the whole grace period
    Idle,
    /// SIGINT / SIGTERM
    Signal,
    /// Requested programmatically
    Requested,
}

/// One-shot shutdown trigger shared by the idle timer, signal handler and
/// server. The first trigger wins; later ones are no-ops.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown. Returns `false` if shutdown was already underway.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let first = self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if first {
            tracing::info!(?reason, "Shutdown requested");
        } else {
            tracing::debug!(?reason, "Shutdown already in progress");
        }
        first
    }

    /// Reason for shutdown if one was triggered
    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.tx.borrow()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolve once shutdown has been triggered
    pub async fn wait(&self) -> ShutdownReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Sender lives in `self`, so this cannot happen while we're borrowed
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// PID file for external tooling (`stop`, launcher scripts)
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current process id to `path`
    pub fn write(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create PID directory")?;
        }
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("Failed to write PID file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file; a missing file is not an error
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to remove PID file {}", self.path.display())),
        }
    }

    /// Read a PID written by [`PidFile::write`]
    pub fn read(path: &Path) -> Result<u32> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read PID file {}", path.display()))?;
        content
            .trim()
            .parse()
            .with_context(|| format!("Invalid PID in {}", path.display()))
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = self.remove();
    }
}

/// A bound, not yet running broker
pub struct Broker {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: BrokerConfig,
    hub: Arc<BroadcastHub>,
    shutdown: ShutdownHandle,
}

impl Broker {
    /// Bind the HTTP/WebSocket port. An occupied port is a fatal error:
    /// the launcher treats it as "another broker is already running".
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {} (is another broker running?)", addr))?;
        let local_addr = listener.local_addr()?;

        let shutdown = ShutdownHandle::new();
        let hub = BroadcastHub::new(config.send_queue, config.idle_shutdown(), shutdown.clone());

        Ok(Self {
            listener,
            local_addr,
            config,
            hub,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn hub(&self) -> Arc<BroadcastHub> {
        Arc::clone(&self.hub)
    }

    /// Serve until idle timeout or a shutdown trigger, then close every
    /// listener, remove the PID file and stop accepting.
    pub async fn run(self) -> Result<ShutdownReason> {
        let Broker {
            listener,
            local_addr,
            config,
            hub,
            shutdown,
        } = self;

        let pid_file = PidFile::write(&config.pid_file)?;
        tracing::info!(
            addr = %local_addr,
            pid = std::process::id(),
            pid_file = %pid_file.path().display(),
            "Notification broker started"
        );

        tokio::spawn(listen_for_signals(shutdown.clone()));

        // Starts with no listeners, so the idle clock starts now
        hub.arm_idle_timer();

        let state = Arc::new(BrokerState {
            hub: Arc::clone(&hub),
            started_at: Instant::now(),
            keepalive_timeout: config.keepalive_timeout(),
            write_timeout: config.write_timeout(),
        });
        let app = server::router(state);

        let graceful_hub = Arc::clone(&hub);
        let graceful_shutdown = shutdown.clone();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let reason = graceful_shutdown.wait().await;
            let closed = graceful_hub.close_all(close_code::NORMAL, "Server shutting down");
            tracing::info!(?reason, closed, "Closing listener connections");
            if let Err(e) = pid_file.remove() {
                tracing::warn!("{:#}", e);
            }
        })
        .await
        .context("Broker server error")?;

        if !hub.wait_until_empty(DRAIN_TIMEOUT).await {
            tracing::warn!(remaining = hub.size(), "Listeners did not close in time");
        }

        let reason = shutdown.reason().unwrap_or(ShutdownReason::Requested);
        tracing::info!(?reason, "Notification broker stopped");
        Ok(reason)
    }
}

async fn listen_for_signals(shutdown: ShutdownHandle) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = shutdown.wait() => return,
    }
    shutdown.trigger(ShutdownReason::Signal);
}
