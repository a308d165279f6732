use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

use claude_notify_bridge::app::Config;
use claude_notify_bridge::broker::Broker;
use claude_notify_bridge::listener::{ConsoleNotifier, FileStore, Listener, ListenerHandle};
use claude_notify_bridge::notify::{self, client::spawn_detached_broker, BrokerClient, EventKind};

/// Claude Code notification bridge - forwards hook events to listeners
#[derive(Parser)]
#[command(name = "claude-notify-bridge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(short, long, env = "CLAUDE_NOTIFY_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker (HTTP + WebSocket)
    Serve {
        /// Port to listen on
        #[arg(short, long, env = "CLAUDE_NOTIFY_PORT")]
        port: Option<u16>,
        /// Also log to stderr
        #[arg(long)]
        foreground: bool,
    },
    /// Submit a hook event, starting the broker if needed
    Notify {
        /// Event type (permission_prompt, idle_prompt, stop)
        #[arg(value_parser = parse_kind)]
        kind: EventKind,
        /// Message text
        #[arg(short, long)]
        message: Option<String>,
        /// Read the hook's JSON payload from stdin and use its `message`
        #[arg(long)]
        stdin: bool,
        /// Do not start a broker when none is running
        #[arg(long)]
        no_launch: bool,
        /// Broker port
        #[arg(short, long, env = "CLAUDE_NOTIFY_PORT")]
        port: Option<u16>,
    },
    /// Show the broker's health
    Status {
        /// Broker port
        #[arg(short, long, env = "CLAUDE_NOTIFY_PORT")]
        port: Option<u16>,
    },
    /// Stop the running broker
    Stop,
    /// Run a listener in this terminal
    Listen {
        /// Broker WebSocket URL
        #[arg(long)]
        url: Option<String>,
    },
}

fn parse_kind(s: &str) -> std::result::Result<EventKind, String> {
    EventKind::parse(s).ok_or_else(|| {
        let known: Vec<_> = EventKind::ALL.iter().map(|k| k.as_str()).collect();
        format!("unknown event type '{}' (expected one of: {})", s, known.join(", "))
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load().unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {:#}", e);
        Config::default()
    });
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level.clone());

    let to_stderr = matches!(
        cli.command,
        Commands::Serve {
            foreground: true,
            ..
        } | Commands::Listen { .. }
    );
    // ログ初期化（失敗しても通知の配送は止めない）
    init_logging(&level, to_stderr);

    let runtime = tokio::runtime::Runtime::new()?;

    match cli.command {
        Commands::Serve { port, .. } => {
            if let Some(port) = port {
                config.broker.port = port;
            }
            runtime.block_on(run_broker(config))
        }
        Commands::Notify {
            kind,
            message,
            stdin,
            no_launch,
            port,
        } => {
            if let Some(port) = port {
                config.broker.port = port;
            }
            let message = message.or_else(|| if stdin { read_hook_message() } else { None });
            runtime.block_on(run_notify(config, kind, message, no_launch));
            // フックを壊さないよう、配送の失敗は常に exit 0
            Ok(())
        }
        Commands::Status { port } => {
            if let Some(port) = port {
                config.broker.port = port;
            }
            if !runtime.block_on(print_status(config))? {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Stop => runtime.block_on(stop_broker(&config)),
        Commands::Listen { url } => {
            if let Some(url) = url {
                config.listener.url = url;
            }
            runtime.block_on(run_listen(config))
        }
    }
}

/// Install the global subscriber. A log file that can't be opened is not
/// fatal: logging falls back to stderr and the error is reported once.
fn init_logging(level: &str, to_stderr: bool) {
    let (dispatch, file_error) = log_dispatch(level, to_stderr, &notify::data_dir());
    if let Err(e) = tracing::dispatcher::set_global_default(dispatch) {
        eprintln!("Failed to install logger: {}", e);
    }
    if let Some(e) = file_error {
        tracing::warn!("Logging to stderr only: {:#}", e);
    }
}

fn log_dispatch(
    level: &str,
    to_stderr: bool,
    log_dir: &Path,
) -> (tracing::Dispatch, Option<anyhow::Error>) {
    let (log_file, file_error) = match open_log_file(log_dir) {
        Ok(file) => (Some(file), None),
        Err(e) => (None, Some(e)),
    };
    let to_stderr = to_stderr || log_file.is_none();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(log_file.map(|file| {
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file)
        }))
        .with(to_stderr.then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)));

    (tracing::Dispatch::new(subscriber), file_error)
}

fn open_log_file(log_dir: &Path) -> Result<File> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let path = log_dir.join("claude-notify-bridge.log");
    // ブローカーとフックが同じファイルに書くので追記モード
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

async fn run_broker(config: Config) -> Result<()> {
    let broker = Broker::bind(config.broker).await?;
    let reason = broker.run().await?;
    info!(?reason, "Exiting");
    Ok(())
}

/// Pull `message` out of a hook payload on stdin
fn read_hook_message() -> Option<String> {
    let mut input = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut input) {
        tracing::warn!("Failed to read stdin: {}", e);
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(&input) {
        Ok(payload) => payload
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string),
        Err(e) => {
            tracing::warn!("Hook payload is not JSON: {}", e);
            None
        }
    }
}

async fn run_notify(config: Config, kind: EventKind, message: Option<String>, no_launch: bool) {
    let client = match BrokerClient::new(config.broker.http_url()) {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!("Failed to create HTTP client: {:#}", e);
            return;
        }
    };

    if !no_launch {
        let port = config.broker.port;
        let outcome = notify::ensure_broker_running(&client, &notify::lock_file_path(), || {
            spawn_detached_broker(port)
        })
        .await;
        tracing::debug!(?outcome, "Broker launch check");
    }

    match client.notify(kind, message.as_deref()).await {
        Ok(response) => info!(
            %kind,
            clients_notified = response.clients_notified,
            "Notification delivered"
        ),
        Err(e) => tracing::warn!(%kind, "Failed to deliver notification: {:#}", e),
    }
}

/// Returns whether the broker answered
async fn print_status(config: Config) -> Result<bool> {
    let client = BrokerClient::new(config.broker.http_url())?;
    match client.health().await {
        Ok(health) => {
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(true)
        }
        Err(e) => {
            eprintln!("Broker is not running at {}: {:#}", client.base_url(), e);
            Ok(false)
        }
    }
}

async fn stop_broker(config: &Config) -> Result<()> {
    let client = BrokerClient::new(config.broker.http_url())?;
    let Some(pid) = notify::client::running_broker_pid(&client, &config.broker.pid_file).await?
    else {
        println!("Broker is not running at {}", client.base_url());
        return Ok(());
    };

    let status = std::process::Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .status()
        .context("Failed to run kill")?;
    if !status.success() {
        anyhow::bail!("kill -TERM {} failed ({})", pid, status);
    }
    println!("Sent SIGTERM to broker (pid {})", pid);
    Ok(())
}

async fn run_listen(config: Config) -> Result<()> {
    let store = Arc::new(FileStore::new(&config.listener.store_path));
    let notifier = Arc::new(ConsoleNotifier::new());
    let (handle, join) = Listener::spawn(config.listener, store, notifier);

    println!("Commands: status, read, test, reconnect, clear, remove <id>, quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_command(&handle, line.trim()).await? {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown().await?;
    join.await.context("Listener task panicked")?;
    Ok(())
}

/// Returns false when the user asked to quit
async fn handle_command(handle: &ListenerHandle, line: &str) -> Result<bool> {
    let mut parts = line.split_whitespace();
    let response = match (parts.next(), parts.next()) {
        (None, _) => return Ok(true),
        (Some("quit" | "exit"), _) => return Ok(false),
        (Some("status"), _) => serde_json::to_value(handle.get_status().await?)?,
        (Some("read"), _) => serde_json::to_value(handle.mark_as_read().await?)?,
        (Some("test"), _) => serde_json::to_value(handle.test_notification().await?)?,
        (Some("reconnect"), _) => serde_json::to_value(handle.reconnect().await?)?,
        (Some("clear"), _) => serde_json::to_value(handle.clear_notifications().await?)?,
        (Some("remove"), Some(id)) => serde_json::to_value(handle.remove_notification(id).await?)?,
        (Some("remove"), None) => {
            println!("Usage: remove <id>");
            return Ok(true);
        }
        (Some(other), _) => {
            println!("Unknown command: {}", other);
            return Ok(true);
        }
    };
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(true)
}
