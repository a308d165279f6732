//! Client for submitting hook events to the broker
//!
//! Also hosts the launcher used by hooks: probe `/health`, and if nothing
//! answers, start a broker under a lock file so concurrent hooks don't race
//! each other into a second instance.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use super::protocol::{EventKind, HealthResponse, NotifyResponse};

/// Lock files older than this are considered abandoned by a crashed launcher
const LOCK_STALE_AFTER: Duration = Duration::from_secs(30);
/// How long a launcher waits for a freshly spawned broker to answer
const LAUNCH_WAIT: Duration = Duration::from_secs(3);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Body of `POST /notify`
#[derive(Debug, Clone, Serialize)]
struct Submission<'a> {
    #[serde(rename = "type")]
    kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
}

/// Thin HTTP client for the broker endpoints
#[derive(Debug, Clone)]
pub struct BrokerClient {
    base_url: String,
    http: reqwest::Client,
}

impl BrokerClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Probe `GET /health`
    pub async fn health(&self) -> Result<HealthResponse> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .with_context(|| format!("Failed to reach broker at {}", self.base_url))?
            .error_for_status()
            .context("Broker health check failed")?;
        response
            .json::<HealthResponse>()
            .await
            .context("Failed to parse health response")
    }

    /// Submit an event; the broker stamps the timestamp
    pub async fn notify(&self, kind: EventKind, message: Option<&str>) -> Result<NotifyResponse> {
        let response = self
            .http
            .post(format!("{}/notify", self.base_url))
            .json(&Submission { kind, message })
            .send()
            .await
            .with_context(|| format!("Failed to reach broker at {}", self.base_url))?
            .error_for_status()
            .context("Broker rejected notification")?;
        response
            .json::<NotifyResponse>()
            .await
            .context("Failed to parse notify response")
    }

    /// Poll `/health` until it answers or `timeout` elapses
    pub async fn wait_until_healthy(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.health().await.is_ok() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }
}

/// Send a notification to the broker
///
/// # Arguments
/// * `base_url` - Broker HTTP base URL (e.g. `http://127.0.0.1:3099`)
/// * `kind` - Event kind
/// * `message` - Optional message text
///
/// # Returns
/// The broker's response, or an error if it could not be reached
pub async fn send_notification(
    base_url: &str,
    kind: EventKind,
    message: Option<&str>,
) -> Result<NotifyResponse> {
    BrokerClient::new(base_url)?.notify(kind, message).await
}

/// What [`ensure_broker_running`] found or did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// A broker already answered the health probe
    AlreadyRunning,
    /// We held the lock, spawned a broker and it came up
    Launched,
    /// Another launcher held the lock and its broker came up
    LaunchedElsewhere,
    /// Nothing answered in time
    Unavailable,
}

/// Make sure a broker is answering on `client`'s address.
///
/// `spawn` starts a broker process; it is only called while holding the
/// lock at `lock_path`. Never fails hard: problems resolve to
/// [`LaunchOutcome::Unavailable`] so the caller can still try to submit.
pub async fn ensure_broker_running<F>(
    client: &BrokerClient,
    lock_path: &Path,
    spawn: F,
) -> LaunchOutcome
where
    F: FnOnce() -> Result<()>,
{
    if client.health().await.is_ok() {
        return LaunchOutcome::AlreadyRunning;
    }

    let lock = match LaunchLock::acquire(lock_path) {
        Ok(lock) => lock,
        Err(e) => {
            tracing::warn!("Failed to take launch lock {}: {:#}", lock_path.display(), e);
            None
        }
    };

    match lock {
        Some(_guard) => {
            // Someone may have finished launching between the health check and the lock
            if client.health().await.is_ok() {
                return LaunchOutcome::AlreadyRunning;
            }
            if let Err(e) = spawn() {
                tracing::warn!("Failed to start broker: {:#}", e);
                return LaunchOutcome::Unavailable;
            }
            if client.wait_until_healthy(LAUNCH_WAIT).await {
                tracing::info!("Broker started at {}", client.base_url());
                LaunchOutcome::Launched
            } else {
                tracing::warn!("Broker did not come up within {:?}", LAUNCH_WAIT);
                LaunchOutcome::Unavailable
            }
        }
        None => {
            tracing::debug!("Launch lock held elsewhere, waiting for broker");
            if client.wait_until_healthy(LAUNCH_WAIT).await {
                LaunchOutcome::LaunchedElsewhere
            } else {
                LaunchOutcome::Unavailable
            }
        }
    }
}

/// PID of the broker that is actually answering on `client`'s address.
///
/// A PID file left behind by a broker that crashed may name a process that
/// has since reused the id, so the file is only trusted while `/health`
/// answers. A file without a live broker is removed and `None` returned.
pub async fn running_broker_pid(client: &BrokerClient, pid_file: &Path) -> Result<Option<u32>> {
    if let Err(e) = client.health().await {
        tracing::debug!("Broker not answering at {}: {:#}", client.base_url(), e);
        match std::fs::remove_file(pid_file) {
            Ok(()) => tracing::info!("Removed stale PID file {}", pid_file.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {}", pid_file.display(), e),
        }
        return Ok(None);
    }
    crate::broker::PidFile::read(pid_file).map(Some)
}

/// Spawn `<current exe> serve --port <port>` detached from the calling hook
pub fn spawn_detached_broker(port: u16) -> Result<()> {
    let exe = std::env::current_exe().context("Failed to locate current executable")?;
    let mut command = std::process::Command::new(exe);
    command
        .arg("serve")
        .arg("--port")
        .arg(port.to_string())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());

    // 親プロセス（フック）のシグナルを受けないよう別プロセスグループで起動
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    command.spawn().context("Failed to spawn broker process")?;
    Ok(())
}

/// Exclusive lock file, removed on drop
#[derive(Debug)]
pub struct LaunchLock {
    path: PathBuf,
}

impl LaunchLock {
    /// Try to take the lock. `Ok(None)` means another launcher holds it.
    pub fn acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create lock directory")?;
        }

        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Some(Self {
                        path: path.to_path_buf(),
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if !Self::is_stale(path) {
                        return Ok(None);
                    }
                    tracing::info!("Removing stale launch lock {}", path.display());
                    let _ = std::fs::remove_file(path);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to create lock file {}", path.display()))
                }
            }
        }
        Ok(None)
    }

    fn is_stale(path: &Path) -> bool {
        std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map(|age| age > LOCK_STALE_AFTER)
            .unwrap_or(false)
    }
}

impl Drop for LaunchLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broker.lock");

        let first = LaunchLock::acquire(&path).unwrap();
        assert!(first.is_some());
        assert!(path.exists());

        let second = LaunchLock::acquire(&path).unwrap();
        assert!(second.is_none());

        drop(first);
        assert!(!path.exists());
        assert!(LaunchLock::acquire(&path).unwrap().is_some());
    }

    #[test]
    fn test_submission_body_shape() {
        let body = serde_json::to_string(&Submission {
            kind: EventKind::Stop,
            message: Some("done"),
        })
        .unwrap();
        assert_eq!(body, r#"{"type":"stop","message":"done"}"#);

        let body = serde_json::to_string(&Submission {
            kind: EventKind::IdlePrompt,
            message: None,
        })
        .unwrap();
        assert_eq!(body, r#"{"type":"idle_prompt"}"#);
    }

    #[tokio::test]
    async fn test_unreachable_broker_with_failing_spawn_is_unavailable() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("broker.lock");
        // Port 9 (discard) on localhost is not expected to run an HTTP server
        let client = BrokerClient::new("http://127.0.0.1:9").unwrap();
        let spawned = AtomicBool::new(false);

        let outcome = ensure_broker_running(&client, &lock_path, || {
            spawned.store(true, Ordering::SeqCst);
            anyhow::bail!("no broker binary in tests")
        })
        .await;

        assert_eq!(outcome, LaunchOutcome::Unavailable);
        assert!(spawned.load(Ordering::SeqCst));
        assert!(!lock_path.exists(), "lock must be released");
    }

    #[tokio::test]
    async fn test_stale_pid_file_is_not_trusted() {
        let dir = tempdir().unwrap();
        let pid_file = dir.path().join("broker.pid");
        std::fs::write(&pid_file, "4242\n").unwrap();
        let client = BrokerClient::new("http://127.0.0.1:9").unwrap();

        assert_eq!(running_broker_pid(&client, &pid_file).await.unwrap(), None);
        assert!(!pid_file.exists(), "stale PID file must be removed");
        // 二回目も同じ結果
        assert_eq!(running_broker_pid(&client, &pid_file).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pid_of_answering_broker() {
        use crate::app::BrokerConfig;
        use crate::broker::{Broker, ShutdownReason};

        let dir = tempdir().unwrap();
        let pid_file = dir.path().join("broker.pid");
        let broker = Broker::bind(BrokerConfig {
            port: 0,
            pid_file: pid_file.clone(),
            ..BrokerConfig::default()
        })
        .await
        .unwrap();
        let client = BrokerClient::new(format!("http://{}", broker.local_addr())).unwrap();
        let shutdown = broker.shutdown_handle();
        let run = tokio::spawn(broker.run());
        assert!(client.wait_until_healthy(Duration::from_secs(3)).await);

        assert_eq!(
            running_broker_pid(&client, &pid_file).await.unwrap(),
            Some(std::process::id())
        );

        shutdown.trigger(ShutdownReason::Requested);
        run.await.unwrap().unwrap();
    }
}
