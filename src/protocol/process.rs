//! Process management for the native streaming client
//!
//! Handles spawning, the stdin handshake, interruption and exit reporting.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, broadcast, oneshot};
use tracing::{debug, info, warn};

use super::stream::{InstabilityMonitor, LogStream, ProtocolLog};
use super::{KILL_LINE, ProtocolConfig, ProtocolEvent, ProtocolHandle, ProtocolLauncher, SessionInfo};

/// Grace period between the interrupt and a hard kill.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The single running client
struct RunningClient {
    handle: ProtocolHandle,
    /// Stdin for the handshake and kill line
    stdin: Option<ChildStdin>,
    /// Asks the waiter task to interrupt the process
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Supervisor for the native client. At most one process runs at a time.
pub struct ProtocolManager {
    config: ProtocolConfig,
    current: Arc<Mutex<Option<RunningClient>>>,
    /// Event broadcaster
    event_tx: broadcast::Sender<ProtocolEvent>,
}

impl ProtocolManager {
    pub fn new(config: ProtocolConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            config,
            current: Arc::new(Mutex::new(None)),
            event_tx,
        }
    }

    /// Handle of the running client, if any.
    pub async fn current(&self) -> Option<ProtocolHandle> {
        self.current.lock().await.as_ref().map(|c| c.handle.clone())
    }

    /// Spawn background task that owns the child until it exits
    fn spawn_waiter(&self, mut child: Child, handle: ProtocolHandle, kill_rx: oneshot::Receiver<()>) {
        let current = self.current.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    interrupt(&mut child);
                    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            warn!(pid = handle.pid, "Client ignored interrupt, killing");
                            let _ = child.start_kill();
                            child.wait().await
                        }
                    }
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(error = %e, "Failed to wait on client");
                    None
                }
            };
            info!(handle = %handle.id, code = ?code, "Client exited");

            {
                let mut current = current.lock().await;
                if current.as_ref().is_some_and(|c| c.handle.id == handle.id) {
                    *current = None;
                }
            }

            let _ = event_tx.send(ProtocolEvent::Exited {
                handle: handle.id,
                code,
            });
        });
    }
}

#[async_trait]
impl ProtocolLauncher for ProtocolManager {
    async fn launch(&self) -> Result<ProtocolHandle> {
        let mut current = self.current.lock().await;
        if let Some(running) = current.as_ref() {
            debug!(handle = %running.handle.id, "Client already running");
            return Ok(running.handle.clone());
        }

        let binary = &self.config.binary;
        ensure_executable(binary).await;

        let log = open_log(&self.config.log_path).await?;

        info!(binary = %binary.display(), environment = %self.config.environment, "Spawning client");

        let mut cmd = Command::new(binary);
        cmd.arg("--read-pipe")
            .arg(format!("--environment={}", self.config.environment))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn client at {}", binary.display()))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().context("Failed to get stdout")?;
        let stderr = child.stderr.take().context("Failed to get stderr")?;

        let handle = ProtocolHandle::new(child.id().unwrap_or_default());

        let monitor = InstabilityMonitor::new(self.config.nack_lookback, self.config.nack_threshold);
        LogStream::new("stdout", log.clone(), self.event_tx.clone())
            .with_monitor(monitor)
            .spawn_reader(stdout);
        LogStream::new("stderr", log, self.event_tx.clone()).spawn_reader(stderr);

        let (kill_tx, kill_rx) = oneshot::channel();
        self.spawn_waiter(child, handle.clone(), kill_rx);

        *current = Some(RunningClient {
            handle: handle.clone(),
            stdin,
            kill_tx: Some(kill_tx),
        });

        let _ = self.event_tx.send(ProtocolEvent::Started(handle.clone()));
        Ok(handle)
    }

    async fn stream_info(&self, handle: &ProtocolHandle, info: &SessionInfo) -> Result<()> {
        let mut current = self.current.lock().await;
        let running = match current.as_mut() {
            Some(running) if running.handle.id == handle.id => running,
            _ => bail!("Client {} is no longer running", handle.id),
        };

        let stdin = running.stdin.as_mut().context("Client stdin not available")?;
        stdin
            .write_all(info.handshake_lines().as_bytes())
            .await
            .context("Failed to write to client stdin")?;
        stdin.flush().await.context("Failed to flush client stdin")?;

        debug!(handle = %handle.id, ip = %info.ip, "Streamed session info to client");
        Ok(())
    }

    async fn kill(&self, handle: &ProtocolHandle) -> Result<()> {
        let mut running = {
            let mut current = self.current.lock().await;
            let matches = current.as_ref().is_some_and(|running| running.handle.id == handle.id);
            if matches { current.take() } else { None }
        }
        .with_context(|| format!("Client {} is not running", handle.id))?;

        info!(handle = %handle.id, pid = handle.pid, "Killing client");

        if let Some(stdin) = running.stdin.as_mut() {
            let written = async {
                stdin.write_all(KILL_LINE.as_bytes()).await?;
                stdin.flush().await
            }
            .await;
            if let Err(e) = written {
                debug!(error = %e, "Could not send kill line, relying on signal");
            }
        }
        if let Some(kill_tx) = running.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.event_tx.subscribe()
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        let _ = child.start_kill();
        return;
    };
    // SAFETY: plain signal delivery to a pid we spawned and have not reaped
    let rc = unsafe { libc::kill(pid, libc::SIGINT) };
    if rc != 0 {
        warn!(pid, "SIGINT failed, killing");
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    let _ = child.start_kill();
}

/// Installers do not always preserve the executable bit.
#[cfg(unix)]
async fn ensure_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return;
    };
    let mut permissions = metadata.permissions();
    let mode = permissions.mode();
    if mode & 0o111 == 0o111 {
        return;
    }
    permissions.set_mode(mode | 0o111);
    if let Err(e) = tokio::fs::set_permissions(path, permissions).await {
        warn!(path = %path.display(), error = %e, "Failed to mark client executable");
    }
}

#[cfg(not(unix))]
async fn ensure_executable(_path: &Path) {}

async fn open_log(path: &Path) -> Result<ProtocolLog> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open client log {}", path.display()))?;
    Ok(ProtocolLog::new(file))
}
