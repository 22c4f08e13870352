//! Client log handling
//!
//! Every stdout/stderr line is classified by its `LEVEL |` prefix, re-emitted
//! on the `protocol` tracing target and appended to the client log file.
//! NACK markers on stdout feed the instability detector.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, broadcast};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::ProtocolEvent;

/// Substring the client logs for every retransmission request.
pub const NACK_MARKER: &str = "NACKING";

/// How often a quiet stream is checked for recovery.
const RECOVERY_POLL: Duration = Duration::from_millis(250);

static LEVEL_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(FATAL|ERROR|WARNING|WARN|INFO|DEBUG|METRIC)\s*\|").expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum LogLevel {
    Fatal,
    Error,
    Warning,
    Info,
    Debug,
    Metric,
}

/// Level of a client log line. Lines without a recognised prefix are INFO.
pub fn classify(line: &str) -> LogLevel {
    let Some(caps) = LEVEL_PREFIX.captures(line) else {
        return LogLevel::Info;
    };
    match &caps[1] {
        "FATAL" => LogLevel::Fatal,
        "ERROR" => LogLevel::Error,
        "WARNING" | "WARN" => LogLevel::Warning,
        "DEBUG" => LogLevel::Debug,
        "METRIC" => LogLevel::Metric,
        _ => LogLevel::Info,
    }
}

fn emit(level: LogLevel, source: &'static str, line: &str) {
    match level {
        LogLevel::Fatal | LogLevel::Error => error!(target: "protocol", source, "{}", line),
        LogLevel::Warning => warn!(target: "protocol", source, "{}", line),
        LogLevel::Info | LogLevel::Metric => info!(target: "protocol", source, "{}", line),
        LogLevel::Debug => debug!(target: "protocol", source, "{}", line),
    }
}

/// NACK burst detector.
///
/// NACKs are counted while each arrives within `lookback` of the previous one;
/// a longer gap restarts the count. Exceeding `threshold` flags the network
/// unstable once. A quiet `lookback` period flags it stable again.
#[derive(Debug, Clone)]
pub struct InstabilityMonitor {
    lookback: Duration,
    threshold: usize,
    count: usize,
    last_nack: Option<Instant>,
    unstable: bool,
}

impl InstabilityMonitor {
    pub fn new(lookback: Duration, threshold: usize) -> Self {
        Self {
            lookback,
            threshold,
            count: 0,
            last_nack: None,
            unstable: false,
        }
    }

    pub fn is_unstable(&self) -> bool {
        self.unstable
    }

    /// Record a NACK. Returns true when this NACK made the network unstable.
    pub fn record_nack(&mut self, now: Instant) -> bool {
        if self
            .last_nack
            .is_some_and(|last| now.saturating_duration_since(last) > self.lookback)
        {
            self.count = 0;
        }
        self.last_nack = Some(now);
        self.count += 1;

        if !self.unstable && self.count > self.threshold {
            self.unstable = true;
            return true;
        }
        false
    }

    /// Returns true when an unstable network has been quiet for a full lookback.
    pub fn poll(&mut self, now: Instant) -> bool {
        let quiet = self
            .last_nack
            .is_none_or(|last| now.saturating_duration_since(last) > self.lookback);
        if self.unstable && quiet {
            self.unstable = false;
            self.count = 0;
            return true;
        }
        false
    }
}

/// Line-buffered client log file shared by the stdout and stderr readers.
#[derive(Clone)]
pub(super) struct ProtocolLog {
    file: Arc<Mutex<File>>,
}

impl ProtocolLog {
    pub(super) fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    async fn write_line(&self, line: &str) {
        let mut file = self.file.lock().await;
        let written = async {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;
        if let Err(e) = written {
            trace!(error = %e, "Failed to append to client log");
        }
    }
}

/// Reader for one of the client's output pipes.
pub(super) struct LogStream {
    source: &'static str,
    log: ProtocolLog,
    monitor: Option<InstabilityMonitor>,
    events: broadcast::Sender<ProtocolEvent>,
}

impl LogStream {
    pub(super) fn new(
        source: &'static str,
        log: ProtocolLog,
        events: broadcast::Sender<ProtocolEvent>,
    ) -> Self {
        Self {
            source,
            log,
            monitor: None,
            events,
        }
    }

    pub(super) fn with_monitor(mut self, monitor: InstabilityMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Spawn a task that reads the pipe until EOF
    pub(super) fn spawn_reader<R>(self, reader: R) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            self.read_stream(reader).await;
        })
    }

    async fn read_stream<R>(mut self, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut recovery = tokio::time::interval(RECOVERY_POLL);
        recovery.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let watch_recovery = self.monitor.is_some();

        loop {
            tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => match read {
                    Ok(0) => break,
                    Ok(_) => {
                        // the client does not promise UTF-8; keep the line anyway
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(['\n', '\r']).to_string();
                        buf.clear();
                        self.handle_line(&line).await;
                    }
                    Err(e) => {
                        warn!(source = self.source, error = %e, "Client pipe read failed");
                        break;
                    }
                },
                _ = recovery.tick(), if watch_recovery => self.check_recovery(),
            }
        }

        debug!(source = self.source, "Client log reader finished");
    }

    async fn handle_line(&mut self, line: &str) {
        emit(classify(line), self.source, line);
        self.log.write_line(line).await;

        if !line.contains(NACK_MARKER) {
            return;
        }
        if let Some(monitor) = self.monitor.as_mut()
            && monitor.record_nack(Instant::now())
        {
            warn!("Network unstable, client is NACKing heavily");
            let _ = self.events.send(ProtocolEvent::Unstable(true));
        }
    }

    fn check_recovery(&mut self) {
        if let Some(monitor) = self.monitor.as_mut()
            && monitor.poll(Instant::now())
        {
            info!("Network stable again");
            let _ = self.events.send(ProtocolEvent::Unstable(false));
        }
    }
}
