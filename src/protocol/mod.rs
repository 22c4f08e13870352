//! Native streaming client ("protocol") supervision
//!
//! Spawns the client binary, hands it session parameters over stdin, mirrors
//! its logs and reports network instability and exit.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              ProtocolManager                 │
//! │  • launch()      - spawn (idempotent)        │
//! │  • stream_info() - ports / key / ip handshake│
//! │  • kill()        - SIGINT + kill?0           │
//! │  • subscribe()   - ProtocolEvent broadcast   │
//! └──────────────────────────────────────────────┘
//!          │ stdin                 ▲ stdout/stderr
//!          ▼                       │
//! ┌──────────────────────────────────────────────┐
//! │     WhistClient --read-pipe --environment=…  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = ProtocolManager::new(config.protocol());
//! let mut events = manager.subscribe();
//!
//! let handle = manager.launch().await?;
//! manager.stream_info(&handle, &info).await?;
//! // ...
//! manager.kill(&handle).await?;
//! ```

mod process;
mod stream;

pub use process::ProtocolManager;
pub use stream::{InstabilityMonitor, LogLevel, NACK_MARKER, classify};

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Opaque handle to one running client process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolHandle {
    pub id: String,
    pub pid: u32,
    /// Unix timestamp when spawned
    pub launched_at: i64,
}

impl ProtocolHandle {
    pub fn new(pid: u32) -> Self {
        Self {
            id: format!("proto_{}", uuid::Uuid::new_v4()),
            pid,
            launched_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub binary: PathBuf,
    /// Passed through as `--environment=<env>`
    pub environment: String,
    pub log_path: PathBuf,
    pub nack_lookback: Duration,
    pub nack_threshold: usize,
}

/// Host ports the mandelbox maps to the client's fixed ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub port_32262: u16,
    pub port_32263: u16,
    pub port_32273: u16,
}

impl PortMapping {
    /// `32262:P1.32263:P2.32273:P3`
    pub fn to_pipe_value(&self) -> String {
        format!(
            "32262:{}.32263:{}.32273:{}",
            self.port_32262, self.port_32263, self.port_32273
        )
    }
}

/// Everything the client needs to connect to its mandelbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub ip: String,
    pub secret: String,
    pub ports: PortMapping,
}

impl SessionInfo {
    /// The stdin handshake, one `key?value` line per parameter.
    pub fn handshake_lines(&self) -> String {
        format!(
            "ports?{}\nprivate-key?{}\nip?{}\nfinished?0\n",
            self.ports.to_pipe_value(),
            self.secret,
            self.ip
        )
    }
}

/// Stdin line asking the client to shut down.
pub const KILL_LINE: &str = "kill?0\n";

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    Started(ProtocolHandle),
    /// Instability detector flipped
    Unstable(bool),
    Exited { handle: String, code: Option<i32> },
}

/// Process-spawning seam used by the orchestrator.
#[async_trait]
pub trait ProtocolLauncher: Send + Sync {
    /// Spawn the client, or return the handle of the one already running.
    async fn launch(&self) -> Result<ProtocolHandle>;

    async fn stream_info(&self, handle: &ProtocolHandle, info: &SessionInfo) -> Result<()>;

    async fn kill(&self, handle: &ProtocolHandle) -> Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_serialize_in_fixed_order() {
        let ports = PortMapping {
            port_32262: 1,
            port_32263: 2,
            port_32273: 3,
        };
        assert_eq!(ports.to_pipe_value(), "32262:1.32263:2.32273:3");
    }

    #[test]
    fn handshake_ends_with_finished() {
        let info = SessionInfo {
            ip: "10.0.0.5".into(),
            secret: "abc".into(),
            ports: PortMapping {
                port_32262: 40000,
                port_32263: 40001,
                port_32273: 40002,
            },
        };
        assert_eq!(
            info.handshake_lines(),
            "ports?32262:40000.32263:40001.32273:40002\nprivate-key?abc\nip?10.0.0.5\nfinished?0\n"
        );
    }

    #[test]
    fn handles_are_unique() {
        let a = ProtocolHandle::new(1);
        let b = ProtocolHandle::new(1);
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("proto_"));
    }
}
