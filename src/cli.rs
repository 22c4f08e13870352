// src/cli.rs
// Command line surface and the stdin/stdout shell adapters

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{Level, debug, warn};

use crate::config::{Config, Environment};
use crate::trigger::ipc::decode_line;
use crate::trigger::{Trigger, TriggerBus};
use crate::windows::ShellCommand;

#[derive(Debug, Parser)]
#[command(name = "whist-session")]
#[command(about = "Session orchestration core for the Whist desktop client")]
#[command(version)]
pub struct Cli {
    /// Backend environment
    #[arg(long, env = "WHIST_ENVIRONMENT")]
    pub environment: Option<Environment>,

    /// Native client executable
    #[arg(long, env = "WHIST_PROTOCOL_PATH")]
    pub protocol_path: Option<PathBuf>,

    /// Directory for the store and client logs
    #[arg(long, env = "WHIST_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Renderer shell URL windows load
    #[arg(long, env = "WHIST_SHELL_URL")]
    pub shell_url: Option<String>,

    /// Override the environment's webserver
    #[arg(long, env = "WHIST_WEBSERVER_URL")]
    pub webserver_url: Option<String>,

    /// Give up waiting for a mandelbox after this many seconds
    #[arg(long, env = "WHIST_READY_TIMEOUT_SECS")]
    pub ready_timeout: Option<u64>,

    #[arg(long, env = "WHIST_LOG_LEVEL", default_value = "info")]
    pub log_level: Level,
}

impl Cli {
    /// Environment configuration with command line overrides on top.
    pub fn into_config(self) -> Config {
        let mut config = Config::from_env();
        if let Some(environment) = self.environment {
            config.set_environment(environment);
        }
        if let Some(path) = self.protocol_path {
            config.protocol_path = path;
        }
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(url) = self.shell_url {
            config.shell_url = url;
        }
        if let Some(url) = self.webserver_url {
            config.webserver_url = url;
        }
        if let Some(secs) = self.ready_timeout {
            config.ready_timeout = Some(Duration::from_secs(secs));
        }
        config
    }
}

/// Feed renderer messages from stdin into the bus until EOF.
///
/// Returns when stdin closes; the shell going away means quit.
pub async fn read_ipc<R>(input: R, bus: TriggerBus)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(input);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let Ok(line) = std::str::from_utf8(&buf) else {
                    debug!(bytes = buf.len(), "Ignoring renderer line that is not UTF-8");
                    continue;
                };
                for trigger in decode_line(line) {
                    debug!(trigger = %trigger.id(), "Renderer trigger");
                    bus.emit(trigger);
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read renderer IPC");
                break;
            }
        }
    }
    debug!("Renderer IPC closed");
    bus.emit(Trigger::Quit);
}

/// Writer task that serializes shell commands to stdout, one per line.
pub fn spawn_shell_writer() -> (mpsc::UnboundedSender<ShellCommand>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ShellCommand>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let mut out = std::io::LineWriter::new(stdout.lock());

        while let Some(command) = rx.blocking_recv() {
            match serde_json::to_string(&command) {
                Ok(line) => {
                    if writeln!(out, "{}", line).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Failed to encode shell command"),
            }
        }

        let _ = out.flush();
    });
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::TriggerId;
    use futures::StreamExt;

    #[test]
    fn flags_override_environment() {
        let cli = Cli::parse_from([
            "whist-session",
            "--environment",
            "staging",
            "--data-dir",
            "/tmp/whist-test",
            "--ready-timeout",
            "30",
        ]);
        let config = cli.into_config();
        assert_eq!(config.environment, Environment::Staging);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/whist-test"));
        assert_eq!(config.ready_timeout, Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn stdin_lines_become_triggers_and_eof_quits() {
        let bus = TriggerBus::new();
        let mut logins = bus.from_trigger(TriggerId::LoginRequest);
        let mut quits = bus.from_trigger(TriggerId::Quit);

        let input = concat!(
            r#"["MAIN_STATE", {"loginRequest": {"email": "a@b.com", "password": "x"}}]"#,
            "\n",
            "garbage\n",
        );
        read_ipc(input.as_bytes(), bus.clone()).await;

        assert!(matches!(logins.next().await, Some(Trigger::LoginRequest { .. })));
        assert_eq!(quits.next().await, Some(Trigger::Quit));
    }

    #[tokio::test]
    async fn undecodable_line_is_skipped_not_fatal() {
        let bus = TriggerBus::new();
        let mut logins = bus.from_trigger(TriggerId::LoginRequest);
        let mut quits = bus.from_trigger(TriggerId::Quit);

        let mut input = b"[\"MAIN_STATE\", {\"x\": \"\xff\"}]\n".to_vec();
        input.extend_from_slice(
            br#"["MAIN_STATE", {"loginRequest": {"email": "a@b.com", "password": "x"}}]"#,
        );
        input.push(b'\n');

        let reader = tokio::spawn(read_ipc(std::io::Cursor::new(input), bus.clone()));

        assert!(matches!(logins.next().await, Some(Trigger::LoginRequest { .. })));
        reader.await.unwrap();
        // quit only once input ends
        assert_eq!(quits.next().await, Some(Trigger::Quit));
    }
}
