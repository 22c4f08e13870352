// src/config/mod.rs
// Runtime configuration: defaults, WHIST_* environment overrides, CLI overrides

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::protocol::ProtocolConfig;

/// Deployment stage the client talks to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn webserver_url(&self) -> &'static str {
        match self {
            Self::Dev => "https://dev-server.whist.com",
            Self::Staging => "https://staging-server.whist.com",
            Self::Prod => "https://prod-server.whist.com",
        }
    }
}

/// Regions the assignment backend can place a mandelbox in.
pub const DEFAULT_REGIONS: &[&str] = &["us-east-1", "us-east-2", "us-west-1", "us-west-2", "ca-central-1"];

#[derive(Debug, Clone)]
pub struct Config {
    // ── Backend
    pub environment: Environment,
    pub webserver_url: String,
    pub http_timeout: Duration,
    pub regions: Vec<String>,

    // ── Renderer shell
    pub shell_url: String,

    // ── Native client
    pub protocol_path: PathBuf,
    pub nack_lookback: Duration,
    pub nack_threshold: usize,

    // ── Mandelbox readiness polling
    pub poll_interval: Duration,
    /// None polls until the mandelbox is ready
    pub ready_timeout: Option<Duration>,

    // ── Storage
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let environment = Environment::Prod;
        let data_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("whist");

        Self {
            environment,
            webserver_url: environment.webserver_url().to_string(),
            http_timeout: Duration::from_secs(30),
            regions: DEFAULT_REGIONS.iter().map(|r| r.to_string()).collect(),
            shell_url: "file:///opt/whist/renderer/index.html".to_string(),
            protocol_path: default_protocol_path(),
            nack_lookback: Duration::from_secs(3),
            nack_threshold: 6,
            poll_interval: Duration::from_secs(1),
            ready_timeout: None,
            data_dir,
        }
    }
}

impl Config {
    /// Defaults overridden by `WHIST_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("WHIST_ENVIRONMENT") {
            match Environment::from_str(val.trim()) {
                Ok(env) => config.set_environment(env),
                Err(_) => warn!(value = %val, "Unknown WHIST_ENVIRONMENT, keeping default"),
            }
        }
        if let Ok(val) = std::env::var("WHIST_WEBSERVER_URL") {
            config.webserver_url = val;
        }
        if let Ok(val) = std::env::var("WHIST_SHELL_URL") {
            config.shell_url = val;
        }
        if let Ok(val) = std::env::var("WHIST_PROTOCOL_PATH") {
            config.protocol_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("WHIST_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("WHIST_REGIONS") {
            let regions: Vec<String> = val
                .split(',')
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect();
            if !regions.is_empty() {
                config.regions = regions;
            }
        }
        if let Some(secs) = env_parse::<u64>("WHIST_HTTP_TIMEOUT_SECS") {
            config.http_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("WHIST_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("WHIST_READY_TIMEOUT_SECS") {
            config.ready_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(threshold) = env_parse::<usize>("WHIST_NACK_THRESHOLD") {
            config.nack_threshold = threshold;
        }

        config
    }

    /// Switch environment, moving the webserver URL along unless it was customised.
    pub fn set_environment(&mut self, environment: Environment) {
        if self.webserver_url == self.environment.webserver_url() {
            self.webserver_url = environment.webserver_url().to_string();
        }
        self.environment = environment;
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }

    pub fn protocol_log_path(&self) -> PathBuf {
        self.data_dir.join("logs").join("protocol.log")
    }

    pub fn protocol(&self) -> ProtocolConfig {
        ProtocolConfig {
            binary: self.protocol_path.clone(),
            environment: self.environment.to_string(),
            log_path: self.protocol_log_path(),
            nack_lookback: self.nack_lookback,
            nack_threshold: self.nack_threshold,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let val = std::env::var(key).ok()?;
    match val.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key, value = %val, "Config value failed to parse, using default");
            None
        }
    }
}

fn default_protocol_path() -> PathBuf {
    let name = if cfg!(windows) { "WhistClient.exe" } else { "WhistClient" };
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("protocol-build").join(name)))
        .unwrap_or_else(|| PathBuf::from(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parses_lowercase() {
        assert_eq!(Environment::from_str("staging").unwrap(), Environment::Staging);
        assert_eq!(Environment::Dev.to_string(), "dev");
        assert!(Environment::from_str("qa").is_err());
    }

    #[test]
    fn switching_environment_moves_default_webserver() {
        let mut config = Config::default();
        config.set_environment(Environment::Dev);
        assert_eq!(config.webserver_url, "https://dev-server.whist.com");

        config.webserver_url = "http://localhost:7730".to_string();
        config.set_environment(Environment::Staging);
        assert_eq!(config.webserver_url, "http://localhost:7730");
        assert_eq!(config.environment, Environment::Staging);
    }

    #[test]
    fn protocol_config_carries_environment_flag() {
        let mut config = Config::default();
        config.data_dir = PathBuf::from("/tmp/whist-test");
        let protocol = config.protocol();
        assert_eq!(protocol.environment, "prod");
        assert_eq!(protocol.log_path, PathBuf::from("/tmp/whist-test/logs/protocol.log"));
        assert_eq!(protocol.nack_threshold, 6);
    }
}
