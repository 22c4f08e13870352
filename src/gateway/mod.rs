// src/gateway/mod.rs
// Remote service gateway: authentication and mandelbox assignment backends

pub mod crypto;
mod http;

pub use http::HttpGateway;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{PortMapping, SessionInfo};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Login and refresh response. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Config token encrypted with the user's password
    #[serde(default)]
    pub encrypted_config_token: Option<String>,
}

impl AuthResponse {
    /// Whether the backend accepted the credentials.
    pub fn is_valid(&self) -> bool {
        self.access_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MandelboxAssignment {
    pub mandelbox_id: String,
    pub ip: String,
    pub region: String,
}

/// Raw `/mandelbox/status` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusResponse {
    pub state: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub port_32262: Option<u16>,
    #[serde(default)]
    pub port_32263: Option<u16>,
    #[serde(default)]
    pub port_32273: Option<u16>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MandelboxStatus {
    Pending,
    Ready(SessionInfo),
    Failed(String),
}

impl From<StatusResponse> for MandelboxStatus {
    fn from(response: StatusResponse) -> Self {
        match response.state.to_ascii_uppercase().as_str() {
            "READY" | "RUNNING" => {
                let ready = (|| {
                    Some(SessionInfo {
                        ip: response.ip?,
                        secret: response.secret?,
                        ports: PortMapping {
                            port_32262: response.port_32262?,
                            port_32263: response.port_32263?,
                            port_32273: response.port_32273?,
                        },
                    })
                })();
                match ready {
                    Some(info) => Self::Ready(info),
                    None => Self::Failed("ready payload is incomplete".to_string()),
                }
            }
            "FAILED" | "FAILURE" | "DYING" | "DEAD" => {
                Self::Failed(response.error.unwrap_or(response.state))
            }
            _ => Self::Pending,
        }
    }
}

/// Backend operations the session flows depend on.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Rejected credentials are an `Ok` response without an access token.
    async fn email_login(&self, email: &str, password: &str) -> Result<AuthResponse, GatewayError>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<AuthResponse, GatewayError>;

    async fn assign_mandelbox(
        &self,
        access_token: &str,
        email: &str,
        regions: &[String],
    ) -> Result<MandelboxAssignment, GatewayError>;

    async fn mandelbox_status(
        &self,
        access_token: &str,
        mandelbox_id: &str,
    ) -> Result<MandelboxStatus, GatewayError>;

    /// Round-trip time to a region's ping endpoint.
    async fn ping_region(&self, region: &str) -> Result<Duration, GatewayError>;

    async fn upload_config_token(&self, access_token: &str, encrypted: &str) -> Result<(), GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(json: serde_json::Value) -> MandelboxStatus {
        serde_json::from_value::<StatusResponse>(json).unwrap().into()
    }

    #[test]
    fn ready_status_carries_session_info() {
        let parsed = status(serde_json::json!({
            "state": "RUNNING",
            "ip": "10.0.0.5",
            "secret": "k",
            "port_32262": 1,
            "port_32263": 2,
            "port_32273": 3
        }));
        let MandelboxStatus::Ready(info) = parsed else {
            panic!("expected ready, got {parsed:?}");
        };
        assert_eq!(info.ports.to_pipe_value(), "32262:1.32263:2.32273:3");
    }

    #[test]
    fn ready_without_ports_is_a_failure() {
        let parsed = status(serde_json::json!({"state": "READY", "ip": "10.0.0.5"}));
        assert!(matches!(parsed, MandelboxStatus::Failed(_)));
    }

    #[test]
    fn other_states_map_to_pending_or_failed() {
        assert_eq!(status(serde_json::json!({"state": "ALLOCATED"})), MandelboxStatus::Pending);
        assert_eq!(
            status(serde_json::json!({"state": "FAILED", "error": "no capacity"})),
            MandelboxStatus::Failed("no capacity".into())
        );
    }

    #[test]
    fn auth_response_validity() {
        assert!(!AuthResponse::default().is_valid());
        let empty = AuthResponse {
            access_token: Some(String::new()),
            ..Default::default()
        };
        assert!(!empty.is_valid());
        let ok = AuthResponse {
            access_token: Some("T".into()),
            ..Default::default()
        };
        assert!(ok.is_valid());
    }
}
