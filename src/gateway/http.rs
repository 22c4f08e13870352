// src/gateway/http.rs
// reqwest implementation of the gateway

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};

use super::{AuthResponse, Gateway, GatewayError, MandelboxAssignment, MandelboxStatus, StatusResponse};
use crate::config::Config;

pub struct HttpGateway {
    client: Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(config: &Config) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(config.http_timeout).build()?;
        Ok(Self {
            client,
            base_url: config.webserver_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn check(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::Status {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
    let response = check(response).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| GatewayError::Decode(e.to_string()))
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn email_login(&self, email: &str, password: &str) -> Result<AuthResponse, GatewayError> {
        let response = self
            .client
            .post(self.url("/account/login"))
            .json(&json!({ "username": email, "password": password }))
            .send()
            .await?;

        if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            debug!(status = %response.status(), "Login rejected");
            return Ok(AuthResponse::default());
        }
        decode(response).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<AuthResponse, GatewayError> {
        let response = self
            .client
            .post(self.url("/token/refresh"))
            .bearer_auth(refresh_token)
            .send()
            .await?;
        decode(response).await
    }

    async fn assign_mandelbox(
        &self,
        access_token: &str,
        email: &str,
        regions: &[String],
    ) -> Result<MandelboxAssignment, GatewayError> {
        let response = self
            .client
            .post(self.url("/mandelbox/assign"))
            .bearer_auth(access_token)
            .json(&json!({ "regions": regions, "user_email": email }))
            .send()
            .await?;
        decode(response).await
    }

    async fn mandelbox_status(
        &self,
        access_token: &str,
        mandelbox_id: &str,
    ) -> Result<MandelboxStatus, GatewayError> {
        let response = self
            .client
            .post(self.url("/mandelbox/status"))
            .bearer_auth(access_token)
            .json(&json!({ "mandelbox_id": mandelbox_id }))
            .send()
            .await?;
        let status: StatusResponse = decode(response).await?;
        Ok(status.into())
    }

    async fn ping_region(&self, region: &str) -> Result<Duration, GatewayError> {
        let url = format!("https://dynamodb.{region}.amazonaws.com/ping");
        let started = Instant::now();
        let response = self.client.get(&url).send().await?;
        check(response).await?;
        Ok(started.elapsed())
    }

    async fn upload_config_token(&self, access_token: &str, encrypted: &str) -> Result<(), GatewayError> {
        let response = self
            .client
            .put(self.url("/account/config_token"))
            .bearer_auth(access_token)
            .json(&json!({ "encrypted_config_token": encrypted }))
            .send()
            .await?;
        if let Err(e) = check(response).await {
            warn!(error = %e, "Config token upload rejected");
            return Err(e);
        }
        Ok(())
    }
}
