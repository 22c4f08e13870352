//! Login and credential flows

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::SessionContext;
use crate::gateway::crypto::{decrypt_config_token, encrypt_config_token, generate_config_token};
use crate::gateway::{AuthResponse, GatewayError};
use crate::state::StatePatch;
use crate::trigger::{Trigger, TriggerId, exhaust_map};
use crate::windows::{WindowDescriptor, WindowHash};

/// `loginWarning` for rejected credentials.
pub const WARNING_INVALID: &str = "INVALID";
/// `loginWarning` for transport failures.
pub const WARNING_NETWORK: &str = "NETWORK_ERROR";

/// What a finished login turns into.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginOutcome {
    pub patch: StatePatch,
    /// Trigger to emit after the patch is applied
    pub follow_up: Trigger,
    /// Freshly encrypted config token the backend should store
    pub upload: Option<String>,
}

/// Resolve a login response into state changes.
pub fn resolve_login(email: &str, password: &str, result: Result<AuthResponse, GatewayError>) -> LoginOutcome {
    let settled = StatePatch {
        login_loading: Some(false),
        login_request: Some(false),
        password: Some(String::new()),
        ..StatePatch::default()
    };

    let response = match result {
        Ok(response) if response.is_valid() => response,
        Ok(_) => {
            return LoginOutcome {
                patch: settled.then(StatePatch {
                    login_warning: Some(WARNING_INVALID.to_string()),
                    ..StatePatch::default()
                }),
                follow_up: Trigger::AuthFlowFailure {
                    warning: WARNING_INVALID.to_string(),
                },
                upload: None,
            };
        }
        Err(e) => {
            warn!(email, error = %e, "Login request failed");
            return LoginOutcome {
                patch: settled.then(StatePatch {
                    login_warning: Some(WARNING_NETWORK.to_string()),
                    ..StatePatch::default()
                }),
                follow_up: Trigger::AuthFlowFailure {
                    warning: WARNING_NETWORK.to_string(),
                },
                upload: None,
            };
        }
    };

    let access_token = response.access_token.unwrap_or_default();
    let refresh_token = response.refresh_token.unwrap_or_default();

    let decrypted = response
        .encrypted_config_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .and_then(|encrypted| match decrypt_config_token(encrypted, password) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(email, error = %e, "Stored config token unreadable, generating a new one");
                None
            }
        });

    let (config_token, upload) = match decrypted {
        Some(token) => (token, None),
        None => {
            let token = generate_config_token();
            let upload = match encrypt_config_token(&token, password) {
                Ok(encrypted) => Some(encrypted),
                Err(e) => {
                    warn!(error = %e, "Failed to encrypt new config token");
                    None
                }
            };
            (token, upload)
        }
    };

    LoginOutcome {
        patch: settled.then(StatePatch {
            email: Some(email.to_string()),
            access_token: Some(access_token.clone()),
            refresh_token: Some(refresh_token.clone()),
            config_token: Some(config_token.clone()),
            login_warning: Some(String::new()),
            ..StatePatch::default()
        }),
        follow_up: Trigger::AuthFlowSuccess {
            email: email.to_string(),
            access_token,
            refresh_token,
            config_token: Some(config_token),
        },
        upload,
    }
}

/// Login flow. Requests arriving while one is in flight are dropped.
pub(super) fn spawn_login(ctx: &SessionContext) -> JoinHandle<()> {
    let requests = ctx.bus.from_trigger(TriggerId::LoginRequest);
    let ctx = ctx.clone();

    tokio::spawn(async move {
        let attempts = exhaust_map(requests, move |trigger| {
            let ctx = ctx.clone();
            async move { login(&ctx, trigger).await }
        });
        futures::pin_mut!(attempts);
        while attempts.next().await.is_some() {}
    })
}

async fn login(ctx: &SessionContext, trigger: Trigger) {
    let Trigger::LoginRequest { email, password } = trigger else {
        return;
    };

    let started = ctx.state.apply_if(|state| {
        (!state.login_loading).then(|| StatePatch {
            login_loading: Some(true),
            login_request: Some(true),
            login_warning: Some(String::new()),
            password: Some(password.clone()),
            ..StatePatch::default()
        })
    });
    if !started {
        debug!("Login already in progress, dropping request");
        return;
    }

    info!(email = %email, "Logging in");
    let result = ctx.gateway.email_login(&email, &password).await;
    let outcome = resolve_login(&email, &password, result);

    ctx.state.apply(outcome.patch);
    ctx.bus.emit(outcome.follow_up);

    if let Some(encrypted) = outcome.upload {
        let access_token = ctx.state.read(|s| s.access_token.clone());
        if let Err(e) = ctx.gateway.upload_config_token(&access_token, &encrypted).await {
            warn!(email = %email, error = %e, "Config token upload failed");
        }
    }
}

/// Credential bookkeeping: auth success, startup refresh, payment refresh, logout.
pub(super) fn spawn_auth(ctx: &SessionContext) -> JoinHandle<()> {
    let mut triggers = ctx.bus.from_triggers(&[
        TriggerId::AuthFlowSuccess,
        TriggerId::AppReady,
        TriggerId::StripeAuthRefresh,
        TriggerId::Logout,
    ]);
    let ctx = ctx.clone();

    tokio::spawn(async move {
        while let Some(trigger) = triggers.next().await {
            match trigger {
                Trigger::AuthFlowSuccess {
                    email,
                    access_token,
                    refresh_token,
                    config_token,
                } => store_tokens(&ctx, email, access_token, refresh_token, config_token),
                Trigger::AppReady => refresh_cached(&ctx).await,
                Trigger::StripeAuthRefresh => refresh_after_payment(&ctx).await,
                Trigger::Logout => logout(&ctx),
                _ => {}
            }
        }
    })
}

fn store_tokens(
    ctx: &SessionContext,
    email: String,
    access_token: String,
    refresh_token: String,
    config_token: Option<String>,
) {
    ctx.state.apply_if(|state| {
        let config_token = config_token
            .filter(|t| !t.is_empty())
            .or_else(|| (!state.config_token.is_empty()).then(|| state.config_token.clone()))
            .unwrap_or_else(generate_config_token);
        Some(StatePatch {
            email: (!email.is_empty()).then_some(email),
            access_token: Some(access_token),
            refresh_token: Some(refresh_token),
            config_token: Some(config_token),
            login_warning: Some(String::new()),
            ..StatePatch::default()
        })
    });
}

/// Refresh tokens with the gateway; returns the success trigger.
async fn refresh(ctx: &SessionContext) -> Result<Trigger, String> {
    let (email, refresh_token) = ctx.state.read(|s| (s.email.clone(), s.refresh_token.clone()));
    match ctx.gateway.refresh_token(&refresh_token).await {
        Ok(response) if response.is_valid() => Ok(Trigger::AuthFlowSuccess {
            email,
            access_token: response.access_token.unwrap_or_default(),
            refresh_token: response.refresh_token.filter(|t| !t.is_empty()).unwrap_or(refresh_token),
            config_token: None,
        }),
        Ok(_) => Err(WARNING_INVALID.to_string()),
        Err(GatewayError::Status { status, body }) if matches!(status, 401 | 403) => {
            debug!(status, body = %body, "Refresh token rejected");
            Err(WARNING_INVALID.to_string())
        }
        Err(e) => {
            warn!(error = %e, "Token refresh failed");
            Err(WARNING_NETWORK.to_string())
        }
    }
}

async fn refresh_cached(ctx: &SessionContext) {
    if !ctx.state.read(|s| s.has_cached_credentials()) {
        return;
    }
    match refresh(ctx).await {
        Ok(success) => {
            info!("Cached credentials refreshed");
            ctx.bus.emit(success);
        }
        Err(warning) => {
            warn!(warning = %warning, "Cached credentials rejected, signing out");
            ctx.state.apply(StatePatch::clear_credentials());
            ctx.bus.emit(Trigger::AuthFlowFailure { warning });
            open_auth_window(ctx);
        }
    }
}

async fn refresh_after_payment(ctx: &SessionContext) {
    match refresh(ctx).await {
        Ok(success) => {
            ctx.bus.emit(success);
            if let Err(e) = ctx.windows.destroy(WindowHash::Payment) {
                warn!(error = %e, "Failed to close payment window");
            }
        }
        Err(warning) => warn!(warning = %warning, "Token refresh after payment failed"),
    }
}

fn logout(ctx: &SessionContext) {
    let email = ctx.state.read(|s| s.email.clone());
    info!(email = %email, "Logging out");

    ctx.state.apply(
        StatePatch::clear_credentials()
            .then(StatePatch::clear_mandelbox())
            .then(StatePatch {
                login_warning: Some(String::new()),
                login_loading: Some(false),
                login_request: Some(false),
                ..StatePatch::default()
            }),
    );
    ctx.windows.destroy_all();
    open_auth_window(ctx);
}

fn open_auth_window(ctx: &SessionContext) {
    if let Err(e) = ctx.windows.ensure(&WindowDescriptor::for_hash(WindowHash::Auth)) {
        error!(error = %e, "Failed to open auth window");
    }
}
