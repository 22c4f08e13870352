//! Application state shared by every flow.
//!
//! The state is a single snapshot held in a `tokio::sync::watch` channel. Flows
//! never rewrite it: they hand a [`StatePatch`] to [`StateHandle::apply`], which
//! merges the present fields into the current snapshot (last write wins per
//! field). Watchers therefore always observe a complete, consistent snapshot,
//! and slow watchers simply skip intermediate ones.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::protocol::ProtocolHandle;
use crate::store::{Store, StoreKey};

/// Complete application snapshot.
///
/// Serializing this type produces the broadcast view: transient secrets and
/// process handles are skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationState {
    // ── Credentials
    pub email: String,
    #[serde(skip)]
    pub password: String,
    pub access_token: String,
    pub refresh_token: String,
    pub config_token: String,

    // ── Login
    pub login_request: bool,
    pub login_loading: bool,
    pub login_warning: String,

    // ── Mandelbox assignment
    pub regions: Vec<String>,
    #[serde(rename = "mandelboxID")]
    pub mandelbox_id: Option<String>,
    #[serde(rename = "mandelboxIP")]
    pub mandelbox_ip: Option<String>,
    pub mandelbox_region: Option<String>,
    #[serde(skip)]
    pub mandelbox_secret: Option<String>,

    // ── Native client
    #[serde(skip)]
    pub protocol_process: Option<ProtocolHandle>,
    pub protocol_loading: bool,
    pub network_unstable: bool,

    pub onboarded: bool,
}

impl ApplicationState {
    /// Restore cached credentials. Missing keys leave fields empty.
    pub fn restore(store: &Store) -> Self {
        let text = |key: StoreKey| store.get_string(key).unwrap_or_default();
        Self {
            email: text(StoreKey::UserEmail),
            access_token: text(StoreKey::AccessToken),
            refresh_token: text(StoreKey::RefreshToken),
            config_token: text(StoreKey::ConfigToken),
            onboarded: store.get_bool(StoreKey::Onboarded).unwrap_or(false),
            ..Self::default()
        }
    }

    pub fn is_logged_in(&self) -> bool {
        !self.access_token.is_empty() && !self.config_token.is_empty()
    }

    pub fn has_cached_credentials(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    /// Guard for entering the protocol-launch `Loading` state.
    pub fn can_launch_protocol(&self) -> bool {
        self.is_logged_in() && !self.protocol_loading && self.protocol_process.is_none()
    }

    /// JSON view pushed to renderer windows.
    pub fn broadcast_view(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Merge a patch into this snapshot, field by field.
    pub fn merge(&mut self, patch: StatePatch) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = patch.$field { self.$field = value; })*
            };
        }
        take!(
            email,
            password,
            access_token,
            refresh_token,
            config_token,
            login_request,
            login_loading,
            login_warning,
            regions,
            mandelbox_id,
            mandelbox_ip,
            mandelbox_region,
            mandelbox_secret,
            protocol_process,
            protocol_loading,
            network_unstable,
            onboarded,
        );
    }
}

/// Partial update: `None` leaves a field untouched.
///
/// Optional state fields use a nested option, so `Some(None)` clears them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub email: Option<String>,
    pub password: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub config_token: Option<String>,
    pub login_request: Option<bool>,
    pub login_loading: Option<bool>,
    pub login_warning: Option<String>,
    pub regions: Option<Vec<String>>,
    pub mandelbox_id: Option<Option<String>>,
    pub mandelbox_ip: Option<Option<String>>,
    pub mandelbox_region: Option<Option<String>>,
    pub mandelbox_secret: Option<Option<String>>,
    pub protocol_process: Option<Option<ProtocolHandle>>,
    pub protocol_loading: Option<bool>,
    pub network_unstable: Option<bool>,
    pub onboarded: Option<bool>,
}

impl StatePatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Combine two patches; fields present in `later` win.
    pub fn then(mut self, later: StatePatch) -> StatePatch {
        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(if later.$field.is_some() { self.$field = later.$field; })*
            };
        }
        overlay!(
            email,
            password,
            access_token,
            refresh_token,
            config_token,
            login_request,
            login_loading,
            login_warning,
            regions,
            mandelbox_id,
            mandelbox_ip,
            mandelbox_region,
            mandelbox_secret,
            protocol_process,
            protocol_loading,
            network_unstable,
            onboarded,
        );
        self
    }

    /// Patch that wipes every credential field.
    pub fn clear_credentials() -> Self {
        Self {
            email: Some(String::new()),
            password: Some(String::new()),
            access_token: Some(String::new()),
            refresh_token: Some(String::new()),
            config_token: Some(String::new()),
            ..Self::default()
        }
    }

    /// Patch that forgets the current mandelbox assignment.
    pub fn clear_mandelbox() -> Self {
        Self {
            mandelbox_id: Some(None),
            mandelbox_ip: Some(None),
            mandelbox_region: Some(None),
            mandelbox_secret: Some(None),
            ..Self::default()
        }
    }
}

/// Durable subset of the state written to the store. Holds no password.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    pub config_token: String,
    pub onboarded: bool,
}

impl From<&ApplicationState> for PersistedState {
    fn from(state: &ApplicationState) -> Self {
        Self {
            email: state.email.clone(),
            access_token: state.access_token.clone(),
            refresh_token: state.refresh_token.clone(),
            config_token: state.config_token.clone(),
            onboarded: state.onboarded,
        }
    }
}

/// Shared handle to the state channel. Cheap to clone.
#[derive(Clone)]
pub struct StateHandle {
    tx: Arc<watch::Sender<ApplicationState>>,
}

impl StateHandle {
    pub fn new(initial: ApplicationState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> ApplicationState {
        self.tx.borrow().clone()
    }

    /// Read a single value without cloning the whole snapshot.
    pub fn read<T>(&self, f: impl FnOnce(&ApplicationState) -> T) -> T {
        f(&self.tx.borrow())
    }

    pub fn apply(&self, patch: StatePatch) {
        if patch.is_empty() {
            return;
        }
        self.tx.send_modify(|state| state.merge(patch));
    }

    /// Atomically check the current snapshot and apply the patch it yields.
    ///
    /// Returns whether a patch was applied.
    pub fn apply_if(&self, decide: impl FnOnce(&ApplicationState) -> Option<StatePatch>) -> bool {
        self.tx.send_if_modified(|state| match decide(state) {
            Some(patch) => {
                state.merge(patch);
                true
            }
            None => false,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ApplicationState> {
        self.tx.subscribe()
    }
}
