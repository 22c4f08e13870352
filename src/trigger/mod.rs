//! Trigger bus
//!
//! Every input to the session core (renderer IPC, OS lifecycle events, results
//! fed back by flows) is a [`Trigger`]. Flows subscribe by [`TriggerId`] and get
//! a hot stream: each subscriber receives every trigger emitted after it
//! subscribed, in emission order, with no replay.
//!
//! ```text
//!  renderer IPC ─┐                        ┌─► login flow
//!  OS events ────┼─► TriggerBus::emit ────┼─► protocol flow
//!  flows ────────┘   (per-id registry)    └─► ...
//! ```

mod combinators;
pub mod ipc;

pub use combinators::{combine_latest, exhaust_map, merge};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

use crate::windows::WindowHash;

/// Closed set of trigger identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::IntoStaticStr)]
#[strum(serialize_all = "camelCase")]
pub enum TriggerId {
    AppReady,
    Activate,
    Quit,
    LoginRequest,
    AuthFlowSuccess,
    AuthFlowFailure,
    Logout,
    StripeAuthRefresh,
    RegionPingSuccess,
    MandelboxAssignSuccess,
    MandelboxAssignFailure,
    ProtocolConnection,
    ProtocolClosed,
    NetworkUnstable,
    ShowPaymentWindow,
    ShowWindow,
    HideWindow,
    WindowLoaded,
}

impl TriggerId {
    /// Whether renderer windows may raise this trigger over IPC.
    pub fn accepts_renderer(&self) -> bool {
        matches!(
            self,
            Self::Quit
                | Self::LoginRequest
                | Self::AuthFlowSuccess
                | Self::Logout
                | Self::StripeAuthRefresh
                | Self::ShowPaymentWindow
                | Self::ShowWindow
                | Self::HideWindow
                | Self::WindowLoaded
        )
    }
}

/// A named event with its payload.
///
/// `Debug` output of `LoginRequest` contains the password; log `id()` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Trigger {
    AppReady,
    Activate,
    Quit,
    LoginRequest {
        email: String,
        password: String,
    },
    AuthFlowSuccess {
        #[serde(default)]
        email: String,
        access_token: String,
        refresh_token: String,
        #[serde(default)]
        config_token: Option<String>,
    },
    AuthFlowFailure {
        warning: String,
    },
    Logout,
    StripeAuthRefresh,
    RegionPingSuccess {
        regions: Vec<String>,
    },
    MandelboxAssignSuccess {
        #[serde(rename = "mandelboxID")]
        mandelbox_id: String,
        ip: String,
        region: String,
    },
    MandelboxAssignFailure {
        reason: String,
    },
    ProtocolConnection {
        connected: bool,
    },
    ProtocolClosed {
        #[serde(default)]
        handle: Option<String>,
        #[serde(default)]
        exit_code: Option<i32>,
    },
    NetworkUnstable {
        unstable: bool,
    },
    ShowPaymentWindow,
    ShowWindow {
        window: WindowHash,
    },
    HideWindow {
        window: WindowHash,
    },
    WindowLoaded {
        window_id: u64,
    },
}

impl Trigger {
    pub fn id(&self) -> TriggerId {
        match self {
            Self::AppReady => TriggerId::AppReady,
            Self::Activate => TriggerId::Activate,
            Self::Quit => TriggerId::Quit,
            Self::LoginRequest { .. } => TriggerId::LoginRequest,
            Self::AuthFlowSuccess { .. } => TriggerId::AuthFlowSuccess,
            Self::AuthFlowFailure { .. } => TriggerId::AuthFlowFailure,
            Self::Logout => TriggerId::Logout,
            Self::StripeAuthRefresh => TriggerId::StripeAuthRefresh,
            Self::RegionPingSuccess { .. } => TriggerId::RegionPingSuccess,
            Self::MandelboxAssignSuccess { .. } => TriggerId::MandelboxAssignSuccess,
            Self::MandelboxAssignFailure { .. } => TriggerId::MandelboxAssignFailure,
            Self::ProtocolConnection { .. } => TriggerId::ProtocolConnection,
            Self::ProtocolClosed { .. } => TriggerId::ProtocolClosed,
            Self::NetworkUnstable { .. } => TriggerId::NetworkUnstable,
            Self::ShowPaymentWindow => TriggerId::ShowPaymentWindow,
            Self::ShowWindow { .. } => TriggerId::ShowWindow,
            Self::HideWindow { .. } => TriggerId::HideWindow,
            Self::WindowLoaded { .. } => TriggerId::WindowLoaded,
        }
    }
}

pub type TriggerStream = UnboundedReceiverStream<Trigger>;

type Subscribers = HashMap<TriggerId, Vec<mpsc::UnboundedSender<Trigger>>>;

/// Process-wide publish/subscribe registry keyed by trigger id.
#[derive(Clone, Default)]
pub struct TriggerBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl TriggerBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream of every future trigger with this id.
    pub fn from_trigger(&self, id: TriggerId) -> TriggerStream {
        self.from_triggers(&[id])
    }

    /// One stream over several ids, preserving emission order across them.
    pub fn from_triggers(&self, ids: &[TriggerId]) -> TriggerStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.lock();
        for id in ids {
            subscribers.entry(*id).or_default().push(tx.clone());
        }
        UnboundedReceiverStream::new(rx)
    }

    /// Deliver a trigger to every live subscriber of its id.
    ///
    /// Subscribers whose stream was dropped are pruned; they never block
    /// delivery to the rest. Returns how many subscribers received it.
    pub fn emit(&self, trigger: Trigger) -> usize {
        let id = trigger.id();
        let mut subscribers = self.lock();
        let Some(senders) = subscribers.get_mut(&id) else {
            trace!(trigger = %id, "No subscribers");
            return 0;
        };

        let before = senders.len();
        senders.retain(|tx| tx.send(trigger.clone()).is_ok());
        let delivered = senders.len();
        if delivered < before {
            debug!(trigger = %id, pruned = before - delivered, "Pruned closed subscribers");
        }
        trace!(trigger = %id, delivered, "Trigger emitted");
        delivered
    }

    pub fn subscriber_count(&self, id: TriggerId) -> usize {
        self.lock()
            .get(&id)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Drop every subscription; open streams complete.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn every_subscriber_receives_every_trigger() {
        let bus = TriggerBus::new();
        let mut first = bus.from_trigger(TriggerId::Activate);
        let mut second = bus.from_trigger(TriggerId::Activate);

        assert_eq!(bus.emit(Trigger::Activate), 2);
        assert_eq!(bus.emit(Trigger::Activate), 2);

        for stream in [&mut first, &mut second] {
            assert_eq!(stream.next().await, Some(Trigger::Activate));
            assert_eq!(stream.next().await, Some(Trigger::Activate));
        }
    }

    #[tokio::test]
    async fn late_subscribers_get_no_replay() {
        let bus = TriggerBus::new();
        bus.emit(Trigger::AppReady);

        let mut late = bus.from_trigger(TriggerId::AppReady);
        bus.emit(Trigger::Quit);
        bus.clear();

        assert_eq!(late.next().await, None);
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_block_others() {
        let bus = TriggerBus::new();
        let dropped = bus.from_trigger(TriggerId::Logout);
        let mut alive = bus.from_trigger(TriggerId::Logout);
        drop(dropped);

        assert_eq!(bus.emit(Trigger::Logout), 1);
        assert_eq!(alive.next().await, Some(Trigger::Logout));
        assert_eq!(bus.subscriber_count(TriggerId::Logout), 1);
    }

    #[tokio::test]
    async fn multi_id_stream_keeps_emission_order() {
        let bus = TriggerBus::new();
        let mut stream = bus.from_triggers(&[TriggerId::AppReady, TriggerId::Activate]);

        bus.emit(Trigger::Activate);
        bus.emit(Trigger::AppReady);
        bus.emit(Trigger::Quit);
        bus.emit(Trigger::Activate);

        assert_eq!(stream.next().await, Some(Trigger::Activate));
        assert_eq!(stream.next().await, Some(Trigger::AppReady));
        assert_eq!(stream.next().await, Some(Trigger::Activate));
    }

    #[test]
    fn trigger_serializes_as_tagged_union() {
        let trigger = Trigger::MandelboxAssignSuccess {
            mandelbox_id: "m-1".into(),
            ip: "10.0.0.1".into(),
            region: "us-east-1".into(),
        };
        let value = serde_json::to_value(&trigger).unwrap();
        assert_eq!(value["kind"], "mandelboxAssignSuccess");
        assert_eq!(value["mandelboxID"], "m-1");

        let closed: Trigger = serde_json::from_value(serde_json::json!({"kind": "protocolClosed"})).unwrap();
        assert_eq!(
            closed,
            Trigger::ProtocolClosed {
                handle: None,
                exit_code: None
            }
        );
    }

    #[test]
    fn ids_match_wire_names() {
        let trigger: Trigger = serde_json::from_value(serde_json::json!({"kind": "stripeAuthRefresh"})).unwrap();
        assert_eq!(trigger.id().to_string(), "stripeAuthRefresh");
        assert_eq!(TriggerId::from_str("loginRequest").unwrap(), TriggerId::LoginRequest);
        assert!(!TriggerId::ProtocolClosed.accepts_renderer());
    }
}
