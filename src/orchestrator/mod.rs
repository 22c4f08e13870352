//! Session orchestrator
//!
//! Composes the trigger bus, state, store, gateway, native client and windows
//! into independent flows. Each flow is a task that owns its trigger
//! subscriptions; no flow waits on another.
//!
//! | flow            | triggers                                   |
//! |-----------------|--------------------------------------------|
//! | login           | loginRequest                               |
//! | auth            | authFlowSuccess, appReady, stripeAuthRefresh, logout |
//! | window launch   | appReady, activate                         |
//! | visibility      | showWindow, hideWindow, showPaymentWindow  |
//! | teardown        | state, protocolConnection, protocolClosed  |
//! | region ping     | appReady                                   |
//! | assignment      | authFlowSuccess × regionPingSuccess        |
//! | protocol launch | mandelboxAssignSuccess, protocolClosed, logout, networkUnstable |
//! | broadcast       | state, windowLoaded                        |
//! | persistence     | state                                      |

mod auth;
mod mandelbox;
pub mod protocol;
mod sync;
mod windows;

pub use mandelbox::rank_regions;

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::gateway::Gateway;
use crate::protocol::{ProtocolEvent, ProtocolLauncher};
use crate::state::StateHandle;
use crate::store::Store;
use crate::trigger::{Trigger, TriggerBus};
use crate::windows::WindowManager;

/// Everything a flow may touch. Cheap to clone.
#[derive(Clone)]
pub struct SessionContext {
    pub bus: TriggerBus,
    pub state: StateHandle,
    pub store: Arc<Store>,
    pub gateway: Arc<dyn Gateway>,
    pub launcher: Arc<dyn ProtocolLauncher>,
    pub windows: Arc<WindowManager>,
    pub config: Arc<Config>,
}

/// Running set of flows.
pub struct Orchestrator {
    ctx: SessionContext,
    tasks: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Subscribe and spawn every flow.
    ///
    /// All subscriptions exist when this returns, so no trigger emitted
    /// afterwards is missed.
    pub fn start(ctx: SessionContext) -> Self {
        let mut tasks = vec![
            auth::spawn_login(&ctx),
            auth::spawn_auth(&ctx),
            windows::spawn_launch(&ctx),
            windows::spawn_visibility(&ctx),
            windows::spawn_teardown(&ctx),
            mandelbox::spawn_region_ping(&ctx),
            mandelbox::spawn_assignment(&ctx),
            protocol::spawn(&ctx),
            sync::spawn_broadcast(&ctx),
            sync::spawn_persistence(&ctx),
        ];
        tasks.push(spawn_protocol_bridge(&ctx));

        info!(flows = tasks.len(), "Session orchestrator started");
        Self { ctx, tasks }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Kill the native client, close windows and stop every flow.
    pub async fn shutdown(self) {
        if let Some(handle) = self.ctx.state.read(|s| s.protocol_process.clone())
            && let Err(e) = self.ctx.launcher.kill(&handle).await
        {
            debug!(error = %e, "Client already gone at shutdown");
        }
        self.ctx.windows.destroy_all();

        for task in &self.tasks {
            task.abort();
        }
        self.ctx.bus.clear();
        info!("Session orchestrator stopped");
    }
}

/// Re-emit native client events as triggers.
fn spawn_protocol_bridge(ctx: &SessionContext) -> JoinHandle<()> {
    let mut events = ctx.launcher.subscribe();
    let bus = ctx.bus.clone();

    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Protocol bridge lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            match event {
                ProtocolEvent::Started(handle) => trace!(handle = %handle.id, "Client started"),
                ProtocolEvent::Unstable(unstable) => {
                    bus.emit(Trigger::NetworkUnstable { unstable });
                }
                ProtocolEvent::Exited { handle, code } => {
                    bus.emit(Trigger::ProtocolClosed {
                        handle: Some(handle),
                        exit_code: code,
                    });
                }
            }
        }
        debug!("Protocol bridge finished");
    })
}
