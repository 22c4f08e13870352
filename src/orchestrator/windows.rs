//! Window flows: launch, visibility and teardown

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::SessionContext;
use crate::trigger::{Trigger, TriggerId, merge};
use crate::windows::{WindowDescriptor, WindowHash};

fn ensure_window(ctx: &SessionContext, hash: WindowHash) {
    if let Err(e) = ctx.windows.ensure(&WindowDescriptor::for_hash(hash)) {
        warn!(window = %hash, error = %e, "Failed to open window");
    }
}

fn destroy_window(ctx: &SessionContext, hash: WindowHash) {
    if let Err(e) = ctx.windows.destroy(hash) {
        warn!(window = %hash, error = %e, "Failed to destroy window");
    }
}

/// Open (or re-show) the auth window on launch and reactivation while
/// logged out. Never creates a second one.
pub(super) fn spawn_launch(ctx: &SessionContext) -> JoinHandle<()> {
    let mut activations = merge([
        ctx.bus.from_trigger(TriggerId::AppReady),
        ctx.bus.from_trigger(TriggerId::Activate),
    ]);
    let ctx = ctx.clone();

    tokio::spawn(async move {
        while let Some(trigger) = activations.next().await {
            if ctx.state.read(|s| s.is_logged_in()) {
                debug!(trigger = %trigger.id(), "Logged in, no auth window needed");
                continue;
            }
            ensure_window(&ctx, WindowHash::Auth);
        }
    })
}

/// Renderer-requested show/hide.
pub(super) fn spawn_visibility(ctx: &SessionContext) -> JoinHandle<()> {
    let mut requests = ctx.bus.from_triggers(&[
        TriggerId::ShowWindow,
        TriggerId::HideWindow,
        TriggerId::ShowPaymentWindow,
    ]);
    let ctx = ctx.clone();

    tokio::spawn(async move {
        while let Some(trigger) = requests.next().await {
            match trigger {
                Trigger::ShowWindow { window } => ensure_window(&ctx, window),
                Trigger::HideWindow { window } => {
                    if let Err(e) = ctx.windows.hide(window) {
                        warn!(window = %window, error = %e, "Failed to hide window");
                    }
                }
                Trigger::ShowPaymentWindow => ensure_window(&ctx, WindowHash::Payment),
                _ => {}
            }
        }
    })
}

/// Close windows that no longer apply.
///
/// Logging in closes everything open; connecting closes the loading and
/// onboarding windows; the client exiting closes the omnibar.
pub(super) fn spawn_teardown(ctx: &SessionContext) -> JoinHandle<()> {
    let mut states = ctx.state.subscribe();
    let mut triggers = ctx
        .bus
        .from_triggers(&[TriggerId::ProtocolConnection, TriggerId::ProtocolClosed]);
    let ctx = ctx.clone();

    tokio::spawn(async move {
        let mut logged_in = states.borrow_and_update().is_logged_in();
        let mut states_open = true;

        loop {
            tokio::select! {
                changed = states.changed(), if states_open => {
                    if changed.is_err() {
                        states_open = false;
                        continue;
                    }
                    let now = states.borrow_and_update().is_logged_in();
                    if now && !logged_in {
                        debug!("Logged in, closing open windows");
                        ctx.windows.destroy_all();
                    }
                    logged_in = now;
                }
                trigger = triggers.next() => match trigger {
                    Some(Trigger::ProtocolConnection { connected: true }) => {
                        destroy_window(&ctx, WindowHash::Loading);
                        destroy_window(&ctx, WindowHash::Onboarding);
                    }
                    Some(Trigger::ProtocolClosed { .. }) => destroy_window(&ctx, WindowHash::Omnibar),
                    Some(_) => {}
                    None => break,
                },
            }
        }
    })
}
