//! State fan-out: renderer broadcast and persistence

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use super::SessionContext;
use crate::state::PersistedState;
use crate::trigger::ipc::IpcMessage;
use crate::trigger::{Trigger, TriggerId};

/// Push every state change to every window.
///
/// The watch channel coalesces: a burst of changes is delivered as the
/// latest snapshot only. Windows still loading get the latest snapshot once
/// they report `windowLoaded`.
pub(super) fn spawn_broadcast(ctx: &SessionContext) -> JoinHandle<()> {
    let mut states = ctx.state.subscribe();
    let mut loaded = ctx.bus.from_trigger(TriggerId::WindowLoaded);
    let ctx = ctx.clone();

    tokio::spawn(async move {
        let mut states_open = true;
        loop {
            tokio::select! {
                changed = states.changed(), if states_open => {
                    if changed.is_err() {
                        states_open = false;
                        continue;
                    }
                    let view = states.borrow_and_update().broadcast_view();
                    trace!("Broadcasting state");
                    ctx.windows.broadcast(&IpcMessage::state(view));
                }
                trigger = loaded.next() => match trigger {
                    Some(Trigger::WindowLoaded { window_id }) => {
                        if !ctx.windows.page_loaded(window_id) {
                            // nothing changed since it opened; give it the current state
                            let view = ctx.state.read(|s| s.broadcast_view());
                            ctx.windows.send(window_id, &IpcMessage::state(view));
                        }
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
    })
}

/// Write the durable subset whenever it differs from what was last written.
/// A failed write is retried on the next change.
pub(super) fn spawn_persistence(ctx: &SessionContext) -> JoinHandle<()> {
    let mut states = ctx.state.subscribe();
    let ctx = ctx.clone();

    tokio::spawn(async move {
        let mut written = PersistedState::from(&*states.borrow_and_update());

        while states.changed().await.is_ok() {
            let current = PersistedState::from(&*states.borrow_and_update());
            if current == written {
                continue;
            }
            match ctx.store.save(&current) {
                Ok(()) => {
                    debug!(path = %ctx.store.path().display(), "Credentials persisted");
                    written = current;
                }
                Err(e) => error!(error = %e, "Failed to persist credentials"),
            }
        }
    })
}
