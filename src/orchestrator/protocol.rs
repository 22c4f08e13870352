//! Protocol-launch flow
//!
//! The flow is a small state machine kept apart from its effects:
//! [`LaunchMachine::step`] is pure and returns a [`Transition`] (a state patch
//! plus [`Command`]s); the executor in this module runs the commands and feeds
//! their results back as [`LaunchEvent`]s.
//!
//! ```text
//!   Idle ──request (guard)──► Loading ──connected──► Streaming
//!    ▲                          │                       │
//!    └──────── failed ──────────┘◄──── closed / logout ─┘
//! ```

use std::collections::VecDeque;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::SessionContext;
use crate::gateway::MandelboxStatus;
use crate::protocol::{ProtocolHandle, SessionInfo};
use crate::state::{ApplicationState, StatePatch};
use crate::trigger::{Trigger, TriggerId};
use crate::windows::{WindowDescriptor, WindowHash};

#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Idle,
    Loading {
        mandelbox_id: String,
        handle: Option<ProtocolHandle>,
    },
    Streaming {
        handle: ProtocolHandle,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum LaunchEvent {
    /// A mandelbox was assigned; start a client for it
    Requested { mandelbox_id: String },
    Spawned(ProtocolHandle),
    Ready(SessionInfo),
    /// Handshake written, the client is connecting
    Connected,
    Failed(String),
    Closed { handle: Option<String> },
    Logout,
    Unstable(bool),
}

impl LaunchEvent {
    pub fn from_trigger(trigger: Trigger) -> Option<Self> {
        match trigger {
            Trigger::MandelboxAssignSuccess { mandelbox_id, .. } => Some(Self::Requested { mandelbox_id }),
            Trigger::ProtocolClosed { handle, .. } => Some(Self::Closed { handle }),
            Trigger::Logout => Some(Self::Logout),
            Trigger::NetworkUnstable { unstable } => Some(Self::Unstable(unstable)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    OpenWindow(WindowHash),
    CloseWindow(WindowHash),
    Spawn,
    AwaitReady { mandelbox_id: String },
    StreamInfo { handle: ProtocolHandle, info: SessionInfo },
    Kill(ProtocolHandle),
    Emit(Trigger),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transition {
    pub patch: StatePatch,
    pub commands: Vec<Command>,
}

impl Transition {
    fn none() -> Self {
        Self::default()
    }
}

#[derive(Debug)]
pub struct LaunchMachine {
    phase: Phase,
}

impl Default for LaunchMachine {
    fn default() -> Self {
        Self { phase: Phase::Idle }
    }
}

impl LaunchMachine {
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn step(&mut self, state: &ApplicationState, event: LaunchEvent) -> Transition {
        if let LaunchEvent::Unstable(unstable) = event {
            return Transition {
                patch: StatePatch {
                    network_unstable: Some(unstable),
                    ..StatePatch::default()
                },
                commands: Vec::new(),
            };
        }

        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        let (next, transition) = match (phase, event) {
            (Phase::Idle, LaunchEvent::Requested { mandelbox_id }) => {
                if !state.can_launch_protocol() {
                    debug!("Launch refused: logged out or a client is already active");
                    (Phase::Idle, Transition::none())
                } else {
                    let window = if state.onboarded {
                        WindowHash::Loading
                    } else {
                        WindowHash::Onboarding
                    };
                    (
                        Phase::Loading {
                            mandelbox_id,
                            handle: None,
                        },
                        Transition {
                            patch: StatePatch {
                                protocol_loading: Some(true),
                                ..StatePatch::default()
                            },
                            commands: vec![Command::OpenWindow(window), Command::Spawn],
                        },
                    )
                }
            }

            (Phase::Loading { mandelbox_id, handle: None }, LaunchEvent::Spawned(handle)) => (
                Phase::Loading {
                    mandelbox_id: mandelbox_id.clone(),
                    handle: Some(handle.clone()),
                },
                Transition {
                    patch: StatePatch {
                        protocol_process: Some(Some(handle)),
                        ..StatePatch::default()
                    },
                    commands: vec![Command::AwaitReady { mandelbox_id }],
                },
            ),

            (
                Phase::Loading {
                    mandelbox_id,
                    handle: Some(handle),
                },
                LaunchEvent::Ready(info),
            ) => (
                Phase::Loading {
                    mandelbox_id,
                    handle: Some(handle.clone()),
                },
                Transition {
                    patch: StatePatch {
                        mandelbox_ip: Some(Some(info.ip.clone())),
                        mandelbox_secret: Some(Some(info.secret.clone())),
                        ..StatePatch::default()
                    },
                    commands: vec![Command::StreamInfo { handle, info }],
                },
            ),

            (Phase::Loading { handle: Some(handle), .. }, LaunchEvent::Connected) => (
                Phase::Streaming { handle },
                Transition {
                    patch: StatePatch {
                        protocol_loading: Some(false),
                        onboarded: Some(true),
                        ..StatePatch::default()
                    },
                    commands: vec![Command::Emit(Trigger::ProtocolConnection { connected: true })],
                },
            ),

            (Phase::Loading { handle, .. }, LaunchEvent::Failed(_)) => {
                let mut commands = Vec::new();
                if let Some(handle) = handle {
                    commands.push(Command::Kill(handle));
                }
                commands.push(Command::CloseWindow(WindowHash::Loading));
                commands.push(Command::CloseWindow(WindowHash::Onboarding));
                // a logout mid-launch already put the auth window up
                if state.is_logged_in() {
                    commands.push(Command::OpenWindow(WindowHash::Error));
                }
                (
                    Phase::Idle,
                    Transition {
                        patch: StatePatch {
                            protocol_loading: Some(false),
                            protocol_process: Some(None),
                            ..StatePatch::default()
                        },
                        commands,
                    },
                )
            }

            (Phase::Streaming { handle }, LaunchEvent::Closed { handle: closed })
                if closed.as_ref().is_none_or(|id| *id == handle.id) =>
            {
                (
                    Phase::Idle,
                    Transition {
                        patch: StatePatch {
                            protocol_process: Some(None),
                            network_unstable: Some(false),
                            ..StatePatch::clear_mandelbox()
                        },
                        commands: vec![Command::Emit(Trigger::ProtocolConnection { connected: false })],
                    },
                )
            }

            (Phase::Streaming { handle }, LaunchEvent::Logout)
            | (Phase::Loading { handle: Some(handle), .. }, LaunchEvent::Logout) => (
                Phase::Idle,
                Transition {
                    patch: StatePatch {
                        protocol_loading: Some(false),
                        protocol_process: Some(None),
                        network_unstable: Some(false),
                        ..StatePatch::default()
                    },
                    commands: vec![Command::Kill(handle)],
                },
            ),

            (phase, _) => {
                debug!(?phase, "Event ignored in current launch phase");
                (phase, Transition::none())
            }
        };

        self.phase = next;
        transition
    }

    /// Step against the shared state, applying the patch atomically with the
    /// guard check. Returns the commands to run.
    fn advance(&mut self, ctx: &SessionContext, event: LaunchEvent) -> Vec<Command> {
        let mut commands = Vec::new();
        ctx.state.apply_if(|state| {
            let transition = self.step(state, event);
            commands = transition.commands;
            (!transition.patch.is_empty()).then_some(transition.patch)
        });
        commands
    }
}

pub(super) fn spawn(ctx: &SessionContext) -> JoinHandle<()> {
    let mut triggers = ctx.bus.from_triggers(&[
        TriggerId::MandelboxAssignSuccess,
        TriggerId::ProtocolClosed,
        TriggerId::Logout,
        TriggerId::NetworkUnstable,
    ]);
    let ctx = ctx.clone();

    tokio::spawn(async move {
        let mut machine = LaunchMachine::default();
        while let Some(trigger) = triggers.next().await {
            let Some(event) = LaunchEvent::from_trigger(trigger) else {
                continue;
            };
            run(&ctx, &mut machine, event).await;
        }
    })
}

/// Run one event and every follow-up it causes to completion.
async fn run(ctx: &SessionContext, machine: &mut LaunchMachine, event: LaunchEvent) {
    let mut events = VecDeque::from([event]);
    while let Some(event) = events.pop_front() {
        if let LaunchEvent::Failed(reason) = &event {
            let email = ctx.state.read(|s| s.email.clone());
            error!(email = %email, error = %reason, "Protocol launch failed");
        }
        for command in machine.advance(ctx, event) {
            if let Some(follow_up) = execute(ctx, command).await {
                events.push_back(follow_up);
            }
        }
    }
}

async fn execute(ctx: &SessionContext, command: Command) -> Option<LaunchEvent> {
    match command {
        Command::OpenWindow(hash) => {
            if let Err(e) = ctx.windows.ensure(&WindowDescriptor::for_hash(hash)) {
                warn!(window = %hash, error = %e, "Failed to open window");
            }
            None
        }
        Command::CloseWindow(hash) => {
            if let Err(e) = ctx.windows.destroy(hash) {
                warn!(window = %hash, error = %e, "Failed to close window");
            }
            None
        }
        Command::Spawn => Some(match ctx.launcher.launch().await {
            Ok(handle) => {
                info!(handle = %handle.id, pid = handle.pid, "Client launched");
                LaunchEvent::Spawned(handle)
            }
            Err(e) => LaunchEvent::Failed(format!("{e:#}")),
        }),
        Command::AwaitReady { mandelbox_id } => Some(await_ready(ctx, &mandelbox_id).await),
        Command::StreamInfo { handle, info } => Some(match ctx.launcher.stream_info(&handle, &info).await {
            Ok(()) => LaunchEvent::Connected,
            Err(e) => LaunchEvent::Failed(format!("{e:#}")),
        }),
        Command::Kill(handle) => {
            if let Err(e) = ctx.launcher.kill(&handle).await {
                debug!(error = %e, "Client already stopped");
            }
            None
        }
        Command::Emit(trigger) => {
            ctx.bus.emit(trigger);
            None
        }
    }
}

/// Poll mandelbox status until it is ready, fails, the user logs out or the
/// configured timeout passes.
async fn await_ready(ctx: &SessionContext, mandelbox_id: &str) -> LaunchEvent {
    let deadline = ctx.config.ready_timeout.map(|timeout| Instant::now() + timeout);

    loop {
        let Some(access_token) = ctx
            .state
            .read(|s| s.is_logged_in().then(|| s.access_token.clone()))
        else {
            return LaunchEvent::Failed("logged out while waiting for mandelbox".to_string());
        };

        match ctx.gateway.mandelbox_status(&access_token, mandelbox_id).await {
            Ok(MandelboxStatus::Ready(info)) => return LaunchEvent::Ready(info),
            Ok(MandelboxStatus::Failed(reason)) => {
                return LaunchEvent::Failed(format!("mandelbox {mandelbox_id} failed: {reason}"));
            }
            Ok(MandelboxStatus::Pending) => debug!(mandelbox = %mandelbox_id, "Mandelbox not ready yet"),
            Err(e) => return LaunchEvent::Failed(format!("status poll failed: {e}")),
        }

        if deadline.is_some_and(|deadline| Instant::now() + ctx.config.poll_interval > deadline) {
            return LaunchEvent::Failed(format!("mandelbox {mandelbox_id} not ready before timeout"));
        }
        tokio::time::sleep(ctx.config.poll_interval).await;
    }
}
