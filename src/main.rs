// src/main.rs
// whist-session - main process of the Whist desktop client, driven by a renderer shell over pipes

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use tracing::info;
use tracing_subscriber::FmtSubscriber;

use whist_session::cli::{Cli, read_ipc, spawn_shell_writer};
use whist_session::gateway::HttpGateway;
use whist_session::orchestrator::{Orchestrator, SessionContext};
use whist_session::protocol::ProtocolManager;
use whist_session::state::{ApplicationState, StateHandle};
use whist_session::store::Store;
use whist_session::trigger::{Trigger, TriggerBus, TriggerId};
use whist_session::windows::{HeadlessWindows, WindowManager};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // stdout carries shell commands, so logs go to stderr
    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Arc::new(cli.into_config());
    info!(
        environment = %config.environment,
        webserver = %config.webserver_url,
        data_dir = %config.data_dir.display(),
        "Starting whist-session"
    );

    let store = Arc::new(Store::open(config.store_path()));
    let state = StateHandle::new(ApplicationState::restore(&store));

    let (shell_tx, shell_writer) = spawn_shell_writer();
    let backend = Arc::new(HeadlessWindows::with_outbox(shell_tx).with_deferred_loading());
    let windows = Arc::new(WindowManager::new(backend, config.shell_url.clone()));

    let gateway = Arc::new(HttpGateway::new(&config).context("Failed to build HTTP client")?);
    let launcher = Arc::new(ProtocolManager::new(config.protocol()));

    let bus = TriggerBus::new();
    let ctx = SessionContext {
        bus: bus.clone(),
        state,
        store,
        gateway,
        launcher,
        windows,
        config,
    };

    let mut quit = bus.from_trigger(TriggerId::Quit);
    let orchestrator = Orchestrator::start(ctx);

    let ipc = tokio::spawn(read_ipc(tokio::io::stdin(), bus.clone()));
    bus.emit(Trigger::AppReady);

    tokio::select! {
        _ = quit.next() => info!("Quit requested"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    ipc.abort();
    orchestrator.shutdown().await;

    // flush pending shell commands; the window backend owns the last sender
    let _ = tokio::time::timeout(Duration::from_secs(2), shell_writer).await;

    // a blocked stdin read would otherwise hold the runtime open
    std::process::exit(0);
}
