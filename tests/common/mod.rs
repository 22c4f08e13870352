// tests/common/mod.rs
// Shared harness: in-memory gateway and launcher fakes wired into a running orchestrator

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::{Notify, broadcast};

use whist_session::config::Config;
use whist_session::gateway::{AuthResponse, Gateway, GatewayError, MandelboxAssignment, MandelboxStatus};
use whist_session::orchestrator::{Orchestrator, SessionContext};
use whist_session::protocol::{PortMapping, ProtocolEvent, ProtocolHandle, ProtocolLauncher, SessionInfo};
use whist_session::state::{ApplicationState, StateHandle};
use whist_session::store::Store;
use whist_session::trigger::TriggerBus;
use whist_session::windows::{HeadlessWindows, WindowManager};

// ============================================================================
// Gateway fake
// ============================================================================

pub fn session_info() -> SessionInfo {
    SessionInfo {
        ip: "10.0.0.5".into(),
        secret: "mandelbox-secret".into(),
        ports: PortMapping {
            port_32262: 1,
            port_32263: 2,
            port_32273: 3,
        },
    }
}

pub struct FakeGateway {
    pub login_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub assign_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    /// When set, logins wait for a notification before answering
    pub login_gate: Option<Arc<Notify>>,
    pub login_response: Mutex<AuthResponse>,
    /// None answers refreshes with 401
    pub refresh_response: Mutex<Option<AuthResponse>>,
    /// Drained one per poll; empty means ready
    pub statuses: Mutex<VecDeque<MandelboxStatus>>,
    /// Region latencies; missing regions fail to answer
    pub latencies: HashMap<String, Duration>,
    pub uploads: Mutex<Vec<String>>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self {
            login_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            assign_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            login_gate: None,
            login_response: Mutex::new(AuthResponse {
                access_token: Some("T".into()),
                refresh_token: Some("R".into()),
                encrypted_config_token: None,
            }),
            refresh_response: Mutex::new(None),
            statuses: Mutex::new(VecDeque::new()),
            latencies: HashMap::from([
                ("us-east-1".to_string(), Duration::from_millis(40)),
                ("us-west-1".to_string(), Duration::from_millis(10)),
            ]),
            uploads: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn email_login(&self, _email: &str, _password: &str) -> Result<AuthResponse, GatewayError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.login_gate {
            gate.notified().await;
        }
        Ok(self.login_response.lock().unwrap().clone())
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<AuthResponse, GatewayError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refresh_response
            .lock()
            .unwrap()
            .clone()
            .ok_or(GatewayError::Status {
                status: 401,
                body: "expired".into(),
            })
    }

    async fn assign_mandelbox(
        &self,
        _access_token: &str,
        _email: &str,
        regions: &[String],
    ) -> Result<MandelboxAssignment, GatewayError> {
        self.assign_calls.fetch_add(1, Ordering::SeqCst);
        Ok(MandelboxAssignment {
            mandelbox_id: "m-1".into(),
            ip: "10.0.0.5".into(),
            region: regions.first().cloned().unwrap_or_default(),
        })
    }

    async fn mandelbox_status(
        &self,
        _access_token: &str,
        _mandelbox_id: &str,
    ) -> Result<MandelboxStatus, GatewayError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MandelboxStatus::Ready(session_info())))
    }

    async fn ping_region(&self, region: &str) -> Result<Duration, GatewayError> {
        self.latencies
            .get(region)
            .copied()
            .ok_or_else(|| GatewayError::Decode(format!("{region} unreachable")))
    }

    async fn upload_config_token(&self, _access_token: &str, encrypted: &str) -> Result<(), GatewayError> {
        self.uploads.lock().unwrap().push(encrypted.to_string());
        Ok(())
    }
}

// ============================================================================
// Launcher fake
// ============================================================================

pub struct FakeLauncher {
    pub spawned: AtomicUsize,
    pub killed: Mutex<Vec<String>>,
    pub streamed: Mutex<Vec<(String, SessionInfo)>>,
    pub fail_launch: std::sync::atomic::AtomicBool,
    current: Mutex<Option<ProtocolHandle>>,
    events: broadcast::Sender<ProtocolEvent>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            spawned: AtomicUsize::new(0),
            killed: Mutex::new(Vec::new()),
            streamed: Mutex::new(Vec::new()),
            fail_launch: Default::default(),
            current: Mutex::new(None),
            events,
        }
    }
}

impl FakeLauncher {
    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Simulate the client process exiting on its own.
    pub fn exit(&self, code: i32) {
        if let Some(handle) = self.current.lock().unwrap().take() {
            let _ = self.events.send(ProtocolEvent::Exited {
                handle: handle.id,
                code: Some(code),
            });
        }
    }

    pub fn report_unstable(&self, unstable: bool) {
        let _ = self.events.send(ProtocolEvent::Unstable(unstable));
    }
}

#[async_trait]
impl ProtocolLauncher for FakeLauncher {
    async fn launch(&self) -> Result<ProtocolHandle> {
        if self.fail_launch.load(Ordering::SeqCst) {
            bail!("client binary missing");
        }
        let mut current = self.current.lock().unwrap();
        if let Some(handle) = current.as_ref() {
            return Ok(handle.clone());
        }
        let n = self.spawned.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = ProtocolHandle::new(1000 + n as u32);
        *current = Some(handle.clone());
        let _ = self.events.send(ProtocolEvent::Started(handle.clone()));
        Ok(handle)
    }

    async fn stream_info(&self, handle: &ProtocolHandle, info: &SessionInfo) -> Result<()> {
        if self.current.lock().unwrap().as_ref() != Some(handle) {
            bail!("stale handle");
        }
        self.streamed
            .lock()
            .unwrap()
            .push((handle.id.clone(), info.clone()));
        Ok(())
    }

    async fn kill(&self, handle: &ProtocolHandle) -> Result<()> {
        let taken = {
            let mut current = self.current.lock().unwrap();
            if current.as_ref() == Some(handle) { current.take() } else { None }
        };
        let Some(handle) = taken else {
            bail!("not running");
        };
        self.killed.lock().unwrap().push(handle.id.clone());
        let _ = self.events.send(ProtocolEvent::Exited {
            handle: handle.id,
            code: Some(0),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub ctx: SessionContext,
    pub gateway: Arc<FakeGateway>,
    pub launcher: Arc<FakeLauncher>,
    pub backend: Arc<HeadlessWindows>,
    pub orchestrator: Orchestrator,
    pub dir: TempDir,
}

impl Harness {
    pub fn start(initial: ApplicationState, gateway: FakeGateway) -> Self {
        Self::start_with(initial, gateway, HeadlessWindows::new())
    }

    pub fn start_with(initial: ApplicationState, gateway: FakeGateway, backend: HeadlessWindows) -> Self {
        let dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            shell_url: "file:///app/index.html".into(),
            regions: vec!["us-east-1".into(), "us-west-1".into(), "eu-west-1".into()],
            poll_interval: Duration::from_millis(10),
            ..Config::default()
        };

        let store = Arc::new(Store::open(config.store_path()));
        let gateway = Arc::new(gateway);
        let launcher = Arc::new(FakeLauncher::default());
        let backend = Arc::new(backend);

        let ctx = SessionContext {
            bus: TriggerBus::new(),
            state: StateHandle::new(initial),
            store,
            gateway: gateway.clone(),
            launcher: launcher.clone(),
            windows: Arc::new(WindowManager::new(backend.clone(), config.shell_url.clone())),
            config: Arc::new(config),
        };
        let orchestrator = Orchestrator::start(ctx.clone());

        Self {
            ctx,
            gateway,
            launcher,
            backend,
            orchestrator,
            dir,
        }
    }

    pub fn state(&self) -> ApplicationState {
        self.ctx.state.snapshot()
    }

    pub fn store_text(&self) -> String {
        std::fs::read_to_string(self.ctx.store.path()).unwrap_or_default()
    }
}

pub fn logged_in() -> ApplicationState {
    ApplicationState {
        email: "a@b.com".into(),
        access_token: "T".into(),
        refresh_token: "R".into(),
        config_token: "C".into(),
        onboarded: true,
        ..Default::default()
    }
}

/// Poll until `check` holds, failing the test after two seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Let every flow drain its queue.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
