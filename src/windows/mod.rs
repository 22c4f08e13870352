// src/windows/mod.rs
// Window lifecycle: create/show/hide/destroy by logical hash, state broadcast

mod headless;

pub use headless::{HeadlessWindows, ShellCommand};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::trigger::ipc::IpcMessage;

/// Query parameter that tells the renderer shell which view to show.
pub const SHOW_PARAM: &str = "show";

/// Logical window identity, carried in the window URL.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WindowHash {
    Auth,
    Payment,
    Loading,
    Omnibar,
    Onboarding,
    Signout,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowOptions {
    pub title: String,
    pub frameless: bool,
    pub always_on_top: bool,
    pub resizable: bool,
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self {
            title: "Whist".to_string(),
            frameless: false,
            always_on_top: false,
            resizable: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowDescriptor {
    pub hash: WindowHash,
    pub width: u32,
    pub height: u32,
    pub options: WindowOptions,
}

impl WindowDescriptor {
    /// Standard geometry for each window the client opens.
    pub fn for_hash(hash: WindowHash) -> Self {
        let (width, height) = match hash {
            WindowHash::Auth => (400, 555),
            WindowHash::Payment => (900, 700),
            WindowHash::Loading => (400, 300),
            WindowHash::Omnibar => (650, 300),
            WindowHash::Onboarding => (700, 500),
            WindowHash::Signout => (400, 225),
            WindowHash::Error => (400, 225),
        };
        let options = match hash {
            WindowHash::Omnibar => WindowOptions {
                frameless: true,
                always_on_top: true,
                ..WindowOptions::default()
            },
            WindowHash::Loading => WindowOptions {
                frameless: true,
                ..WindowOptions::default()
            },
            WindowHash::Payment => WindowOptions {
                resizable: true,
                ..WindowOptions::default()
            },
            _ => WindowOptions::default(),
        };
        Self {
            hash,
            width,
            height,
            options,
        }
    }
}

/// A live window as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowHandle {
    pub id: u64,
    pub url: String,
    pub visible: bool,
    /// The page has not finished loading yet
    pub loading: bool,
}

impl WindowHandle {
    /// Hash parsed back out of the window URL.
    pub fn hash(&self) -> Option<WindowHash> {
        let url = Url::parse(&self.url).ok()?;
        url.query_pairs()
            .find(|(key, _)| key == SHOW_PARAM)
            .and_then(|(_, value)| value.parse().ok())
    }
}

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("invalid shell URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("window {0} does not exist")]
    NotFound(u64),

    #[error("window backend error: {0}")]
    Backend(String),
}

/// Native window toolkit seam.
pub trait WindowBackend: Send + Sync {
    fn open(&self, url: &str, descriptor: &WindowDescriptor) -> Result<WindowHandle, WindowError>;

    /// Every live window, in creation order.
    fn windows(&self) -> Vec<WindowHandle>;

    fn set_visible(&self, id: u64, visible: bool) -> Result<(), WindowError>;

    fn close(&self, id: u64) -> Result<(), WindowError>;

    /// The window's page reported it finished loading.
    fn mark_loaded(&self, id: u64) -> Result<(), WindowError>;

    fn send(&self, id: u64, message: &IpcMessage) -> Result<(), WindowError>;
}

/// Finds windows by scanning the backend's live windows, so there is no
/// registry to fall out of sync with windows the user closed.
pub struct WindowManager {
    backend: Arc<dyn WindowBackend>,
    shell_url: String,
    /// Latest undelivered message per still-loading window
    pending: Mutex<HashMap<u64, IpcMessage>>,
}

impl WindowManager {
    pub fn new(backend: Arc<dyn WindowBackend>, shell_url: impl Into<String>) -> Self {
        Self {
            backend,
            shell_url: shell_url.into(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn url_for(&self, hash: WindowHash) -> Result<String, WindowError> {
        let mut url = Url::parse(&self.shell_url).map_err(|source| WindowError::InvalidUrl {
            url: self.shell_url.clone(),
            source,
        })?;
        let name: &'static str = hash.into();
        url.query_pairs_mut().append_pair(SHOW_PARAM, name);
        Ok(url.into())
    }

    pub fn create(&self, descriptor: &WindowDescriptor) -> Result<WindowHandle, WindowError> {
        let url = self.url_for(descriptor.hash)?;
        let handle = self.backend.open(&url, descriptor)?;
        info!(window = %descriptor.hash, id = handle.id, "Window created");
        Ok(handle)
    }

    /// Create the window if absent, otherwise make sure it is visible.
    pub fn ensure(&self, descriptor: &WindowDescriptor) -> Result<WindowHandle, WindowError> {
        match self.find(descriptor.hash) {
            Some(mut handle) => {
                if !handle.visible {
                    self.backend.set_visible(handle.id, true)?;
                    handle.visible = true;
                }
                Ok(handle)
            }
            None => self.create(descriptor),
        }
    }

    pub fn find(&self, hash: WindowHash) -> Option<WindowHandle> {
        self.backend
            .windows()
            .into_iter()
            .find(|handle| handle.hash() == Some(hash))
    }

    pub fn is_visible(&self, hash: WindowHash) -> bool {
        self.find(hash).is_some_and(|handle| handle.visible)
    }

    pub fn show(&self, hash: WindowHash) -> Result<(), WindowError> {
        match self.find(hash) {
            Some(handle) if !handle.visible => self.backend.set_visible(handle.id, true),
            _ => Ok(()),
        }
    }

    pub fn hide(&self, hash: WindowHash) -> Result<(), WindowError> {
        match self.find(hash) {
            Some(handle) if handle.visible => self.backend.set_visible(handle.id, false),
            _ => Ok(()),
        }
    }

    pub fn destroy(&self, hash: WindowHash) -> Result<(), WindowError> {
        let Some(handle) = self.find(hash) else {
            return Ok(());
        };
        self.close(handle.id)?;
        info!(window = %hash, id = handle.id, "Window destroyed");
        Ok(())
    }

    pub fn destroy_all(&self) {
        for handle in self.backend.windows() {
            if let Err(e) = self.close(handle.id) {
                warn!(id = handle.id, error = %e, "Failed to close window");
            }
        }
    }

    /// Send a message to every window.
    ///
    /// Windows still loading keep only the most recent message, delivered by
    /// [`WindowManager::page_loaded`].
    pub fn broadcast(&self, message: &IpcMessage) {
        for handle in self.backend.windows() {
            if handle.loading {
                self.lock_pending().insert(handle.id, message.clone());
                continue;
            }
            self.send(handle.id, message);
        }
    }

    /// Mark a window loaded and flush its pending message.
    ///
    /// Returns false when there was nothing pending for it.
    pub fn page_loaded(&self, id: u64) -> bool {
        if let Err(e) = self.backend.mark_loaded(id) {
            debug!(id, error = %e, "Loaded window is gone");
            self.lock_pending().remove(&id);
            return true;
        }
        let Some(message) = self.lock_pending().remove(&id) else {
            return false;
        };
        debug!(id, "Delivering deferred broadcast");
        self.send(id, &message);
        true
    }

    /// Send to one window, logging failures.
    pub fn send(&self, id: u64, message: &IpcMessage) {
        if let Err(e) = self.backend.send(id, message) {
            warn!(id, error = %e, "Failed to deliver message");
        }
    }

    fn close(&self, id: u64) -> Result<(), WindowError> {
        self.lock_pending().remove(&id);
        self.backend.close(id)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, IpcMessage>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> (Arc<HeadlessWindows>, WindowManager) {
        let backend = Arc::new(HeadlessWindows::new());
        let manager = WindowManager::new(backend.clone(), "file:///app/index.html");
        (backend, manager)
    }

    #[test]
    fn url_carries_hash_as_show_param() {
        let (_, manager) = manager();
        assert_eq!(
            manager.url_for(WindowHash::Auth).unwrap(),
            "file:///app/index.html?show=auth"
        );
    }

    #[test]
    fn invalid_shell_url_is_an_error() {
        let manager = WindowManager::new(Arc::new(HeadlessWindows::new()), "not a url");
        assert!(matches!(
            manager.url_for(WindowHash::Auth),
            Err(WindowError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn ensure_creates_once_then_shows() {
        let (backend, manager) = manager();
        let descriptor = WindowDescriptor::for_hash(WindowHash::Auth);

        let first = manager.ensure(&descriptor).unwrap();
        manager.hide(WindowHash::Auth).unwrap();
        assert!(!manager.is_visible(WindowHash::Auth));

        let second = manager.ensure(&descriptor).unwrap();
        assert_eq!(first.id, second.id);
        assert!(manager.is_visible(WindowHash::Auth));
        assert_eq!(backend.created_count(), 1);
    }

    #[test]
    fn operations_on_absent_windows_are_noops() {
        let (_, manager) = manager();
        manager.show(WindowHash::Omnibar).unwrap();
        manager.hide(WindowHash::Omnibar).unwrap();
        manager.destroy(WindowHash::Omnibar).unwrap();
        assert!(manager.find(WindowHash::Omnibar).is_none());
    }

    #[test]
    fn destroy_all_closes_every_window() {
        let (backend, manager) = manager();
        manager.create(&WindowDescriptor::for_hash(WindowHash::Auth)).unwrap();
        manager.create(&WindowDescriptor::for_hash(WindowHash::Loading)).unwrap();
        manager.destroy_all();
        assert!(backend.windows().is_empty());
    }

    #[test]
    fn loading_windows_receive_only_the_latest_message() {
        let backend = Arc::new(HeadlessWindows::new().with_deferred_loading());
        let manager = WindowManager::new(backend.clone(), "file:///app/index.html");
        let handle = manager.create(&WindowDescriptor::for_hash(WindowHash::Auth)).unwrap();

        manager.broadcast(&IpcMessage::state(json!({"n": 1})));
        manager.broadcast(&IpcMessage::state(json!({"n": 2})));
        assert!(backend.messages(handle.id).is_empty());

        assert!(manager.page_loaded(handle.id));
        assert_eq!(backend.messages(handle.id), vec![IpcMessage::state(json!({"n": 2}))]);

        manager.broadcast(&IpcMessage::state(json!({"n": 3})));
        assert_eq!(backend.messages(handle.id).len(), 2);
    }

    #[test]
    fn descriptor_geometry() {
        let omnibar = WindowDescriptor::for_hash(WindowHash::Omnibar);
        assert!(omnibar.options.always_on_top);
        assert!(omnibar.options.frameless);
        assert!(!WindowDescriptor::for_hash(WindowHash::Auth).options.always_on_top);
    }
}
