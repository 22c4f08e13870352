// src/windows/headless.rs
// In-memory window backend; forwards every window command to a shell channel

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{WindowBackend, WindowDescriptor, WindowError, WindowHandle};
use crate::trigger::ipc::{IPC_CHANNEL, IpcMessage};

/// Command for the external renderer shell, one JSON line each.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ShellCommand {
    Open {
        id: u64,
        url: String,
        descriptor: WindowDescriptor,
    },
    SetVisible {
        id: u64,
        visible: bool,
    },
    Close {
        id: u64,
    },
    Send {
        id: u64,
        channel: &'static str,
        message: IpcMessage,
    },
}

struct HeadlessWindow {
    handle: WindowHandle,
    inbox: Vec<IpcMessage>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    created: usize,
    windows: BTreeMap<u64, HeadlessWindow>,
}

/// Windows that exist only as records.
///
/// New windows are loaded immediately unless deferred loading is enabled,
/// in which case they stay loading until [`HeadlessWindows::finish_loading`].
#[derive(Default)]
pub struct HeadlessWindows {
    inner: Mutex<Inner>,
    outbox: Option<mpsc::UnboundedSender<ShellCommand>>,
    defer_loading: bool,
}

impl HeadlessWindows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outbox(outbox: mpsc::UnboundedSender<ShellCommand>) -> Self {
        Self {
            outbox: Some(outbox),
            ..Self::default()
        }
    }

    pub fn with_deferred_loading(mut self) -> Self {
        self.defer_loading = true;
        self
    }

    /// Mark a window's page as loaded. Returns false for unknown ids.
    pub fn finish_loading(&self, id: u64) -> bool {
        match self.lock().windows.get_mut(&id) {
            Some(window) => {
                window.handle.loading = false;
                true
            }
            None => false,
        }
    }

    /// Total windows ever opened, including closed ones.
    pub fn created_count(&self) -> usize {
        self.lock().created
    }

    /// Messages delivered to a live window, oldest first.
    pub fn messages(&self, id: u64) -> Vec<IpcMessage> {
        self.lock()
            .windows
            .get(&id)
            .map(|window| window.inbox.clone())
            .unwrap_or_default()
    }

    fn forward(&self, command: ShellCommand) {
        if let Some(outbox) = &self.outbox
            && outbox.send(command).is_err()
        {
            trace!("Shell outbox closed");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl WindowBackend for HeadlessWindows {
    fn open(&self, url: &str, descriptor: &WindowDescriptor) -> Result<WindowHandle, WindowError> {
        let handle = {
            let mut inner = self.lock();
            inner.next_id += 1;
            inner.created += 1;
            let handle = WindowHandle {
                id: inner.next_id,
                url: url.to_string(),
                visible: true,
                loading: self.defer_loading,
            };
            inner.windows.insert(
                handle.id,
                HeadlessWindow {
                    handle: handle.clone(),
                    inbox: Vec::new(),
                },
            );
            handle
        };

        debug!(id = handle.id, url, "Headless window opened");
        self.forward(ShellCommand::Open {
            id: handle.id,
            url: url.to_string(),
            descriptor: descriptor.clone(),
        });
        Ok(handle)
    }

    fn windows(&self) -> Vec<WindowHandle> {
        self.lock()
            .windows
            .values()
            .map(|window| window.handle.clone())
            .collect()
    }

    fn set_visible(&self, id: u64, visible: bool) -> Result<(), WindowError> {
        self.lock()
            .windows
            .get_mut(&id)
            .ok_or(WindowError::NotFound(id))?
            .handle
            .visible = visible;
        self.forward(ShellCommand::SetVisible { id, visible });
        Ok(())
    }

    fn close(&self, id: u64) -> Result<(), WindowError> {
        self.lock()
            .windows
            .remove(&id)
            .ok_or(WindowError::NotFound(id))?;
        self.forward(ShellCommand::Close { id });
        Ok(())
    }

    fn mark_loaded(&self, id: u64) -> Result<(), WindowError> {
        if self.finish_loading(id) {
            Ok(())
        } else {
            Err(WindowError::NotFound(id))
        }
    }

    fn send(&self, id: u64, message: &IpcMessage) -> Result<(), WindowError> {
        self.lock()
            .windows
            .get_mut(&id)
            .ok_or(WindowError::NotFound(id))?
            .inbox
            .push(message.clone());
        self.forward(ShellCommand::Send {
            id,
            channel: IPC_CHANNEL,
            message: message.clone(),
        });
        Ok(())
    }
}
