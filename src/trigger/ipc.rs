// src/trigger/ipc.rs
// Renderer IPC codec: `[event, partialState]` messages on a single channel

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::{Trigger, TriggerId};

/// Name of the channel every renderer message travels on.
pub const IPC_CHANNEL: &str = "MAIN_STATE_CHANNEL";

/// Event name of outbound state snapshots.
pub const STATE_EVENT: &str = "state";

/// One message on the IPC channel, serialized as a two-element JSON array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcMessage(pub String, pub Value);

impl IpcMessage {
    pub fn state(view: Value) -> Self {
        Self(STATE_EVENT.to_string(), view)
    }

    pub fn event(&self) -> &str {
        &self.0
    }

    pub fn payload(&self) -> &Value {
        &self.1
    }
}

/// Decode one line of NDJSON into triggers. Malformed lines yield nothing.
pub fn decode_line(line: &str) -> Vec<Trigger> {
    let line = line.trim();
    if line.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<IpcMessage>(line) {
        Ok(message) => decode_inbound(&message),
        Err(e) => {
            debug!(error = %e, "Ignoring malformed IPC message");
            Vec::new()
        }
    }
}

/// Route every field of the partial state that names a renderer trigger.
///
/// Object payloads carry the trigger's fields; `true` fires a trigger with no
/// fields; anything else (including unknown keys) is ignored.
pub fn decode_inbound(message: &IpcMessage) -> Vec<Trigger> {
    let Some(fields) = message.payload().as_object() else {
        debug!(event = message.event(), "IPC payload is not an object");
        return Vec::new();
    };

    fields
        .iter()
        .filter_map(|(key, payload)| {
            let id = TriggerId::from_str(key).ok()?;
            if !id.accepts_renderer() {
                debug!(trigger = %id, "Renderer may not raise this trigger");
                return None;
            }
            decode_field(id, payload)
        })
        .collect()
}

fn decode_field(id: TriggerId, payload: &Value) -> Option<Trigger> {
    let kind: &'static str = id.into();
    let tagged = match payload {
        Value::Object(fields) => {
            let mut tagged = fields.clone();
            tagged.insert("kind".to_string(), Value::String(kind.to_string()));
            tagged
        }
        Value::Bool(true) => {
            let mut tagged = Map::new();
            tagged.insert("kind".to_string(), Value::String(kind.to_string()));
            tagged
        }
        _ => return None,
    };

    match serde_json::from_value::<Trigger>(Value::Object(tagged)) {
        Ok(trigger) => Some(trigger),
        Err(e) => {
            debug!(trigger = %id, error = %e, "Ignoring malformed trigger payload");
            None
        }
    }
}

/// Encode an outbound message as one NDJSON line.
pub fn encode_line(message: &IpcMessage) -> serde_json::Result<String> {
    serde_json::to_string(message)
}
