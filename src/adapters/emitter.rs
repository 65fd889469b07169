use serde_json::{json, Value};

use crate::core::ports::emitter::EmitterPort;

/// Writes every event as one JSON line on the `triage::events` log target.
pub struct LogEmitter;

impl LogEmitter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LogEmitter {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn event_line(channel: &str, payload: &Value) -> String {
    json!({ "channel": channel, "payload": payload }).to_string()
}

impl EmitterPort for LogEmitter {
    fn emit(&self, channel: &str, payload: &Value) {
        log::info!(target: "triage::events", "{}", event_line(channel, payload));
    }
}
