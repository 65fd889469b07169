use serde_json::Value;

pub trait EmitterPort: Send + Sync {
    fn emit(&self, channel: &str, payload: &Value);
}

/// Discards every event.
pub struct NullEmitter;

impl EmitterPort for NullEmitter {
    fn emit(&self, _channel: &str, _payload: &Value) {}
}
