use anyhow::Context;
use serde_json::{json, Map, Value};

/// The wire unit of the LAN API.
///
/// Every command travels as a top-level JSON object of the form
/// `{"msg": {"cmd": <name>, "data": {...}}}`. Some devices additionally want
/// the `device` and `sku` identifiers at the top level; those are merged in
/// by [`CommandEnvelope::with_identity`] only where the payload does not
/// already carry them.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    payload: Map<String, Value>,
}

impl CommandEnvelope {
    pub fn new(cmd: &str, data: Map<String, Value>) -> Self {
        let mut msg = Map::new();
        msg.insert("cmd".to_string(), Value::String(cmd.to_string()));
        msg.insert("data".to_string(), Value::Object(data));

        let mut payload = Map::new();
        payload.insert("msg".to_string(), Value::Object(msg));
        CommandEnvelope { payload }
    }

    /// Wraps a payload that was built elsewhere and already contains `msg`.
    pub fn from_payload(payload: Map<String, Value>) -> Self {
        CommandEnvelope { payload }
    }

    fn from_data(cmd: &str, data: Value) -> Self {
        match data {
            Value::Object(map) => Self::new(cmd, map),
            _ => Self::new(cmd, Map::new()),
        }
    }

    /// `turn` with `value` 1 (on) or 0 (off).
    pub fn turn(on: bool) -> Self {
        Self::from_data("turn", json!({ "value": if on { 1 } else { 0 } }))
    }

    /// `brightness`; the value is expected to be clamped already.
    pub fn brightness(value: u8) -> Self {
        Self::from_data("brightness", json!({ "value": value }))
    }

    pub fn color_rgb(red: u8, green: u8, blue: u8) -> Self {
        Self::from_data(
            "colorwc",
            json!({ "color": { "r": red, "g": green, "b": blue } }),
        )
    }

    pub fn color_temperature(kelvin: u16) -> Self {
        Self::from_data("colorwc", json!({ "colorTemInKelvin": kelvin }))
    }

    pub fn scene(scene_id: u32) -> Self {
        Self::from_data("scene", json!({ "sceneId": scene_id }))
    }

    pub fn dev_status() -> Self {
        Self::new("devStatus", Map::new())
    }

    /// The discovery probe multicast and broadcast by the scanner.
    pub fn scan() -> Self {
        Self::from_data("scan", json!({ "account_topic": "reserve" }))
    }

    /// Merges `device` and `sku` into the top level of the payload.
    ///
    /// Empty identifiers are ignored, and keys already present in the payload
    /// are never overwritten.
    pub fn with_identity(mut self, device: Option<&str>, sku: Option<&str>) -> Self {
        for (key, value) in [("device", device), ("sku", sku)] {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                self.payload
                    .entry(key.to_string())
                    .or_insert_with(|| Value::String(value.to_string()));
            }
        }
        self
    }

    /// The command name, if the payload carries a well-formed `msg.cmd`.
    pub fn command(&self) -> Option<&str> {
        self.payload.get("msg")?.get("cmd")?.as_str()
    }

    /// The `msg.data` object, if present.
    pub fn data(&self) -> Option<&Map<String, Value>> {
        self.payload.get("msg")?.get("data")?.as_object()
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.payload.clone())
    }

    /// Serializes the envelope to the UTF-8 JSON bytes put on the wire.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(&self.payload).context("Failed to serialize command envelope")
    }
}
