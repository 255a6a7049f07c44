use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use anyhow::anyhow;
use clap::ValueEnum;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::sleep;

use crate::util::envelope::CommandEnvelope;
use crate::util::packet_monitor::{PacketLogEntry, PacketMonitor};
use crate::util::traits::DatagramTransport;
use crate::util::udp::UdpTransport;

/// The UDP port devices listen on for control commands.
pub const CONTROL_PORT: u16 = 4003;

/// Default per-attempt timeout of the convenience commands.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

pub const MIN_BRIGHTNESS: i64 = 1;
pub const MAX_BRIGHTNESS: i64 = 100;
pub const MIN_KELVIN: i64 = 1000;
pub const MAX_KELVIN: i64 = 10000;

/// Clamps a brightness percentage into `1..=100`.
pub fn clamp_brightness(value: i64) -> u8 {
    value.clamp(MIN_BRIGHTNESS, MAX_BRIGHTNESS) as u8
}

/// Clamps a single color channel into `0..=255`.
pub fn clamp_channel(value: i64) -> u8 {
    value.clamp(0, u8::MAX as i64) as u8
}

/// Clamps a color temperature into `1000..=10000` Kelvin.
pub fn clamp_kelvin(value: i64) -> u16 {
    value.clamp(MIN_KELVIN, MAX_KELVIN) as u16
}

/// Where commands are sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTarget {
    pub address: String,
    pub port: u16,
    /// Vendor device identifier, required by some commands.
    pub device_id: Option<String>,
    pub sku: Option<String>,
}

impl DeviceTarget {
    pub fn new(address: &str) -> Self {
        DeviceTarget {
            address: address.trim().to_string(),
            port: CONTROL_PORT,
            device_id: None,
            sku: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_device_info(mut self, device_id: Option<&str>, sku: Option<&str>) -> Self {
        if let Some(device_id) = device_id {
            self.device_id = Some(device_id.trim().to_string());
        }
        if let Some(sku) = sku {
            self.sku = Some(sku.trim().to_string());
        }
        self
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/**
A thread-safe handle on the device target shared by every sender.

Senders take a [`SharedTarget::snapshot`] once per call, so re-pointing the
handle never changes the destination of a send that is already retrying.
 */
#[derive(Debug, Clone)]
pub struct SharedTarget {
    inner: Arc<RwLock<DeviceTarget>>,
}

impl SharedTarget {
    pub fn new(target: DeviceTarget) -> Self {
        SharedTarget {
            inner: Arc::new(RwLock::new(target)),
        }
    }

    pub fn snapshot(&self) -> DeviceTarget {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn replace(&self, target: DeviceTarget) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = target;
    }

    pub fn set_address(&self, address: &str) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).address = address.trim().to_string();
    }

    /// Updates the identifiers that are given, leaving the others untouched.
    pub fn set_device_info(&self, device_id: Option<&str>, sku: Option<&str>) {
        let mut target = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *target = target.clone().with_device_info(device_id, sku);
    }
}

/// Fixed-delay retry policy applied to every send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts made after the first one.
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 2,
            retry_delay: Duration::from_millis(300),
        }
    }
}

impl RetryPolicy {
    pub fn total_attempts(&self) -> u32 {
        self.max_attempts.saturating_add(1)
    }

    /// Upper bound on how long one send may block.
    pub fn worst_case(&self, timeout: Duration) -> Duration {
        timeout
            .saturating_add(self.retry_delay)
            .saturating_mul(self.total_attempts())
    }
}

/// A decoded reply from a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    /// The reply was not JSON; holds the text as received.
    Raw { raw: String },
    Json(Value),
}

impl Reply {
    /// Decodes a datagram, falling back to [`Reply::Raw`] when it is not JSON.
    pub fn decode(bytes: &[u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => Reply::Json(value),
            Err(_) => Reply::Raw {
                raw: text.into_owned(),
            },
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Reply::Json(value) => Some(value),
            Reply::Raw { .. } => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Reply::Json(value) => value.clone(),
            Reply::Raw { raw } => serde_json::json!({ "raw": raw }),
        }
    }
}

/// Per-call options for the raw send operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOptions {
    pub expect_reply: bool,
    pub timeout: Duration,
    /// Overrides the target's device identifier for this call only.
    pub device: Option<String>,
    /// Overrides the target's sku for this call only.
    pub sku: Option<String>,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions {
            expect_reply: false,
            timeout: DEFAULT_TIMEOUT,
            device: None,
            sku: None,
        }
    }
}

/**
The protocol client for a single LAN API device.

Every operation degrades silently: transport failures are retried according
to the [`RetryPolicy`] and then reported as `None`, never as an error. A
`None` therefore means "no reply", which is indistinguishable from an offline
device, and a send that returns without error is not an acknowledgment that
the device applied the command.

Cloning is cheap and clones share the target, transport, and packet log.
 */
#[derive(Clone)]
pub struct ControlInterface {
    target: SharedTarget,
    transport: Arc<dyn DatagramTransport>,
    monitor: Arc<PacketMonitor>,
    retry_policy: RetryPolicy,
    timeout: Duration,
    last_status: Arc<Mutex<Option<Value>>>,
    saved_scenes: Arc<Mutex<HashMap<String, Value>>>,
}

impl fmt::Debug for ControlInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlInterface")
            .field("target", &self.target.snapshot())
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ControlInterface {
    /// Creates a client talking UDP to `address` on the control port.
    pub fn new(address: &str) -> Self {
        Self::with_transport(
            SharedTarget::new(DeviceTarget::new(address)),
            Arc::new(UdpTransport),
            Arc::new(PacketMonitor::default()),
        )
    }

    pub fn with_transport(
        target: SharedTarget,
        transport: Arc<dyn DatagramTransport>,
        monitor: Arc<PacketMonitor>,
    ) -> Self {
        ControlInterface {
            target,
            transport,
            monitor,
            retry_policy: RetryPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            last_status: Arc::new(Mutex::new(None)),
            saved_scenes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Sets the per-attempt timeout used by the convenience commands.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn target(&self) -> &SharedTarget {
        &self.target
    }

    pub fn packet_monitor(&self) -> &Arc<PacketMonitor> {
        &self.monitor
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// The most recent JSON reply received by this client, if any.
    pub fn last_status(&self) -> Option<Value> {
        self.last_status.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn saved_scenes(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.saved_scenes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Names of the scenes saved with [`ControlInterface::save_scene`], sorted.
    pub fn saved_scene_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.saved_scenes().keys().cloned().collect();
        names.sort();
        names
    }

    /**
    Sends `envelope` to `target` with an explicit retry policy.

    Each attempt is logged to the packet monitor, then sent over a fresh
    socket with `timeout` applied to the attempt. The same bytes are reused on
    every retry.
     */
    pub async fn send_to(
        &self,
        target: &DeviceTarget,
        envelope: CommandEnvelope,
        expect_reply: bool,
        timeout: Duration,
        retry_policy: RetryPolicy,
    ) -> Option<Reply> {
        let envelope =
            envelope.with_identity(target.device_id.as_deref(), target.sku.as_deref());
        let payload = match envelope.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Dropping command for {}: {:#}", target, e);
                return None;
            }
        };
        let payload_json = envelope.to_value();

        let mut last_error = None;
        for attempt in 0..retry_policy.total_attempts() {
            self.monitor.record(PacketLogEntry::new(
                &target.address,
                target.port,
                payload_json.clone(),
                &payload,
            ));
            debug!(
                "Sending {} to {} (attempt {}/{})",
                envelope.command().unwrap_or("?"),
                target,
                attempt + 1,
                retry_policy.total_attempts()
            );

            match self
                .transport
                .exchange(&target.address, target.port, &payload, expect_reply, timeout)
                .await
            {
                Ok(Some(bytes)) => {
                    let reply = Reply::decode(&bytes);
                    if let Reply::Json(value) = &reply {
                        *self.last_status.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(value.clone());
                    }
                    return Some(reply);
                }
                Ok(None) => return None,
                Err(e) => {
                    debug!("Attempt {} to {} failed: {}", attempt + 1, target, e);
                    last_error = Some(e);
                    if attempt < retry_policy.max_attempts {
                        sleep(retry_policy.retry_delay).await;
                    }
                }
            }
        }

        if let Some(e) = last_error {
            warn!(
                "Send to {} failed after {} attempts: {}",
                target,
                retry_policy.total_attempts(),
                e
            );
        }
        None
    }

    /// Sends `envelope` to the current target using this client's retry policy.
    pub async fn send(
        &self,
        envelope: CommandEnvelope,
        expect_reply: bool,
        timeout: Duration,
    ) -> Option<Reply> {
        let target = self.target.snapshot();
        self.send_to(&target, envelope, expect_reply, timeout, self.retry_policy)
            .await
    }

    async fn send_with_options(&self, envelope: CommandEnvelope, options: SendOptions) -> Option<Reply> {
        let envelope = envelope.with_identity(options.device.as_deref(), options.sku.as_deref());
        self.send(envelope, options.expect_reply, options.timeout).await
    }

    /// Sends an arbitrary command name with its `data` object.
    pub async fn send_command(
        &self,
        cmd: &str,
        data: Map<String, Value>,
        options: SendOptions,
    ) -> Option<Reply> {
        self.send_with_options(CommandEnvelope::new(cmd, data), options)
            .await
    }

    /// Sends a payload that already contains the `msg` wrapper.
    pub async fn send_payload(&self, payload: Map<String, Value>, options: SendOptions) -> Option<Reply> {
        self.send_with_options(CommandEnvelope::from_payload(payload), options)
            .await
    }

    pub async fn turn_on(&self) -> Option<Reply> {
        self.send(CommandEnvelope::turn(true), false, self.timeout)
            .await
    }

    pub async fn turn_off(&self) -> Option<Reply> {
        self.send(CommandEnvelope::turn(false), false, self.timeout)
            .await
    }

    /// Sets the brightness, clamped into `1..=100`.
    pub async fn set_brightness(&self, brightness: i64) -> Option<Reply> {
        let brightness = clamp_brightness(brightness);
        self.send(CommandEnvelope::brightness(brightness), false, self.timeout)
            .await
    }

    /// Sets the color; each channel is clamped into `0..=255`.
    pub async fn set_rgb(&self, red: i64, green: i64, blue: i64) -> Option<Reply> {
        let envelope =
            CommandEnvelope::color_rgb(clamp_channel(red), clamp_channel(green), clamp_channel(blue));
        self.send(envelope, false, self.timeout).await
    }

    pub async fn set_color(&self, rgb: RGB) -> Option<Reply> {
        self.send(
            CommandEnvelope::color_rgb(rgb.red, rgb.green, rgb.blue),
            false,
            self.timeout,
        )
        .await
    }

    /// Sets the white color temperature, clamped into `1000..=10000` Kelvin.
    pub async fn set_color_temperature(&self, kelvin: i64) -> Option<Reply> {
        self.send(
            CommandEnvelope::color_temperature(clamp_kelvin(kelvin)),
            false,
            self.timeout,
        )
        .await
    }

    /// Activates one of the device's built-in scenes.
    pub async fn activate_scene(&self, scene_id: u32) -> Option<Reply> {
        self.send(CommandEnvelope::scene(scene_id), false, self.timeout)
            .await
    }

    /// Queries power, brightness and color. Always waits for a reply.
    pub async fn get_status(&self) -> Option<Reply> {
        self.send(CommandEnvelope::dev_status(), true, self.timeout)
            .await
    }

    /**
    Queries the device and keeps its status under `name`, replacing any scene
    of the same name.

    Returns false, and saves nothing, when the device did not answer with
    JSON. Saved scenes live in memory and are shared by clones of this client.
     */
    pub async fn save_scene(&self, name: &str) -> bool {
        let status = match self.get_status().await {
            Some(Reply::Json(status)) => status,
            _ => {
                warn!("No status from {}, scene {:?} not saved", self.target.snapshot(), name);
                return false;
            }
        };
        self.saved_scenes().insert(name.to_string(), status);
        true
    }

    /**
    Replays a saved scene: its power state and, when it was on, its
    brightness and RGB color.

    Returns false if no scene of that name was saved.
     */
    pub async fn load_scene(&self, name: &str) -> bool {
        let status = match self.saved_scenes().get(name).cloned() {
            Some(status) => status,
            None => return false,
        };
        let data = status.pointer("/msg/data").cloned().unwrap_or(Value::Null);

        match data.get("onOff").and_then(Value::as_i64) {
            Some(0) => {
                self.turn_off().await;
            }
            Some(_) => {
                self.turn_on().await;
                if let Some(brightness) = data.get("brightness").and_then(Value::as_i64) {
                    self.set_brightness(brightness).await;
                }
                let channel = |c: &str| data.pointer(&format!("/color/{}", c)).and_then(Value::as_i64);
                if let (Some(r), Some(g), Some(b)) = (channel("r"), channel("g"), channel("b")) {
                    self.set_rgb(r, g, b).await;
                }
            }
            None => debug!("Scene {:?} has no power state to replay", name),
        }
        true
    }

    /// Turns the device off and, after a second, on again.
    pub async fn power_cycle(&self) -> Option<Reply> {
        info!("Power cycling {}", self.target.snapshot());
        self.turn_off().await;
        sleep(Duration::from_secs(1)).await;
        self.turn_on().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RGB {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl From<(u8, u8, u8)> for RGB {
    fn from((red, green, blue): (u8, u8, u8)) -> Self {
        RGB { red, green, blue }
    }
}

impl From<RGB> for (u8, u8, u8) {
    fn from(rgb: RGB) -> Self {
        (rgb.red, rgb.green, rgb.blue)
    }
}

/// Named colors accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliColors {
    Red,
    Green,
    Blue,
    White,
    WarmWhite,
    Yellow,
    Orange,
    Purple,
    Cyan,
    Magenta,
    Pink,
    Teal,
}

impl FromStr for CliColors {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <CliColors as ValueEnum>::from_str(s, true).map_err(|_| anyhow!("Invalid color: {}", s))
    }
}

impl From<CliColors> for RGB {
    fn from(color: CliColors) -> Self {
        let rgb = match color {
            CliColors::Red => (255, 0, 0),
            CliColors::Green => (0, 255, 0),
            CliColors::Blue => (0, 0, 255),
            CliColors::White => (255, 255, 255),
            CliColors::WarmWhite => (255, 180, 107),
            CliColors::Yellow => (255, 255, 0),
            CliColors::Orange => (255, 165, 0),
            CliColors::Purple => (128, 0, 128),
            CliColors::Cyan => (0, 255, 255),
            CliColors::Magenta => (255, 0, 255),
            CliColors::Pink => (255, 192, 203),
            CliColors::Teal => (0, 128, 128),
        };
        rgb.into()
    }
}
