//! TOML config file loading, environment overrides, validation, and broker
//! host resolution.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::handshake::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_INTERVAL};
use crate::storage::STORAGE_SIZE;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Config {
    pub(crate) gateway: GatewaySettings,
    pub(crate) mqtt: MqttSettings,
    pub(crate) link: LinkSettings,
    pub(crate) handshake: HandshakeSettings,
    pub(crate) watchdog: WatchdogSettings,
    pub(crate) storage: StorageSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct GatewaySettings {
    /// Added to every telemetry payload as `deviceId`.
    pub(crate) device_id: String,
    pub(crate) loop_interval_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            device_id: "irrigation-gateway".into(),
            loop_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct MqttSettings {
    /// Falls back to the stored server address when unset.
    pub(crate) host: Option<String>,
    pub(crate) port: u16,
    pub(crate) client_id: String,
    pub(crate) control_topic: String,
    pub(crate) telemetry_topic: String,
    pub(crate) keep_alive_s: u64,
    /// Upper bound on time spent servicing the broker per iteration.
    pub(crate) service_budget_ms: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: None,
            port: 1883,
            client_id: "irrigation-gateway".into(),
            control_topic: "pump/control".into(),
            telemetry_topic: "sensor/data".into(),
            keep_alive_s: 30,
            service_budget_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct LinkSettings {
    /// Serial device path, e.g. `/dev/ttyUSB0`.
    pub(crate) device: Option<String>,
    pub(crate) baud: u32,
    /// `host:port` of a sensor node listening on TCP (development bridge).
    pub(crate) tcp: Option<String>,
    pub(crate) read_window_ms: u64,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            device: None,
            baud: irrigation_link::LINK_BAUD,
            tcp: None,
            read_window_ms: irrigation_link::DEFAULT_READ_WINDOW.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct HandshakeSettings {
    pub(crate) retry_interval_s: u64,
    pub(crate) max_attempts: u32,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            retry_interval_s: DEFAULT_RETRY_INTERVAL.as_secs(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct WatchdogSettings {
    pub(crate) timeout_s: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self { timeout_s: 10 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct StorageSettings {
    /// Storage image file. Without one the stored address is not consulted.
    pub(crate) path: Option<String>,
    pub(crate) server_addr_offset: u64,
}

// ---------------------------------------------------------------------------
// Derived durations
// ---------------------------------------------------------------------------

impl Config {
    pub(crate) fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.gateway.loop_interval_ms)
    }

    pub(crate) fn service_budget(&self) -> Duration {
        Duration::from_millis(self.mqtt.service_budget_ms)
    }

    pub(crate) fn read_window(&self) -> Duration {
        Duration::from_millis(self.link.read_window_ms)
    }

    pub(crate) fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.handshake.retry_interval_s)
    }

    pub(crate) fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog.timeout_s)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub(crate) fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_gateway(&mut errors);
        self.validate_mqtt(&mut errors);
        self.validate_link(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_storage(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_gateway(&self, errors: &mut Vec<String>) {
        if self.gateway.device_id.trim().is_empty() {
            errors.push("gateway.device_id is empty".into());
        }
        if self.gateway.loop_interval_ms == 0 {
            errors.push("gateway.loop_interval_ms must be positive".into());
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;

        if let Some(host) = &m.host {
            if host.trim().is_empty() {
                errors.push("mqtt.host is set but empty".into());
            }
        }
        if m.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".into());
        }

        // ── Topics ──────────────────────────────────────────
        if m.control_topic.trim().is_empty() {
            errors.push("mqtt.control_topic is empty".into());
        }
        if m.telemetry_topic.trim().is_empty() {
            errors.push("mqtt.telemetry_topic is empty".into());
        } else if m.telemetry_topic.contains(['+', '#']) {
            errors.push(format!(
                "mqtt.telemetry_topic '{}' contains a wildcard; publish topics must be concrete",
                m.telemetry_topic
            ));
        }
        if m.control_topic == m.telemetry_topic {
            errors.push(format!(
                "mqtt.control_topic and mqtt.telemetry_topic are both '{}'",
                m.control_topic
            ));
        }

        // rumqttc rejects keep-alives under 5 s.
        if m.keep_alive_s < 5 {
            errors.push(format!(
                "mqtt.keep_alive_s must be at least 5, got {}",
                m.keep_alive_s
            ));
        }
        if m.service_budget_ms == 0 {
            errors.push("mqtt.service_budget_ms must be positive".into());
        }
    }

    fn validate_link(&self, errors: &mut Vec<String>) {
        let l = &self.link;

        if l.device.is_some() && l.tcp.is_some() {
            errors.push("link.device and link.tcp are mutually exclusive".into());
        }
        if let Some(device) = &l.device {
            if device.trim().is_empty() {
                errors.push("link.device is set but empty".into());
            }
        }
        if let Some(tcp) = &l.tcp {
            if !tcp.contains(':') {
                errors.push(format!("link.tcp '{tcp}' must be host:port"));
            }
        }
        if l.baud == 0 {
            errors.push("link.baud must be positive".into());
        }
        if l.read_window_ms == 0 {
            errors.push("link.read_window_ms must be positive".into());
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        if self.handshake.retry_interval_s == 0 {
            errors.push("handshake.retry_interval_s must be positive".into());
        }
        if self.handshake.max_attempts == 0 {
            errors.push("handshake.max_attempts must be at least 1".into());
        }

        // One iteration blocks for at most the broker budget plus the link
        // drain (no new read after one window, and a read lasts at most one
        // window), then sleeps the loop interval.
        let worst_case = self.read_window() * 2 + self.service_budget() + self.loop_interval();
        if self.watchdog_timeout() <= worst_case {
            errors.push(format!(
                "watchdog.timeout_s ({}s) must exceed two read windows + broker budget + loop interval ({}ms)",
                self.watchdog.timeout_s,
                worst_case.as_millis()
            ));
        }
    }

    fn validate_storage(&self, errors: &mut Vec<String>) {
        if self.storage.server_addr_offset >= STORAGE_SIZE {
            errors.push(format!(
                "storage.server_addr_offset {} outside {STORAGE_SIZE}-byte storage",
                self.storage.server_addr_offset
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Apply `MQTT_HOST`, `MQTT_PORT`, `DEVICE_ID`, `LINK_DEVICE` and
    /// `LINK_TCP`. Setting one link variable clears the other link kind.
    pub(crate) fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt.host = Some(host);
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.mqtt.port = port
                .parse()
                .with_context(|| format!("MQTT_PORT '{port}' is not a valid port"))?;
        }
        if let Some(id) = lookup("DEVICE_ID") {
            self.gateway.device_id = id;
        }
        if let Some(device) = lookup("LINK_DEVICE") {
            self.link.device = Some(device);
            self.link.tcp = None;
        }
        if let Some(tcp) = lookup("LINK_TCP") {
            self.link.tcp = Some(tcp);
            self.link.device = None;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file. A missing file yields the defaults.
pub(crate) fn load_file(path: &str) -> Result<Config> {
    let contents = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path, "no config file, using defaults");
            return Ok(Config::default());
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read config: {path}")),
    };
    toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))
}

/// Read the config file, apply environment overrides, and validate.
pub(crate) fn load(path: &str) -> Result<Config> {
    let mut config = load_file(path)?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Broker host
// ---------------------------------------------------------------------------

/// Reduce a stored server address to a bare host. The provisioning portal
/// stores it as a URL (`http://192.168.1.10:3000`); only the host part is
/// used for the broker.
pub(crate) fn host_from_address(addr: &str) -> Option<String> {
    let addr = addr.trim();
    let rest = addr.split_once("://").map_or(addr, |(_, rest)| rest);
    let authority = rest.split('/').next().unwrap_or(rest);

    let host = if let Some(bracketed) = authority.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or(bracketed)
    } else {
        authority.rsplit_once(':').map_or(authority, |(h, _)| h)
    };

    (!host.is_empty()).then(|| host.to_string())
}

/// Configured host first, then the stored address. `None` from both is a
/// provisioning failure.
pub(crate) fn resolve_broker_host(configured: Option<&str>, stored: Option<&str>) -> Result<String> {
    if let Some(host) = configured {
        return Ok(host.trim().to_string());
    }
    match stored.and_then(host_from_address) {
        Some(host) => Ok(host),
        None => bail!(
            "no broker address: set mqtt.host, MQTT_HOST, or provision a server address in storage"
        ),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
