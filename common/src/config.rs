use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Longest value the device keeps for any configuration string.
pub const MAX_CONFIG_VALUE_LEN: usize = 39;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_HTTP_PORT: u16 = 8080;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
    pub tick_ms: u32,
    pub mqtt_poll_ms: u32,
    pub web_poll_ms: u32,
    pub heartbeat_ms: u32,
    pub sunrise_step_ms: u32,
    pub max_tasks: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 10,
            mqtt_poll_ms: 250,
            web_poll_ms: 50,
            heartbeat_ms: 60_000,
            sunrise_step_ms: 100,
            max_tasks: 16,
        }
    }
}

impl TimerConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        for (value, default) in [
            (&mut self.tick_ms, defaults.tick_ms),
            (&mut self.mqtt_poll_ms, defaults.mqtt_poll_ms),
            (&mut self.web_poll_ms, defaults.web_poll_ms),
            (&mut self.heartbeat_ms, defaults.heartbeat_ms),
            (&mut self.sunrise_step_ms, defaults.sunrise_step_ms),
        ] {
            if *value == 0 {
                *value = default;
            }
        }
        self.tick_ms = self.tick_ms.min(1_000);
        self.max_tasks = self.max_tasks.clamp(4, 64);
    }
}

/// Persisted device configuration (`config.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub mqtt_server: String,
    /// Last LED command, replayed at boot.
    #[serde(default)]
    pub state: String,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default)]
    pub timers: TimerConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            mqtt_server: String::new(),
            state: String::new(),
            mqtt_port: DEFAULT_MQTT_PORT,
            http_port: DEFAULT_HTTP_PORT,
            timers: TimerConfig::default(),
        }
    }
}

fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

impl DeviceConfig {
    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_slice(raw).map_err(ConfigError::Parse)?;
        config.sanitize();
        Ok(config)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ConfigError> {
        serde_json::to_vec_pretty(self).map_err(ConfigError::Serialize)
    }

    pub fn sanitize(&mut self) {
        clip(&mut self.device_name);
        clip(&mut self.mqtt_server);
        clip(&mut self.state);
        if self.mqtt_port == 0 {
            self.mqtt_port = DEFAULT_MQTT_PORT;
        }
        if self.http_port == 0 {
            self.http_port = DEFAULT_HTTP_PORT;
        }
        self.timers.sanitize();
    }

    /// MQTT needs both a client name and a broker to talk to.
    pub fn is_mqtt_configured(&self) -> bool {
        !self.device_name.is_empty() && !self.mqtt_server.is_empty()
    }

    pub fn set_device_name(&mut self, name: &str) {
        self.device_name = clipped(name);
    }

    pub fn set_mqtt_server(&mut self, server: &str) {
        self.mqtt_server = clipped(server);
    }

    pub fn set_state(&mut self, state: &str) {
        self.state = clipped(state);
    }
}

/// Values collected during provisioning.
///
/// `apply` reports whether anything changed, and that flag is what decides
/// whether the caller persists the configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub device_name: Option<String>,
    pub mqtt_server: Option<String>,
    pub mqtt_port: Option<u16>,
    pub http_port: Option<u16>,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut DeviceConfig) -> bool {
        let before = config.clone();

        if let Some(name) = self.device_name.as_deref() {
            config.set_device_name(name.trim());
        }
        if let Some(server) = self.mqtt_server.as_deref() {
            config.set_mqtt_server(server.trim());
        }
        if let Some(port) = self.mqtt_port.filter(|port| *port != 0) {
            config.mqtt_port = port;
        }
        if let Some(port) = self.http_port.filter(|port| *port != 0) {
            config.http_port = port;
        }

        *config != before
    }
}

fn clipped(value: &str) -> String {
    let mut value = value.to_string();
    clip(&mut value);
    value
}

fn clip(value: &mut String) {
    if value.len() <= MAX_CONFIG_VALUE_LEN {
        return;
    }
    let mut end = MAX_CONFIG_VALUE_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value.truncate(end);
}
