use std::collections::HashMap;
use std::str::FromStr;

use envconfig::Envconfig;
use telemetry_common::config::{EnvMsDuration, KafkaConfig};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3300")]
    pub port: u16,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "1048576")]
    pub max_body_bytes: usize,

    #[envconfig(default = "text")]
    pub log_format: String,

    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "telemetry-ingress")]
    pub otel_service_name: String,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub rate_limit: RateLimitConfig,

    #[envconfig(nested = true)]
    pub mqtt: MqttConfig,

    #[envconfig(nested = true)]
    pub device_auth: DeviceAuthConfig,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct RateLimitConfig {
    #[envconfig(default = "100")]
    pub rate_limit_per_window: u32,

    #[envconfig(default = "60")]
    pub rate_limit_window_secs: u64,

    // Comma separated device_type=limit pairs, eg. "thermostat=10,camera=500"
    #[envconfig(default = "")]
    pub rate_limit_device_type_overrides: DeviceTypeOverrides,

    #[envconfig(default = "600")]
    pub rate_limit_idle_eviction_secs: u64,
}

#[derive(Envconfig, Clone)]
pub struct MqttConfig {
    #[envconfig(default = "true")]
    pub mqtt_enabled: bool,

    #[envconfig(default = "localhost")]
    pub mqtt_host: String,

    #[envconfig(default = "1883")]
    pub mqtt_port: u16,

    #[envconfig(default = "telemetry-ingress")]
    pub mqtt_client_id: String,

    #[envconfig(default = "")]
    pub mqtt_topic_prefix: String,

    pub mqtt_username: Option<String>,

    pub mqtt_password: Option<String>,

    #[envconfig(default = "30")]
    pub mqtt_keep_alive_secs: u64,

    #[envconfig(default = "1000")]
    pub mqtt_reconnect_backoff_ms: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct DeviceAuthConfig {
    #[envconfig(default = "false")]
    pub device_auth_enabled: bool,

    #[envconfig(default = "http://localhost:8020")]
    pub device_auth_url: String,

    #[envconfig(default = "500")]
    pub device_auth_timeout_ms: EnvMsDuration,

    #[envconfig(default = "60")]
    pub device_auth_cache_ttl_secs: u64,
}

/// Per-device-type admission limits, overriding the global one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceTypeOverrides(pub HashMap<String, u32>);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseOverridesError(pub String);

impl FromStr for DeviceTypeOverrides {
    type Err = ParseOverridesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut overrides = HashMap::new();
        for pair in s.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
            let (device_type, limit) = pair
                .split_once('=')
                .ok_or_else(|| ParseOverridesError(pair.to_owned()))?;
            let limit = limit
                .trim()
                .parse::<u32>()
                .map_err(|_| ParseOverridesError(pair.to_owned()))?;
            overrides.insert(device_type.trim().to_owned(), limit);
        }
        Ok(DeviceTypeOverrides(overrides))
    }
}
