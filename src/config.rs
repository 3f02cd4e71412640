//! Configuration module for rako-mqttd
//!
//! Parses environment variables into a strongly-typed configuration struct.
//! Built once at startup and passed by reference afterwards.

use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::rako::{FadeEncoding, FadeRate, BRIDGE_PORT};

/// Main configuration struct containing all settings
#[derive(Debug, Clone)]
pub struct Config {
    /// Rako bridge settings
    pub rako: RakoConfig,
    /// MQTT broker configuration
    pub mqtt: MqttConfig,
    /// Enable verbose logging
    pub debug: bool,
}

/// Rako bridge configuration
#[derive(Debug, Clone)]
pub struct RakoConfig {
    /// Bridge address; `None` triggers broadcast discovery
    pub host: Option<IpAddr>,
    /// UDP/Telnet port of the bridge
    pub port: u16,
    /// Exported topology file; fetched from the bridge when absent
    pub topology_file: Option<PathBuf>,
    /// Fade rate used when a command has no transition
    pub default_fade: FadeRate,
    /// How transitions are written to the wire
    pub fade_encoding: FadeEncoding,
    /// How long to wait for a discovery reply
    pub discovery_timeout: Duration,
    /// Silence after which the bridge is reported offline (zero disables)
    pub liveness_window: Duration,
    /// Grace period for in-flight sends at shutdown
    pub shutdown_grace: Duration,
    /// Scene cache poll period (zero disables)
    pub scene_cache_interval: Duration,
}

/// MQTT-specific configuration
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker hostname/IP
    pub host: String,
    /// Broker TCP port
    pub port: u16,
    /// Username (empty = anonymous)
    pub user: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Prefix for MQTT client IDs
    pub client_id_prefix: String,
    /// Home Assistant discovery prefix
    pub discovery_prefix: String,
    /// TLS configuration
    pub tls: Option<TlsConfig>,
}

/// TLS configuration for MQTT
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// CA certificate file path
    pub ca_file: Option<PathBuf>,
    /// CA certificate directory path
    pub ca_path: Option<PathBuf>,
    /// Client certificate path
    pub cert_file: Option<PathBuf>,
    /// Private key path
    pub key_file: Option<PathBuf>,
    /// Skip certificate validation
    pub insecure: bool,
}

/// Configuration error type
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source
    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let mqtt_host = vars
            .string("MQTT_HOST")
            .ok_or(ConfigError::MissingRequired("MQTT_HOST"))?;

        let host = match vars.string("RAKO_BRIDGE_HOST") {
            Some(v) => Some(
                v.parse::<IpAddr>()
                    .map_err(|_| ConfigError::InvalidValue("RAKO_BRIDGE_HOST", v))?,
            ),
            None => None,
        };

        let default_fade = match vars.string("DEFAULT_FADE_RATE") {
            Some(v) => FadeRate::from_name(&v)
                .ok_or(ConfigError::InvalidValue("DEFAULT_FADE_RATE", v))?,
            None => FadeRate::Medium,
        };

        let fade_encoding = if vars.bool("RAKO_CONTINUOUS_FADE", false) {
            FadeEncoding::Seconds
        } else {
            FadeEncoding::Buckets
        };

        let tls = if vars.bool("MQTT_TLS", false) {
            Some(TlsConfig {
                ca_file: vars.string("MQTT_CAFILE").map(PathBuf::from),
                ca_path: vars.string("MQTT_CAPATH").map(PathBuf::from),
                cert_file: vars.string("MQTT_CERTFILE").map(PathBuf::from),
                key_file: vars.string("MQTT_KEYFILE").map(PathBuf::from),
                insecure: vars.bool("MQTT_TLS_INSECURE", false),
            })
        } else {
            None
        };

        Ok(Config {
            rako: RakoConfig {
                host,
                port: vars.parse("RAKO_PORT", BRIDGE_PORT)?,
                topology_file: vars.string("RAKO_TOPOLOGY_FILE").map(PathBuf::from),
                default_fade,
                fade_encoding,
                discovery_timeout: Duration::from_secs(vars.parse("DISCOVERY_TIMEOUT", 5)?),
                liveness_window: Duration::from_secs(vars.parse("LIVENESS_WINDOW", 900)?),
                shutdown_grace: Duration::from_secs(vars.parse("SHUTDOWN_GRACE", 3)?),
                scene_cache_interval: Duration::from_secs(
                    vars.parse("SCENE_CACHE_INTERVAL", 5)?,
                ),
            },
            mqtt: MqttConfig {
                host: mqtt_host,
                port: vars.parse("MQTT_PORT", 1883)?,
                user: vars.string("MQTT_USER"),
                password: vars.string("MQTT_PASSWORD"),
                client_id_prefix: vars
                    .string("MQTT_CLIENT_ID_PREFIX")
                    .unwrap_or_else(|| "rako".to_string()),
                discovery_prefix: vars
                    .string("HA_DISCOVERY_PREFIX")
                    .unwrap_or_else(|| "homeassistant".to_string()),
                tls,
            },
            debug: vars.bool("DEBUG", false),
        })
    }

    /// Generate a unique client ID for the MQTT connection
    pub fn client_id(&self) -> String {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        format!(
            "{}-{}-{}",
            self.mqtt.client_id_prefix,
            hostname,
            std::process::id()
        )
    }
}

/// Typed access to a variable source; empty values count as unset
struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str, default: bool) -> bool {
        self.string(name)
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(default)
    }

    fn parse<T: std::str::FromStr>(&self, name: &'static str, default: T) -> Result<T, ConfigError> {
        match self.string(name) {
            Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue(name, v)),
            None => Ok(default),
        }
    }
}
