//! Configuration loader for the `plantbox-ingest` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). Configuration is read once at startup; nothing
//! re-reads it afterwards.
//!
use std::env;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono_tz::Tz;
use uuid::Uuid;

use crate::broker::{Backoff, ManagerSettings, MqttSettings, TransportVariant};
use crate::store::DEFAULT_MAX_RECORDS;

/// Parse an optional numeric variable with a default value.
macro_rules! parse_env {
    ($lookup:expr, $var_name:expr, $ty:ty, $default:expr) => {
        $lookup($var_name)
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string variable.
macro_rules! require_env {
    ($lookup:expr, $var_name:expr) => {
        $lookup($var_name)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

pub const DEFAULT_BROKER: &str = "nam1.cloud.thethings.network";

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// Application id on the network server. Also the MQTT username.
    pub app_id: String,

    /// API key used as the MQTT password.
    pub api_key: String,

    /// Broker host for the raw socket transport.
    pub broker_host: String,

    /// Broker port for the raw socket transport.
    pub broker_port: u16,

    /// Full URL for the websocket transport.
    pub broker_ws_url: String,

    /// Uplink topic pattern.
    pub topic: String,

    pub client_id: String,

    pub keep_alive: Duration,

    /// Time allowed for CONNACK + SUBACK.
    pub connect_timeout: Duration,

    pub retry_interval: Duration,

    pub retry_max: Duration,

    /// Record store capacity.
    pub max_records: usize,

    /// Whether the connection manager may touch the network at all.
    pub ingest_enabled: bool,

    /// Zone used for formatted timestamps.
    pub display_tz: Tz,

    pub http_port: u16,
}

/// Load configuration from environment variables with defaults.
///
/// Required when ingestion is enabled:
/// - `TTN_APP_ID` – application id (MQTT username)
/// - `TTN_API_KEY` – API key (MQTT password)
///
/// Optional:
/// - `MQTT_BROKER` (default: `nam1.cloud.thethings.network`), `MQTT_PORT` (1883)
/// - `MQTT_WS_URL` (default: `ws://<broker>:80/mqtt`)
/// - `MQTT_TOPIC` (default: `v3/<app id>/devices/+/up`)
/// - `MQTT_CLIENT_ID` (default: `plantbox-<uuid>`), `MQTT_KEEP_ALIVE_SECS` (60)
/// - `CONNECT_TIMEOUT_SECS` (10), `RETRY_INTERVAL_SECS` (10), `RETRY_MAX_SECS` (interval)
/// - `MAX_RECORDS` (100), `INGEST_ENABLED` (true), `DISPLAY_TZ` (`US/Eastern`)
/// - `HTTP_PORT` (8080)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    load_from(|name| env::var(name).ok())
}

/// Same as [`load_from_env`] but reads variables through `lookup`.
pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
    // ---
    let ingest_enabled = match lookup("INGEST_ENABLED") {
        Some(v) => parse_flag(&v).ok_or_else(|| anyhow!("Invalid INGEST_ENABLED: {}", v))?,
        None => true,
    };

    let (app_id, api_key) = if ingest_enabled {
        (
            require_env!(lookup, "TTN_APP_ID"),
            require_env!(lookup, "TTN_API_KEY"),
        )
    } else {
        (
            lookup("TTN_APP_ID").unwrap_or_default(),
            lookup("TTN_API_KEY").unwrap_or_default(),
        )
    };

    let broker_host = lookup("MQTT_BROKER").unwrap_or_else(|| DEFAULT_BROKER.to_string());
    let broker_port = parse_env!(lookup, "MQTT_PORT", u16, 1883);
    let broker_ws_url =
        lookup("MQTT_WS_URL").unwrap_or_else(|| format!("ws://{}:80/mqtt", broker_host));
    let topic = lookup("MQTT_TOPIC").unwrap_or_else(|| format!("v3/{}/devices/+/up", app_id));
    let client_id =
        lookup("MQTT_CLIENT_ID").unwrap_or_else(|| format!("plantbox-{}", Uuid::new_v4()));

    let keep_alive = parse_env!(lookup, "MQTT_KEEP_ALIVE_SECS", u64, 60);
    let connect_timeout = parse_env!(lookup, "CONNECT_TIMEOUT_SECS", u64, 10);
    let retry_interval = parse_env!(lookup, "RETRY_INTERVAL_SECS", u64, 10);
    let retry_max = parse_env!(lookup, "RETRY_MAX_SECS", u64, retry_interval);
    let max_records = parse_env!(lookup, "MAX_RECORDS", usize, DEFAULT_MAX_RECORDS);
    let http_port = parse_env!(lookup, "HTTP_PORT", u16, 8080);

    let tz_name = lookup("DISPLAY_TZ").unwrap_or_else(|| "US/Eastern".to_string());
    let display_tz: Tz = tz_name
        .parse()
        .map_err(|e| anyhow!("Invalid DISPLAY_TZ {}: {}", tz_name, e))?;

    if max_records == 0 {
        bail!("Invalid MAX_RECORDS: must be at least 1");
    }
    if connect_timeout == 0 {
        bail!("Invalid CONNECT_TIMEOUT_SECS: must be at least 1");
    }
    if keep_alive < 5 {
        bail!("Invalid MQTT_KEEP_ALIVE_SECS: must be at least 5");
    }
    if client_id.trim().is_empty() || client_id.starts_with(' ') {
        bail!("Invalid MQTT_CLIENT_ID: {:?}", client_id);
    }
    if !broker_ws_url.starts_with("ws://") {
        bail!("Invalid MQTT_WS_URL: {} (expected ws://...)", broker_ws_url);
    }

    Ok(Config {
        app_id,
        api_key,
        broker_host,
        broker_port,
        broker_ws_url,
        topic,
        client_id,
        keep_alive: Duration::from_secs(keep_alive),
        connect_timeout: Duration::from_secs(connect_timeout),
        retry_interval: Duration::from_secs(retry_interval),
        retry_max: Duration::from_secs(retry_max),
        max_records,
        ingest_enabled,
        display_tz,
        http_port,
    })
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Both halves of the broker credential pair are present.
    pub fn has_credentials(&self) -> bool {
        !self.app_id.trim().is_empty() && !self.api_key.trim().is_empty()
    }

    /// Connection settings for the MQTT transport.
    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.broker_host.clone(),
            port: self.broker_port,
            ws_url: self.broker_ws_url.clone(),
            username: self.app_id.clone(),
            password: self.api_key.clone(),
            client_id: self.client_id.clone(),
            keep_alive: self.keep_alive,
        }
    }

    /// Control-loop settings for the connection manager.
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            topic: self.topic.clone(),
            connect_timeout: self.connect_timeout,
            backoff: if self.retry_max > self.retry_interval {
                Backoff::new(self.retry_interval, self.retry_max)
            } else {
                Backoff::fixed(self.retry_interval)
            },
            initial_transport: TransportVariant::Tcp,
        }
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks the API key while showing all other values that were loaded.
    pub fn log_config(&self) {
        // ---
        let masked_key = match self.api_key.len() {
            0 => "<unset>".to_string(),
            n if n <= 8 => "****".to_string(),
            _ => format!("{}****", self.api_key.chars().take(6).collect::<String>()),
        };

        tracing::info!("Configuration loaded:");
        tracing::info!("  TTN_APP_ID      : {}", self.app_id);
        tracing::info!("  TTN_API_KEY     : {}", masked_key);
        tracing::info!("  MQTT_BROKER     : {}:{}", self.broker_host, self.broker_port);
        tracing::info!("  MQTT_WS_URL     : {}", self.broker_ws_url);
        tracing::info!("  MQTT_TOPIC      : {}", self.topic);
        tracing::info!("  MQTT_CLIENT_ID  : {}", self.client_id);
        tracing::info!("  CONNECT_TIMEOUT : {:?}", self.connect_timeout);
        tracing::info!("  RETRY           : {:?}..{:?}", self.retry_interval, self.retry_max);
        tracing::info!("  MAX_RECORDS     : {}", self.max_records);
        tracing::info!("  INGEST_ENABLED  : {}", self.ingest_enabled);
        tracing::info!("  DISPLAY_TZ      : {}", self.display_tz);
        tracing::info!("  HTTP_PORT       : {}", self.http_port);
    }
}
