use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::connection::ConnectionSettings;
use crate::error::ConfigError;
use crate::hub::HubConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    pub outbound_capacity: usize,
    pub hub_capacity: usize,
    pub ping_interval: Duration,
    pub pong_wait: Duration,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
    pub sweep_interval: Duration,
    pub ended_retention: Duration,
}

impl Config {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick up `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let jwt_secret = lookup("JWT_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("JWT_SECRET"))?;

        let config = Self {
            bind_addr: parse_or(&lookup, "RELAY_BIND", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            jwt_secret,
            outbound_capacity: positive(parse_or(&lookup, "RELAY_OUTBOUND_CAPACITY", 256)?, "RELAY_OUTBOUND_CAPACITY")?,
            hub_capacity: positive(parse_or(&lookup, "RELAY_HUB_CAPACITY", 1024)?, "RELAY_HUB_CAPACITY")?,
            ping_interval: secs(&lookup, "RELAY_PING_INTERVAL_SECS", 54)?,
            pong_wait: secs(&lookup, "RELAY_PONG_WAIT_SECS", 60)?,
            write_timeout: secs(&lookup, "RELAY_WRITE_TIMEOUT_SECS", 10)?,
            max_frame_bytes: positive(parse_or(&lookup, "RELAY_MAX_FRAME_BYTES", 64 * 1024)?, "RELAY_MAX_FRAME_BYTES")?,
            sweep_interval: secs(&lookup, "RELAY_SWEEP_INTERVAL_SECS", 60)?,
            ended_retention: Duration::from_secs(parse_or(&lookup, "RELAY_ENDED_RETENTION_SECS", 300)?),
        };

        if config.ping_interval >= config.pong_wait {
            return Err(ConfigError::KeepaliveOrder);
        }
        Ok(config)
    }

    pub fn hub(&self) -> HubConfig {
        HubConfig {
            command_capacity: self.hub_capacity,
            sweep_interval: self.sweep_interval,
            ended_retention: self.ended_retention,
        }
    }

    pub fn connection(&self) -> ConnectionSettings {
        ConnectionSettings {
            outbound_capacity: self.outbound_capacity,
            ping_interval: self.ping_interval,
            pong_wait: self.pong_wait,
            write_timeout: self.write_timeout,
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let value = positive(parse_or(lookup, key, default)?, key)?;
    Ok(Duration::from_secs(value))
}

fn positive<T: PartialEq + Default + ToString>(value: T, key: &'static str) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::Invalid { key, value: value.to_string() });
    }
    Ok(value)
}
