//! Server configuration

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use fleetsync_shared::limits;
use thiserror::Error;

use crate::scheduler::{RouteConfig, MIN_CRUISE_SPEED_MPS};

pub const ENV_LISTEN: &str = "FLEETSYNC_LISTEN";
pub const ENV_DATABASE: &str = "FLEETSYNC_DATABASE";
pub const ENV_SIGNING_KEY: &str = "FLEETSYNC_SIGNING_KEY";
pub const ENV_KEY_ID: &str = "FLEETSYNC_KEY_ID";
pub const ENV_HANDSHAKE_TIMEOUT_MS: &str = "FLEETSYNC_HANDSHAKE_TIMEOUT_MS";
pub const ENV_OUTBOUND_QUEUE: &str = "FLEETSYNC_OUTBOUND_QUEUE";
pub const ENV_CRUISE_SPEED_MPS: &str = "FLEETSYNC_CRUISE_SPEED_MPS";
pub const ENV_SERVICE_MINUTES: &str = "FLEETSYNC_SERVICE_MINUTES";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var}={value:?} is not valid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Configuration for the channel server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address for channel connections
    pub listen_addr: String,
    /// SQLite database path; in-memory store when unset
    pub database: Option<PathBuf>,
    /// Base64 ed25519 seed used to sign and verify credentials
    pub signing_key: Option<String>,
    /// Key id stamped into issued credentials
    pub key_id: String,
    /// Time allowed for the Hello frame after accept
    pub handshake_timeout: Duration,
    /// Per-channel outbound queue depth
    pub outbound_queue: usize,
    pub route: RouteConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            database: None,
            signing_key: None,
            key_id: "primary".into(),
            handshake_timeout: Duration::from_millis(limits::HANDSHAKE_TIMEOUT_MS),
            outbound_queue: 256,
            route: RouteConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `FLEETSYNC_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(addr) = get(ENV_LISTEN) {
            config.listen_addr = addr;
        }
        config.database = get(ENV_DATABASE).map(PathBuf::from);
        config.signing_key = get(ENV_SIGNING_KEY);
        if let Some(key_id) = get(ENV_KEY_ID) {
            config.key_id = key_id;
        }
        if let Some(ms) = parse::<u64>(ENV_HANDSHAKE_TIMEOUT_MS, get(ENV_HANDSHAKE_TIMEOUT_MS))? {
            config.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(depth) = parse::<usize>(ENV_OUTBOUND_QUEUE, get(ENV_OUTBOUND_QUEUE))? {
            if depth == 0 {
                return Err(invalid(ENV_OUTBOUND_QUEUE, "0", "must be at least 1"));
            }
            config.outbound_queue = depth;
        }
        if let Some(speed) = parse::<f64>(ENV_CRUISE_SPEED_MPS, get(ENV_CRUISE_SPEED_MPS))? {
            if !speed.is_finite() || speed < MIN_CRUISE_SPEED_MPS {
                return Err(invalid(
                    ENV_CRUISE_SPEED_MPS,
                    &speed.to_string(),
                    &format!("must be at least {MIN_CRUISE_SPEED_MPS}"),
                ));
            }
            config.route.cruise_speed_mps = speed;
        }
        if let Some(minutes) = parse::<u32>(ENV_SERVICE_MINUTES, get(ENV_SERVICE_MINUTES))? {
            config.route.service_minutes = minutes;
        }

        Ok(config)
    }
}

fn parse<T>(var: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(var, &raw, &e.to_string())),
    }
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
