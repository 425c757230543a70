//! Runtime configuration.
//!
//! Everything is read from the environment with a default for each value, so a session can be
//! started without any configuration at all. Invalid values are rejected rather than silently
//! replaced by the default.
use std::time::Duration;

use derive_more::{Display, Error};

pub const HOST_VAR: &str = "MERCURIUS_HOST";
pub const MIN_PORT_VAR: &str = "MERCURIUS_MIN_PORT";
pub const MAX_PORT_VAR: &str = "MERCURIUS_MAX_PORT";
pub const POLL_TIMEOUT_VAR: &str = "MERCURIUS_POLL_TIMEOUT_MS";
pub const REQUEST_TIMEOUT_VAR: &str = "MERCURIUS_REQUEST_TIMEOUT_MS";
pub const DATABASE_URL_VAR: &str = "MERCURIUS_DATABASE_URL";

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("{key} has invalid value {value}")]
    Invalid { key: String, value: String },
    #[display("port range {min}-{max} is empty")]
    EmptyPortRange { min: u16, max: u16 },
}

/// Inclusive range of ports scanned when a listening socket asks for port zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortRange {
    min: u16,
    max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Result<Self, ConfigError> {
        if min == 0 || min > max {
            return Err(ConfigError::EmptyPortRange { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> u16 {
        self.min
    }

    pub fn max(&self) -> u16 {
        self.max
    }

    pub fn len(&self) -> usize {
        usize::from(self.max - self.min) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.min..=self.max
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 40_000,
            max: 40_999,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port_range: PortRange,
    /// How long the control loop blocks on a receive before checking for a stop signal.
    pub poll_timeout: Duration,
    /// Per-request receive timeout for calls to workers. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Handed to workers on `configure_execution` so they can bootstrap their own storage.
    pub database_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port_range: PortRange::default(),
            poll_timeout: Duration::from_millis(500),
            request_timeout: Some(Duration::from_secs(30)),
            database_url: "postgres://localhost:5432/mercurius".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup, `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Config::default();

        let host = lookup(HOST_VAR).unwrap_or(default.host);
        let min = parse_var(&lookup, MIN_PORT_VAR)?.unwrap_or(default.port_range.min);
        let max = parse_var(&lookup, MAX_PORT_VAR)?.unwrap_or(default.port_range.max);
        let port_range = PortRange::new(min, max)?;

        let poll_timeout = parse_var::<u64, _>(&lookup, POLL_TIMEOUT_VAR)?
            .map(Duration::from_millis)
            .unwrap_or(default.poll_timeout);

        //Zero disables the timeout
        let request_timeout = match parse_var::<u64, _>(&lookup, REQUEST_TIMEOUT_VAR)? {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => default.request_timeout,
        };

        let database_url = lookup(DATABASE_URL_VAR).unwrap_or(default.database_url);

        Ok(Self {
            host,
            port_range,
            poll_timeout,
            request_timeout,
            database_url,
        })
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value,
            }),
        None => Ok(None),
    }
}
