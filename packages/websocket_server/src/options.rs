//! Server options.

use std::{str::FromStr, time::Duration};

use thiserror::Error;

pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(10);
pub const DEFAULT_QUEUED_PING_LIMIT: usize = 3;
pub const DEFAULT_FRAME_SIZE_LIMIT: usize = 2 * 1024 * 1024;
pub const DEFAULT_MESSAGE_SIZE_LIMIT: usize = 10 * 1024 * 1024;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("Heartbeat period must be greater than 0")]
    InvalidHeartbeatPeriod,
    #[error("Queued ping limit must be greater than 0")]
    InvalidQueuedPingLimit,
    #[error("Invalid value for {name}: {value:?}")]
    InvalidEnvValue { name: &'static str, value: String },
}

/// Tuning for websocket connections served by an [`Endpoint`](crate::Endpoint).
///
/// Options are immutable once built. Each `with_*` method returns a modified copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    heartbeat_enabled: bool,
    heartbeat_period: Duration,
    queued_ping_limit: usize,
    compression_enabled: bool,
    frame_size_limit: usize,
    message_size_limit: usize,
    shutdown_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            heartbeat_enabled: true,
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            queued_ping_limit: DEFAULT_QUEUED_PING_LIMIT,
            compression_enabled: true,
            frame_size_limit: DEFAULT_FRAME_SIZE_LIMIT,
            message_size_limit: DEFAULT_MESSAGE_SIZE_LIMIT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

fn parse_env<T: FromStr>(name: &'static str, value: &str) -> Result<T, OptionsError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| OptionsError::InvalidEnvValue {
            name,
            value: value.to_string(),
        })
}

fn parse_env_bool(name: &'static str, value: &str) -> Result<bool, OptionsError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(OptionsError::InvalidEnvValue {
            name,
            value: value.to_string(),
        }),
    }
}

impl ServerOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads overrides for the defaults from the process environment.
    ///
    /// # Errors
    ///
    /// * If a variable is set to a value that does not parse
    /// * If a variable is set to a value rejected by the matching `with_*` method
    pub fn from_env() -> Result<Self, OptionsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads overrides for the defaults through `lookup`.
    ///
    /// Recognised variables: `WS_HEARTBEAT_ENABLED`, `WS_HEARTBEAT_PERIOD_SECS`,
    /// `WS_QUEUED_PING_LIMIT`, `WS_COMPRESSION_ENABLED`, `WS_FRAME_SIZE_LIMIT`,
    /// `WS_MESSAGE_SIZE_LIMIT` and `WS_SHUTDOWN_TIMEOUT_MS`.
    ///
    /// # Errors
    ///
    /// * If a variable is set to a value that does not parse
    /// * If a variable is set to a value rejected by the matching `with_*` method
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, OptionsError> {
        let mut options = Self::default();

        if let Some(value) = lookup("WS_HEARTBEAT_ENABLED") {
            options =
                options.with_heartbeat_enabled(parse_env_bool("WS_HEARTBEAT_ENABLED", &value)?);
        }
        if let Some(value) = lookup("WS_HEARTBEAT_PERIOD_SECS") {
            let secs = parse_env::<u64>("WS_HEARTBEAT_PERIOD_SECS", &value)?;
            options = options.with_heartbeat_period(Duration::from_secs(secs))?;
        }
        if let Some(value) = lookup("WS_QUEUED_PING_LIMIT") {
            options =
                options.with_queued_ping_limit(parse_env("WS_QUEUED_PING_LIMIT", &value)?)?;
        }
        if let Some(value) = lookup("WS_COMPRESSION_ENABLED") {
            options = options
                .with_compression_enabled(parse_env_bool("WS_COMPRESSION_ENABLED", &value)?);
        }
        if let Some(value) = lookup("WS_FRAME_SIZE_LIMIT") {
            options = options.with_frame_size_limit(parse_env("WS_FRAME_SIZE_LIMIT", &value)?);
        }
        if let Some(value) = lookup("WS_MESSAGE_SIZE_LIMIT") {
            options =
                options.with_message_size_limit(parse_env("WS_MESSAGE_SIZE_LIMIT", &value)?);
        }
        if let Some(value) = lookup("WS_SHUTDOWN_TIMEOUT_MS") {
            let millis = parse_env::<u64>("WS_SHUTDOWN_TIMEOUT_MS", &value)?;
            options = options.with_shutdown_timeout(Duration::from_millis(millis));
        }

        log::trace!("from_lookup: {options:?}");

        Ok(options)
    }

    #[must_use]
    pub const fn heartbeat_enabled(&self) -> bool {
        self.heartbeat_enabled
    }

    #[must_use]
    pub const fn with_heartbeat_enabled(mut self, enabled: bool) -> Self {
        self.heartbeat_enabled = enabled;
        self
    }

    #[must_use]
    pub const fn heartbeat_period(&self) -> Duration {
        self.heartbeat_period
    }

    /// # Errors
    ///
    /// * [`OptionsError::InvalidHeartbeatPeriod`] if `period` is zero
    pub const fn with_heartbeat_period(mut self, period: Duration) -> Result<Self, OptionsError> {
        if period.is_zero() {
            return Err(OptionsError::InvalidHeartbeatPeriod);
        }
        self.heartbeat_period = period;
        Ok(self)
    }

    /// Number of unanswered pings after which a connection is closed.
    #[must_use]
    pub const fn queued_ping_limit(&self) -> usize {
        self.queued_ping_limit
    }

    /// # Errors
    ///
    /// * [`OptionsError::InvalidQueuedPingLimit`] if `limit` is zero
    pub const fn with_queued_ping_limit(mut self, limit: usize) -> Result<Self, OptionsError> {
        if limit == 0 {
            return Err(OptionsError::InvalidQueuedPingLimit);
        }
        self.queued_ping_limit = limit;
        Ok(self)
    }

    #[must_use]
    pub const fn compression_enabled(&self) -> bool {
        self.compression_enabled
    }

    #[must_use]
    pub const fn with_compression_enabled(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    #[must_use]
    pub const fn frame_size_limit(&self) -> usize {
        self.frame_size_limit
    }

    #[must_use]
    pub const fn with_frame_size_limit(mut self, limit: usize) -> Self {
        self.frame_size_limit = limit;
        self
    }

    #[must_use]
    pub const fn message_size_limit(&self) -> usize {
        self.message_size_limit
    }

    #[must_use]
    pub const fn with_message_size_limit(mut self, limit: usize) -> Self {
        self.message_size_limit = limit;
        self
    }

    /// How long shutdown waits for connections to close before forgetting them.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}
