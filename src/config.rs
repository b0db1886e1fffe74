//! Server configuration
//!
//! Every field has a default, so an empty TOML file is a valid config.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::handler::DEFAULT_MAX_BODY_SIZE;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Readiness events fetched per poll
    pub epoll_size: usize,
    /// Number of worker threads
    pub thread_count: u16,
    /// Connections one worker may hold
    pub connection_pool_size: usize,
    /// Idle connections are offered to `on_timeout` after this long; 0 disables
    pub connection_timeout_seconds: u64,
    pub epoll_timeout_milliseconds: u64,
    /// Capacity of each worker's intake queue
    pub takeover_queue_size: usize,
    pub listen: Vec<SocketAddr>,
    /// Largest body the builtin handler accepts
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            epoll_size: 10000,
            thread_count: 1,
            connection_pool_size: 10000,
            connection_timeout_seconds: 10,
            epoll_timeout_milliseconds: 2000,
            takeover_queue_size: 100,
            listen: vec![SocketAddr::from(([0, 0, 0, 0], 9999))],
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_count == 0 {
            return Err(invalid("thread_count", "must be at least 1"));
        }
        if self.takeover_queue_size == 0 {
            return Err(invalid("takeover_queue_size", "must be at least 1"));
        }
        if self.epoll_size == 0 {
            return Err(invalid("epoll_size", "must be at least 1"));
        }
        if self.connection_pool_size == 0 {
            return Err(invalid("connection_pool_size", "must be at least 1"));
        }
        if self.listen.is_empty() {
            return Err(invalid("listen", "at least one address is required"));
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        match self.connection_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn epoll_timeout(&self) -> Duration {
        Duration::from_millis(self.epoll_timeout_milliseconds)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_owned(),
    }
}
