use std::{net::SocketAddr, time::Duration};

use thiserror::Error;

/// Time allowed to read the next pong from a peer.
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);
/// Time allowed to write a single frame to a peer.
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);
/// Time allowed for one peer's share of a broadcast fan-out.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512;
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_EVENT_CAPACITY: usize = 64;
pub const DEFAULT_FANOUT_CONCURRENCY: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("ping period {ping_period:?} must be shorter than pong wait {pong_wait:?}")]
    PingPeriodTooLong {
        ping_period: Duration,
        pong_wait: Duration,
    },

    #[error("endpoint path '{0}' must start with '/'")]
    InvalidPath(String),
}

/// Keepalive, framing and fan-out settings shared by the hub and every
/// connection it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub write_wait: Duration,
    pub send_timeout: Duration,
    pub max_message_size: usize,
    pub write_buffer_size: usize,
    /// Capacity of the hub's event channel. Producers wait when it is full.
    pub event_capacity: usize,
    /// Upper bound on concurrent sends per broadcast; zero means unbounded.
    pub fanout_concurrency: usize,
}

impl HubConfig {
    /// Defaults with the given pong wait and a ping period of 9/10 of it.
    pub fn with_pong_wait(pong_wait: Duration) -> Self {
        Self {
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pong_wait.is_zero() {
            return Err(ConfigError::Zero("pong wait"));
        }
        if self.ping_period.is_zero() {
            return Err(ConfigError::Zero("ping period"));
        }
        if self.ping_period >= self.pong_wait {
            return Err(ConfigError::PingPeriodTooLong {
                ping_period: self.ping_period,
                pong_wait: self.pong_wait,
            });
        }
        if self.write_wait.is_zero() {
            return Err(ConfigError::Zero("write wait"));
        }
        if self.send_timeout.is_zero() {
            return Err(ConfigError::Zero("send timeout"));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::Zero("max message size"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Zero("event capacity"));
        }
        Ok(())
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            pong_wait: DEFAULT_PONG_WAIT,
            ping_period: DEFAULT_PONG_WAIT * 9 / 10,
            write_wait: DEFAULT_WRITE_WAIT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            fanout_concurrency: DEFAULT_FANOUT_CONCURRENCY,
        }
    }
}

/// Settings for the HTTP listener that hosts the upgrade endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub path: String,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.path.starts_with('/') {
            return Err(ConfigError::InvalidPath(self.path.clone()));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Zero("request timeout"));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            path: "/ws".to_string(),
            request_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ping_period_is_nine_tenths_of_pong_wait() {
        let config = HubConfig::default();
        assert_eq!(config.ping_period, Duration::from_secs(54));
        assert_eq!(config.validate(), Ok(()));

        let short = HubConfig::with_pong_wait(Duration::from_millis(100));
        assert_eq!(short.ping_period, Duration::from_millis(90));
    }

    #[test]
    fn rejects_ping_period_not_shorter_than_pong_wait() {
        let config = HubConfig {
            ping_period: Duration::from_secs(60),
            ..HubConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PingPeriodTooLong { .. })
        ));
    }

    #[test]
    fn rejects_zero_event_capacity() {
        let config = HubConfig {
            event_capacity: 0,
            ..HubConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("event capacity")));
    }

    #[test]
    fn server_path_must_be_absolute() {
        let config = ServerConfig {
            path: "ws".into(),
            ..ServerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidPath("ws".into()))
        );
        assert_eq!(ServerConfig::default().validate(), Ok(()));
    }
}
