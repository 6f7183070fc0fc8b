use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::{
    ConfigError, DEFAULT_EVENT_CAPACITY, DEFAULT_FANOUT_CONCURRENCY, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_WRITE_BUFFER_SIZE, HubConfig, ServerConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting WebSocket connections.
    Serve(ServeArgs),
    /// Connect to a relay and exchange lines over stdin/stdout.
    Connect(ConnectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, env = "RELAY_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Path of the upgrade endpoint.
    #[arg(long, env = "RELAY_PATH", default_value = "/ws")]
    pub path: String,

    /// Seconds to wait for a pong before dropping a peer.
    #[arg(long, env = "RELAY_PONG_WAIT_SECS", default_value_t = 60)]
    pub pong_wait_secs: u64,

    /// Milliseconds between pings. Defaults to 9/10 of the pong wait.
    #[arg(long, env = "RELAY_PING_PERIOD_MS")]
    pub ping_period_ms: Option<u64>,

    /// Seconds allowed for a ping or close frame write.
    #[arg(long, env = "RELAY_WRITE_WAIT_SECS", default_value_t = 10)]
    pub write_wait_secs: u64,

    /// Seconds allowed for delivering one broadcast to one peer.
    #[arg(long, env = "RELAY_SEND_TIMEOUT_SECS", default_value_t = 5)]
    pub send_timeout_secs: u64,

    /// Largest accepted message, in bytes.
    #[arg(long, env = "RELAY_MAX_MESSAGE_SIZE", default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,

    #[arg(long, env = "RELAY_WRITE_BUFFER_SIZE", default_value_t = DEFAULT_WRITE_BUFFER_SIZE)]
    pub write_buffer_size: usize,

    /// Events the hub buffers before readers have to wait.
    #[arg(long, env = "RELAY_EVENT_CAPACITY", default_value_t = DEFAULT_EVENT_CAPACITY)]
    pub event_capacity: usize,

    /// Concurrent sends per broadcast; 0 for no limit.
    #[arg(long, env = "RELAY_FANOUT_CONCURRENCY", default_value_t = DEFAULT_FANOUT_CONCURRENCY)]
    pub fanout_concurrency: usize,

    /// Seconds allowed for answering an HTTP request.
    #[arg(long, env = "RELAY_REQUEST_TIMEOUT_SECS", default_value_t = 1)]
    pub request_timeout_secs: u64,

    /// Seconds to wait for connections to drain on shutdown.
    #[arg(long, env = "RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    pub shutdown_grace_secs: u64,
}

impl ServeArgs {
    pub fn hub_config(&self) -> Result<HubConfig, ConfigError> {
        let pong_wait = Duration::from_secs(self.pong_wait_secs);
        let mut config = HubConfig::with_pong_wait(pong_wait);
        if let Some(ping_period_ms) = self.ping_period_ms {
            config.ping_period = Duration::from_millis(ping_period_ms);
        }
        config.write_wait = Duration::from_secs(self.write_wait_secs);
        config.send_timeout = Duration::from_secs(self.send_timeout_secs);
        config.max_message_size = self.max_message_size;
        config.write_buffer_size = self.write_buffer_size;
        config.event_capacity = self.event_capacity;
        config.fanout_concurrency = self.fanout_concurrency;
        config.validate()?;
        Ok(config)
    }

    pub fn server_config(&self) -> Result<ServerConfig, ConfigError> {
        let config = ServerConfig {
            listen: self.listen,
            path: self.path.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// WebSocket URL of the relay endpoint.
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults_match_config_defaults() {
        let cli = Cli::try_parse_from(["websocket-relay", "serve"]).expect("parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve command");
        };

        let hub = args.hub_config().expect("hub config");
        assert_eq!(hub, HubConfig::default());

        let server = args.server_config().expect("server config");
        assert_eq!(server, ServerConfig::default());
    }

    #[test]
    fn explicit_ping_period_must_stay_below_pong_wait() {
        let cli = Cli::try_parse_from([
            "websocket-relay",
            "serve",
            "--pong-wait-secs",
            "5",
            "--ping-period-ms",
            "5000",
        ])
        .expect("parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve command");
        };
        assert!(matches!(
            args.hub_config(),
            Err(ConfigError::PingPeriodTooLong { .. })
        ));
    }

    #[test]
    fn read_buffer_size_is_not_a_serve_option() {
        let parsed =
            Cli::try_parse_from(["websocket-relay", "serve", "--read-buffer-size", "4096"]);
        assert!(parsed.is_err());

        let cli = Cli::try_parse_from(["websocket-relay", "serve", "--write-buffer-size", "4096"])
            .expect("parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve command");
        };
        assert_eq!(args.hub_config().expect("hub config").write_buffer_size, 4096);
    }
}
