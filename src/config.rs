use std::{fs::read_to_string, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;
use url::Url;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    ///
    /// websocket server listen
    ///
    /// The address and port the subscribers connect to, both ipv4 and ipv6
    /// are supported.
    ///
    #[serde(default = "Server::listen")]
    pub listen: SocketAddr,
    ///
    /// Maximum size in bytes of a message received from a subscriber, larger
    /// messages close the connection.
    ///
    #[serde(default = "Server::max_payload_size")]
    pub max_payload_size: usize,
    ///
    /// subscriber send queue
    ///
    /// Number of payloads that can wait to be written to one subscriber. A
    /// subscriber that lets its queue fill up is dropped.
    ///
    #[serde(default = "Server::send_queue_size")]
    pub send_queue_size: usize,
}

impl Server {
    fn listen() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], 3000))
    }

    fn max_payload_size() -> usize {
        100 * 1024
    }

    fn send_queue_size() -> usize {
        1024
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            max_payload_size: Self::max_payload_size(),
            send_queue_size: Self::send_queue_size(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Upstream {
    ///
    /// jetstream endpoint
    ///
    /// The subscribe endpoint of the Jetstream instance to read posts from.
    ///
    #[serde(default = "Upstream::endpoint")]
    pub endpoint: String,
    ///
    /// The record collection to subscribe to.
    ///
    #[serde(default = "Upstream::collection")]
    pub collection: String,
    ///
    /// Seconds to wait before reopening a lost upstream connection.
    ///
    #[serde(default = "Upstream::reconnect_delay")]
    pub reconnect_delay: u64,
}

impl Upstream {
    fn endpoint() -> String {
        "wss://jetstream2.us-west.bsky.network/subscribe".to_string()
    }

    fn collection() -> String {
        "app.bsky.feed.post".to_string()
    }

    fn reconnect_delay() -> u64 {
        5
    }

    /// The endpoint with the collection filter appended to its query.
    pub fn url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint)?;
        url.query_pairs_mut()
            .append_pair("wantedCollections", &self.collection);

        Ok(url)
    }

    pub fn get_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay)
    }
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            endpoint: Self::endpoint(),
            collection: Self::collection(),
            reconnect_delay: Self::reconnect_delay(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Runtime {
    ///
    /// Maximum number of threads the relay can use.
    ///
    #[serde(default = "Runtime::max_threads")]
    pub max_threads: usize,
}

impl Runtime {
    fn max_threads() -> usize {
        num_cpus::get()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            max_threads: Self::max_threads(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
    ///
    /// Seconds between two statistics lines, `0` turns them off.
    ///
    #[serde(default = "Log::stats_interval")]
    pub stats_interval: u64,
}

impl Log {
    fn stats_interval() -> u64 {
        60
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            stats_interval: Self::stats_interval(),
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub upstream: Upstream,
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: emoji-relay --config /etc/emoji-relay/config.json5
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// If the configuration file path is specified, the configuration is read
    /// from the configuration file, otherwise the default configuration is
    /// used.
    ///
    pub fn load() -> Result<Self> {
        Ok(match Cli::parse().config {
            Some(path) => Self::from_str(&read_to_string(path)?)?,
            None => Self::default(),
        })
    }
}

impl FromStr for Config {
    type Err = serde_json5::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        serde_json5::from_str(value)
    }
}
