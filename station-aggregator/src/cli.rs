use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{
    AggregatorConfig, DEFAULT_DATA_DIR, DEFAULT_PORT, ProducerConfig, QueryConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the aggregation server. Type `shutdown` on stdin to stop it.
    Aggregator(AggregatorArgs),
    /// Publish a station source file and keep it alive with heartbeats.
    Producer(ProducerArgs),
    /// Fetch one station's reading, or the most recent one.
    Consumer(ConsumerArgs),
}

#[derive(Args, Debug, Clone)]
pub struct AggregatorArgs {
    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Interface to bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Directory holding one record file per station.
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Milliseconds between eviction sweeps.
    #[arg(long, default_value_t = 30_000)]
    pub sweep_interval_ms: u64,

    /// Milliseconds of silence after which a station is evicted.
    #[arg(long, default_value_t = 30_000)]
    pub inactivity_threshold_ms: u64,

    /// Maximum number of concurrently served connections.
    #[arg(long, default_value_t = crate::config::MAX_SESSIONS)]
    pub max_sessions: usize,
}

impl From<AggregatorArgs> for AggregatorConfig {
    fn from(args: AggregatorArgs) -> Self {
        Self {
            host: args.host,
            port: args.port,
            data_dir: args.data_dir,
            sweep_period: Duration::from_millis(args.sweep_interval_ms),
            inactivity_threshold: Duration::from_millis(args.inactivity_threshold_ms),
            max_sessions: args.max_sessions,
            ..AggregatorConfig::default()
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ProducerArgs {
    /// Aggregator address as <host>:<port>.
    pub server: String,

    /// Station source file of `key: value` lines.
    pub source: PathBuf,

    /// Milliseconds between source modification checks.
    #[arg(long, default_value_t = 5_000)]
    pub poll_interval_ms: u64,

    /// Milliseconds between heartbeats.
    #[arg(long, default_value_t = 10_000)]
    pub heartbeat_interval_ms: u64,
}

impl From<ProducerArgs> for ProducerConfig {
    fn from(args: ProducerArgs) -> Self {
        let mut config = ProducerConfig::new(args.server, args.source);
        config.poll_interval = Duration::from_millis(args.poll_interval_ms);
        config.heartbeat_interval = Duration::from_millis(args.heartbeat_interval_ms);
        config
    }
}

#[derive(Args, Debug, Clone)]
pub struct ConsumerArgs {
    /// Aggregator address as <host>:<port>.
    pub server: String,

    /// Station id to fetch. Omit for the most recently active station.
    pub station: Option<String>,
}

impl From<ConsumerArgs> for QueryConfig {
    fn from(args: ConsumerArgs) -> Self {
        QueryConfig::new(args.server, args.station)
    }
}
