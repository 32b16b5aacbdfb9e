//! Runtime configuration for the three process roles.
//!
//! Values normally come from the command line (see [`crate::cli`]); the
//! `Default` impls carry the reference timings.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 4567;
pub const DEFAULT_DATA_DIR: &str = "aggr_data";

pub const SWEEP_PERIOD: Duration = Duration::from_secs(30);
pub const INACTIVITY_THRESHOLD: Duration = Duration::from_secs(30);
pub const MAX_SESSIONS: usize = 256;
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(30);

pub const SOURCE_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const MAX_HEARTBEAT_FAILURES: u32 = 2;

pub const RETRY_ATTEMPTS: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub host: String,
    /// `0` binds an ephemeral port.
    pub port: u16,
    pub data_dir: PathBuf,
    pub sweep_period: Duration,
    /// Stations silent for longer than this are evicted on the next sweep.
    pub inactivity_threshold: Duration,
    /// Upper bound on concurrently running sessions.
    pub max_sessions: usize,
    pub session_timeout: Duration,
}

impl AggregatorConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            sweep_period: SWEEP_PERIOD,
            inactivity_threshold: INACTIVITY_THRESHOLD,
            max_sessions: MAX_SESSIONS,
            session_timeout: SESSION_TIMEOUT,
        }
    }
}

/// Fixed-delay retry bound for client connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: RETRY_ATTEMPTS,
            delay: RETRY_DELAY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Aggregator address as `host:port`.
    pub server: String,
    pub source: PathBuf,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub retry: RetryPolicy,
    /// Consecutive heartbeat failures after which the producer stops.
    pub max_heartbeat_failures: u32,
}

impl ProducerConfig {
    pub fn new(server: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            server: server.into(),
            source: source.into(),
            poll_interval: SOURCE_POLL_INTERVAL,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            retry: RetryPolicy::default(),
            max_heartbeat_failures: MAX_HEARTBEAT_FAILURES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub server: String,
    /// `None` asks for the most recently active station.
    pub station: Option<String>,
    pub retry: RetryPolicy,
}

impl QueryConfig {
    pub fn new(server: impl Into<String>, station: Option<String>) -> Self {
        Self {
            server: server.into(),
            station,
            retry: RetryPolicy::default(),
        }
    }
}
