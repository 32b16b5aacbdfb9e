//! One-shot reads against the aggregator.

use std::io;

use tracing::debug;

use crate::clock::LogicalClock;
use crate::config::QueryConfig;
use crate::protocol::{MOST_RECENT, Request, Response};
use crate::transport::exchange;

/// Stateless GET client; the only state it keeps is its own clock.
pub struct QueryAgent {
    config: QueryConfig,
    clock: LogicalClock,
}

impl QueryAgent {
    pub fn new(config: QueryConfig) -> Self {
        Self {
            config,
            clock: LogicalClock::new(),
        }
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    /// The id sent on the wire; `MOST_RECENT` when none was configured.
    pub fn station(&self) -> &str {
        self.config.station.as_deref().unwrap_or(MOST_RECENT)
    }

    /// Fetches the configured station, retrying connection failures.
    pub async fn fetch(&self) -> io::Result<Response> {
        let server = self.config.server.as_str();
        let station = self.station();
        self.config
            .retry
            .run("query", |attempt| {
                let request = Request::Get {
                    clock: self.clock.tick(),
                    station: station.to_string(),
                };
                debug!(attempt, %station, "sending query");
                async move { exchange(server, &request).await }
            })
            .await
    }
}

/// Formats a response for the terminal: status line, then body if any.
pub fn render(response: &Response) -> String {
    match &response.body {
        Some(body) => format!("{}\n{body}", response.status),
        None => response.status.to_string(),
    }
}
