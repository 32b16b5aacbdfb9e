//! Content producer.
//!
//! Publishes a station source file to the aggregator and then keeps it
//! alive with two background loops: one re-publishes when the file's
//! modification time changes, the other sends heartbeats. Both loops exit
//! once the producer stops, which happens on request, when a publish
//! exhausts its retries, or after too many consecutive heartbeat failures.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::select;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::clock::LogicalClock;
use crate::config::ProducerConfig;
use crate::payload;
use crate::protocol::{CONTENT_TYPE_JSON, Request, Response};
use crate::transport::exchange;

pub const USER_AGENT: &str = "ATOMClient/1/0";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to read source {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("source {0} has no station id")]
    MissingStationId(PathBuf),
    #[error("aggregator unreachable after {attempts} attempts: {source}")]
    Unreachable {
        attempts: u32,
        #[source]
        source: io::Error,
    },
}

pub struct Producer {
    config: ProducerConfig,
    clock: LogicalClock,
    last_modified: Mutex<Option<SystemTime>>,
    heartbeat_failures: AtomicU32,
    running: watch::Sender<bool>,
}

impl Producer {
    pub fn new(config: ProducerConfig) -> Arc<Self> {
        let (running, _) = watch::channel(true);
        Arc::new(Self {
            config,
            clock: LogicalClock::new(),
            last_modified: Mutex::new(None),
            heartbeat_failures: AtomicU32::new(0),
            running,
        })
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Asks both background loops to exit at their next wake-up.
    pub fn stop(&self) {
        if self.running.send_replace(false) {
            info!(source = %self.config.source.display(), "producer stopping");
        }
    }

    /// Resolves once the producer has stopped.
    pub async fn stopped(&self) {
        let mut running = self.running.subscribe();
        let _ = running.wait_for(|running| !*running).await;
    }

    /// Publishes an initial copy and then watches and heartbeats until stopped.
    pub async fn run(self: Arc<Self>) {
        info!(
            server = %self.config.server,
            source = %self.config.source.display(),
            "producer starting"
        );

        if let Err(err) = self.publish().await {
            error!(error = %err, "initial publish failed");
            self.stop();
            return;
        }

        let watcher = tokio::spawn(Arc::clone(&self).watch_source());
        let heartbeats = tokio::spawn(Arc::clone(&self).emit_heartbeats());
        let (watcher, heartbeats) = tokio::join!(watcher, heartbeats);
        for joined in [watcher, heartbeats] {
            if let Err(err) = joined {
                warn!(error = ?err, "producer task ended abnormally");
            }
        }
        info!("producer stopped");
    }

    /// Reads, flattens and sends the source, retrying connection failures.
    ///
    /// Exhausting the retry budget stops the producer.
    pub async fn publish(&self) -> Result<Response, PublishError> {
        let path = &self.config.source;
        let modified = source_modified(path).await;
        let body = payload::read_source(path)
            .await
            .map_err(|source| PublishError::Source {
                path: path.clone(),
                source,
            })?;
        *self.last_modified.lock() = modified;

        let station = payload::extract_id(&body)
            .ok_or_else(|| PublishError::MissingStationId(path.clone()))?
            .to_string();

        let headers = vec![
            ("User-Agent".to_string(), USER_AGENT.to_string()),
            ("Content-Type".to_string(), CONTENT_TYPE_JSON.to_string()),
            ("Content-Length".to_string(), body.len().to_string()),
        ];
        let server = self.config.server.as_str();
        let retry = self.config.retry;

        let outcome = retry
            .run("publish", |_| {
                let request = Request::Put {
                    clock: self.clock.tick(),
                    headers: headers.clone(),
                    payload: body.clone(),
                };
                async move { exchange(server, &request).await }
            })
            .await;

        match outcome {
            Ok(response) => {
                if response.status.is_success() {
                    info!(%station, status = %response.status, "published station reading");
                } else {
                    warn!(%station, status = %response.status, "aggregator rejected reading");
                }
                debug!(body = ?response.body, "publish response");
                Ok(response)
            }
            Err(source) => {
                error!(%station, attempts = retry.attempts, "publish failed, giving up");
                self.stop();
                Err(PublishError::Unreachable {
                    attempts: retry.attempts,
                    source,
                })
            }
        }
    }

    /// Sends a single heartbeat naming the source path.
    pub async fn heartbeat(&self) -> io::Result<Response> {
        let request = Request::Heartbeat {
            path: self.config.source.to_string_lossy().into_owned(),
        };
        exchange(&self.config.server, &request).await
    }

    async fn watch_source(self: Arc<Self>) {
        while self.pause(self.config.poll_interval).await {
            let modified = source_modified(&self.config.source).await;
            let published = *self.last_modified.lock();
            if modified.is_none() || modified == published {
                continue;
            }

            info!(source = %self.config.source.display(), "source changed, republishing");
            if let Err(err) = self.publish().await {
                warn!(error = %err, "republish failed");
            }
        }
        debug!("source watcher stopped");
    }

    async fn emit_heartbeats(self: Arc<Self>) {
        while self.pause(self.config.heartbeat_interval).await {
            let failure = match self.heartbeat().await {
                Ok(response) if response.status.is_success() => None,
                Ok(response) => Some(format!("aggregator answered {}", response.status)),
                Err(err) => Some(err.to_string()),
            };

            let Some(reason) = failure else {
                self.heartbeat_failures.store(0, Ordering::SeqCst);
                debug!("heartbeat acknowledged");
                continue;
            };

            let failures = self.heartbeat_failures.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(failures, %reason, "heartbeat failed");
            if failures >= self.config.max_heartbeat_failures {
                error!(failures, "too many consecutive heartbeat failures");
                self.stop();
            }
        }
        debug!("heartbeat emitter stopped");
    }

    /// Sleeps for `period` unless stopped first; returns whether to keep going.
    async fn pause(&self, period: Duration) -> bool {
        if !self.is_running() {
            return false;
        }
        select! {
            _ = sleep(period) => {}
            _ = self.stopped() => {}
        }
        self.is_running()
    }
}

async fn source_modified(path: &Path) -> Option<SystemTime> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    metadata.modified().ok()
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::net::TcpListener;

    use super::*;
    use crate::config::RetryPolicy;

    async fn unused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("local addr")
    }

    fn quick_config(server: String, source: PathBuf) -> ProducerConfig {
        let mut config = ProducerConfig::new(server, source);
        config.retry = RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(10),
        };
        config.poll_interval = Duration::from_millis(20);
        config.heartbeat_interval = Duration::from_millis(20);
        config
    }

    #[tokio::test]
    async fn unreachable_aggregator_exhausts_retries_and_stops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("S1.txt");
        std::fs::write(&source, "id: S1\ntemp: 10\n").expect("write source");
        let addr = unused_addr().await;

        let producer = Producer::new(quick_config(addr.to_string(), source));
        let result = producer.publish().await;

        assert!(matches!(
            result,
            Err(PublishError::Unreachable { attempts: 3, .. })
        ));
        assert!(!producer.is_running());
        // One tick per attempt.
        assert_eq!(producer.clock().current(), 3);
    }

    #[tokio::test]
    async fn source_without_id_is_rejected_before_sending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = dir.path().join("S1.txt");
        std::fs::write(&source, "temp: 10\n").expect("write source");
        let addr = unused_addr().await;

        let producer = Producer::new(quick_config(addr.to_string(), source));
        let result = producer.publish().await;

        assert!(matches!(result, Err(PublishError::MissingStationId(_))));
        assert_eq!(producer.clock().current(), 0);
    }

    #[tokio::test]
    async fn missing_source_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let addr = unused_addr().await;

        let producer = Producer::new(quick_config(
            addr.to_string(),
            dir.path().join("absent.txt"),
        ));

        assert!(matches!(
            producer.publish().await,
            Err(PublishError::Source { .. })
        ));
    }

    #[tokio::test]
    async fn stop_releases_pause_early() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = quick_config("127.0.0.1:1".into(), dir.path().join("S1.txt"));
        config.poll_interval = Duration::from_secs(60);
        let producer = Producer::new(config);

        let waiter = {
            let producer = Arc::clone(&producer);
            tokio::spawn(async move { producer.pause(Duration::from_secs(60)).await })
        };
        producer.stop();

        let keep_going = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("pause should end on stop")
            .expect("pause task");
        assert!(!keep_going);
    }
}
