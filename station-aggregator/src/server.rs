//! Connection acceptor and session dispatcher.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{OwnedSemaphorePermit, Semaphore, oneshot, watch},
    task::{JoinHandle, JoinSet},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::clock::LogicalClock;
use crate::config::AggregatorConfig;
use crate::registry::StationRegistry;
use crate::session::{SessionError, handle_session};
use crate::store::RecordStore;
use crate::sweeper::EvictionSweeper;

/// State shared by every session and the sweeper.
pub struct ServerContext {
    pub clock: LogicalClock,
    pub registry: StationRegistry,
    pub store: RecordStore,
}

impl ServerContext {
    pub fn new(store: RecordStore) -> Self {
        Self {
            clock: LogicalClock::new(),
            registry: StationRegistry::new(),
            store,
        }
    }
}

pub struct Aggregator {
    listener: TcpListener,
    context: Arc<ServerContext>,
    config: AggregatorConfig,
}

impl Aggregator {
    /// Opens the data directory and binds the listening socket.
    pub async fn bind(config: AggregatorConfig) -> Result<Self> {
        let store = RecordStore::open(&config.data_dir)
            .await
            .with_context(|| format!("failed to open data dir {}", config.data_dir.display()))?;
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        Ok(Self {
            listener,
            context: Arc::new(ServerContext::new(store)),
            config,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.context)
    }

    /// Serves connections until `shutdown` resolves.
    ///
    /// On shutdown the listener is closed first, then the sweeper is stopped
    /// and any in-flight sessions are cancelled.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Aggregator {
            listener,
            context,
            config,
        } = self;
        tokio::pin!(shutdown);

        let (running_tx, running_rx) = watch::channel(true);
        let sweeper = EvictionSweeper::new(
            Arc::clone(&context),
            config.sweep_period,
            config.inactivity_threshold,
        );
        let sweeper_task = tokio::spawn(sweeper.run(running_rx));

        let slots = Arc::new(Semaphore::new(config.max_sessions.max(1)));
        let mut sessions = JoinSet::new();

        loop {
            while sessions.try_join_next().is_some() {}

            let permit = select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&slots).acquire_owned() => {
                    permit.context("session pool closed")?
                }
            };

            select! {
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, permit, &context, &config, &mut sessions);
                }
            }
        }

        info!("aggregator shutting down");
        drop(listener);
        let _ = running_tx.send(false);
        sessions.shutdown().await;
        if let Err(err) = sweeper_task.await {
            warn!(error = ?err, "sweeper task ended abnormally");
        }
        info!("aggregator stopped");

        Ok(())
    }

    /// Runs the aggregator on a background task.
    pub fn spawn(self) -> Result<AggregatorHandle> {
        let local_addr = self.local_addr()?;
        let context = self.context();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(self.run_until(async move {
            let _ = shutdown_rx.await;
        }));

        Ok(AggregatorHandle {
            local_addr,
            context,
            shutdown_tx,
            task,
        })
    }
}

/// Operational control over a spawned aggregator.
pub struct AggregatorHandle {
    local_addr: SocketAddr,
    context: Arc<ServerContext>,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl AggregatorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn current_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Stops accepting, cancels in-flight sessions and waits for the loop.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        self.task.await.context("aggregator task panicked")?
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    permit: OwnedSemaphorePermit,
    context: &Arc<ServerContext>,
    config: &AggregatorConfig,
    sessions: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, permit, context, config, sessions),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    permit: OwnedSemaphorePermit,
    context: &Arc<ServerContext>,
    config: &AggregatorConfig,
    sessions: &mut JoinSet<()>,
) {
    let context = Arc::clone(context);
    let limit = config.session_timeout;
    sessions.spawn(async move {
        let _permit = permit;
        let outcome = match timeout(limit, handle_session(stream, &context)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SessionError::TimedOut(limit)),
        };
        match outcome {
            Ok(status) => debug!(peer = %peer, %status, "session complete"),
            Err(err) => warn!(peer = %peer, error = %err, "session ended with error"),
        }
    });
}
