use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::oneshot;
use tracing::{info, warn};

use station_aggregator::{
    cli::{Cli, Command},
    config::{AggregatorConfig, ProducerConfig, QueryConfig},
    producer::Producer,
    query::{self, QueryAgent},
    server::Aggregator,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::stdout().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Aggregator(args) => run_aggregator(args.into()).await?,
        Command::Producer(args) => run_producer(args.into()).await,
        Command::Consumer(args) => run_consumer(args.into()).await?,
    }

    Ok(())
}

async fn run_aggregator(config: AggregatorConfig) -> Result<()> {
    let aggregator = Aggregator::bind(config).await?;
    let addr = aggregator.local_addr()?;
    info!("aggregator listening on {}", addr);

    if let Err(err) = aggregator.run_until(shutdown_requested()).await {
        warn!("aggregator exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}

async fn run_producer(config: ProducerConfig) {
    let producer = Producer::new(config);
    let task = tokio::spawn(Arc::clone(&producer).run());

    tokio::select! {
        _ = producer.stopped() => {}
        ctrl_c = tokio::signal::ctrl_c() => {
            if let Err(err) = ctrl_c {
                warn!(error = ?err, "ctrl-c handler failed");
            }
            producer.stop();
        }
    }

    if let Err(err) = task.await {
        warn!(error = ?err, "producer task ended abnormally");
    }
}

async fn run_consumer(config: QueryConfig) -> Result<()> {
    let agent = QueryAgent::new(config);
    let response = agent
        .fetch()
        .await
        .with_context(|| format!("unable to fetch {} after retries", agent.station()))?;
    println!("{}", query::render(&response));
    Ok(())
}

/// Resolves on Ctrl-C or a `shutdown` line on stdin.
///
/// Closing stdin does not count as a request.
async fn shutdown_requested() {
    let console = console_shutdown();
    let console = async {
        match console.await {
            Ok(()) => info!("shutdown requested from console"),
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = console => {}
        ctrl_c = tokio::signal::ctrl_c() => {
            if let Err(err) = ctrl_c {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        }
    }
}

// Stdin is read on a plain thread so a pending read never holds up runtime
// shutdown.
fn console_shutdown() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            match line {
                Ok(line) if line.trim().eq_ignore_ascii_case("shutdown") => {
                    let _ = tx.send(());
                    return;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    });
    rx
}
