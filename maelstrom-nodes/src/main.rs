use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;
use tracing::{info, warn};

use maelstrom_nodes::{
    channel,
    cli::{Cli, Command},
    runtime::{Runtime, Workload},
    workloads::{
        broadcast::BroadcastEngine, counter::Counter, echo::Echo, kafka::Kafka, txn::Txn,
        unique_ids::UniqueIds,
    },
};

/// How long in-flight handlers get to finish writing after stdin closes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    // stdout carries the protocol; logs go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn serve<W: Workload>(workload: W) -> Result<()> {
    let (outbox, rx) = channel::outbox();
    let writer = channel::spawn_writer(rx, tokio::io::stdout());
    let runtime = Runtime::new(workload, outbox);

    runtime
        .run(BufReader::new(tokio::io::stdin()))
        .await
        .context("failed to read stdin")?;
    drop(runtime);

    match tokio::time::timeout(SHUTDOWN_GRACE, writer).await {
        Ok(joined) => joined
            .context("writer task failed")?
            .context("failed to write stdout")?,
        Err(_) => warn!("handlers still running at shutdown; exiting anyway"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    info!(workload = ?cli.command, "starting");
    match &cli.command {
        Command::Echo => serve(Echo).await,
        Command::UniqueIds => serve(UniqueIds::default()).await,
        Command::Broadcast(args) => serve(BroadcastEngine::new(args.into())).await,
        Command::Counter(args) => serve(Counter::new(args.into())).await,
        Command::Kafka(args) => serve(Kafka::new(args.into())).await,
        Command::Txn(args) => serve(Txn::new(args.into())).await,
    }
}
