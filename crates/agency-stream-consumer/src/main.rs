use agency_stream_consumer::{
    config::{CliArgs, ConsumerConfig},
    consumer::{GrpcBatchSource, RunOutcome, StreamConsumer},
    directory::MemoryDirectory,
    telemetry::init_logging,
};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ConsumerConfig::try_from(args)?;

    init_logging(config.log_format)?;

    tracing::info!(
        generator = %config.endpoint.uri(),
        count = config.settings.count,
        batch_size = config.settings.batch_size,
        "Starting stream consumer"
    );

    let directory = Arc::new(MemoryDirectory::seeded(
        config.seed_counterparties,
        config.seed_real_estates,
    ));
    let consumer = StreamConsumer::new(
        GrpcBatchSource::new(config.endpoint),
        Arc::clone(&directory),
        config.settings,
    );

    let cancel = CancellationToken::new();
    let mut run = tokio::spawn({
        let cancel = cancel.clone();
        async move { consumer.run(&cancel).await }
    });

    let outcome = tokio::select! {
        joined = &mut run => joined?,
        () = shutdown_signal() => {
            cancel.cancel();
            run.await?
        }
    }?;

    match outcome {
        RunOutcome::Completed {
            request_id,
            received,
            created,
        } => tracing::info!(
            %request_id,
            received,
            created,
            stored = directory.created_count(),
            "Run completed"
        ),
        RunOutcome::Incomplete {
            request_id,
            received,
            created,
        } => tracing::warn!(
            %request_id,
            received,
            created,
            "Run ended without the final batch"
        ),
        RunOutcome::Cancelled => tracing::info!("Run cancelled"),
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
