use chrono::Duration;
use imagecache::{
    PathStorage, ResultStorage, StorageContext, StorageFactory, SweepOptions, SweepReport,
};
use shared::config::{PathStorageConfig, ResultStorageConfig, SweepConfig};
use std::sync::Arc;
use storage_engine::MongoStorageFactory;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting imagecache sweeper");

    match dotenvy::dotenv() {
        Ok(_) => info!("Loaded environment variables from .env file"),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let path_config = PathStorageConfig::from_env();
    let result_config = ResultStorageConfig::from_env();
    let sweep_config = SweepConfig::from_env();
    let options = sweep_options(&sweep_config);

    info!(
        "Image storage at {} ({}.{}), result storage at {} ({}.{})",
        path_config.mongo.endpoint.describe(),
        path_config.mongo.database,
        path_config.mongo.collection,
        result_config.mongo.endpoint.describe(),
        result_config.mongo.database,
        result_config.mongo.collection
    );

    let factory = MongoStorageFactory::new();
    let context = Arc::new(StorageContext::system());

    tokio::select! {
        outcome = run(&factory, path_config, result_config, context, &options) => outcome?,
        _ = shutdown_signal() => warn!("Sweep interrupted, remaining orphans are left for the next run"),
    }

    Ok(())
}

async fn run(
    factory: &dyn StorageFactory,
    path_config: PathStorageConfig,
    result_config: ResultStorageConfig,
    context: Arc<StorageContext>,
    options: &SweepOptions,
) -> shared::Result<()> {
    // opening a storage also bootstraps its lookup index
    let images = PathStorage::connect(path_config, factory, Arc::clone(&context)).await?;
    let results = ResultStorage::connect(result_config, factory, context).await?;

    let mut failed = false;
    for (name, sweeper) in [("images", images.sweeper()), ("results", results.sweeper())] {
        match sweeper.sweep(options).await {
            Ok(report) => log_report(name, &report, options.dry_run),
            Err(e) => {
                error!("Sweep of {} failed: {}", name, e);
                failed = true;
            }
        }
    }

    if failed {
        return Err(shared::Error::StoreUnavailable(
            "at least one sweep did not complete".to_string(),
        ));
    }
    Ok(())
}

fn sweep_options(config: &SweepConfig) -> SweepOptions {
    let grace = i64::try_from(config.grace_seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or_else(|| {
            warn!(
                "SWEEP_GRACE_SECONDS={} is out of range, using the default",
                config.grace_seconds
            );
            SweepOptions::default().grace
        });

    SweepOptions {
        grace,
        dry_run: config.dry_run,
    }
}

fn log_report(name: &str, report: &SweepReport, dry_run: bool) {
    info!(
        "{}: scanned {} document(s) and {} blob(s)",
        name, report.documents_scanned, report.blobs_scanned
    );
    if dry_run {
        for file_id in &report.orphan_blobs {
            info!("{}: would delete orphan blob {}", name, file_id);
        }
        for file_id in &report.orphan_documents {
            info!("{}: would delete documents pointing at missing blob {}", name, file_id);
        }
        return;
    }
    info!(
        "{}: removed {} blob(s) and {} document(s)",
        name, report.blobs_removed, report.documents_removed
    );
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
