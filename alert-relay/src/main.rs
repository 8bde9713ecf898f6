use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use alert_relay::app::AlertRelay;
use alert_relay::config::AppConfig;
use alert_relay::metrics::MetricsCollector;
use alert_relay::{database, logging, utils};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("loading configuration")?;

    let (logging, _log_guard) =
        logging::init_logging(&config.log_dir).context("initializing logging")?;
    utils::http_client::install_rustls_provider();

    let pool = database::init_pool(&config.database_url)
        .await
        .context("opening database")?;
    database::run_migrations(&pool)
        .await
        .context("running migrations")?;

    let metrics = Arc::new(MetricsCollector::new());
    metrics.set_label("version", env!("CARGO_PKG_VERSION"));

    let relay = AlertRelay::from_config(&config, pool.clone(), metrics.clone())?;

    let cancel = CancellationToken::new();
    let mut tasks = relay.start(cancel.clone()).await?;
    tasks.push(logging.start_retention_cleanup(cancel.clone()));

    tracing::info!(
        database = %config.database_url,
        log_filter = %logging.get_filter(),
        "alert-relay started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown requested");

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        triggered = snapshot.triggered,
        escalations = snapshot.escalations,
        retries_claimed = snapshot.retries_claimed,
        log_write_failures = snapshot.log_write_failures,
        "Final metrics"
    );

    pool.close().await;
    Ok(())
}
