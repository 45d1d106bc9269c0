use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;
use vidpress::config::AppConfig;
use vidpress::services::ServiceContainer;
use vidpress::{database, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;

    let (logging_config, _guard) = logging::init_logging(&config.log_dir)?;
    let shutdown = CancellationToken::new();
    logging_config.start_retention_cleanup(shutdown.clone());

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let container = ServiceContainer::new(pool.clone(), config);
    let recovered = container.initialize().await?;
    info!("vidpress started, {} jobs recovered", recovered);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    shutdown.cancel();
    container.shutdown_with_timeout(Duration::from_secs(30)).await;
    pool.close().await;

    Ok(())
}
