use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tokenscan_indexer::config::Config;
use tokenscan_indexer::engine::Engine;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    // Structured logging (RUST_LOG=info by default, INDEXER_LOG_FORMAT=json for JSON lines)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("INDEXER_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    tracing::info!("TokenScan indexer starting");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path)?;
    tracing::info!(
        chains = config.chains.len(),
        tracked_tokens = config.tracked_tokens.len(),
        "Configuration loaded from {}",
        config_path
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .map_err(|e| eyre::eyre!("Failed to connect to database: {}", e))?;

    tracing::info!("Connected to PostgreSQL");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| eyre::eyre!("Failed to run migrations: {}", e))?;

    tracing::info!("Database migrations complete");

    let engine = Engine::init(pool, &config).await?;

    if config.engine.skip_autostart {
        tracing::info!("Autostart disabled, exiting after seeding");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let handles = engine.spawn(&shutdown);

    if config.engine.one_shot {
        tracing::info!("One-shot mode: running a single cycle per poller");
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Poller task panicked");
            }
        }
        tracing::info!("One-shot run complete");
        return Ok(());
    }

    tracing::info!("All pollers started. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, stopping all pollers...");
    shutdown.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Poller task panicked");
        }
    }

    tracing::info!("TokenScan indexer stopped gracefully");
    Ok(())
}
