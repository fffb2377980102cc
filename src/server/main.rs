use std::sync::Arc;
use std::time::Duration;

use crosspath::server::cache::RedisCache;
use crosspath::server::config::ServerConfig;
use crosspath::server::database::Database;
use crosspath::server::hub::Hub;
use crosspath::server::worker;
use crosspath::server::ws;
use log::{error, info, warn};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    std::env::set_var("RUST_LOG", &log_level);
    env_logger::init();

    let config = ServerConfig::from_env().map_err(|e| {
        error!("cannot load config: {}", e);
        e
    })?;

    let database = Arc::new(Database::connect(&config.database_url).await.map_err(|e| {
        error!("cannot connect to database: {}", e);
        e
    })?);

    info!("running database migrations");
    database.migrate().await.map_err(|e| {
        error!("database migration failed: {}", e);
        e
    })?;

    // The KV client connects lazily; a down Redis degrades caching and
    // detection, it does not stop the server from booting.
    let kv = Arc::new(RedisCache::new(&config.redis_address)?);
    let hub = Arc::new(Hub::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let cleanup_handle = worker::spawn_cleanup(database.clone(), shutdown_rx.clone());
    let sweeper_handle = worker::spawn_crossing_sweeper(
        database.clone(),
        kv.clone(),
        hub.clone(),
        shutdown_rx.clone(),
    );

    let ws_addr = config.server_address.clone();
    let ws_hub = hub.clone();
    let ws_db = database.clone();
    let ws_shutdown = shutdown_rx.clone();
    let ws_handle = tokio::spawn(async move {
        if let Err(e) = ws::run_ws_server(&ws_addr, ws_hub, ws_db, ws_shutdown).await {
            error!("[WS] server error: {}", e);
        }
    });

    info!("server started on {}", config.server_address);

    tokio::signal::ctrl_c().await?;
    info!("shutting down gracefully");
    let _ = shutdown_tx.send(true);

    // Listener stops accepting immediately; give pumps and in-flight sweeps
    // up to five seconds to drain.
    let drain = async {
        let _ = ws_handle.await;
        let _ = cleanup_handle.await;
        let _ = sweeper_handle.await;
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        warn!("shutdown drain timed out");
    }

    // KV connection goes last
    drop(kv);
    info!("server stopped");
    Ok(())
}
