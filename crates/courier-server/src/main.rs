mod config;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use courier_api::AppStateInner;
use courier_api::outbound::GraphApiSender;
use courier_crypto::credentials::CredentialVault;
use courier_crypto::keys::{generate_key, key_to_base64};
use courier_db::{Database, SqliteMirror};

use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // `courier generate-key` prints a fresh COURIER_CREDENTIAL_KEY and exits
    if std::env::args().nth(1).as_deref() == Some("generate-key") {
        println!("{}", key_to_base64(&generate_key()));
        return Ok(());
    }

    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let addr = config.addr()?;
    let vault = CredentialVault::new(config.vault_key()?);

    // Init database
    let mut db = Database::open(&config.db_path)?;
    match &config.mirror_db_path {
        Some(path) => {
            db = db.with_secondary(Arc::new(SqliteMirror::open(path)?));
            info!(path = %path.display(), "secondary mirror enabled");
        }
        None => warn!("COURIER_MIRROR_DB_PATH not set, secondary mirror disabled"),
    }

    tokio::fs::create_dir_all(config.media_root.join("outbound")).await?;
    let media_root = config.media_root.clone();

    let sender = Arc::new(GraphApiSender::new(&config.graph_base_url)?);
    let state = AppStateInner::new(db, config.into_relay_config(), vault, sender)?;

    let app = courier_api::router(state)
        .nest_service("/media", ServeDir::new(&media_root))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!("Courier relay listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Courier relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
