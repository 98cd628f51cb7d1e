use anyhow::Context;
use axum::Router;
use std::net::SocketAddr;
use tracing::info;

use sql_chat_backend::api::handlers::AppState;
use sql_chat_backend::api::routes::create_router;
use sql_chat_backend::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize logging; RUST_LOG wins over the configured level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();

    info!(
        "Row limit {} (max {}), statement timeout {}s, summaries {}",
        config.executor.default_row_limit,
        config.executor.max_row_limit,
        config.executor.timeout_secs,
        if config.llm.summarize { "on" } else { "off" }
    );

    // Create router with state
    let app: Router = create_router(AppState::new(config.clone()));

    // Start server
    let addr: SocketAddr = config
        .server_address()
        .parse()
        .with_context(|| format!("Invalid server address {}", config.server_address()))?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
