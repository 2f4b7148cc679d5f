mod bot;
mod config;
mod entitlements;
mod llm;
mod platform;
mod server;
mod signature;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bot::AppState;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fortune_relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Optional config file; environment variables override it
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    match &config_path {
        Some(path) => info!("Loading configuration from: {}", path.display()),
        None => info!("Loading configuration from environment"),
    }
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;

    info!("Configuration loaded successfully");
    info!("  Model: {}", config.llm.model);
    info!("  Seeded paid users: {}", config.entitlements.paid_user_ids.len());
    info!("  Unauthorized policy: {}", config.entitlements.on_unauthorized);
    if config.server.admin_token.is_none() {
        warn!("ADMIN_TOKEN is not set: /add-paid-user and /remove-paid-user accept any caller");
    }

    let state = Arc::new(AppState::new(&config));
    info!("Paid users at startup: {}", state.paid_user_count().await);

    server::serve(state, &config.bind_address()).await
}
