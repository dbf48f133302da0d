//! Azure AD sign-in bridge - standalone server.

#![deny(clippy::all)]

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use aad_login_bridge::auth::AzureAdClient;
use aad_login_bridge::config::Config;
use aad_login_bridge::directory::FileDirectory;
use aad_login_bridge::server::{self, AppState};
use aad_login_bridge::session::CookieSessionTransport;

#[tokio::main]
async fn main() {
    // Load .env file (if present) before anything else
    if let Err(e) = dotenvy::dotenv() {
        // .env file is optional - only log if it's not a "file not found" error
        if !e.to_string().contains("not found") {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    // Load configuration
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            eprintln!("\nPlease set the following environment variables or update config.toml:");
            eprintln!("  AZURE_CLIENT_ID=<your-azure-ad-client-id>");
            eprintln!("  AZURE_CLIENT_SECRET=<your-azure-ad-client-secret>");
            std::process::exit(1);
        }
    };

    init_logging(&config.logging.level);

    info!("Starting aad-login-bridge v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Initialize tracing/logging.
fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

async fn run(config: Config) -> Result<()> {
    let directory = FileDirectory::load(&config.directory.users_file)
        .context("Failed to load user directory")?;

    let provider = AzureAdClient::new(&config).context("Failed to create OAuth client")?;
    info!(authority = %config.oauth.authority, "OAuth client configured");

    let transport = CookieSessionTransport::new(&config.session);

    let state = AppState::new(
        &config,
        Arc::new(provider),
        Arc::new(directory),
        Arc::new(transport),
    );

    server::serve(&config, state).await
}
