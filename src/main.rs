use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ytapi::oauth::{OAuthConfig, OAuthSession};
use ytapi::server::{self, AppState};
use ytapi::token_store::TokenStore;
use ytapi::youtube::YouTubeClient;
use ytapi::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; everything can come from the environment.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ytapi=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    args.validate().context("invalid configuration")?;

    let store = TokenStore::new(args.token_path());
    let oauth_config = OAuthConfig::from_args(&args)?;
    let session = OAuthSession::new(&oauth_config, store).context("creating OAuth session")?;
    info!(
        token_path = %session.store().path().display(),
        refresh_policy = ?session.refresh_policy(),
        "oauth session ready"
    );

    let timeout = args
        .request_timeout
        .map(|d| d.to_std())
        .transpose()
        .context("request timeout must not be negative")?;
    let youtube = YouTubeClient::new(&args.api_base_url, timeout).context("creating HTTP client")?;

    let state = AppState::new(Arc::new(session), youtube, args.upload_dir());
    let app = server::router(state, args.max_upload_bytes);

    let addr = SocketAddr::new(args.host.parse().context("parsing YTAPI_HOST")?, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", err);
    }
}
