use std::sync::Arc;

use anyhow::{Context, Result};
use doorman_core::{CtfTimeClient, TelegramClient};
use tokio::net::TcpListener;
use tracing::info;

use doorman_server::oauth_callback::{api_router, ApiState};
use doorman_server::platform::TelegramPlatform;
use doorman_server::shutdown::wait_for_signal;
use doorman_server::state_machine::interpreter::Services;
use doorman_server::state_machine::repository::SqliteRepository;
use doorman_server::state_machine::Engine;
use doorman_server::{get_version, init_tracing, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(&config.log_level);

    info!(version = %get_version(), "Starting doorman API");
    info!(?config, "Loaded configuration");

    let client_secret = config.require_client_secret()?.to_string();

    info!("Using state database: {}", config.database_path.display());
    let repo = Arc::new(
        SqliteRepository::new(&config.database_path)
            .context("Failed to initialize SQLite database")?,
    );

    // Greetings are removed from the chat on verification, so the API
    // process talks to Telegram too.
    let client = TelegramClient::new(config.telegram_token.clone());
    let me = client
        .get_me()
        .await
        .context("getMe failed, check TELEGRAM_TOKEN")?;
    let platform = Arc::new(TelegramPlatform::new(client, me));

    let provider = Arc::new(CtfTimeClient::new(config.oauth_settings(), client_secret));

    let engine = Arc::new(Engine::new(Services {
        store: repo.clone(),
        ledger: repo,
        messenger: platform,
        provider: Some(provider),
        oauth: config.oauth_settings(),
        policy: config.policy(),
    }));

    let app = api_router(Arc::new(ApiState { engine }));

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_signal())
        .await?;

    info!("doorman API stopped");
    Ok(())
}
