use std::sync::Arc;

use anyhow::{Context, Result};
use doorman_core::TelegramClient;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use doorman_server::admin_sync::admin_sync_loop;
use doorman_server::dispatcher::Dispatcher;
use doorman_server::platform::TelegramPlatform;
use doorman_server::poller::{Poller, PollerConfig};
use doorman_server::reconciliation::reconciliation_loop;
use doorman_server::shutdown::cancel_on_signal;
use doorman_server::state_machine::interpreter::Services;
use doorman_server::state_machine::repository::SqliteRepository;
use doorman_server::state_machine::Engine;
use doorman_server::{get_version, init_tracing, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(&config.log_level);

    info!(version = %get_version(), "Starting doorman bot");
    info!(?config, "Loaded configuration");

    info!("Using state database: {}", config.database_path.display());
    let repo = Arc::new(
        SqliteRepository::new(&config.database_path)
            .context("Failed to initialize SQLite database")?,
    );

    let client = TelegramClient::new(config.telegram_token.clone());
    let me = client
        .get_me()
        .await
        .context("getMe failed, check TELEGRAM_TOKEN")?;
    info!(bot_id = me.id, username = ?me.username, "Authenticated with Telegram");
    let platform = Arc::new(TelegramPlatform::new(client.clone(), me.clone()));

    let engine = Arc::new(Engine::new(Services {
        store: repo.clone(),
        ledger: repo.clone(),
        messenger: platform.clone(),
        provider: None,
        oauth: config.oauth_settings(),
        policy: config.policy(),
    }));
    let dispatcher = Arc::new(Dispatcher::new(
        engine.clone(),
        me.id,
        config.admin_max_age(),
    ));
    let poller = Poller::new(
        Arc::new(client),
        repo.clone(),
        dispatcher,
        PollerConfig {
            handler_timeout: config.handler_timeout,
            ..PollerConfig::default()
        },
    );

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());

    let reconciler = tokio::spawn(reconciliation_loop(
        engine,
        repo.clone(),
        config.reconcile_interval,
        shutdown.clone(),
    ));
    let admin_sync = tokio::spawn(admin_sync_loop(
        repo,
        platform,
        config.admin_sync_interval,
        shutdown.clone(),
    ));

    let result = poller.run(shutdown.clone()).await;
    if let Err(e) = &result {
        error!(error = %e, "Poller failed");
    }

    shutdown.cancel();
    for (name, task) in [("reconciliation", reconciler), ("admin sync", admin_sync)] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "Background task panicked");
        }
    }

    info!("doorman bot stopped");
    result
}
