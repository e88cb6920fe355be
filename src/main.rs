//! Disrelay - two-way chat relay between a game server and Discord.
//!
//! This binary bridges a Discord channel to a console stand-in for the game:
//! stdin lines are relayed as player chat, relayed messages go to stdout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info};

use disrelay::config::{env::get_config_path, load_and_validate};
use disrelay::game::console::run_console;
use disrelay::gateway::discord::DiscordGateway;
use disrelay::gateway::webhook::WebhookSender;
use disrelay::translate::{LibreTranslate, Translator};
use disrelay::RelayRuntime;

/// How long running tasks get to finish after a shutdown request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Disrelay v{} starting...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_path = get_config_path();
    info!("Loading configuration from {}...", config_path);

    let config = load_and_validate(&config_path).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        error!("Please ensure {} exists and is properly formatted.", config_path);
        e
    })?;

    info!("Configuration loaded successfully");
    info!("  Channel: {}", config.discord.channel_id);
    info!(
        "  Delivery: {}",
        if config.discord.webhook_url.is_some() { "webhook" } else { "bot" }
    );

    // ============================================================
    // Build the gateway and the optional translator
    // ============================================================
    let webhook = config
        .discord
        .webhook_url
        .as_deref()
        .map(WebhookSender::new)
        .transpose()?;
    let gateway = Arc::new(DiscordGateway::new(config.discord.channel_id, webhook)?);

    let translation = &config.translation;
    let translator: Option<Arc<dyn Translator>> = match (translation.enabled, translation.endpoint.as_deref()) {
        (true, Some(endpoint)) => {
            info!("  Translation: {}", endpoint);
            Some(Arc::new(LibreTranslate::new(
                endpoint,
                translation.api_key.clone(),
                translation.timeout(),
            )?))
        }
        _ => None,
    };

    // ============================================================
    // Start the relay and the console
    // ============================================================
    let (runtime, display_rx) = RelayRuntime::start(&config, gateway, translator);
    let handle = runtime.handle();

    let console = tokio::spawn(run_console(handle.clone(), display_rx, handle.shutdown_signal()));

    shutdown_signal().await;
    info!("Shutdown signal received - stopping relay...");

    runtime.shutdown(SHUTDOWN_GRACE).await;
    if tokio::time::timeout(SHUTDOWN_GRACE, console).await.is_err() {
        error!("Console did not stop in time");
    }

    info!("Exiting...");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
