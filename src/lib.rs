// Gemini Relay - OpenAI-compatible and native Gemini API over a browser automation channel

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod proxy;

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::api::AppState;
use crate::auth::{AccountDirectory, FileAccountDirectory};
use crate::proxy::orchestrator::Orchestrator;
use crate::proxy::registry::ConnectionRegistry;
use crate::proxy::rotation::Rotator;
use crate::proxy::session::LauncherSessionManager;

/// Pick the account to start on: the configured one if usable, else the
/// lowest usable index.
pub fn select_initial_index(configured: Option<usize>, usable: &[usize]) -> usize {
    if let Some(index) = configured {
        if usable.contains(&index) {
            return index;
        }
        tracing::warn!("Configured initial account {} is not usable", index);
    }
    match usable.first() {
        Some(&index) => index,
        None => {
            tracing::warn!("No usable accounts found, starting on index 0");
            0
        }
    }
}

pub async fn run() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = config::default_config_path();
    let shared = config::init_config(&config_path)?;
    let config = shared.read().clone();

    let auth_dir = config::resolve_auth_dir(&config.auth_dir);
    tracing::info!("Reading accounts from {:?}", auth_dir);
    let accounts: Arc<dyn AccountDirectory> = Arc::new(FileAccountDirectory::new(auth_dir));
    let usable = accounts.list_usable_indices();
    tracing::info!("{} usable account(s): {:?}", usable.len(), usable);
    let initial = select_initial_index(config.initial_auth_index, &usable);

    let ws_host = match config.host.as_str() {
        "" | "0.0.0.0" => "127.0.0.1",
        host => host,
    };
    let channel_token = config
        .channel_token
        .clone()
        .or_else(|| config.launcher.as_ref().map(|_| uuid::Uuid::new_v4().simple().to_string()));
    let ws_url = match &channel_token {
        Some(token) => format!("ws://{}:{}/ws?token={}", ws_host, config.port, token),
        None => {
            if config.api_keys.is_empty() {
                tracing::warn!("No channel token or API keys configured, /ws accepts any peer");
            }
            format!("ws://{}:{}/ws", ws_host, config.port)
        }
    };

    let registry = Arc::new(ConnectionRegistry::new());
    let sessions = Arc::new(LauncherSessionManager::new(
        registry.clone(),
        accounts.clone(),
        config.launcher.clone(),
        ws_url,
        initial,
    ));
    let rotator = Arc::new(Rotator::new(sessions, accounts));
    let orchestrator = Arc::new(Orchestrator::new(registry, rotator.clone(), shared));

    if config.launcher.is_some() {
        // Launch under the busy gate; concurrent recovery attempts back off
        tokio::spawn(async move {
            tracing::info!("Starting automation for account {}", initial);
            match rotator.recover().await {
                Ok(true) => {}
                Ok(false) => tracing::info!("Initial launch already in progress"),
                Err(e) => tracing::error!("Initial automation launch failed: {}", e),
            }
        });
    } else {
        tracing::info!("No launcher configured, waiting for the automation layer on /ws");
    }

    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            let _ = api::stop_server().await;
        }
    });

    let state = AppState::new(orchestrator).with_channel_token(channel_token);
    api::start_server(state, &config.host, config.port).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_index_prefers_configured_usable_account() {
        assert_eq!(select_initial_index(Some(3), &[1, 3, 5]), 3);
        assert_eq!(select_initial_index(Some(4), &[1, 3, 5]), 1);
        assert_eq!(select_initial_index(None, &[2, 7]), 2);
        assert_eq!(select_initial_index(None, &[]), 0);
    }
}
