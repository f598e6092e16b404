// Upstream session management - which account currently drives the channel

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::registry::ConnectionRegistry;
use crate::auth::AccountDirectory;
use crate::config::LauncherConfig;
use crate::error::SessionError;

/// The only component allowed to create or replace the upstream channel.
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Make `index` the active account with a live channel.
    ///
    /// Returns quickly when that account is already active and connected.
    async fn ensure_channel_for(&self, index: usize) -> Result<(), SessionError>;

    fn current_index(&self) -> usize;
}

/// Drives an external automation process, one per active account.
///
/// Switching kills the running process, closes its channels, spawns the
/// launcher for the new account and waits for it to connect back on `/ws`.
/// Without a launcher the automation layer is managed elsewhere and only the
/// index is tracked.
pub struct LauncherSessionManager {
    registry: Arc<ConnectionRegistry>,
    accounts: Arc<dyn AccountDirectory>,
    launcher: Option<LauncherConfig>,
    ws_url: String,
    current: AtomicUsize,
    child: Mutex<Option<Child>>,
}

impl LauncherSessionManager {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        accounts: Arc<dyn AccountDirectory>,
        launcher: Option<LauncherConfig>,
        ws_url: String,
        initial_index: usize,
    ) -> Self {
        Self {
            registry,
            accounts,
            launcher,
            ws_url,
            current: AtomicUsize::new(initial_index),
            child: Mutex::new(None),
        }
    }

    async fn spawn_for(&self, launcher: &LauncherConfig, index: usize) -> Result<(), SessionError> {
        let auth_file = self
            .accounts
            .auth_file(index)
            .ok_or(SessionError::UnknownAccount(index))?;

        let mut child_slot = self.child.lock().await;
        if let Some(mut old) = child_slot.take() {
            tracing::info!("Stopping automation process for account {}", self.current_index());
            if let Err(e) = old.kill().await {
                tracing::warn!("Failed to stop automation process: {}", e);
            }
        }
        self.registry.close_all();

        tracing::info!(
            "Launching automation for account {} ({})",
            index,
            self.accounts.name_of(index)
        );
        let child = Command::new(&launcher.command)
            .args(&launcher.args)
            .env("RELAY_ACCOUNT_INDEX", index.to_string())
            .env("RELAY_AUTH_FILE", &auth_file)
            .env("RELAY_WS_URL", &self.ws_url)
            .kill_on_drop(true)
            .spawn()?;
        *child_slot = Some(child);
        drop(child_slot);

        let waited_ms = launcher.ready_timeout_ms;
        if !self
            .registry
            .wait_for_channel(Duration::from_millis(waited_ms))
            .await
        {
            return Err(SessionError::ChannelTimeout { index, waited_ms });
        }
        Ok(())
    }
}

#[async_trait]
impl SessionManager for LauncherSessionManager {
    async fn ensure_channel_for(&self, index: usize) -> Result<(), SessionError> {
        if self.current_index() == index && self.registry.has_live_channel() {
            return Ok(());
        }

        match &self.launcher {
            Some(launcher) => {
                self.spawn_for(launcher, index).await?;
                self.current.store(index, Ordering::SeqCst);
                tracing::info!("Account {} is now active", index);
                Ok(())
            }
            None => {
                if !self.registry.has_live_channel() {
                    return Err(SessionError::NoLauncher);
                }
                self.current.store(index, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    fn current_index(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAccountDirectory;
    use tokio::sync::mpsc;

    fn manager(registry: Arc<ConnectionRegistry>) -> LauncherSessionManager {
        LauncherSessionManager::new(
            registry,
            Arc::new(StaticAccountDirectory::new([0, 1])),
            None,
            "ws://127.0.0.1:7860/ws".to_string(),
            0,
        )
    }

    #[tokio::test]
    async fn without_launcher_requires_live_channel() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sessions = manager(registry.clone());
        assert!(matches!(
            sessions.ensure_channel_for(1).await,
            Err(SessionError::NoLauncher)
        ));
        assert_eq!(sessions.current_index(), 0);

        let (tx, _rx) = mpsc::unbounded_channel();
        registry.add_channel(tx);
        sessions.ensure_channel_for(1).await.unwrap();
        assert_eq!(sessions.current_index(), 1);
    }

    #[tokio::test]
    async fn launcher_needs_auth_file() {
        let registry = Arc::new(ConnectionRegistry::new());
        let sessions = LauncherSessionManager::new(
            registry,
            Arc::new(StaticAccountDirectory::new([0, 1])),
            Some(LauncherConfig {
                command: "true".to_string(),
                args: Vec::new(),
                ready_timeout_ms: 10,
            }),
            "ws://127.0.0.1:7860/ws".to_string(),
            0,
        );
        assert!(matches!(
            sessions.ensure_channel_for(1).await,
            Err(SessionError::UnknownAccount(1))
        ));
    }
}
