// Account rotation - failure/usage accounting and the switch state machine

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use super::session::SessionManager;
use crate::auth::AccountDirectory;
use crate::config::AppConfig;
use crate::error::{RotationError, SessionError};

/// Process-wide rotation state. One instance, shared by reference.
///
/// `is_switching` implies `is_system_busy`; both are only ever set through
/// [`BusyGuard`], which clears them on drop.
#[derive(Debug, Default)]
pub struct RotationState {
    is_switching: AtomicBool,
    is_system_busy: AtomicBool,
    failure_count: AtomicU32,
    usage_count: AtomicU32,
}

impl RotationState {
    pub fn is_switching(&self) -> bool {
        self.is_switching.load(Ordering::SeqCst)
    }

    pub fn is_system_busy(&self) -> bool {
        self.is_system_busy.load(Ordering::SeqCst)
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    pub fn usage_count(&self) -> u32 {
        self.usage_count.load(Ordering::SeqCst)
    }

    fn reset_counters(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        self.usage_count.store(0, Ordering::SeqCst);
    }

    fn try_acquire(&self, switching: bool) -> Option<BusyGuard<'_>> {
        self.is_system_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        if switching {
            self.is_switching.store(true, Ordering::SeqCst);
        }
        Some(BusyGuard { state: self })
    }

    /// Take the gate for a channel recovery.
    pub fn try_begin_recovery(&self) -> Option<BusyGuard<'_>> {
        self.try_acquire(false)
    }

    /// Take the exclusive switch lock.
    pub fn try_begin_switch(&self) -> Option<BusyGuard<'_>> {
        self.try_acquire(true)
    }
}

pub struct BusyGuard<'a> {
    state: &'a RotationState,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.state.is_switching.store(false, Ordering::SeqCst);
        self.state.is_system_busy.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SwitchOutcome {
    pub previous: usize,
    pub current: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RotationSnapshot {
    pub current_index: usize,
    pub usage_count: u32,
    pub failure_count: u32,
    pub is_switching: bool,
    pub is_system_busy: bool,
}

enum Target {
    Next,
    Specific(usize),
}

/// Drives account switches against the session manager.
pub struct Rotator {
    state: RotationState,
    sessions: Arc<dyn SessionManager>,
    accounts: Arc<dyn AccountDirectory>,
}

impl Rotator {
    pub fn new(sessions: Arc<dyn SessionManager>, accounts: Arc<dyn AccountDirectory>) -> Self {
        Self {
            state: RotationState::default(),
            sessions,
            accounts,
        }
    }

    pub fn state(&self) -> &RotationState {
        &self.state
    }

    pub fn sessions(&self) -> &Arc<dyn SessionManager> {
        &self.sessions
    }

    pub fn accounts(&self) -> &Arc<dyn AccountDirectory> {
        &self.accounts
    }

    pub fn current_index(&self) -> usize {
        self.sessions.current_index()
    }

    pub fn snapshot(&self) -> RotationSnapshot {
        RotationSnapshot {
            current_index: self.current_index(),
            usage_count: self.state.usage_count(),
            failure_count: self.state.failure_count(),
            is_switching: self.state.is_switching(),
            is_system_busy: self.state.is_system_busy(),
        }
    }

    /// One synchronous attempt to bring the current account's channel back.
    ///
    /// Returns `Ok(false)` when the gate is already held by someone else.
    pub async fn recover(&self) -> Result<bool, SessionError> {
        let Some(_guard) = self.state.try_begin_recovery() else {
            return Ok(false);
        };
        let index = self.current_index();
        tracing::warn!("No live upstream channel, recovering account {}", index);
        self.sessions.ensure_channel_for(index).await?;
        tracing::info!("Recovered upstream channel for account {}", index);
        Ok(true)
    }

    pub async fn switch_to_next(&self) -> Result<SwitchOutcome, RotationError> {
        self.rotate(Target::Next).await
    }

    pub async fn switch_to_specific(&self, index: usize) -> Result<SwitchOutcome, RotationError> {
        self.rotate(Target::Specific(index)).await
    }

    fn next_index(&self, previous: usize) -> Result<usize, RotationError> {
        let usable = self.accounts.list_usable_indices();
        if usable.len() < 2 {
            return Err(RotationError::OnlyOneAccount);
        }
        let next = usable
            .iter()
            .copied()
            .find(|&i| i > previous)
            .unwrap_or(usable[0]);
        Ok(next)
    }

    async fn rotate(&self, target: Target) -> Result<SwitchOutcome, RotationError> {
        let Some(_guard) = self.state.try_begin_switch() else {
            tracing::info!("Account switch requested while another is in flight, ignoring");
            return Err(RotationError::Busy);
        };

        let previous = self.current_index();
        let next = match target {
            Target::Next => match self.next_index(previous) {
                Ok(next) => next,
                Err(e) => {
                    self.state.failure_count.store(0, Ordering::SeqCst);
                    tracing::warn!("Not switching accounts: {}", e);
                    return Err(e);
                }
            },
            Target::Specific(index) => {
                if !self.accounts.list_usable_indices().contains(&index) {
                    return Err(RotationError::InvalidAccount(index));
                }
                index
            }
        };

        tracing::info!(
            "Switching account {} ({}) -> {} ({})",
            previous,
            self.accounts.name_of(previous),
            next,
            self.accounts.name_of(next)
        );

        let reason = match self.sessions.ensure_channel_for(next).await {
            Ok(()) => {
                self.state.reset_counters();
                tracing::info!("Switched to account {}", next);
                return Ok(SwitchOutcome {
                    previous,
                    current: next,
                });
            }
            Err(e) => e.to_string(),
        };

        tracing::warn!(
            "Switch to account {} failed ({}), falling back to {}",
            next,
            reason,
            previous
        );
        match self.sessions.ensure_channel_for(previous).await {
            Ok(()) => {
                self.state.reset_counters();
                Err(RotationError::FallbackSucceeded {
                    target: next,
                    previous,
                    reason,
                })
            }
            Err(fallback) => {
                tracing::error!(
                    "Fallback to account {} failed ({}), upstream channel may be down",
                    previous,
                    fallback
                );
                Err(RotationError::FallbackFailed {
                    target: next,
                    previous,
                    reason,
                    fallback_reason: fallback.to_string(),
                })
            }
        }
    }

    /// Account for one failed request and rotate if it crosses a trigger.
    ///
    /// Returns a notice for the client when a rotation was attempted.
    pub async fn handle_request_failure(&self, status: u16, config: &AppConfig) -> Option<String> {
        let failures = self.state.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        let immediate = config.is_immediate_switch_status(status);
        let over_threshold = config.failure_threshold > 0 && failures >= config.failure_threshold;

        if !immediate && !over_threshold {
            tracing::info!(
                "Upstream failure {}/{} (status {})",
                failures,
                config.failure_threshold,
                status
            );
            return None;
        }

        if immediate {
            tracing::warn!("Status {} triggers an immediate account switch", status);
        } else {
            tracing::warn!("Failure threshold {} reached, switching account", config.failure_threshold);
        }

        let notice = match self.switch_to_next().await {
            Ok(outcome) => format!(
                "[relay] switched from account {} to account {}, please retry",
                outcome.previous, outcome.current
            ),
            Err(RotationError::Busy) => return None,
            Err(e) => format!("[relay] account switch attempted: {}", e),
        };
        Some(notice)
    }

    /// Account for one fully delivered request.
    ///
    /// Returns true when the usage threshold was reached and a rotation should
    /// run once the response has been sent.
    pub fn record_success(&self, is_generative: bool, config: &AppConfig) -> bool {
        if !is_generative {
            return false;
        }
        self.state.failure_count.store(0, Ordering::SeqCst);
        if config.switch_on_uses == 0 {
            return false;
        }
        let uses = self.state.usage_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("Account usage {}/{}", uses, config.switch_on_uses);
        uses >= config.switch_on_uses
    }

    /// Run a usage-triggered rotation in the background.
    pub fn spawn_deferred_rotation(self: &Arc<Self>) {
        let rotator = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!("Usage threshold reached, rotating account");
            match rotator.switch_to_next().await {
                Ok(outcome) => tracing::info!(
                    "Usage rotation moved account {} -> {}",
                    outcome.previous,
                    outcome.current
                ),
                Err(RotationError::Busy) => {}
                Err(e) => tracing::error!("Usage rotation failed: {}", e),
            }
        });
    }
}
