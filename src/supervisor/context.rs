//! # Supervisor Context
//!
//! Process-wide owner of the [`ControllerManager`] and of the recovery policy.
//!
//! ## Why This Module Exists
//! Callers (a web front end, a CLI, scripts) reach controller sessions through
//! a shared-state channel that can die independently of the sessions. The
//! context hides that: it creates the manager lazily, probes the channel
//! before touching session state, and rebuilds the manager a bounded number
//! of times when the channel is gone.
//!
//! ## Lifecycle
//! - The manager is created on first use, under a mutex, so concurrent first
//!   calls initialize exactly once.
//! - `reset()` tears the manager down (best effort) and counts a restart.
//!   Once `max_restarts` is spent every further reset fails and the context
//!   stays dead until the process restarts.
//! - Recreating a crashed *session* is not a restart and costs nothing.
//!
//! ## Reject vs. drop
//! Operations addressed at a missing or crashed session are rejected with a
//! specific error. Live input sent while the manager itself is dead is
//! dropped silently instead.

use super::error::SupervisorError;
use super::manager::{ControllerManager, Platform};
use super::state_service::StateSnapshot;
use super::SupervisorSettings;
use crate::controller::buttons::ControllerKind;
use crate::controller::input_engine::{Command, MacroId};
use crate::controller::session::{ConnectionState, SessionIndex};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerStatus {
    Alive,
    /// The channel was dead and the manager was rebuilt during this call
    Recovered,
    Dead(String),
}

/// Result of [`SupervisorContext::get_state`]
#[derive(Debug, Clone, Serialize)]
pub struct StateReport {
    pub status: ManagerStatus,
    pub sessions: StateSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionHealth {
    pub index: SessionIndex,
    pub exists: bool,
    pub state: Option<ConnectionState>,
    pub manager_dead: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub ok: bool,
    pub message: Option<String>,
    pub adapters: usize,
    pub restart_count: u32,
}

/// What happened to live input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The manager is dead; the input was dropped on purpose
    Discarded,
}

#[derive(Default)]
struct SupervisorState {
    manager: Option<Arc<ControllerManager>>,
    restart_count: u32,
    init_failed: Option<String>,
    exhausted: bool,
}

pub struct SupervisorContext {
    settings: SupervisorSettings,
    platform: Platform,
    inner: Mutex<SupervisorState>,
}

impl SupervisorContext {
    pub fn new(settings: SupervisorSettings, platform: Platform) -> Self {
        Self {
            settings,
            platform,
            inner: Mutex::new(SupervisorState::default()),
        }
    }

    pub async fn restart_count(&self) -> u32 {
        self.inner.lock().await.restart_count
    }

    /// The current manager without creating one
    pub async fn current_manager(&self) -> Option<Arc<ControllerManager>> {
        self.inner.lock().await.manager.clone()
    }

    /// Returns the manager, creating it on first use
    pub async fn manager(&self) -> Result<Arc<ControllerManager>, SupervisorError> {
        let mut inner = self.inner.lock().await;
        if inner.exhausted {
            return Err(SupervisorError::RestartLimitExceeded(self.settings.max_restarts));
        }
        if let Some(reason) = &inner.init_failed {
            return Err(SupervisorError::InitializationFailed(reason.clone()));
        }
        if let Some(manager) = &inner.manager {
            return Ok(manager.clone());
        }

        info!("Initializing controller manager");
        match ControllerManager::start(self.settings.clone(), self.platform.clone()).await {
            Ok(manager) => {
                let manager = Arc::new(manager);
                inner.manager = Some(manager.clone());
                Ok(manager)
            }
            Err(e) => {
                error!("Failed to initialize controller manager: {}", e);
                inner.init_failed = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// False when there is no manager or its channel is severed.
    /// A busy channel still counts as alive.
    pub async fn check_alive(&self) -> bool {
        let Some(manager) = self.current_manager().await else {
            return false;
        };
        match manager.probe().await {
            Ok(()) => true,
            Err(e) if e.is_severed() => {
                debug!("Manager probe failed: {}", e);
                false
            }
            Err(e) => {
                debug!("Manager probe inconclusive: {}", e);
                true
            }
        }
    }

    /// Tears the manager down and counts a restart. The next access recreates it.
    pub async fn reset(&self) -> Result<(), SupervisorError> {
        let (old, result) = {
            let mut inner = self.inner.lock().await;
            let old = inner.manager.take();
            if inner.restart_count >= self.settings.max_restarts {
                inner.exhausted = true;
                (old, Err(SupervisorError::RestartLimitExceeded(self.settings.max_restarts)))
            } else {
                inner.restart_count += 1;
                inner.init_failed = None;
                info!(
                    "Resetting controller manager ({}/{})",
                    inner.restart_count, self.settings.max_restarts
                );
                (old, Ok(()))
            }
        };

        // teardown happens outside the lock
        if let Some(manager) = old {
            manager.shutdown().await;
        }

        if let Err(e) = &result {
            error!("{}. Manual intervention required", e);
        }
        result
    }

    /// Manual recovery trigger: reset, then bring a fresh manager up
    pub async fn reset_supervisor(&self) -> Result<(), SupervisorError> {
        self.reset().await?;
        self.manager().await.map(|_| ())
    }

    /// Resets once and returns a manager whose channel answers
    async fn recover(&self) -> Result<Arc<ControllerManager>, SupervisorError> {
        warn!("Manager channel lost, attempting recovery");
        self.reset().await?;
        let manager = self.manager().await?;
        match manager.probe().await {
            Err(e) if e.is_severed() => Err(SupervisorError::ManagerDead(e.to_string())),
            _ => Ok(manager),
        }
    }

    /// Runs `op` against a live manager. A severed channel triggers one
    /// recovery and one retry before the manager is declared dead.
    async fn with_recovery<T, F, Fut>(&self, op: F) -> Result<T, SupervisorError>
    where
        F: Fn(Arc<ControllerManager>) -> Fut,
        Fut: Future<Output = Result<T, SupervisorError>>,
    {
        let mut recovered = false;
        let manager = self.manager().await?;
        let manager = if self.check_alive().await {
            manager
        } else {
            recovered = true;
            self.recover().await?
        };

        match op(manager).await {
            Err(e) if e.is_channel_failure() && !recovered => {
                let manager = self.recover().await?;
                op(manager).await.map_err(|e| {
                    if e.is_channel_failure() {
                        SupervisorError::ManagerDead(e.to_string())
                    } else {
                        e
                    }
                })
            }
            Err(e) if e.is_channel_failure() => Err(SupervisorError::ManagerDead(e.to_string())),
            other => other,
        }
    }

    /// Snapshot of every session. Never fails: a dead channel yields an empty snapshot.
    pub async fn get_state(&self) -> StateReport {
        let mut status = ManagerStatus::Alive;
        let manager = match self.manager().await {
            Ok(manager) => {
                if self.check_alive().await {
                    Ok(manager)
                } else {
                    let recovered = self.recover().await;
                    if recovered.is_ok() {
                        status = ManagerStatus::Recovered;
                    }
                    recovered
                }
            }
            Err(e) => Err(e),
        };

        match manager {
            Ok(manager) => match manager.state() {
                Ok(sessions) => StateReport { status, sessions },
                Err(e) => {
                    debug!("State unavailable: {}", e);
                    StateReport {
                        status,
                        sessions: StateSnapshot::new(),
                    }
                }
            },
            Err(e) => StateReport {
                status: ManagerStatus::Dead(e.to_string()),
                sessions: StateSnapshot::new(),
            },
        }
    }

    pub async fn check_session_health(&self, index: SessionIndex) -> SessionHealth {
        let dead = SessionHealth {
            index,
            exists: false,
            state: None,
            manager_dead: true,
        };
        if !self.check_alive().await {
            return dead;
        }
        let Some(manager) = self.current_manager().await else {
            return dead;
        };
        match manager.session_state(index) {
            Ok(snapshot) => SessionHealth {
                index,
                exists: snapshot.is_some(),
                state: snapshot.map(|s| s.state),
                manager_dead: false,
            },
            Err(_) => dead,
        }
    }

    /// Live input. Dropped silently while the manager is dead.
    pub async fn submit_command(
        &self,
        index: SessionIndex,
        command: Command,
    ) -> Result<Delivery, SupervisorError> {
        let Some(manager) = self.current_manager().await else {
            // nothing was ever created, so no session can exist
            return Err(SupervisorError::UnknownSession(index));
        };
        if !self.check_alive().await {
            debug!("Dropping input for session {}: manager dead", index);
            return Ok(Delivery::Discarded);
        }
        match manager.set_controller_input(index, command).await {
            Ok(()) => Ok(Delivery::Delivered),
            Err(e) if e.is_channel_failure() => {
                debug!("Dropping input for session {}: {}", index, e);
                Ok(Delivery::Discarded)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn submit_macro(&self, index: SessionIndex, text: &str) -> Result<MacroId, SupervisorError> {
        let text = Arc::new(text.to_string());
        self.with_recovery(|manager| {
            let text = text.clone();
            async move { manager.submit_macro(index, &text).await }
        })
        .await
    }

    pub async fn stop_macro(&self, index: SessionIndex, id: MacroId) -> Result<(), SupervisorError> {
        self.with_recovery(|manager| async move { manager.stop_macro(index, id).await })
            .await
    }

    /// Idempotent. Skips cleanup when the manager is dead.
    pub async fn remove_session(&self, index: SessionIndex) -> Result<bool, SupervisorError> {
        if !self.check_alive().await {
            debug!("Manager not alive, skipping removal of session {}", index);
            return Ok(false);
        }
        match self.current_manager().await {
            Some(manager) => manager.remove_controller(index).await,
            None => Ok(false),
        }
    }

    /// Replaces `previous` (if any) with a new session. Remembered consoles are
    /// dialed directly; without any the session waits to be paired.
    pub async fn create_session(
        &self,
        kind: ControllerKind,
        previous: Option<SessionIndex>,
    ) -> Result<SessionIndex, SupervisorError> {
        self.with_recovery(|manager| async move {
            if let Some(old) = previous {
                manager.remove_controller(old).await?;
            }
            let addresses = manager.get_switch_addresses().await;
            manager.create_controller(kind, None, addresses).await
        })
        .await
    }

    /// Like [`create_session`](Self::create_session) but refuses to fall back to pairing
    pub async fn reconnect_session(
        &self,
        kind: ControllerKind,
        previous: Option<SessionIndex>,
    ) -> Result<SessionIndex, SupervisorError> {
        self.with_recovery(|manager| async move {
            if let Some(old) = previous {
                manager.remove_controller(old).await?;
            }
            let addresses = manager.get_switch_addresses().await;
            if addresses.is_empty() {
                return Err(SupervisorError::NoRememberedConsole);
            }
            manager.create_controller(kind, None, addresses).await
        })
        .await
    }

    pub async fn health(&self) -> HealthReport {
        let restart_count = self.restart_count().await;
        match self.manager().await {
            Ok(manager) => HealthReport {
                ok: true,
                message: None,
                adapters: manager.get_available_adapters().len(),
                restart_count,
            },
            Err(e) => HealthReport {
                ok: false,
                message: Some(e.to_string()),
                adapters: 0,
                restart_count,
            },
        }
    }

    /// Tears down the manager; the context can still be used afterwards
    pub async fn shutdown(&self) {
        let manager = self.inner.lock().await.manager.take();
        if let Some(manager) = manager {
            manager.shutdown().await;
        }
        info!("Supervisor shut down");
    }
}
