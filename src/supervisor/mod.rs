//! Supervision of controller sessions
//!
//! - [`state_service`] - shared-state channel between sessions and callers
//! - [`manager`] - creates, tracks and tears down sessions
//! - [`context`] - owns the manager, detects a dead channel and restarts it
//!
//! ```text
//! caller ──► SupervisorContext ──► ControllerManager ──► session tasks
//!                  │                      │                    │
//!                  └──── probe ──► StateService ◄── publish ───┘
//! ```

pub mod context;
pub mod error;
pub mod manager;
pub mod state_service;

pub use context::{Delivery, HealthReport, ManagerStatus, SessionHealth, StateReport, SupervisorContext};
pub use error::SupervisorError;
pub use manager::{ControllerManager, Platform};
pub use state_service::{ChannelError, SeverKind, StateClient, StateService, StateSnapshot};

use crate::controller::input_engine::EngineSettings;
use crate::controller::session::SessionSettings;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub session: SessionSettings,
    pub engine: EngineSettings,
    /// Manager resets allowed before recovery gives up for good
    pub max_restarts: u32,
    /// How long a liveness probe may wait for the state worker
    pub probe_timeout: Duration,
    pub state_channel_capacity: usize,
    pub request_channel_capacity: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            engine: EngineSettings::default(),
            max_restarts: 3,
            probe_timeout: Duration::from_millis(500),
            state_channel_capacity: 256,
            request_channel_capacity: 64,
        }
    }
}
