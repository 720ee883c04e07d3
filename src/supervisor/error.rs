//! Error kinds surfaced to callers of the manager and supervisor

use super::state_service::ChannelError;
use crate::bluetooth::AdapterError;
use crate::controller::macro_parser::MacroParseError;
use crate::controller::session::SessionIndex;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// No session at this index
    #[error("Unknown session: {0}")]
    UnknownSession(SessionIndex),

    /// The session's socket failed; it must be recreated
    #[error("Session {0} has crashed")]
    SessionCrashed(SessionIndex),

    /// The session's task has ended without crashing (timeout or cancellation)
    #[error("Session {0} has stopped")]
    SessionStopped(SessionIndex),

    /// The session's request queue is full
    #[error("Session {0} is busy")]
    SessionBusy(SessionIndex),

    #[error("Macro rejected: {0}")]
    Parse(#[from] MacroParseError),

    #[error("Connection timed out")]
    ConnectionTimeout,

    #[error("No adapter available: {0}")]
    NoAdapter(String),

    #[error("Adapter {0} already drives a controller")]
    AdapterBusy(String),

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("No remembered console to reconnect to")]
    NoRememberedConsole,

    #[error("State channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Manager initialization failed: {0}")]
    InitializationFailed(String),

    /// Recovery was attempted and the manager is still unreachable
    #[error("Manager is dead: {0}")]
    ManagerDead(String),

    /// Terminal: no further automatic recovery
    #[error("Restart limit of {0} exceeded")]
    RestartLimitExceeded(u32),
}

impl SupervisorError {
    /// Failures that a manager reset may cure
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, SupervisorError::Channel(err) if err.is_severed())
    }
}
