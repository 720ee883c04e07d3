//! # Pairing Authority
//!
//! The Bluetooth daemon asks a registered agent object to approve every
//! pairing and service authorization. A console expects those prompts to be
//! accepted silently, so the only agent we ship accepts everything and hands
//! out the default legacy PIN.
//!
//! [`PairingAuthority`] owns the agent and its registration lifecycle:
//! registering twice is fine, unregistering never fails loudly, and peers are
//! marked trusted once their handshake completes so reconnects skip
//! authorization.

use super::adapter::{AdapterError, BluetoothAdapter};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const AGENT_PATH: &str = "/nxpad/agent";
pub const AGENT_CAPABILITY: &str = "NoInputNoOutput";
pub const DEFAULT_PIN_CODE: &str = "0000";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Request canceled")]
    Canceled,
}

/// Callback surface the daemon invokes on a registered agent
pub trait PairingAgent: Send + Sync {
    fn release(&self);

    fn authorize_service(&self, device: &str, uuid: &str) -> Result<(), AgentError>;

    fn request_pin_code(&self, device: &str) -> Result<String, AgentError>;

    fn request_passkey(&self, device: &str) -> Result<u32, AgentError>;

    fn display_passkey(&self, device: &str, passkey: u32, entered: u16);

    fn display_pin_code(&self, device: &str, pin_code: &str);

    fn request_confirmation(&self, device: &str, passkey: u32) -> Result<(), AgentError>;

    fn request_authorization(&self, device: &str) -> Result<(), AgentError>;

    fn cancel(&self);
}

/// Trust-on-first-use agent
#[derive(Debug, Default)]
pub struct AutoAcceptAgent;

impl PairingAgent for AutoAcceptAgent {
    fn release(&self) {
        debug!("Agent released");
    }

    fn authorize_service(&self, device: &str, uuid: &str) -> Result<(), AgentError> {
        debug!("AuthorizeService {} {}", device, uuid);
        Ok(())
    }

    fn request_pin_code(&self, device: &str) -> Result<String, AgentError> {
        debug!("RequestPinCode {}", device);
        Ok(DEFAULT_PIN_CODE.to_string())
    }

    fn request_passkey(&self, device: &str) -> Result<u32, AgentError> {
        debug!("RequestPasskey {}", device);
        Ok(0)
    }

    fn display_passkey(&self, device: &str, passkey: u32, entered: u16) {
        debug!("DisplayPasskey {} {:06} ({} entered)", device, passkey, entered);
    }

    fn display_pin_code(&self, device: &str, pin_code: &str) {
        debug!("DisplayPinCode {} {}", device, pin_code);
    }

    fn request_confirmation(&self, device: &str, passkey: u32) -> Result<(), AgentError> {
        debug!("RequestConfirmation {} {:06}", device, passkey);
        Ok(())
    }

    fn request_authorization(&self, device: &str) -> Result<(), AgentError> {
        debug!("RequestAuthorization {}", device);
        Ok(())
    }

    fn cancel(&self) {
        debug!("Pairing request canceled");
    }
}

/// A callback as it arrives from the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRequest {
    Release,
    AuthorizeService { device: String, uuid: String },
    RequestPinCode { device: String },
    RequestPasskey { device: String },
    DisplayPasskey { device: String, passkey: u32, entered: u16 },
    DisplayPinCode { device: String, pin_code: String },
    RequestConfirmation { device: String, passkey: u32 },
    RequestAuthorization { device: String },
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentReply {
    Accepted,
    PinCode(String),
    Passkey(u32),
    Rejected(AgentError),
}

/// Routes one daemon callback to the agent
pub fn dispatch(agent: &dyn PairingAgent, request: AgentRequest) -> AgentReply {
    let result = match request {
        AgentRequest::Release => {
            agent.release();
            Ok(AgentReply::Accepted)
        }
        AgentRequest::AuthorizeService { device, uuid } => agent
            .authorize_service(&device, &uuid)
            .map(|_| AgentReply::Accepted),
        AgentRequest::RequestPinCode { device } => {
            agent.request_pin_code(&device).map(AgentReply::PinCode)
        }
        AgentRequest::RequestPasskey { device } => {
            agent.request_passkey(&device).map(AgentReply::Passkey)
        }
        AgentRequest::DisplayPasskey {
            device,
            passkey,
            entered,
        } => {
            agent.display_passkey(&device, passkey, entered);
            Ok(AgentReply::Accepted)
        }
        AgentRequest::DisplayPinCode { device, pin_code } => {
            agent.display_pin_code(&device, &pin_code);
            Ok(AgentReply::Accepted)
        }
        AgentRequest::RequestConfirmation { device, passkey } => agent
            .request_confirmation(&device, passkey)
            .map(|_| AgentReply::Accepted),
        AgentRequest::RequestAuthorization { device } => agent
            .request_authorization(&device)
            .map(|_| AgentReply::Accepted),
        AgentRequest::Cancel => {
            agent.cancel();
            Ok(AgentReply::Accepted)
        }
    };
    result.unwrap_or_else(AgentReply::Rejected)
}

/// Owns the agent and tracks which adapters it is registered on
pub struct PairingAuthority {
    agent: Arc<dyn PairingAgent>,
    registered: Mutex<HashSet<String>>,
}

impl PairingAuthority {
    pub fn new(agent: Arc<dyn PairingAgent>) -> Self {
        Self {
            agent,
            registered: Mutex::new(HashSet::new()),
        }
    }

    pub fn auto_accept() -> Self {
        Self::new(Arc::new(AutoAcceptAgent))
    }

    /// Registers the agent as the adapter's default. An existing registration counts as success.
    pub async fn register(&self, adapter: &dyn BluetoothAdapter) -> Result<(), AdapterError> {
        match adapter
            .register_agent(AGENT_PATH, AGENT_CAPABILITY, self.agent.clone())
            .await
        {
            Ok(()) => info!("Pairing agent registered on {}", adapter.id()),
            Err(AdapterError::AlreadyRegistered(_)) => {
                debug!("Pairing agent already registered on {}", adapter.id())
            }
            Err(e) => return Err(e),
        }
        self.registered.lock().await.insert(adapter.id().to_string());
        Ok(())
    }

    pub async fn is_registered(&self, adapter_id: &str) -> bool {
        self.registered.lock().await.contains(adapter_id)
    }

    /// Best-effort; failures are logged
    pub async fn unregister(&self, adapter: &dyn BluetoothAdapter) {
        if !self.registered.lock().await.remove(adapter.id()) {
            return;
        }
        if let Err(e) = adapter.unregister_agent(AGENT_PATH).await {
            warn!("Failed to unregister pairing agent on {}: {}", adapter.id(), e);
        }
        self.agent.release();
    }

    /// Marks a peer trusted after its handshake. Returns false if the adapter refused.
    pub async fn trust_peer(&self, adapter: &dyn BluetoothAdapter, address: &str) -> bool {
        match adapter.trust_device(address).await {
            Ok(()) => {
                info!("Trusted {} on {}", address, adapter.id());
                true
            }
            Err(e) => {
                warn!("Failed to trust {} on {}: {}", address, adapter.id(), e);
                false
            }
        }
    }

    pub fn handle(&self, request: AgentRequest) -> AgentReply {
        dispatch(self.agent.as_ref(), request)
    }
}
