use super::normalize_address;
use super::pairing::{dispatch, AgentReply, AgentRequest, PairingAgent};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("Agent already registered at {0}")]
    AlreadyRegistered(String),

    #[error("Object does not exist: {0}")]
    DoesNotExist(String),

    #[error("Operation not permitted: {0}")]
    NotPermitted(String),

    #[error("Adapter operation failed: {0}")]
    Failed(String),
}

/// A device the adapter knows about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: String,
    pub name: String,
    pub paired: bool,
    pub trusted: bool,
}

/// Host Bluetooth adapter as exposed by the platform's Bluetooth daemon
#[async_trait]
pub trait BluetoothAdapter: Send + Sync {
    fn id(&self) -> &str;

    async fn address(&self) -> Result<String, AdapterError>;

    /// Address the adapter had before we changed it
    async fn original_address(&self) -> Result<String, AdapterError>;

    async fn set_address(&self, address: &str) -> Result<(), AdapterError>;

    async fn set_alias(&self, alias: &str) -> Result<(), AdapterError>;

    async fn set_device_class(&self, class: &str) -> Result<(), AdapterError>;

    async fn set_discoverable(&self, discoverable: bool) -> Result<(), AdapterError>;

    async fn set_pairable(&self, pairable: bool) -> Result<(), AdapterError>;

    async fn devices(&self) -> Result<Vec<DeviceInfo>, AdapterError>;

    async fn trust_device(&self, address: &str) -> Result<(), AdapterError>;

    async fn register_agent(
        &self,
        path: &str,
        capability: &str,
        agent: Arc<dyn PairingAgent>,
    ) -> Result<(), AdapterError>;

    async fn unregister_agent(&self, path: &str) -> Result<(), AdapterError>;
}

struct SimulatedState {
    address: String,
    alias: String,
    device_class: String,
    discoverable: bool,
    pairable: bool,
    devices: Vec<DeviceInfo>,
    agents: HashMap<String, Arc<dyn PairingAgent>>,
    failing: bool,
}

/// In-memory adapter. Mirrors the daemon's behavior closely enough for the
/// session and supervisor logic, including "already registered" errors.
pub struct SimulatedAdapter {
    id: String,
    original_address: String,
    state: Mutex<SimulatedState>,
}

impl SimulatedAdapter {
    pub fn new(id: impl Into<String>, address: &str) -> Self {
        let address = normalize_address(address);
        Self {
            id: id.into(),
            original_address: address.clone(),
            state: Mutex::new(SimulatedState {
                address,
                alias: String::new(),
                device_class: String::new(),
                discoverable: false,
                pairable: false,
                devices: Vec::new(),
                agents: HashMap::new(),
                failing: false,
            }),
        }
    }

    pub fn with_device(mut self, address: &str, name: &str, paired: bool) -> Self {
        self.state.get_mut().devices.push(DeviceInfo {
            address: normalize_address(address),
            name: name.to_string(),
            paired,
            trusted: false,
        });
        self
    }

    /// Makes every mutating operation fail from now on
    pub async fn set_failing(&self, failing: bool) {
        self.state.lock().await.failing = failing;
    }

    pub async fn alias(&self) -> String {
        self.state.lock().await.alias.clone()
    }

    pub async fn device_class(&self) -> String {
        self.state.lock().await.device_class.clone()
    }

    pub async fn is_discoverable(&self) -> bool {
        self.state.lock().await.discoverable
    }

    pub async fn is_pairable(&self) -> bool {
        self.state.lock().await.pairable
    }

    pub async fn has_agent(&self, path: &str) -> bool {
        self.state.lock().await.agents.contains_key(path)
    }

    pub async fn trusted_devices(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .devices
            .iter()
            .filter(|device| device.trusted)
            .map(|device| device.address.clone())
            .collect()
    }

    /// Plays the daemon's side of a console pairing against the registered agent
    pub async fn simulate_pairing(&self, console: &str) -> Result<Vec<AgentReply>, AdapterError> {
        let agent = {
            let state = self.state.lock().await;
            state
                .agents
                .values()
                .next()
                .cloned()
                .ok_or_else(|| AdapterError::DoesNotExist("no agent registered".into()))?
        };

        let device = normalize_address(console);
        let replies = vec![
            dispatch(
                agent.as_ref(),
                AgentRequest::RequestConfirmation {
                    device: device.clone(),
                    passkey: 0,
                },
            ),
            dispatch(
                agent.as_ref(),
                AgentRequest::AuthorizeService {
                    device: device.clone(),
                    uuid: "00001124-0000-1000-8000-00805f9b34fb".into(),
                },
            ),
        ];

        let mut state = self.state.lock().await;
        if !state.devices.iter().any(|d| d.address == device) {
            state.devices.push(DeviceInfo {
                address: device,
                name: "Nintendo Switch".into(),
                paired: true,
                trusted: false,
            });
        }
        Ok(replies)
    }

    fn check(&self, failing: bool, op: &str) -> Result<(), AdapterError> {
        if failing {
            return Err(AdapterError::Failed(format!("{} on {}", op, self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl BluetoothAdapter for SimulatedAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn address(&self) -> Result<String, AdapterError> {
        Ok(self.state.lock().await.address.clone())
    }

    async fn original_address(&self) -> Result<String, AdapterError> {
        Ok(self.original_address.clone())
    }

    async fn set_address(&self, address: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        self.check(state.failing, "set_address")?;
        if super::parse_address(address).is_none() {
            return Err(AdapterError::Failed(format!("invalid address {}", address)));
        }
        debug!("[{}] address {} -> {}", self.id, state.address, address);
        state.address = normalize_address(address);
        Ok(())
    }

    async fn set_alias(&self, alias: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        self.check(state.failing, "set_alias")?;
        state.alias = alias.to_string();
        Ok(())
    }

    async fn set_device_class(&self, class: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        self.check(state.failing, "set_device_class")?;
        state.device_class = class.to_string();
        Ok(())
    }

    async fn set_discoverable(&self, discoverable: bool) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        self.check(state.failing, "set_discoverable")?;
        state.discoverable = discoverable;
        Ok(())
    }

    async fn set_pairable(&self, pairable: bool) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        self.check(state.failing, "set_pairable")?;
        state.pairable = pairable;
        Ok(())
    }

    async fn devices(&self) -> Result<Vec<DeviceInfo>, AdapterError> {
        Ok(self.state.lock().await.devices.clone())
    }

    async fn trust_device(&self, address: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        self.check(state.failing, "trust_device")?;
        let address = normalize_address(address);
        match state.devices.iter_mut().find(|d| d.address == address) {
            Some(device) => {
                device.trusted = true;
                Ok(())
            }
            None => {
                // Consoles that connect without pairing first still get an entry
                state.devices.push(DeviceInfo {
                    address,
                    name: "Nintendo Switch".into(),
                    paired: true,
                    trusted: true,
                });
                Ok(())
            }
        }
    }

    async fn register_agent(
        &self,
        path: &str,
        _capability: &str,
        agent: Arc<dyn PairingAgent>,
    ) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        self.check(state.failing, "register_agent")?;
        if state.agents.contains_key(path) {
            return Err(AdapterError::AlreadyRegistered(path.to_string()));
        }
        state.agents.insert(path.to_string(), agent);
        Ok(())
    }

    async fn unregister_agent(&self, path: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        match state.agents.remove(path) {
            Some(_) => Ok(()),
            None => Err(AdapterError::DoesNotExist(path.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn address_changes_keep_original() {
        let adapter = SimulatedAdapter::new("hci0", "dc:a6:32:00:00:01");
        adapter.set_address("7C:BB:8A:11:22:33").await.unwrap();
        assert_eq!(adapter.address().await.unwrap(), "7C:BB:8A:11:22:33");
        assert_eq!(adapter.original_address().await.unwrap(), "DC:A6:32:00:00:01");
        assert!(adapter.set_address("not-an-address").await.is_err());
    }

    #[tokio::test]
    async fn failing_adapter_rejects_mutations() {
        let adapter = SimulatedAdapter::new("hci0", "DC:A6:32:00:00:01");
        adapter.set_failing(true).await;
        assert!(matches!(
            adapter.set_discoverable(true).await,
            Err(AdapterError::Failed(_))
        ));
        assert!(!adapter.is_discoverable().await);
    }

    #[tokio::test]
    async fn trust_marks_known_devices() {
        let adapter = SimulatedAdapter::new("hci0", "DC:A6:32:00:00:01").with_device(
            "98:b6:e9:00:00:01",
            "Nintendo Switch",
            true,
        );
        adapter.trust_device("98:B6:E9:00:00:01").await.unwrap();
        assert_eq!(adapter.trusted_devices().await, vec!["98:B6:E9:00:00:01"]);
    }
}
