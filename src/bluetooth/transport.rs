use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// L2CAP PSMs of the HID profile
pub const CONTROL_PSM: u16 = 17;
pub const INTERRUPT_PSM: u16 = 19;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Channel closed by peer")]
    Closed,

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Receive(String),
}

/// How the session reaches the console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectMode {
    /// Wait for a console to pair with us
    Listen,
    /// Dial a console we paired with before, in order
    Reconnect(Vec<String>),
}

/// One L2CAP channel
#[async_trait]
pub trait HidChannel: Send {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// `Ok(None)` when nothing arrived within `timeout`. A zero timeout polls.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError>;

    async fn close(&mut self);
}

/// Opens control + interrupt channel pairs
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, adapter_id: &str, mode: &ConnectMode) -> Result<Transport, TransportError>;
}

/// Control and interrupt channels to one console
pub struct Transport {
    peer: String,
    control: Box<dyn HidChannel>,
    interrupt: Box<dyn HidChannel>,
    sent: u64,
}

impl Transport {
    pub fn new(peer: String, control: Box<dyn HidChannel>, interrupt: Box<dyn HidChannel>) -> Self {
        Self {
            peer,
            control,
            interrupt,
            sent: 0,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn frames_sent(&self) -> u64 {
        self.sent
    }

    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.interrupt.send(bytes).await?;
        self.sent += 1;
        Ok(())
    }

    pub async fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        self.interrupt.receive(timeout).await
    }

    /// Surfaces a closed control channel; anything the console sends there is ignored
    pub async fn poll_control(&mut self) -> Result<(), TransportError> {
        while let Some(frame) = self.control.receive(Duration::ZERO).await? {
            debug!("Ignoring {} byte control frame from {}", frame.len(), self.peer);
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        self.interrupt.close().await;
        self.control.close().await;
    }
}
