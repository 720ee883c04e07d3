//! In-memory console link
//!
//! `LoopbackFactory` hands the session one end of a channel pair and publishes
//! the other end as a [`ConsoleEndpoint`], which plays the console: it sends
//! subcommands, reads reports and can sever the link.

use super::transport::{
    ConnectMode, HidChannel, Transport, TransportError, TransportFactory, CONTROL_PSM,
    INTERRUPT_PSM,
};
use crate::controller::protocol::{self, REPORT_STANDARD, REPORT_SUBCOMMAND_REPLY};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

pub const DEFAULT_CONSOLE_ADDRESS: &str = "98:B6:E9:00:00:01";

struct LoopbackChannel {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl HidChannel for LoopbackChannel {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(bytes.to_vec()).map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        if timeout.is_zero() {
            return match self.rx.try_recv() {
                Ok(frame) => Ok(Some(frame)),
                Err(mpsc::error::TryRecvError::Empty) => Ok(None),
                Err(mpsc::error::TryRecvError::Disconnected) => Err(TransportError::Closed),
            };
        }
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}

fn channel_pair() -> (LoopbackChannel, (mpsc::UnboundedSender<Vec<u8>>, mpsc::UnboundedReceiver<Vec<u8>>)) {
    let (to_console, from_controller) = mpsc::unbounded_channel();
    let (to_controller, from_console) = mpsc::unbounded_channel();
    (
        LoopbackChannel {
            tx: Some(to_console),
            rx: from_console,
        },
        (to_controller, from_controller),
    )
}

/// The console's side of a loopback link
pub struct ConsoleEndpoint {
    address: String,
    adapter_id: String,
    _control: (mpsc::UnboundedSender<Vec<u8>>, mpsc::UnboundedReceiver<Vec<u8>>),
    interrupt_tx: mpsc::UnboundedSender<Vec<u8>>,
    interrupt_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    timer: u8,
}

impl ConsoleEndpoint {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    pub fn send_raw(&self, frame: Vec<u8>) -> bool {
        self.interrupt_tx.send(frame).is_ok()
    }

    pub fn send_subcommand(&mut self, id: u8, data: &[u8]) -> bool {
        let frame = protocol::subcommand_frame(self.timer, id, data);
        self.timer = self.timer.wrapping_add(1);
        self.send_raw(frame)
    }

    /// Next frame from the controller, `None` once the link is gone or `timeout` passes
    pub async fn next_frame(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        tokio::time::timeout(timeout, self.interrupt_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next standard input report, skipping subcommand replies
    pub async fn next_report(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let frame = self.next_frame(remaining).await?;
            if frame.get(1) == Some(&REPORT_STANDARD) {
                return Some(frame);
            }
        }
    }

    /// Everything the controller has sent so far
    pub fn drain_frames(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.interrupt_rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Sends a subcommand and waits for its `0x21` reply
    pub async fn request(&mut self, id: u8, data: &[u8], timeout: Duration) -> Option<Vec<u8>> {
        if !self.send_subcommand(id, data) {
            return None;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let frame = self.next_frame(remaining).await?;
            if frame.get(1) == Some(&REPORT_SUBCOMMAND_REPLY) && frame.get(15) == Some(&id) {
                return Some(frame);
            }
        }
    }

    /// Runs the console's side of the pairing exchange, ending with player lights
    pub async fn complete_handshake(&mut self, timeout: Duration) -> bool {
        let sequence: [(u8, &[u8]); 7] = [
            (protocol::SUBCMD_DEVICE_INFO, &[]),
            (protocol::SUBCMD_SHIPMENT, &[0x00]),
            (protocol::SUBCMD_SPI_READ, &[0x00, 0x60, 0x00, 0x00, 0x10]),
            (protocol::SUBCMD_SPI_READ, &[0x50, 0x60, 0x00, 0x00, 0x0D]),
            (protocol::SUBCMD_SET_INPUT_MODE, &[0x30]),
            (protocol::SUBCMD_TRIGGER_ELAPSED, &[]),
            (protocol::SUBCMD_PLAYER_LIGHTS, &[0x01]),
        ];
        for (id, data) in sequence {
            if self.request(id, data, timeout).await.is_none() {
                debug!("Console handshake stalled at subcommand 0x{:02X}", id);
                return false;
            }
        }
        true
    }

    /// Drops the console's ends; the controller sees a closed socket
    pub fn sever(self) {
        debug!("Severing loopback link to {}", self.address);
    }
}

/// Hands out loopback links and publishes the console ends
pub struct LoopbackFactory {
    console_address: String,
    consoles: mpsc::UnboundedSender<ConsoleEndpoint>,
    stalled: bool,
}

impl LoopbackFactory {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConsoleEndpoint>) {
        let (consoles, rx) = mpsc::unbounded_channel();
        (
            Self {
                console_address: DEFAULT_CONSOLE_ADDRESS.to_string(),
                consoles,
                stalled: false,
            },
            rx,
        )
    }

    pub fn with_console_address(mut self, address: &str) -> Self {
        self.console_address = super::normalize_address(address);
        self
    }

    /// A factory whose connects never complete
    pub fn stalled() -> Self {
        let (factory, _rx) = Self::new();
        Self {
            stalled: true,
            ..factory
        }
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn connect(&self, adapter_id: &str, mode: &ConnectMode) -> Result<Transport, TransportError> {
        if self.stalled {
            std::future::pending::<()>().await;
        }

        let peer = match mode {
            ConnectMode::Listen => self.console_address.clone(),
            ConnectMode::Reconnect(addresses) => addresses
                .first()
                .map(|a| super::normalize_address(a))
                .ok_or_else(|| TransportError::ConnectionFailed("no reconnect address".into()))?,
        };

        let (control, (control_tx, control_rx)) = channel_pair();
        let (interrupt, (interrupt_tx, interrupt_rx)) = channel_pair();
        let console = ConsoleEndpoint {
            address: peer.clone(),
            adapter_id: adapter_id.to_string(),
            _control: (control_tx, control_rx),
            interrupt_tx,
            interrupt_rx,
            timer: 0,
        };
        self.consoles
            .send(console)
            .map_err(|_| TransportError::ConnectionFailed("console side dropped".into()))?;

        debug!(
            "Loopback link {} <-> {} (psm {}/{})",
            adapter_id, peer, CONTROL_PSM, INTERRUPT_PSM
        );
        Ok(Transport::new(peer, Box::new(control), Box::new(interrupt)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::buttons::{ControllerKind, InputPayload};

    #[tokio::test]
    async fn frames_cross_the_link() {
        let (factory, mut consoles) = LoopbackFactory::new();
        let mut transport = factory.connect("hci0", &ConnectMode::Listen).await.unwrap();
        let mut console = consoles.recv().await.unwrap();
        assert_eq!(transport.peer(), DEFAULT_CONSOLE_ADDRESS);

        let report = protocol::input_report(0, ControllerKind::ProController, &InputPayload::NEUTRAL);
        transport.send(&report).await.unwrap();
        assert_eq!(console.next_report(Duration::from_secs(1)).await, Some(report));

        console.send_subcommand(protocol::SUBCMD_PLAYER_LIGHTS, &[0x01]);
        let frame = transport.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(frame[11], protocol::SUBCMD_PLAYER_LIGHTS);
    }

    #[tokio::test]
    async fn severed_link_fails_both_directions() {
        let (factory, mut consoles) = LoopbackFactory::new();
        let mut transport = factory.connect("hci0", &ConnectMode::Listen).await.unwrap();
        consoles.recv().await.unwrap().sever();

        assert_eq!(transport.send(&[0xA1]).await, Err(TransportError::Closed));
        assert_eq!(
            transport.receive(Duration::ZERO).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn reconnect_dials_first_address() {
        let (factory, mut consoles) = LoopbackFactory::new();
        let mode = ConnectMode::Reconnect(vec!["aa:bb:cc:dd:ee:ff".into()]);
        let transport = factory.connect("hci1", &mode).await.unwrap();
        let console = consoles.recv().await.unwrap();
        assert_eq!(transport.peer(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(console.adapter_id(), "hci1");

        let empty = ConnectMode::Reconnect(Vec::new());
        assert!(factory.connect("hci1", &empty).await.is_err());
    }
}
