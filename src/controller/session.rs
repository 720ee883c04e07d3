//! Controller session with statum state machine for the console handshake
//!
//! One session drives one emulated controller on one adapter. It runs in its
//! own tokio task and is reached only through its request channel, its
//! cancellation token and the snapshots it publishes.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──► PairingWait ──► Paired ──► Connected ──► Active
//!   (prepare)       (accept)      (handshake)  (activate)    (run)
//! ```
//!
//! Every transition consumes the session. A failure publishes the final
//! connection state before the error is returned:
//! - connect or handshake timeout, or cancellation: `disconnected`
//! - any socket error: `crashed` (the session never restarts itself)

use super::buttons::{ControllerKind, InputPayload};
use super::input_engine::{Command, EngineSettings, EngineState, InputEngine, MacroId};
use super::macro_parser::MacroStep;
use super::protocol::{self, OutputReport};
use super::report_scheduler::ReportScheduler;
use crate::bluetooth::{
    parse_address, random_controller_address, BluetoothAdapter, ConnectMode, PairingAuthority,
    Transport, TransportError, TransportFactory,
};
use crate::persistence::ConnectionStore;
use crate::supervisor::state_service::{ChannelError, StateClient};
use chrono::{DateTime, Local};
use serde::Serialize;
use statum::{machine, state};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type SessionIndex = u8;

const STATS_INTERVAL: Duration = Duration::from_secs(30);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    PairingWait,
    Paired,
    Connected,
    Active,
    Crashed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Active)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::PairingWait => "pairing_wait",
            ConnectionState::Paired => "paired",
            ConnectionState::Connected => "connected",
            ConnectionState::Active => "active",
            ConnectionState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// What a session publishes about itself
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub index: SessionIndex,
    pub kind: ControllerKind,
    pub adapter_id: String,
    pub state: ConnectionState,
    pub engine_state: EngineState,
    pub tick_counter: u64,
    pub finished_macros: Vec<MacroId>,
    pub errors: Option<String>,
    pub last_connection: Option<String>,
    pub updated_at: DateTime<Local>,
}

impl SessionSnapshot {
    pub fn new(index: SessionIndex, kind: ControllerKind, adapter_id: &str) -> Self {
        Self {
            index,
            kind,
            adapter_id: adapter_id.to_string(),
            state: ConnectionState::Disconnected,
            engine_state: EngineState::Idle,
            tick_counter: 0,
            finished_macros: Vec::new(),
            errors: None,
            last_connection: None,
            updated_at: Local::now(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("No console connected within {0:?}")]
    ConnectionTimeout(Duration),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session cancelled")]
    Cancelled,
}

impl SessionError {
    fn final_state(&self) -> ConnectionState {
        match self {
            SessionError::Transport(_) => ConnectionState::Crashed,
            SessionError::ConnectionTimeout(_) | SessionError::Cancelled => {
                ConnectionState::Disconnected
            }
        }
    }
}

/// Work submitted to a running session
#[derive(Debug)]
pub enum SessionRequest {
    Command(Command),
    Macro { id: MacroId, steps: Vec<MacroStep> },
    StopMacro(MacroId),
    ClearMacros,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub tick_interval: Duration,
    pub max_transmit_gap: Duration,
    pub connect_timeout: Duration,
    pub handshake_quiet: Duration,
    pub subcommand_budget: usize,
    pub assign_controller_mac: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(15),
            max_transmit_gap: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(30),
            handshake_quiet: Duration::from_secs(1),
            subcommand_budget: 8,
            assign_controller_mac: false,
        }
    }
}

/// Platform handles a session works with
#[derive(Clone)]
pub struct SessionDeps {
    pub adapter: Arc<dyn BluetoothAdapter>,
    pub transports: Arc<dyn TransportFactory>,
    pub authority: Arc<PairingAuthority>,
    pub store: ConnectionStore,
    pub state: StateClient,
}

/// Handshake progress of a session
#[state]
#[derive(Debug, Clone)]
pub enum HandshakeState {
    Disconnected, // adapter not yet prepared
    PairingWait,  // discoverable, waiting for the console
    Paired,       // channels open, subcommand exchange pending
    Connected,    // console finished its handshake
    Active,       // report loop running
}

/// One emulated controller, typestated by handshake progress
#[machine]
pub struct ControllerSession<S: HandshakeState> {
    index: SessionIndex,
    kind: ControllerKind,
    mode: ConnectMode,
    settings: SessionSettings,
    deps: SessionDeps,
    requests: mpsc::Receiver<SessionRequest>,
    shutdown: CancellationToken,
    engine: InputEngine,
    scheduler: ReportScheduler,
    transport: Option<Transport>,
    controller_mac: [u8; 6],
    snapshot: SessionSnapshot,
    channel_warned: bool,
}

impl<S: HandshakeState> ControllerSession<S> {
    pub fn index(&self) -> SessionIndex {
        self.index
    }

    fn adapter_id(&self) -> &str {
        self.deps.adapter.id()
    }

    fn publish(&mut self, state: ConnectionState) {
        self.snapshot.state = state;
        self.publish_snapshot();
    }

    fn publish_snapshot(&mut self) {
        self.snapshot.engine_state = self.engine.state();
        self.snapshot.tick_counter = self.scheduler.tick_counter();
        self.snapshot.updated_at = Local::now();
        match self.deps.state.publish(self.snapshot.clone()) {
            Ok(()) => self.channel_warned = false,
            Err(ChannelError::Busy) => debug!("[{}] State channel busy, snapshot skipped", self.index),
            Err(e) => {
                // the channel can die without us; keep driving the controller
                if !self.channel_warned {
                    warn!("[{}] Could not publish state: {}", self.index, e);
                    self.channel_warned = true;
                }
            }
        }
    }

    async fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
            debug!("[{}] Closed channels to {}", self.index, transport.peer());
        }
    }

    /// Publishes the terminal state for `err` and releases the channels
    async fn fail(&mut self, err: &SessionError) {
        match err {
            SessionError::Transport(_) => error!("[{}] Session crashed: {}", self.index, err),
            SessionError::ConnectionTimeout(_) => warn!("[{}] {}", self.index, err),
            SessionError::Cancelled => info!("[{}] Session cancelled", self.index),
        }
        self.close_transport().await;
        if *err != SessionError::Cancelled {
            self.snapshot.errors = Some(err.to_string());
        }
        self.publish(err.final_state());
    }

    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), SessionError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(SessionError::Transport(TransportError::Closed))?;
        transport.send(frame).await?;
        Ok(())
    }

    async fn reply_to_subcommand(&mut self, id: u8, data: &[u8]) -> Result<(), SessionError> {
        let (ack, reply_data) = protocol::handle_subcommand(self.kind, self.controller_mac, id, data);
        let timer = self.scheduler.next_timer();
        let frame = protocol::subcommand_reply(
            timer,
            self.kind,
            &self.engine.current_payload(),
            ack,
            id,
            &reply_data,
        );
        debug!("[{}] Subcommand 0x{:02X} -> ack 0x{:02X}", self.index, id, ack);
        self.send_frame(&frame).await
    }
}

impl ControllerSession<Disconnected> {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        index: SessionIndex,
        kind: ControllerKind,
        mode: ConnectMode,
        settings: SessionSettings,
        engine_settings: EngineSettings,
        deps: SessionDeps,
        requests: mpsc::Receiver<SessionRequest>,
        shutdown: CancellationToken,
    ) -> Self {
        info!("[{}] Creating {} session on {}", index, kind, deps.adapter.id());
        let snapshot = SessionSnapshot::new(index, kind, deps.adapter.id());
        let scheduler = ReportScheduler::new(kind, settings.max_transmit_gap);

        Self::new(
            index,
            kind,
            mode,
            settings,
            deps,
            requests,
            shutdown,
            InputEngine::new(kind, engine_settings),
            scheduler,
            None,     // transport
            [0u8; 6], // controller_mac
            snapshot,
            false, // channel_warned
        )
    }

    /// Restores the controller address and makes the adapter look like a controller
    pub async fn prepare(mut self) -> ControllerSession<PairingWait> {
        let adapter = self.deps.adapter.clone();
        self.restore_address(adapter.as_ref()).await;

        if let Err(e) = adapter.set_alias(self.kind.name()).await {
            warn!("[{}] Failed to set alias: {}", self.index, e);
        }
        if let Err(e) = adapter.set_device_class(self.kind.device_class()).await {
            warn!("[{}] Failed to set device class: {}", self.index, e);
        }
        if self.mode == ConnectMode::Listen {
            if let Err(e) = adapter.set_pairable(true).await {
                warn!("[{}] Failed to make adapter pairable: {}", self.index, e);
            }
            if let Err(e) = adapter.set_discoverable(true).await {
                warn!("[{}] Failed to make adapter discoverable: {}", self.index, e);
            }
        }
        if let Err(e) = self.deps.authority.register(adapter.as_ref()).await {
            warn!("[{}] Pairing agent unavailable: {}", self.index, e);
        }

        self.controller_mac = match adapter.address().await {
            Ok(address) => parse_address(&address).unwrap_or_default(),
            Err(e) => {
                warn!("[{}] Could not read adapter address: {}", self.index, e);
                [0u8; 6]
            }
        };

        self.publish(ConnectionState::PairingWait);
        self.transition()
    }

    async fn restore_address(&mut self, adapter: &dyn BluetoothAdapter) {
        let target = match self.deps.store.get_assigned_mac(adapter.id()).await {
            Some(mac) => mac,
            None if self.settings.assign_controller_mac && self.mode == ConnectMode::Listen => {
                random_controller_address()
            }
            None => return,
        };

        match adapter.address().await {
            Ok(current) if current == target => {
                debug!("[{}] Adapter already at {}", self.index, target)
            }
            _ => match adapter.set_address(&target).await {
                Ok(()) => info!("[{}] Controller address set to {}", self.index, target),
                Err(e) => warn!("[{}] Failed to set address {}: {}", self.index, target, e),
            },
        }
    }
}

impl ControllerSession<PairingWait> {
    /// Waits for the console, bounded by the connect timeout
    pub async fn accept(mut self) -> Result<ControllerSession<Paired>, SessionError> {
        let timeout = self.settings.connect_timeout;
        info!(
            "[{}] Waiting up to {:?} for console ({:?})",
            self.index, timeout, self.mode
        );

        let result = {
            let connect = self.deps.transports.connect(self.deps.adapter.id(), &self.mode);
            tokio::select! {
                _ = self.shutdown.cancelled() => Err(SessionError::Cancelled),
                res = tokio::time::timeout(timeout, connect) => match res {
                    Ok(Ok(transport)) => Ok(transport),
                    Ok(Err(e)) => Err(SessionError::Transport(e)),
                    Err(_) => Err(SessionError::ConnectionTimeout(timeout)),
                },
            }
        };

        match result {
            Ok(transport) => {
                info!("[{}] Console {} connected", self.index, transport.peer());
                self.snapshot.last_connection = Some(transport.peer().to_string());
                self.snapshot.errors = None;
                self.transport = Some(transport);
                self.publish(ConnectionState::Paired);
                Ok(self.transition())
            }
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }
}

impl ControllerSession<Paired> {
    /// Answers the console's subcommands until it assigns player lights
    pub async fn handshake(mut self) -> Result<ControllerSession<Connected>, SessionError> {
        match self.exchange_subcommands().await {
            Ok(()) => {
                info!("[{}] Handshake complete", self.index);
                self.publish(ConnectionState::Connected);
                Ok(self.transition())
            }
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn exchange_subcommands(&mut self) -> Result<(), SessionError> {
        let start = Instant::now();
        let deadline = start + self.settings.connect_timeout;
        // a reconnecting console may skip the input mode request
        let mut quiet_since = match self.mode {
            ConnectMode::Reconnect(_) => Some(start),
            ConnectMode::Listen => None,
        };

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(SessionError::ConnectionTimeout(self.settings.connect_timeout));
            }
            if let Some(since) = quiet_since {
                if now.duration_since(since) >= self.settings.handshake_quiet {
                    debug!("[{}] Console went quiet after input mode", self.index);
                    return Ok(());
                }
            }

            let wait = self.settings.tick_interval.min(deadline - now);
            let transport = self
                .transport
                .as_mut()
                .ok_or(SessionError::Transport(TransportError::Closed))?;
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(SessionError::Cancelled),
                frame = transport.receive(wait) => frame?,
            };

            match frame.map(|f| protocol::parse_output_report(&f)) {
                Some(OutputReport::Subcommand { id, data }) => {
                    self.reply_to_subcommand(id, &data).await?;
                    if id == protocol::SUBCMD_PLAYER_LIGHTS {
                        return Ok(());
                    }
                    if id == protocol::SUBCMD_SET_INPUT_MODE || quiet_since.is_some() {
                        quiet_since = Some(Instant::now());
                    }
                }
                Some(OutputReport::RumbleOnly) => {}
                Some(OutputReport::Unknown(frame)) => {
                    debug!("[{}] Ignoring {} byte frame", self.index, frame.len())
                }
                None => {
                    // keep the link warm while the console decides
                    let timer = self.scheduler.next_timer();
                    let report = protocol::input_report(timer, self.kind, &InputPayload::NEUTRAL);
                    self.send_frame(&report).await?;
                }
            }
        }
    }
}

impl ControllerSession<Connected> {
    /// Trusts the console, records the connection and stops advertising
    pub async fn activate(mut self) -> ControllerSession<Active> {
        let adapter = self.deps.adapter.clone();
        let peer = self
            .transport
            .as_ref()
            .map(|t| t.peer().to_string())
            .unwrap_or_default();

        self.deps.authority.trust_peer(adapter.as_ref(), &peer).await;

        let original = adapter.original_address().await.ok();
        match adapter.address().await {
            Ok(current) => {
                if let Err(e) = self
                    .deps
                    .store
                    .record_connection(adapter.id(), original, &current, &peer)
                    .await
                {
                    warn!("[{}] Failed to record connection: {}", self.index, e);
                }
            }
            Err(e) => warn!("[{}] Could not read adapter address: {}", self.index, e),
        }

        if self.mode == ConnectMode::Listen {
            if let Err(e) = adapter.set_discoverable(false).await {
                warn!("[{}] Failed to stop advertising: {}", self.index, e);
            }
        }

        self.publish(ConnectionState::Active);
        self.transition()
    }
}

impl ControllerSession<Active> {
    /// Runs the report loop until shutdown or a socket error
    pub async fn run(mut self) -> Result<(), SessionError> {
        let result = self.report_loop().await;
        match &result {
            Ok(()) => {
                self.close_transport().await;
                self.publish(ConnectionState::Disconnected);
                info!("[{}] Session stopped", self.index);
            }
            Err(e) => self.fail(e).await,
        }
        result
    }

    async fn report_loop(&mut self) -> Result<(), SessionError> {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_stats = Instant::now();
        let mut last_publish = Instant::now();
        let label = format!("{}:{}", self.adapter_id(), self.index);

        info!(
            "[{}] Report loop running every {:?}",
            self.index, self.settings.tick_interval
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("[{}] Shutdown requested", self.index);
                    return Ok(());
                }
                _ = interval.tick() => {}
            }

            let now = Instant::now();
            if !self.drain_requests(now) {
                info!("[{}] Request channel closed", self.index);
                return Ok(());
            }

            self.service_console().await?;

            let tick = self.engine.tick(now);
            if let Some((reason, report)) = self.scheduler.schedule(tick, now) {
                debug!("[{}] Sending report ({:?})", self.index, reason);
                self.send_frame(&report).await?;
            }

            let finished = self.engine.take_finished();
            let macros_finished = !finished.is_empty();
            self.snapshot.finished_macros.extend(finished);

            if macros_finished || now.duration_since(last_publish) >= SNAPSHOT_INTERVAL {
                self.publish_snapshot();
                last_publish = now;
            }

            if now.duration_since(last_stats) >= STATS_INTERVAL {
                self.scheduler.log_stats(&label);
                last_stats = now;
            }
        }
    }

    /// Moves pending submissions into the engine. False once every sender is gone.
    fn drain_requests(&mut self, now: Instant) -> bool {
        loop {
            match self.requests.try_recv() {
                Ok(SessionRequest::Command(command)) => self.engine.enqueue_command(command),
                Ok(SessionRequest::Macro { id, steps }) => self.engine.enqueue_macro(id, steps),
                Ok(SessionRequest::StopMacro(id)) => {
                    if !self.engine.stop_macro(id, now) {
                        debug!("[{}] {} not pending", self.index, id);
                    }
                }
                Ok(SessionRequest::ClearMacros) => self.engine.clear_macros(now),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// Answers console frames that arrived since the last tick
    async fn service_console(&mut self) -> Result<(), SessionError> {
        for _ in 0..self.settings.subcommand_budget {
            let transport = self
                .transport
                .as_mut()
                .ok_or(SessionError::Transport(TransportError::Closed))?;
            transport.poll_control().await?;
            let Some(frame) = transport.receive(Duration::ZERO).await? else {
                break;
            };
            if let OutputReport::Subcommand { id, data } = protocol::parse_output_report(&frame) {
                self.reply_to_subcommand(id, &data).await?;
            }
        }
        Ok(())
    }
}

/// Drives a session through the whole handshake and its report loop
pub async fn run_session(session: ControllerSession<Disconnected>) -> Result<(), SessionError> {
    let index = session.index();
    let session = session.prepare().await;
    let session = session.accept().await?;
    let session = session.handshake().await?;
    let session = session.activate().await;
    debug!("[{}] Entering report loop", index);
    session.run().await
}
