//! Controller manager: creates, tracks and tears down sessions.
//!
//! Every session runs in its own task. The manager keeps only a handle per
//! session (request sender, cancellation token, join handle) and reads session
//! state back through the shared [`StateService`].

use super::error::SupervisorError;
use super::state_service::{ChannelError, StateService, StateSnapshot};
use super::SupervisorSettings;
use crate::bluetooth::{normalize_address, BluetoothAdapter, ConnectMode, PairingAuthority, TransportFactory};
use crate::controller::buttons::{ButtonMask, ControllerKind};
use crate::controller::input_engine::{Command, MacroId};
use crate::controller::macro_parser::parse_macro;
use crate::controller::session::{
    run_session, ConnectionState, ControllerSession, SessionDeps, SessionIndex, SessionRequest,
    SessionSnapshot,
};
use crate::persistence::ConnectionStore;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SESSION_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Platform capabilities the manager is built on
#[derive(Clone)]
pub struct Platform {
    pub adapters: Vec<Arc<dyn BluetoothAdapter>>,
    pub transports: Arc<dyn TransportFactory>,
    pub store: ConnectionStore,
}

struct SessionHandle {
    kind: ControllerKind,
    adapter_id: String,
    requests: mpsc::Sender<SessionRequest>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ControllerManager {
    settings: SupervisorSettings,
    platform: Platform,
    authority: Arc<PairingAuthority>,
    state: StateService,
    sessions: RwLock<BTreeMap<SessionIndex, SessionHandle>>,
    next_macro_id: AtomicU64,
}

impl ControllerManager {
    /// Spawns the state service and registers the pairing agent on every adapter
    pub async fn start(settings: SupervisorSettings, platform: Platform) -> Result<Self, SupervisorError> {
        if platform.adapters.is_empty() {
            return Err(SupervisorError::InitializationFailed(
                "no Bluetooth adapters available".into(),
            ));
        }

        let authority = Arc::new(PairingAuthority::auto_accept());
        for adapter in &platform.adapters {
            if let Err(e) = authority.register(adapter.as_ref()).await {
                warn!("Pairing agent registration failed on {}: {}", adapter.id(), e);
            }
        }

        let state = StateService::spawn(settings.state_channel_capacity);
        info!(
            "Controller manager started with {} adapter(s)",
            platform.adapters.len()
        );

        Ok(Self {
            settings,
            platform,
            authority,
            state,
            sessions: RwLock::new(BTreeMap::new()),
            next_macro_id: AtomicU64::new(1),
        })
    }

    pub fn state_service(&self) -> &StateService {
        &self.state
    }

    pub async fn probe(&self) -> Result<(), ChannelError> {
        self.state.probe(self.settings.probe_timeout).await
    }

    pub fn state(&self) -> Result<StateSnapshot, ChannelError> {
        self.state.snapshot()
    }

    pub fn get_available_adapters(&self) -> Vec<String> {
        self.platform
            .adapters
            .iter()
            .map(|adapter| adapter.id().to_string())
            .collect()
    }

    /// Remembered consoles plus paired consoles the adapters report, without duplicates
    pub async fn get_switch_addresses(&self) -> Vec<String> {
        let mut addresses = self.platform.store.get_remembered_peers(None).await;
        for adapter in &self.platform.adapters {
            match adapter.devices().await {
                Ok(devices) => {
                    for device in devices {
                        let address = normalize_address(&device.address);
                        if device.paired
                            && device.name == "Nintendo Switch"
                            && !addresses.contains(&address)
                        {
                            addresses.push(address);
                        }
                    }
                }
                Err(e) => debug!("Could not list devices on {}: {}", adapter.id(), e),
            }
        }
        addresses
    }

    pub async fn session_indices(&self) -> Vec<SessionIndex> {
        self.sessions.read().await.keys().copied().collect()
    }

    pub async fn session_kind(&self, index: SessionIndex) -> Option<(ControllerKind, String)> {
        self.sessions
            .read()
            .await
            .get(&index)
            .map(|handle| (handle.kind, handle.adapter_id.clone()))
    }

    /// Starts a session on `adapter_id` (or the first free adapter) and returns its index.
    /// With `reconnect` addresses the session dials the console instead of waiting to be paired.
    pub async fn create_controller(
        &self,
        kind: ControllerKind,
        adapter_id: Option<&str>,
        reconnect: Vec<String>,
    ) -> Result<SessionIndex, SupervisorError> {
        let mut sessions = self.sessions.write().await;

        // finished tasks no longer hold their adapter
        sessions.retain(|index, handle| {
            if handle.task.is_finished() {
                debug!("Dropping finished session {}", index);
                false
            } else {
                true
            }
        });

        let busy = |id: &str| sessions.values().any(|handle| handle.adapter_id == id);
        let adapter = match adapter_id {
            Some(id) => {
                let adapter = self
                    .platform
                    .adapters
                    .iter()
                    .find(|adapter| adapter.id() == id)
                    .ok_or_else(|| SupervisorError::NoAdapter(id.to_string()))?;
                if busy(id) {
                    return Err(SupervisorError::AdapterBusy(id.to_string()));
                }
                adapter.clone()
            }
            None => self
                .platform
                .adapters
                .iter()
                .find(|adapter| !busy(adapter.id()))
                .cloned()
                .ok_or_else(|| SupervisorError::NoAdapter("all adapters in use".into()))?,
        };

        let index = (0..=SessionIndex::MAX)
            .find(|candidate| !sessions.contains_key(candidate))
            .ok_or_else(|| SupervisorError::NoAdapter("session limit reached".into()))?;

        let mode = if reconnect.is_empty() {
            ConnectMode::Listen
        } else {
            ConnectMode::Reconnect(reconnect)
        };

        let (requests, requests_rx) = mpsc::channel(self.settings.request_channel_capacity);
        let shutdown = CancellationToken::new();
        let deps = SessionDeps {
            adapter: adapter.clone(),
            transports: self.platform.transports.clone(),
            authority: self.authority.clone(),
            store: self.platform.store.clone(),
            state: self.state.client(),
        };

        if let Err(e) = deps
            .state
            .publish(SessionSnapshot::new(index, kind, adapter.id()))
        {
            warn!("Could not publish initial state for session {}: {}", index, e);
        }

        let session = ControllerSession::create(
            index,
            kind,
            mode,
            self.settings.session.clone(),
            self.settings.engine.clone(),
            deps,
            requests_rx,
            shutdown.clone(),
        );
        let task = tokio::spawn(async move {
            match run_session(session).await {
                Ok(()) => debug!("Session {} task finished", index),
                Err(e) => debug!("Session {} task ended: {}", index, e),
            }
        });

        sessions.insert(
            index,
            SessionHandle {
                kind,
                adapter_id: adapter.id().to_string(),
                requests,
                shutdown,
                task,
            },
        );
        info!("Created {} as session {} on {}", kind, index, adapter.id());
        Ok(index)
    }

    /// Stops a session and forgets it. `Ok(false)` if it was already gone.
    pub async fn remove_controller(&self, index: SessionIndex) -> Result<bool, SupervisorError> {
        // bookkeeping only under the lock
        let handle = self.sessions.write().await.remove(&index);
        let Some(handle) = handle else {
            debug!("Session {} already removed", index);
            return Ok(false);
        };

        stop_session(index, handle).await;
        match self.state.remove(index).await {
            Ok(_) => {}
            Err(e) => warn!("Could not clear state of session {}: {}", index, e),
        }
        info!("Removed session {}", index);
        Ok(true)
    }

    /// Cancels a session but keeps its entry, so its final state stays
    /// readable until [`remove_controller`](Self::remove_controller).
    pub async fn disconnect_controller(&self, index: SessionIndex) -> Result<(), SupervisorError> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(&index)
            .ok_or(SupervisorError::UnknownSession(index))?;
        handle.shutdown.cancel();
        info!("Disconnecting session {}", index);
        Ok(())
    }

    pub fn session_state(&self, index: SessionIndex) -> Result<Option<SessionSnapshot>, ChannelError> {
        Ok(self.state.snapshot()?.remove(&index))
    }

    /// Waits until the session reports a connected console
    pub async fn wait_for_connection(
        &self,
        index: SessionIndex,
        timeout: Duration,
    ) -> Result<(), SupervisorError> {
        self.ensure_known(index).await?;
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                let current = rx.borrow_and_update().get(&index).cloned();
                if let Some(snapshot) = current {
                    match snapshot.state {
                        state if state.is_connected() => return Ok(()),
                        ConnectionState::Crashed => return Err(SupervisorError::SessionCrashed(index)),
                        ConnectionState::Disconnected if snapshot.errors.is_some() => {
                            return Err(SupervisorError::ConnectionTimeout)
                        }
                        _ => {}
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(SupervisorError::Channel(ChannelError::Unavailable));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SupervisorError::ConnectionTimeout)?
    }

    /// Waits until a macro has finished or been stopped
    pub async fn wait_for_macro(
        &self,
        index: SessionIndex,
        id: MacroId,
        timeout: Duration,
    ) -> Result<bool, SupervisorError> {
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                let finished = rx
                    .borrow_and_update()
                    .get(&index)
                    .map(|snapshot| snapshot.finished_macros.contains(&id));
                match finished {
                    Some(true) => return Ok(true),
                    None => return Err(SupervisorError::UnknownSession(index)),
                    Some(false) => {}
                }
                if rx.changed().await.is_err() {
                    return Err(SupervisorError::Channel(ChannelError::Unavailable));
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Ok(false),
        }
    }

    pub async fn set_controller_input(
        &self,
        index: SessionIndex,
        command: Command,
    ) -> Result<(), SupervisorError> {
        self.submit(index, SessionRequest::Command(command)).await
    }

    pub async fn press_buttons(
        &self,
        index: SessionIndex,
        buttons: ButtonMask,
        down: Duration,
        up: Duration,
    ) -> Result<(), SupervisorError> {
        self.submit(index, SessionRequest::Command(Command::press(buttons, down, up)))
            .await
    }

    /// Parses and queues a macro. Nothing is queued if parsing fails.
    pub async fn submit_macro(&self, index: SessionIndex, text: &str) -> Result<MacroId, SupervisorError> {
        self.ensure_known(index).await?;
        self.ensure_not_crashed(index)?;
        let steps = parse_macro(text)?;
        let id = MacroId(self.next_macro_id.fetch_add(1, Ordering::Relaxed));
        self.submit(index, SessionRequest::Macro { id, steps }).await?;
        info!("Queued {} on session {}", id, index);
        Ok(id)
    }

    pub async fn stop_macro(&self, index: SessionIndex, id: MacroId) -> Result<(), SupervisorError> {
        self.submit(index, SessionRequest::StopMacro(id)).await
    }

    pub async fn clear_macros(&self, index: SessionIndex) -> Result<(), SupervisorError> {
        self.submit(index, SessionRequest::ClearMacros).await
    }

    async fn ensure_known(&self, index: SessionIndex) -> Result<(), SupervisorError> {
        if self.sessions.read().await.contains_key(&index) {
            Ok(())
        } else {
            Err(SupervisorError::UnknownSession(index))
        }
    }

    fn ensure_not_crashed(&self, index: SessionIndex) -> Result<(), SupervisorError> {
        match self.session_state(index)? {
            Some(snapshot) if snapshot.state == ConnectionState::Crashed => {
                Err(SupervisorError::SessionCrashed(index))
            }
            _ => Ok(()),
        }
    }

    async fn submit(&self, index: SessionIndex, request: SessionRequest) -> Result<(), SupervisorError> {
        let sender = {
            let sessions = self.sessions.read().await;
            let handle = sessions
                .get(&index)
                .ok_or(SupervisorError::UnknownSession(index))?;
            handle.requests.clone()
        };
        self.ensure_not_crashed(index)?;

        match sender.try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SupervisorError::SessionBusy(index)),
            Err(TrySendError::Closed(_)) => Err(self.ended_session_error(index).await),
        }
    }

    /// Rejection for a session whose task is gone. The task publishes its
    /// final state before it drops the request receiver; the probe queues
    /// behind that publish, so the snapshot read after it is final.
    async fn ended_session_error(&self, index: SessionIndex) -> SupervisorError {
        if let Err(e) = self.state.probe(self.settings.probe_timeout).await {
            debug!("State probe for ended session {} failed: {}", index, e);
        }
        match self.session_state(index) {
            Ok(Some(snapshot)) if snapshot.state == ConnectionState::Crashed => {
                SupervisorError::SessionCrashed(index)
            }
            _ => SupervisorError::SessionStopped(index),
        }
    }

    /// Cancels every session, stops the state service and unregisters the agent.
    /// Failures are logged, never returned.
    pub async fn shutdown(&self) {
        let handles: Vec<(SessionIndex, SessionHandle)> = {
            let mut sessions = self.sessions.write().await;
            std::mem::take(&mut *sessions).into_iter().collect()
        };
        for (index, handle) in handles {
            stop_session(index, handle).await;
        }

        self.state.kill().await;
        for adapter in &self.platform.adapters {
            self.authority.unregister(adapter.as_ref()).await;
        }
        info!("Controller manager shut down");
    }
}

async fn stop_session(index: SessionIndex, handle: SessionHandle) {
    handle.shutdown.cancel();
    drop(handle.requests);
    let mut task = handle.task;
    match tokio::time::timeout(SESSION_STOP_TIMEOUT, &mut task).await {
        Ok(Ok(())) => debug!("Session {} stopped", index),
        Ok(Err(e)) => error!("Session {} task failed: {}", index, e),
        Err(_) => {
            warn!("Session {} did not stop in time, aborting", index);
            task.abort();
        }
    }
}
