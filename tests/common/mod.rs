#![allow(dead_code)]

use nxpad::bluetooth::{
    BluetoothAdapter, ConsoleEndpoint, LoopbackFactory, SimulatedAdapter, TransportFactory,
};
use nxpad::controller::buttons::ControllerKind;
use nxpad::controller::session::{ConnectionState, SessionIndex};
use nxpad::persistence::ConnectionStore;
use nxpad::supervisor::{Platform, SupervisorContext, SupervisorSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const ADAPTER_ID: &str = "hci0";
pub const ADAPTER_ADDRESS: &str = "DC:A6:32:00:00:01";

pub struct Rig {
    pub context: SupervisorContext,
    pub adapter: Arc<SimulatedAdapter>,
    pub store: ConnectionStore,
    pub consoles: mpsc::UnboundedReceiver<ConsoleEndpoint>,
}

/// Store file in a fresh per-test directory
pub fn scratch_store(name: &str) -> ConnectionStore {
    let dir = std::env::temp_dir().join(format!("nxpad-it-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    ConnectionStore::new(dir.join("connection_state.toml"))
}

pub fn rig(name: &str, settings: SupervisorSettings) -> Rig {
    let (factory, consoles) = LoopbackFactory::new();
    rig_with(name, settings, SimulatedAdapter::new(ADAPTER_ID, ADAPTER_ADDRESS), factory, consoles)
}

pub fn rig_with(
    name: &str,
    settings: SupervisorSettings,
    adapter: SimulatedAdapter,
    transports: impl TransportFactory + 'static,
    consoles: mpsc::UnboundedReceiver<ConsoleEndpoint>,
) -> Rig {
    let adapter = Arc::new(adapter);
    let store = scratch_store(name);
    let shared: Arc<dyn BluetoothAdapter> = adapter.clone();
    let platform = Platform {
        adapters: vec![shared],
        transports: Arc::new(transports),
        store: store.clone(),
    };
    Rig {
        context: SupervisorContext::new(settings, platform),
        adapter,
        store,
        consoles,
    }
}

/// Creates a session and plays the console through the handshake
pub async fn connect(rig: &mut Rig, kind: ControllerKind) -> (SessionIndex, ConsoleEndpoint) {
    let index = rig.context.create_session(kind, None).await.unwrap();
    let mut console = rig.consoles.recv().await.unwrap();
    assert!(console.complete_handshake(Duration::from_secs(5)).await);

    let manager = rig.context.manager().await.unwrap();
    manager
        .wait_for_connection(index, Duration::from_secs(10))
        .await
        .unwrap();
    wait_for_state(rig, index, ConnectionState::Active).await;
    (index, console)
}

/// Polls the session until it reports `expected`
pub async fn wait_for_state(rig: &Rig, index: SessionIndex, expected: ConnectionState) {
    let mut state = None;
    for _ in 0..400 {
        state = rig.context.check_session_health(index).await.state;
        if state == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session {} stuck in {:?}, expected {}", index, state, expected);
}
