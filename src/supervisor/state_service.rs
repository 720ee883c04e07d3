//! Shared-state channel between sessions and their callers.
//!
//! Sessions publish snapshots through a [`StateClient`]; one worker task owns
//! the aggregated map and republishes it through a `watch` channel, so readers
//! copy the latest snapshot without waiting on the writer. Every operation on
//! the channel is fallible. The worker can die on its own (or be killed), and
//! callers have to tell "no data" apart from "channel severed".

use crate::controller::session::{SessionIndex, SessionSnapshot};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type StateSnapshot = BTreeMap<SessionIndex, SessionSnapshot>;

macro_rules! respond {
    ($response_tx:expr, $value:expr) => {
        if $response_tx.send($value).is_err() {
            debug!("State requester went away before the response");
        }
    };
}

/// How the channel was found to be severed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeverKind {
    /// The worker task is gone
    WorkerGone,
    /// The worker dropped a request without answering
    ResponseDropped,
    /// No answer within the probe timeout
    Unresponsive,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("State channel severed ({0:?})")]
    Severed(SeverKind),

    /// Transient: the queue is full but the worker is alive
    #[error("State channel busy")]
    Busy,

    #[error("State channel unavailable")]
    Unavailable,
}

impl ChannelError {
    pub fn is_severed(&self) -> bool {
        matches!(self, ChannelError::Severed(_) | ChannelError::Unavailable)
    }
}

#[derive(Debug)]
pub enum StateAction {
    Publish(SessionSnapshot),
    Remove {
        index: SessionIndex,
        response_tx: oneshot::Sender<bool>,
    },
    Ping {
        response_tx: oneshot::Sender<()>,
    },
}

/// Write side handed to sessions
#[derive(Clone, Debug)]
pub struct StateClient {
    tx: mpsc::Sender<StateAction>,
}

impl StateClient {
    /// Never waits: a session's tick loop must not block on the channel
    pub fn publish(&self, snapshot: SessionSnapshot) -> Result<(), ChannelError> {
        self.tx
            .try_send(StateAction::Publish(snapshot))
            .map_err(|e| match e {
                TrySendError::Full(_) => ChannelError::Busy,
                TrySendError::Closed(_) => ChannelError::Severed(SeverKind::WorkerGone),
            })
    }
}

pub struct StateService {
    tx: mpsc::Sender<StateAction>,
    snapshot_rx: watch::Receiver<Arc<StateSnapshot>>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl StateService {
    pub fn spawn(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<StateAction>(capacity);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(StateSnapshot::new()));

        let handle = tokio::spawn(async move {
            let mut sessions = StateSnapshot::new();
            while let Some(action) = rx.recv().await {
                match action {
                    StateAction::Publish(snapshot) => {
                        sessions.insert(snapshot.index, snapshot);
                        snapshot_tx.send_replace(Arc::new(sessions.clone()));
                    }
                    StateAction::Remove { index, response_tx } => {
                        let removed = sessions.remove(&index).is_some();
                        if removed {
                            snapshot_tx.send_replace(Arc::new(sessions.clone()));
                        }
                        respond!(response_tx, removed);
                    }
                    StateAction::Ping { response_tx } => {
                        respond!(response_tx, ());
                    }
                }
            }
            info!("State service worker stopped");
        });

        Self {
            tx,
            snapshot_rx,
            worker_handle: Mutex::new(Some(handle)),
        }
    }

    pub fn client(&self) -> StateClient {
        StateClient {
            tx: self.tx.clone(),
        }
    }

    /// Copy of the latest snapshot. Fails once the worker is gone.
    pub fn snapshot(&self) -> Result<StateSnapshot, ChannelError> {
        if self.snapshot_rx.has_changed().is_err() {
            return Err(ChannelError::Unavailable);
        }
        Ok(self.snapshot_rx.borrow().as_ref().clone())
    }

    /// Receiver that wakes on every published change
    pub fn subscribe(&self) -> watch::Receiver<Arc<StateSnapshot>> {
        self.snapshot_rx.clone()
    }

    /// Lightweight liveness probe
    pub async fn probe(&self, timeout: Duration) -> Result<(), ChannelError> {
        let (response_tx, response_rx) = oneshot::channel();
        match self.tx.try_send(StateAction::Ping { response_tx }) {
            Ok(()) => {}
            // a full queue means the worker is alive, just behind
            Err(TrySendError::Full(_)) => return Err(ChannelError::Busy),
            Err(TrySendError::Closed(_)) => {
                return Err(ChannelError::Severed(SeverKind::WorkerGone))
            }
        }

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ChannelError::Severed(SeverKind::ResponseDropped)),
            Err(_) => Err(ChannelError::Severed(SeverKind::Unresponsive)),
        }
    }

    /// Removes a session's entry. `Ok(false)` if it was already gone.
    pub async fn remove(&self, index: SessionIndex) -> Result<bool, ChannelError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(StateAction::Remove { index, response_tx })
            .await
            .map_err(|_| ChannelError::Severed(SeverKind::WorkerGone))?;
        response_rx
            .await
            .map_err(|_| ChannelError::Severed(SeverKind::ResponseDropped))
    }

    /// Stops the worker and waits for it to go away
    pub async fn kill(&self) {
        let handle = self.worker_handle.lock().await.take();
        if let Some(handle) = handle {
            handle.abort();
            match handle.await {
                Ok(()) => debug!("State service worker already finished"),
                Err(e) if e.is_cancelled() => warn!("State service worker aborted"),
                Err(e) => error!("State service worker failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::buttons::ControllerKind;
    use crate::controller::session::ConnectionState;

    fn snapshot(index: SessionIndex) -> SessionSnapshot {
        SessionSnapshot::new(index, ControllerKind::ProController, "hci0")
    }

    async fn settle(service: &StateService, len: usize) {
        let mut rx = service.subscribe();
        while rx.borrow_and_update().len() != len {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn published_snapshots_are_readable() {
        let service = StateService::spawn(8);
        let client = service.client();
        client.publish(snapshot(0)).unwrap();
        client.publish(snapshot(2)).unwrap();
        settle(&service, 2).await;

        let state = service.snapshot().unwrap();
        assert_eq!(state.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(state[&0].state, ConnectionState::Disconnected);
        assert!(service.probe(Duration::from_millis(100)).await.is_ok());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let service = StateService::spawn(8);
        service.client().publish(snapshot(1)).unwrap();
        settle(&service, 1).await;

        assert_eq!(service.remove(1).await, Ok(true));
        assert_eq!(service.remove(1).await, Ok(false));
    }

    #[tokio::test]
    async fn killed_worker_reads_as_severed() {
        let service = StateService::spawn(8);
        let client = service.client();
        service.kill().await;

        assert_eq!(service.snapshot(), Err(ChannelError::Unavailable));
        let probe = service.probe(Duration::from_millis(100)).await;
        assert_eq!(probe, Err(ChannelError::Severed(SeverKind::WorkerGone)));
        assert!(probe.unwrap_err().is_severed());
        assert!(client.publish(snapshot(0)).is_err());
        assert!(service.remove(0).await.is_err());
    }
}
