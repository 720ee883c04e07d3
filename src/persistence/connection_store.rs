use super::{AdapterField, ConnectionRecords};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const STORE_DIR: &str = ".nxpad";
const STORE_FILE: &str = "connection_state.toml";

/// File-backed [`ConnectionRecords`]. Clones share one write lock so
/// concurrent sessions never interleave a read-modify-write.
#[derive(Clone, Debug)]
pub struct ConnectionStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl ConnectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// `~/.nxpad/connection_state.toml`
    pub fn default_location() -> Self {
        let mut path = get_home_dir();
        path.push(STORE_DIR);
        path.push(STORE_FILE);
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable stores come back empty
    pub async fn load(&self) -> ConnectionRecords {
        match self.read().await {
            Ok(Some(records)) => records,
            Ok(None) => {
                debug!("No connection store at {}, starting empty", self.path.display());
                ConnectionRecords::default()
            }
            Err(e) => {
                warn!("Ignoring connection store {}: {}", self.path.display(), e);
                ConnectionRecords::default()
            }
        }
    }

    async fn read(&self) -> Result<Option<ConnectionRecords>> {
        if !tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| eyre!("Failed to check if connection store exists: {}", e))?
        {
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| eyre!("Failed to read connection store: {}", e))?;

        let records = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse connection store: {}", e))?;
        Ok(Some(records))
    }

    pub async fn save(&self, records: &ConnectionRecords) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
        }

        let content = toml::to_string_pretty(records)
            .map_err(|e| eyre!("Failed to serialize connection store: {}", e))?;

        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| eyre!("Failed to write connection store: {}", e))?;

        debug!("Connection store saved to {}", self.path.display());
        Ok(())
    }

    /// Loads, applies one field and saves
    pub async fn update(&self, adapter_id: &str, field: AdapterField) -> Result<ConnectionRecords> {
        let _guard = self.write_lock.lock().await;
        let records = self.load().await.update(adapter_id, field);
        self.save(&records).await?;
        Ok(records)
    }

    /// Records a completed (re)connection in a single write
    pub async fn record_connection(
        &self,
        adapter_id: &str,
        original_mac: Option<String>,
        controller_mac: &str,
        peer: &str,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await;
        if let Some(original) = original_mac {
            records = records.update(adapter_id, AdapterField::OriginalMac(original));
        }
        let records = records
            .update(adapter_id, AdapterField::ControllerMac(controller_mac.to_string()))
            .update(adapter_id, AdapterField::RememberedPeer(peer.to_string()));
        self.save(&records).await?;
        info!("Recorded connection {} -> {} on {}", controller_mac, peer, adapter_id);
        Ok(())
    }

    pub async fn get_assigned_mac(&self, adapter_id: &str) -> Option<String> {
        self.load().await.assigned_mac(adapter_id)
    }

    pub async fn get_remembered_peers(&self, adapter_id: Option<&str>) -> Vec<String> {
        self.load().await.remembered_peers(adapter_id)
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static SCRATCH: AtomicUsize = AtomicUsize::new(0);

    fn scratch_store() -> ConnectionStore {
        let n = SCRATCH.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("nxpad-store-{}-{}", std::process::id(), n));
        let _ = std::fs::remove_dir_all(&dir);
        ConnectionStore::new(dir.join("nested").join(STORE_FILE))
    }

    #[tokio::test]
    async fn missing_store_loads_empty() {
        let store = scratch_store();
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_store_loads_empty() {
        let store = scratch_store();
        tokio::fs::create_dir_all(store.path().parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(store.path(), "adapters = [not toml").await.unwrap();
        assert_eq!(store.load().await, ConnectionRecords::default());
    }

    #[tokio::test]
    async fn update_round_trips_through_disk() {
        let store = scratch_store();
        let updated = store
            .load()
            .await
            .update("hci0", AdapterField::ControllerMac("7C:BB:8A:AA:BB:CC".into()));
        store.save(&updated).await.unwrap();

        let reloaded = store.load().await;
        assert_eq!(reloaded, updated);
        assert_eq!(
            store.get_assigned_mac("hci0").await.as_deref(),
            Some("7C:BB:8A:AA:BB:CC")
        );
    }

    #[tokio::test]
    async fn record_connection_keeps_peers_unique() {
        let store = scratch_store();
        for _ in 0..2 {
            store
                .record_connection(
                    "hci0",
                    Some("DC:A6:32:00:00:01".into()),
                    "7C:BB:8A:AA:BB:CC",
                    "98:b6:e9:00:00:01",
                )
                .await
                .unwrap();
        }
        assert_eq!(
            store.get_remembered_peers(Some("hci0")).await,
            vec!["98:B6:E9:00:00:01"]
        );
        let record = store.load().await.adapters["hci0"].clone();
        assert_eq!(record.original_mac.as_deref(), Some("DC:A6:32:00:00:01"));
    }
}
