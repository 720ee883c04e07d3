//! # Persistence Module
//!
//! ## Why This Module Exists
//! A console only reconnects to a controller it already knows, and it knows
//! controllers by their Bluetooth address. To survive restarts we remember,
//! per host adapter, the address the adapter shipped with, the controller
//! address we gave it, and every console that has connected through it.
//!
//! ## Key Abstractions
//! - **ConnectionRecords**: the whole store, keyed by adapter id
//! - **AdapterRecord**: one adapter's addresses and remembered consoles
//! - **AdapterField**: a single field update, applied with [`ConnectionRecords::update`]
//!
//! ## Error Handling Strategy
//! Reading never fails: a missing or corrupt file yields empty records with a
//! warning. Writing returns a `color_eyre` result that callers log and move on
//! from, since losing a record only costs a re-pair.

pub mod connection_store;

pub use connection_store::ConnectionStore;

use crate::bluetooth::normalize_address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What we know about one host adapter
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct AdapterRecord {
    /// Address the adapter had before we first changed it
    #[serde(default)]
    pub original_mac: Option<String>,
    /// Address the consoles know this controller by
    #[serde(default)]
    pub controller_mac: Option<String>,
    /// Consoles that connected through this adapter, oldest first
    #[serde(default)]
    pub switch_addresses: Vec<String>,
}

/// One field of an [`AdapterRecord`] together with its new value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdapterField {
    OriginalMac(String),
    ControllerMac(String),
    RememberedPeer(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionRecords {
    #[serde(default)]
    pub adapters: BTreeMap<String, AdapterRecord>,
}

impl ConnectionRecords {
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn get(&self, adapter_id: &str) -> Option<&AdapterRecord> {
        self.adapters.get(adapter_id)
    }

    /// Returns the records with one field changed. Peers are appended once.
    pub fn update(mut self, adapter_id: &str, field: AdapterField) -> Self {
        let record = self.adapters.entry(adapter_id.to_string()).or_default();
        match field {
            AdapterField::OriginalMac(mac) => {
                // the first value seen is the factory address
                if record.original_mac.is_none() {
                    record.original_mac = Some(normalize_address(&mac));
                }
            }
            AdapterField::ControllerMac(mac) => record.controller_mac = Some(normalize_address(&mac)),
            AdapterField::RememberedPeer(peer) => {
                let peer = normalize_address(&peer);
                if !record.switch_addresses.contains(&peer) {
                    record.switch_addresses.push(peer);
                }
            }
        }
        self
    }

    pub fn assigned_mac(&self, adapter_id: &str) -> Option<String> {
        self.get(adapter_id)
            .and_then(|record| record.controller_mac.clone())
    }

    /// Remembered consoles for one adapter, or for all adapters without duplicates
    pub fn remembered_peers(&self, adapter_id: Option<&str>) -> Vec<String> {
        match adapter_id {
            Some(id) => self
                .get(id)
                .map(|record| record.switch_addresses.clone())
                .unwrap_or_default(),
            None => {
                let mut peers: Vec<String> = Vec::new();
                for address in self.adapters.values().flat_map(|r| r.switch_addresses.iter()) {
                    if !peers.contains(address) {
                        peers.push(address.clone());
                    }
                }
                peers
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_are_normalized_and_unique() {
        let records = ConnectionRecords::default()
            .update("hci0", AdapterField::RememberedPeer("98:b6:e9:00:00:01".into()))
            .update("hci0", AdapterField::RememberedPeer("98:B6:E9:00:00:01".into()))
            .update("hci1", AdapterField::RememberedPeer("98:B6:E9:00:00:02".into()))
            .update("hci1", AdapterField::RememberedPeer("98:B6:E9:00:00:01".into()));

        assert_eq!(records.remembered_peers(Some("hci0")), vec!["98:B6:E9:00:00:01"]);
        assert_eq!(
            records.remembered_peers(None),
            vec!["98:B6:E9:00:00:01", "98:B6:E9:00:00:02"]
        );
        assert!(records.remembered_peers(Some("hci9")).is_empty());
    }

    #[test]
    fn original_mac_is_written_once() {
        let records = ConnectionRecords::default()
            .update("hci0", AdapterField::OriginalMac("DC:A6:32:00:00:01".into()))
            .update("hci0", AdapterField::OriginalMac("7C:BB:8A:00:00:01".into()))
            .update("hci0", AdapterField::ControllerMac("7c:bb:8a:00:00:01".into()));

        let record = records.get("hci0").unwrap();
        assert_eq!(record.original_mac.as_deref(), Some("DC:A6:32:00:00:01"));
        assert_eq!(records.assigned_mac("hci0").as_deref(), Some("7C:BB:8A:00:00:01"));
        assert_eq!(records.assigned_mac("hci1"), None);
    }
}
