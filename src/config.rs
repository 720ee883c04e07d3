//! Runtime configuration, read from `~/.config/nxpad/config.toml`.
//!
//! Every field has a default, so a partial file only overrides what it names.
//! Durations are stored as whole milliseconds.

use crate::controller::input_engine::EngineSettings;
use crate::controller::session::SessionSettings;
use crate::persistence::ConnectionStore;
use crate::supervisor::SupervisorSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/nxpad";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct NxpadConfig {
    pub session: SessionConfig,
    pub engine: EngineConfig,
    pub supervisor: SupervisorConfig,
    pub store: StoreConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Report loop cadence
    pub tick_interval_ms: u64,
    /// Longest the console may go without a report before we resend
    pub max_transmit_gap_ms: u64,
    /// Bound on pairing/reconnect and the subcommand handshake
    pub connect_timeout_ms: u64,
    /// Quiet period after the input mode request that ends the handshake
    pub handshake_quiet_ms: u64,
    /// Console frames handled per tick
    pub subcommand_budget: usize,
    /// Give the adapter a fresh controller address on first pairing
    pub assign_controller_mac: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 15,
            max_transmit_gap_ms: 250,
            connect_timeout_ms: 30_000,
            handshake_quiet_ms: 1_000,
            subcommand_budget: 8,
            assign_controller_mac: false,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub macro_cooldown_ms: u64,
    pub post_macro_neutral_reports: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            macro_cooldown_ms: 100,
            post_macro_neutral_reports: 10,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_restarts: u32,
    pub probe_timeout_ms: u64,
    pub state_channel_capacity: usize,
    pub request_channel_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            probe_timeout_ms: 500,
            state_channel_capacity: 256,
            request_channel_capacity: 64,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Overrides `~/.nxpad/connection_state.toml`
    pub path: Option<PathBuf>,
}

impl NxpadConfig {
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| {
            warn!("Could not determine home directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Falls back to defaults if the file is missing or invalid
    pub async fn load(path: &Path) -> Self {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                return Self::default();
            }
            Err(e) => {
                warn!("Failed to read config {}: {}, using defaults", path.display(), e);
                return Self::default();
            }
        };

        match toml::from_str(&content) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                warn!("Failed to parse config {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            tick_interval: Duration::from_millis(self.session.tick_interval_ms.max(1)),
            max_transmit_gap: Duration::from_millis(self.session.max_transmit_gap_ms),
            connect_timeout: Duration::from_millis(self.session.connect_timeout_ms),
            handshake_quiet: Duration::from_millis(self.session.handshake_quiet_ms),
            subcommand_budget: self.session.subcommand_budget.max(1),
            assign_controller_mac: self.session.assign_controller_mac,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            macro_cooldown: Duration::from_millis(self.engine.macro_cooldown_ms),
            post_macro_neutral_required: self.engine.post_macro_neutral_reports,
        }
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            session: self.session_settings(),
            engine: self.engine_settings(),
            max_restarts: self.supervisor.max_restarts,
            probe_timeout: Duration::from_millis(self.supervisor.probe_timeout_ms),
            state_channel_capacity: self.supervisor.state_channel_capacity.max(1),
            request_channel_capacity: self.supervisor.request_channel_capacity.max(1),
        }
    }

    pub fn connection_store(&self) -> ConnectionStore {
        match &self.store.path {
            Some(path) => ConnectionStore::new(path.clone()),
            None => ConnectionStore::default_location(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: NxpadConfig = toml::from_str(
            r#"
            [session]
            max_transmit_gap_ms = 400

            [supervisor]
            max_restarts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.session.max_transmit_gap_ms, 400);
        assert_eq!(config.session.tick_interval_ms, 15);
        assert_eq!(config.supervisor.max_restarts, 5);
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn defaults_match_protocol_timings() {
        let settings = NxpadConfig::default().supervisor_settings();
        assert_eq!(settings.session.tick_interval, Duration::from_millis(15));
        assert_eq!(settings.engine.macro_cooldown, Duration::from_millis(100));
        assert_eq!(settings.engine.post_macro_neutral_required, 10);
        assert_eq!(settings.max_restarts, 3);
    }

    #[test]
    fn store_path_override() {
        let config: NxpadConfig = toml::from_str("[store]\npath = \"/tmp/nxpad-store.toml\"").unwrap();
        assert_eq!(
            config.connection_store().path(),
            Path::new("/tmp/nxpad-store.toml")
        );
    }

    #[tokio::test]
    async fn unreadable_config_falls_back() {
        let path = std::env::temp_dir().join(format!("nxpad-missing-{}.toml", std::process::id()));
        assert_eq!(NxpadConfig::load(&path).await, NxpadConfig::default());
    }
}
