//! Runtime configuration: a small JSON file read with defaults on any
//! failure, plus a shared handle the engine watches for changes.

use std::fs;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

/// Upper bound on retained encounter history.
pub const MAX_HISTORY_LIMIT: u32 = 60;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MeterConfig {
    /// Seconds of combat silence before an encounter ends. 0 = never.
    pub encounter_reset_timer_seconds: u32,
    /// How many completed encounters to keep, clamped to 0..=60.
    pub max_encounter_history: u32,
    /// pcap device name to capture on; empty = all suitable devices.
    pub network_interface: String,
    pub log_level: String,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            encounter_reset_timer_seconds: 5,
            max_encounter_history: 10,
            network_interface: String::new(),
            log_level: "info".to_string(),
        }
    }
}

impl MeterConfig {
    pub fn clamped(mut self) -> Self {
        self.max_encounter_history = self.max_encounter_history.min(MAX_HISTORY_LIMIT);
        self
    }
}

/// Read the config file, falling back to defaults on any failure. A missing
/// file is created with the defaults so users have something to edit.
pub fn load_config(path: &Path) -> MeterConfig {
    if !path.exists() {
        let defaults = MeterConfig::default();
        if let Ok(json) = serde_json::to_string_pretty(&defaults) {
            let _ = fs::write(path, json);
        }
        return defaults;
    }

    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str::<MeterConfig>(&content)
            .map(MeterConfig::clamped)
            .unwrap_or_else(|e| {
                log::warn!("config file unreadable ({e}), using defaults");
                MeterConfig::default()
            }),
        Err(e) => {
            log::warn!("config file unreadable ({e}), using defaults");
            MeterConfig::default()
        }
    }
}

pub fn save_config(path: &Path, config: &MeterConfig) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)
}

/// Shared settings: read-dominant lock for readers, watcher channels for
/// anyone that needs to react to updates.
#[derive(Debug)]
pub struct SettingsHandle {
    inner: RwLock<MeterConfig>,
    watchers: Mutex<Vec<Sender<MeterConfig>>>,
}

impl SettingsHandle {
    pub fn new(config: MeterConfig) -> Self {
        Self {
            inner: RwLock::new(config.clamped()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> MeterConfig {
        self.inner.read().unwrap().clone()
    }

    pub fn watch(&self) -> Receiver<MeterConfig> {
        let (tx, rx) = unbounded();
        self.watchers.lock().unwrap().push(tx);
        rx
    }

    /// Replace the settings and notify every watcher with the new value.
    pub fn update(&self, config: MeterConfig) {
        let config = config.clamped();
        {
            let mut inner = self.inner.write().unwrap();
            if *inner == config {
                return;
            }
            *inner = config.clone();
        }
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|tx| tx.send(config.clone()).is_ok());
    }
}
