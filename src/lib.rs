//! Passive combat meter for a live game connection.
//!
//! The pipeline: promiscuous TCP capture on every suitable interface,
//! game-server identification by payload signature, per-flow reassembly,
//! length-prefixed frame decoding, lenient protobuf-style message parsing,
//! and an encounter engine that aggregates damage/healing per attacker and
//! publishes typed events to subscribers. The meter only listens; it never
//! transmits.

pub mod config;
pub mod errors;
pub mod events;
pub mod player_cache;
pub mod protocol;
pub mod service;
pub mod services;
pub mod skill_table;

#[cfg(test)]
pub(crate) mod testutil;


pub use config::{load_config, save_config, MeterConfig, SettingsHandle};
pub use errors::MeterError;
pub use events::{AttackerRow, EncounterSnapshot, EventBus, MeterEvent};
pub use player_cache::{PlayerCache, PlayerInfo};
pub use service::MeterService;
