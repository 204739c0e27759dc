//! Typed events published by the encounter engine and the fan-out bus that
//! delivers them to subscribers.

use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;

/// One attacker's row in an encounter snapshot, sorted most damage first.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttackerRow {
    pub uid: u64,
    pub name: String,
    pub class_id: Option<u32>,
    pub spec_name: Option<String>,
    pub ability_score: Option<u64>,
    pub total_damage: u64,
    pub dps: u64,
    pub damage_count: u64,
    pub crit_count: u64,
    pub healing_done: u64,
}

/// Immutable view of an encounter, cheap enough to hand to every subscriber.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncounterSnapshot {
    pub start_ms: i64,
    pub duration_ms: i64,
    pub is_active: bool,
    pub total_damage: u64,
    pub rows: Vec<AttackerRow>,
}

#[derive(Debug, Clone)]
pub enum MeterEvent {
    ServerChange,
    EncounterStarted(EncounterSnapshot),
    EncounterUpdated(EncounterSnapshot),
    EncounterEnded(EncounterSnapshot),
    HistoryChanged,
    SelectedEncounterChanged(Option<EncounterSnapshot>),
}

/// Single-producer, multi-subscriber fan-out. `emit` never blocks: each
/// subscriber gets its own unbounded channel and dead subscribers are
/// pruned on the next emit.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<MeterEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<MeterEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn emit(&self, event: MeterEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}
