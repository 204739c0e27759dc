//! Process-wide cache of player identity data, merged monotonically from
//! every message that mentions a character.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::protocol::parser::is_plausible_name;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlayerInfo {
    pub uid: u64,
    pub name: Option<String>,
    pub class_id: Option<u32>,
    pub spec_id: Option<u32>,
    pub ability_score: Option<u64>,
    pub spec_name: Option<String>,
}

/// Thread-safe uid -> player info map. Fields only ever gain values: a
/// valid name is never overwritten, numeric fields accept the first
/// strictly-positive value and keep it.
#[derive(Debug, Default)]
pub struct PlayerCache {
    inner: Mutex<HashMap<u64, PlayerInfo>>,
}

impl PlayerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(
        &self,
        uid: u64,
        name: Option<&str>,
        class_id: Option<u32>,
        spec_id: Option<u32>,
        ability_score: Option<u64>,
        spec_name: Option<&str>,
    ) {
        let mut map = self.inner.lock().unwrap();
        let entry = map.entry(uid).or_insert_with(|| PlayerInfo {
            uid,
            ..Default::default()
        });

        if entry.name.is_none() {
            if let Some(candidate) = name {
                if is_plausible_name(candidate) {
                    entry.name = Some(candidate.trim().to_string());
                }
            }
        }
        if entry.class_id.is_none() {
            if let Some(v) = class_id.filter(|v| *v > 0) {
                entry.class_id = Some(v);
            }
        }
        if entry.spec_id.is_none() {
            if let Some(v) = spec_id.filter(|v| *v > 0) {
                entry.spec_id = Some(v);
            }
        }
        if entry.ability_score.is_none() {
            if let Some(v) = ability_score.filter(|v| *v > 0) {
                entry.ability_score = Some(v);
            }
        }
        if entry.spec_name.is_none() {
            if let Some(candidate) = spec_name.filter(|s| !s.trim().is_empty()) {
                entry.spec_name = Some(candidate.to_string());
            }
        }
    }

    pub fn get(&self, uid: u64) -> Option<PlayerInfo> {
        self.inner.lock().unwrap().get(&uid).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
