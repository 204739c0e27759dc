//! Encounter engine: consumes decoded opcode records, attributes damage and
//! healing to attackers, infers specs from observed skills, and runs the
//! idle-timeout lifecycle with a bounded history of completed encounters.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crossbeam_channel::Sender;
use indexmap::IndexMap;

use crate::config::MeterConfig;
use crate::events::{AttackerRow, EncounterSnapshot, EventBus, MeterEvent};
use crate::player_cache::PlayerCache;
use crate::protocol::parser::{
    decode_attrs, is_plausible_name, parse_container_data, parse_near_delta_info,
    parse_near_entities, parse_to_me_delta_info,
};
use crate::protocol::types::{
    shift_uid, AoiSyncDelta, AttrCollection, DamageInfo, DamageKind, EntityKind, Opcode,
    OpcodeRecord,
};
use crate::skill_table;

/// One attributed damage or heal tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DamageEvent {
    pub attacker_uid: u64,
    pub target_uid: u64,
    pub amount: u64,
    pub kind: DamageKind,
    pub is_crit: bool,
    pub is_miss: bool,
    pub timestamp_ms: i64,
}

/// What an encounter knows about an entity it has seen. Fields are set but
/// never cleared.
#[derive(Debug, Clone, Default)]
pub struct EntityInfo {
    pub kind: EntityKind,
    pub name: Option<String>,
    pub class_id: Option<u32>,
    pub spec_name: Option<String>,
    pub ability_score: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct AttackerStats {
    pub uid: u64,
    pub name: Option<String>,
    pub class_id: Option<u32>,
    pub spec_name: Option<String>,
    pub ability_score: Option<u64>,
    pub total_damage: u64,
    pub damage_count: u64,
    pub crit_count: u64,
    pub healing_done: u64,
    pub skill_ids: HashSet<u32>,
    pub damage_by_skill: HashMap<u32, u64>,
    pub healing_by_skill: HashMap<u32, u64>,
}

impl AttackerStats {
    pub fn dps(&self, duration_ms: i64) -> u64 {
        if duration_ms <= 0 {
            return 0;
        }
        self.total_damage.saturating_mul(1000) / duration_ms as u64
    }
}

#[derive(Debug, Clone)]
pub struct Encounter {
    pub start_ms: i64,
    pub last_activity_ms: i64,
    pub is_active: bool,
    pub attackers: IndexMap<u64, AttackerStats>,
    pub all_events: VecDeque<DamageEvent>,
    pub entities: HashMap<u64, EntityInfo>,
}

impl Encounter {
    fn new(now_ms: i64) -> Self {
        Self {
            start_ms: now_ms,
            last_activity_ms: now_ms,
            is_active: true,
            attackers: IndexMap::new(),
            all_events: VecDeque::new(),
            entities: HashMap::new(),
        }
    }

    pub fn duration_ms(&self, now_ms: i64) -> i64 {
        let end = if self.is_active {
            now_ms
        } else {
            self.last_activity_ms
        };
        (end - self.start_ms).max(0)
    }

    pub fn snapshot(&self, now_ms: i64) -> EncounterSnapshot {
        let duration_ms = self.duration_ms(now_ms);
        let mut rows: Vec<AttackerRow> = self
            .attackers
            .values()
            .map(|stats| AttackerRow {
                uid: stats.uid,
                name: stats
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("#{:x}", stats.uid)),
                class_id: stats.class_id,
                spec_name: stats.spec_name.clone(),
                ability_score: stats.ability_score,
                total_damage: stats.total_damage,
                dps: stats.dps(duration_ms),
                damage_count: stats.damage_count,
                crit_count: stats.crit_count,
                healing_done: stats.healing_done,
            })
            .collect();
        rows.sort_by(|a, b| b.total_damage.cmp(&a.total_damage));
        EncounterSnapshot {
            start_ms: self.start_ms,
            duration_ms,
            is_active: self.is_active,
            total_damage: rows.iter().map(|r| r.total_damage).sum(),
            rows,
        }
    }
}

/// The engine proper. All entry points take `now_ms` so callers own the
/// clock; the service wires in wall time, tests inject theirs.
pub struct EncounterEngine {
    current: Option<Encounter>,
    history: VecDeque<Encounter>,
    selected: Option<usize>,
    local_player_uuid: Option<u64>,
    player_cache: Arc<PlayerCache>,
    bus: Arc<EventBus>,
    timer: Sender<i64>,
    reset_timer_seconds: u32,
    max_history: usize,
}

impl EncounterEngine {
    pub fn new(
        player_cache: Arc<PlayerCache>,
        bus: Arc<EventBus>,
        timer: Sender<i64>,
        config: &MeterConfig,
    ) -> Self {
        let config = config.clone().clamped();
        Self {
            current: None,
            history: VecDeque::new(),
            selected: None,
            local_player_uuid: None,
            player_cache,
            bus,
            timer,
            reset_timer_seconds: config.encounter_reset_timer_seconds,
            max_history: config.max_encounter_history as usize,
        }
    }

    pub fn current(&self) -> Option<&Encounter> {
        self.current.as_ref()
    }

    pub fn history(&self) -> &VecDeque<Encounter> {
        &self.history
    }

    pub fn local_player_uid(&self) -> Option<u64> {
        self.local_player_uuid.map(shift_uid)
    }

    pub fn handle_record(&mut self, record: &OpcodeRecord, now_ms: i64) {
        match record.opcode {
            Opcode::ServerChange => {
                log::info!("active server changed, dropping local player binding");
                self.local_player_uuid = None;
                self.bus.emit(MeterEvent::ServerChange);
            }
            Opcode::SyncNearDeltaInfo => {
                let message = parse_near_delta_info(&record.payload);
                for delta in &message.deltas {
                    self.apply_delta(delta, delta.uuid, now_ms);
                }
            }
            Opcode::SyncToMeDeltaInfo => {
                let message = parse_to_me_delta_info(&record.payload);
                if let Some(base) = &message.base_delta {
                    if let Some(uuid) = base.uuid {
                        if self.local_player_uuid != Some(uuid) {
                            log::info!(
                                "local player uuid {:#x} (uid {})",
                                uuid,
                                shift_uid(uuid)
                            );
                            self.local_player_uuid = Some(uuid);
                        }
                    }
                    let target = base.uuid.or(self.local_player_uuid);
                    self.apply_delta(base, target, now_ms);
                }
            }
            Opcode::SyncNearEntities => {
                let message = parse_near_entities(&record.payload);
                for entity in &message.entities {
                    let Some(uuid) = entity.uuid else { continue };
                    if let Some(attrs) = &entity.attrs {
                        self.apply_entity_attrs(uuid, attrs);
                    }
                }
            }
            Opcode::SyncContainerData => {
                let message = parse_container_data(&record.payload);
                self.apply_container(&message);
            }
            Opcode::SyncServerTime => {
                log::trace!("server time sync ({} bytes)", record.payload.len());
            }
        }
    }

    fn apply_delta(&mut self, delta: &AoiSyncDelta, target_uuid: Option<u64>, now_ms: i64) {
        let Some(target_uuid) = target_uuid else { return };
        if let Some(attrs) = &delta.attrs {
            self.apply_entity_attrs(target_uuid, attrs);
        }
        if let Some(effect) = &delta.skill_effect {
            for info in &effect.damages {
                self.process_damage(target_uuid, info, now_ms);
            }
        }
    }

    fn apply_container(&mut self, message: &crate::protocol::types::ContainerData) {
        let Some(character) = &message.character else { return };
        let Some(base) = &character.base else { return };
        let Some(uid) = base.char_id else { return };

        // the container snapshot describes the local character; char id is
        // already the shifted uid
        let profession = character
            .professions
            .as_ref()
            .and_then(|p| p.cur_profession_id);
        self.player_cache.merge(
            uid,
            base.name.as_deref(),
            profession,
            None,
            base.fight_point,
            None,
        );
    }

    fn apply_entity_attrs(&mut self, uuid: u64, attrs: &AttrCollection) {
        let kind = EntityKind::from_raw(uuid);
        let uid = shift_uid(uuid);
        let decoded = decode_attrs(attrs);

        if kind == EntityKind::Character {
            self.player_cache.merge(
                uid,
                decoded.name.as_deref(),
                decoded.class_id,
                None,
                decoded.fight_point,
                None,
            );
        }

        let Some(encounter) = self.current.as_mut() else {
            return;
        };
        let entity = encounter.entities.entry(uid).or_default();
        if entity.kind == EntityKind::Error {
            entity.kind = kind;
        }
        if entity.name.is_none() {
            if let Some(name) = decoded.name.as_deref().filter(|n| is_plausible_name(n)) {
                entity.name = Some(name.to_string());
            }
        }
        if entity.class_id.is_none() {
            entity.class_id = decoded.class_id;
        }
        if entity.ability_score.is_none() {
            entity.ability_score = decoded.fight_point;
        }
    }

    /// Attribute one damage tick. Only Normal and Heal ticks extend the
    /// encounter; everything else is folded into an already-active one and
    /// never touches the idle timer.
    pub fn process_damage(&mut self, target_uuid: u64, info: &DamageInfo, now_ms: i64) {
        let Some(attacker_raw) = info.top_summoner_id.or(info.attacker_uuid) else {
            log::trace!("damage tick without attacker id, dropping");
            return;
        };
        let attacker_uid = shift_uid(attacker_raw);
        let attacker_kind = EntityKind::from_raw(attacker_raw);
        let target_uid = shift_uid(target_uuid);
        let kind = DamageKind::from_u32(info.kind.unwrap_or(0));

        if kind.extends_encounter() {
            self.ensure_active_encounter(now_ms);
            if let Some(encounter) = self.current.as_mut() {
                encounter.last_activity_ms = now_ms;
            }
        } else {
            let active = matches!(&self.current, Some(e) if e.is_active);
            if !active {
                log::trace!("{kind:?} tick outside an active encounter, ignoring");
                return;
            }
        }

        let is_crit = info
            .is_crit
            .unwrap_or_else(|| info.type_flag.unwrap_or(0) & 0x01 != 0);
        let is_miss = info.is_miss.unwrap_or(false) || kind == DamageKind::Miss;
        let amount = info.value.unwrap_or(0);
        let skill_id = info.owner_id.unwrap_or(0);

        let seed = self.player_cache.get(attacker_uid);
        let encounter = self.current.as_mut().expect("encounter exists");
        encounter.all_events.push_back(DamageEvent {
            attacker_uid,
            target_uid,
            amount,
            kind,
            is_crit,
            is_miss,
            timestamp_ms: now_ms,
        });

        let target_kind = EntityKind::from_raw(target_uuid);
        let target_entity = encounter.entities.entry(target_uid).or_default();
        if target_entity.kind == EntityKind::Error {
            target_entity.kind = target_kind;
        }

        if attacker_kind == EntityKind::Character {
            let mut detected: Option<&'static skill_table::SpecRule> = None;
            {
                let stats = encounter
                    .attackers
                    .entry(attacker_uid)
                    .or_insert_with(|| {
                        let mut stats = AttackerStats {
                            uid: attacker_uid,
                            ..Default::default()
                        };
                        if let Some(info) = seed {
                            stats.name = info.name;
                            stats.class_id = info.class_id;
                            stats.spec_name = info.spec_name;
                            stats.ability_score = info.ability_score;
                        }
                        stats
                    });
                stats.skill_ids.insert(skill_id);
                if stats.spec_name.is_none() {
                    if let Some(rule) = skill_table::detect_spec(&stats.skill_ids) {
                        stats.spec_name = Some(rule.spec_name.to_string());
                        stats.class_id = Some(rule.class_id);
                        detected = Some(rule);
                    }
                }

                if kind == DamageKind::Heal {
                    stats.healing_done += amount;
                    *stats.healing_by_skill.entry(skill_id).or_insert(0) += amount;
                } else if kind != DamageKind::Miss {
                    stats.total_damage += amount;
                    stats.damage_count += 1;
                    if is_crit {
                        stats.crit_count += 1;
                    }
                    *stats.damage_by_skill.entry(skill_id).or_insert(0) += amount;
                }
            }

            let attacker_entity = encounter.entities.entry(attacker_uid).or_default();
            attacker_entity.kind = EntityKind::Character;
            if let Some(rule) = detected {
                attacker_entity.spec_name = Some(rule.spec_name.to_string());
                attacker_entity.class_id = Some(rule.class_id);
                self.player_cache.merge(
                    attacker_uid,
                    None,
                    Some(rule.class_id),
                    None,
                    None,
                    Some(rule.spec_name),
                );
            }
        }

        if kind.extends_encounter() {
            self.arm_timer();
        }
        let snapshot = self
            .current
            .as_ref()
            .map(|e| e.snapshot(now_ms))
            .unwrap_or_default();
        self.bus.emit(MeterEvent::EncounterUpdated(snapshot));
    }

    fn ensure_active_encounter(&mut self, now_ms: i64) {
        let needs_new = match &self.current {
            Some(encounter) => !encounter.is_active,
            None => true,
        };
        if needs_new {
            let encounter = Encounter::new(now_ms);
            let snapshot = encounter.snapshot(now_ms);
            self.current = Some(encounter);
            self.bus.emit(MeterEvent::EncounterStarted(snapshot));
        }
    }

    fn arm_timer(&self) {
        if self.reset_timer_seconds == 0 {
            return;
        }
        if let Some(encounter) = &self.current {
            if encounter.is_active {
                let deadline = encounter.last_activity_ms + self.reset_timer_seconds as i64 * 1000;
                let _ = self.timer.send(deadline);
            }
        }
    }

    /// Idle timer callback. Finalizes the encounter when the quiet period
    /// has really elapsed, otherwise returns the deadline to re-arm for.
    pub fn on_idle_timeout(&mut self, now_ms: i64) -> Option<i64> {
        let timeout_ms = self.reset_timer_seconds as i64 * 1000;
        if timeout_ms == 0 {
            return None;
        }
        let last_activity = match &self.current {
            Some(encounter) if encounter.is_active => encounter.last_activity_ms,
            _ => return None,
        };
        if now_ms - last_activity >= timeout_ms {
            self.finalize_current();
            None
        } else {
            Some(last_activity + timeout_ms)
        }
    }

    /// Close the active encounter and move it into history. It stays the
    /// "current" reference until a new one begins, so the last result keeps
    /// showing.
    fn finalize_current(&mut self) {
        let Some(encounter) = self.current.as_mut() else {
            return;
        };
        if !encounter.is_active {
            return;
        }
        encounter.is_active = false;
        encounter.last_activity_ms = encounter
            .all_events
            .iter()
            .map(|e| e.timestamp_ms)
            .max()
            .unwrap_or(encounter.start_ms);

        let snapshot = encounter.snapshot(encounter.last_activity_ms);
        log::info!(
            "encounter ended: {}ms, {} attackers, {} total damage",
            snapshot.duration_ms,
            snapshot.rows.len(),
            snapshot.total_damage
        );
        let completed = encounter.clone();
        self.history.push_front(completed);
        while self.history.len() > self.max_history {
            self.history.pop_back();
        }
        self.bus.emit(MeterEvent::EncounterEnded(snapshot));
        self.bus.emit(MeterEvent::HistoryChanged);
    }

    /// React to a runtime settings change.
    pub fn apply_settings(&mut self, config: &MeterConfig, now_ms: i64) {
        let config = config.clone().clamped();

        if config.encounter_reset_timer_seconds != self.reset_timer_seconds {
            self.reset_timer_seconds = config.encounter_reset_timer_seconds;
            let active = matches!(&self.current, Some(e) if e.is_active);
            if active && self.reset_timer_seconds > 0 {
                let last_activity = self.current.as_ref().expect("active encounter").last_activity_ms;
                let deadline = last_activity + self.reset_timer_seconds as i64 * 1000;
                if deadline <= now_ms {
                    self.finalize_current();
                } else {
                    let _ = self.timer.send(deadline);
                }
            }
        }

        let new_max = config.max_encounter_history as usize;
        if new_max != self.max_history {
            self.max_history = new_max;
            if self.history.len() > new_max {
                self.history.truncate(new_max);
                self.bus.emit(MeterEvent::HistoryChanged);
            }
        }
    }

    /// Change which encounter subscribers should display. `None` selects
    /// the live one.
    pub fn select_encounter(&mut self, index: Option<usize>, now_ms: i64) {
        let snapshot = match index {
            None => {
                self.selected = None;
                self.current.as_ref().map(|e| e.snapshot(now_ms))
            }
            Some(i) => match self.history.get(i) {
                Some(encounter) => {
                    self.selected = Some(i);
                    Some(encounter.snapshot(now_ms))
                }
                None => {
                    log::warn!("no encounter at history index {i}");
                    return;
                }
            },
        };
        self.bus.emit(MeterEvent::SelectedEncounterChanged(snapshot));
    }

    pub fn selected(&self) -> Option<usize> {
        self.selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use crossbeam_channel::{unbounded, Receiver};

    const PLAYER_RAW: u64 = 0x04b0_0280; // low 16 = 640 -> character
    const PLAYER_UID: u64 = 0x04b0;
    const MONSTER_RAW: u64 = 0x0777_0040; // low 16 = 64 -> monster

    fn engine_with(config: MeterConfig) -> (EncounterEngine, Receiver<MeterEvent>, Receiver<i64>) {
        let bus = Arc::new(EventBus::new());
        let events = bus.subscribe();
        let (timer_tx, timer_rx) = unbounded();
        let cache = Arc::new(PlayerCache::new());
        let engine = EncounterEngine::new(cache, bus, timer_tx, &config);
        (engine, events, timer_rx)
    }

    fn engine() -> (EncounterEngine, Receiver<MeterEvent>, Receiver<i64>) {
        engine_with(MeterConfig {
            encounter_reset_timer_seconds: 3,
            ..Default::default()
        })
    }

    fn damage(attacker: u64, skill: u32, value: u64, kind: u32) -> DamageInfo {
        DamageInfo {
            attacker_uuid: Some(attacker),
            owner_id: Some(skill),
            value: Some(value),
            kind: Some(kind),
            ..Default::default()
        }
    }

    fn drain(rx: &Receiver<MeterEvent>) -> Vec<MeterEvent> {
        rx.try_iter().collect()
    }

    #[test]
    fn first_damage_starts_encounter_and_attributes_it() {
        let (mut engine, events, timer) = engine();
        engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 1714, 1000, 0), 0);

        let emitted = drain(&events);
        assert!(matches!(emitted[0], MeterEvent::EncounterStarted(_)));
        let MeterEvent::EncounterUpdated(snapshot) = &emitted[1] else {
            panic!("expected update, got {:?}", emitted[1]);
        };
        assert_eq!(snapshot.total_damage, 1000);

        let encounter = engine.current().unwrap();
        let stats = &encounter.attackers[&PLAYER_UID];
        assert_eq!(stats.total_damage, 1000);
        assert_eq!(stats.damage_count, 1);
        assert_eq!(stats.spec_name.as_deref(), Some("Iaido"));
        assert_eq!(stats.class_id, Some(1));
        assert_eq!(stats.damage_by_skill[&1714], 1000);
        // deadline armed at last_activity + 3s
        assert_eq!(timer.try_recv().unwrap(), 3000);
    }

    #[test]
    fn heal_counts_only_as_healing() {
        let (mut engine, _events, _timer) = engine();
        engine.process_damage(PLAYER_RAW, &damage(PLAYER_RAW, 1714, 1000, 2), 0);

        let stats = &engine.current().unwrap().attackers[&PLAYER_UID];
        assert_eq!(stats.healing_done, 1000);
        assert_eq!(stats.total_damage, 0);
        assert_eq!(stats.damage_count, 0);
        assert_eq!(stats.healing_by_skill[&1714], 1000);
    }

    #[test]
    fn miss_contributes_to_neither() {
        let (mut engine, _events, _timer) = engine();
        engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 1714, 500, 0), 0);
        let mut miss = damage(PLAYER_RAW, 1714, 500, 1);
        miss.is_miss = Some(true);
        engine.process_damage(MONSTER_RAW, &miss, 100);

        let encounter = engine.current().unwrap();
        let stats = &encounter.attackers[&PLAYER_UID];
        assert_eq!(stats.total_damage, 500);
        assert_eq!(stats.damage_count, 1);
        assert_eq!(stats.healing_done, 0);
        // the miss is still recorded as an event
        assert_eq!(encounter.all_events.len(), 2);
        assert!(encounter.all_events[1].is_miss);
        // and it does not extend the encounter
        assert_eq!(encounter.last_activity_ms, 0);
    }

    #[test]
    fn non_extending_kinds_accumulate_but_do_not_reset_idle() {
        let (mut engine, _events, timer) = engine();
        engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 1714, 100, 0), 0);
        let _ = timer.try_recv();

        // immune tick at t=1000 adds damage but leaves the timer alone
        engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 1714, 50, 3), 1000);
        let encounter = engine.current().unwrap();
        assert_eq!(encounter.attackers[&PLAYER_UID].total_damage, 150);
        assert_eq!(encounter.last_activity_ms, 0);
        assert!(timer.try_recv().is_err());
    }

    #[test]
    fn non_extending_tick_without_encounter_is_ignored() {
        let (mut engine, events, _timer) = engine();
        engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 1714, 50, 3), 0);
        assert!(engine.current().is_none());
        assert!(drain(&events).is_empty());
    }

    #[test]
    fn monster_attacker_recorded_without_stats() {
        let (mut engine, _events, _timer) = engine();
        engine.process_damage(PLAYER_RAW, &damage(MONSTER_RAW, 9001, 777, 0), 0);

        let encounter = engine.current().unwrap();
        assert!(encounter.attackers.is_empty());
        assert_eq!(encounter.all_events.len(), 1);
        assert_eq!(encounter.all_events[0].amount, 777);
    }

    #[test]
    fn error_kind_attacker_recorded_without_stats() {
        let (mut engine, _events, _timer) = engine();
        engine.process_damage(MONSTER_RAW, &damage(0x1234_0001, 1, 10, 0), 0);
        let encounter = engine.current().unwrap();
        assert!(encounter.attackers.is_empty());
        assert_eq!(encounter.all_events.len(), 1);
    }

    #[test]
    fn missing_attacker_id_drops_tick() {
        let (mut engine, events, _timer) = engine();
        let info = DamageInfo {
            value: Some(10),
            kind: Some(0),
            ..Default::default()
        };
        engine.process_damage(MONSTER_RAW, &info, 0);
        assert!(engine.current().is_none());
        assert!(drain(&events).is_empty());
    }

    #[test]
    fn top_summoner_takes_precedence_over_attacker() {
        let (mut engine, _events, _timer) = engine();
        let mut info = damage(0x9999_0040, 1714, 42, 0);
        info.top_summoner_id = Some(PLAYER_RAW);
        engine.process_damage(MONSTER_RAW, &info, 0);
        assert_eq!(
            engine.current().unwrap().attackers[&PLAYER_UID].total_damage,
            42
        );
    }

    #[test]
    fn crit_from_flag_or_type_flag() {
        let (mut engine, _events, _timer) = engine();
        let mut explicit = damage(PLAYER_RAW, 1714, 10, 0);
        explicit.is_crit = Some(true);
        engine.process_damage(MONSTER_RAW, &explicit, 0);

        let mut flagged = damage(PLAYER_RAW, 1714, 10, 0);
        flagged.type_flag = Some(0x01);
        engine.process_damage(MONSTER_RAW, &flagged, 10);

        let plain = damage(PLAYER_RAW, 1714, 10, 0);
        engine.process_damage(MONSTER_RAW, &plain, 20);

        let stats = &engine.current().unwrap().attackers[&PLAYER_UID];
        assert_eq!(stats.crit_count, 2);
        assert_eq!(stats.damage_count, 3);
        assert!(stats.crit_count <= stats.damage_count);
    }

    #[test]
    fn idle_timeout_finalizes_at_last_event_timestamp() {
        let (mut engine, events, _timer) = engine();
        engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 1714, 100, 0), 0);
        engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 1734, 100, 0), 2000);
        drain(&events);

        // quiet period not over yet: re-arm for last_activity + timeout
        assert_eq!(engine.on_idle_timeout(4000), Some(5000));
        assert!(engine.current().unwrap().is_active);

        assert_eq!(engine.on_idle_timeout(5500), None);
        let encounter = engine.current().unwrap();
        assert!(!encounter.is_active);
        assert_eq!(encounter.last_activity_ms, 2000);
        assert_eq!(encounter.duration_ms(99999), 2000);
        assert_eq!(engine.history().len(), 1);

        let emitted = drain(&events);
        assert!(matches!(emitted[0], MeterEvent::EncounterEnded(_)));
        assert!(matches!(emitted[1], MeterEvent::HistoryChanged));
    }

    #[test]
    fn zero_timeout_never_finalizes() {
        let (mut engine, _events, timer) = engine_with(MeterConfig {
            encounter_reset_timer_seconds: 0,
            ..Default::default()
        });
        engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 1714, 100, 0), 0);
        // no deadline ever armed
        assert!(timer.try_recv().is_err());
        // ten minutes of silence changes nothing
        assert_eq!(engine.on_idle_timeout(600_000), None);
        assert!(engine.current().unwrap().is_active);
        assert!(engine.history().is_empty());
    }

    #[test]
    fn next_extending_event_after_finalize_starts_fresh() {
        let (mut engine, events, _timer) = engine();
        engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 1714, 100, 0), 0);
        engine.on_idle_timeout(10_000);
        drain(&events);

        engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 1714, 55, 0), 20_000);
        let emitted = drain(&events);
        assert!(matches!(emitted[0], MeterEvent::EncounterStarted(_)));
        let encounter = engine.current().unwrap();
        assert!(encounter.is_active);
        assert_eq!(encounter.start_ms, 20_000);
        assert_eq!(encounter.attackers[&PLAYER_UID].total_damage, 55);
    }

    #[test]
    fn history_is_bounded_and_most_recent_first() {
        let (mut engine, _events, _timer) = engine_with(MeterConfig {
            encounter_reset_timer_seconds: 1,
            max_encounter_history: 2,
            ..Default::default()
        });
        for i in 0..4i64 {
            let t = i * 100_000;
            engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 1714, 100, 0), t);
            engine.on_idle_timeout(t + 50_000);
        }
        assert_eq!(engine.history().len(), 2);
        assert!(engine.history()[0].start_ms > engine.history()[1].start_ms);
    }

    #[test]
    fn shrinking_history_trims_oldest() {
        let (mut engine, events, _timer) = engine_with(MeterConfig {
            encounter_reset_timer_seconds: 1,
            max_encounter_history: 10,
            ..Default::default()
        });
        for i in 0..3i64 {
            let t = i * 100_000;
            engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 1714, 100, 0), t);
            engine.on_idle_timeout(t + 50_000);
        }
        drain(&events);

        engine.apply_settings(
            &MeterConfig {
                encounter_reset_timer_seconds: 1,
                max_encounter_history: 1,
                ..Default::default()
            },
            400_000,
        );
        assert_eq!(engine.history().len(), 1);
        assert_eq!(engine.history()[0].start_ms, 200_000);
        assert!(drain(&events)
            .iter()
            .any(|e| matches!(e, MeterEvent::HistoryChanged)));
    }

    #[test]
    fn shortening_timeout_past_due_finalizes_immediately() {
        let (mut engine, events, _timer) = engine_with(MeterConfig {
            encounter_reset_timer_seconds: 60,
            ..Default::default()
        });
        engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 1714, 100, 0), 0);
        drain(&events);

        engine.apply_settings(
            &MeterConfig {
                encounter_reset_timer_seconds: 2,
                ..Default::default()
            },
            10_000,
        );
        assert!(!engine.current().unwrap().is_active);
        assert_eq!(engine.history().len(), 1);
    }

    #[test]
    fn shortening_timeout_still_pending_rearms() {
        let (mut engine, _events, timer) = engine_with(MeterConfig {
            encounter_reset_timer_seconds: 60,
            ..Default::default()
        });
        engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 1714, 100, 0), 0);
        let _ = timer.try_recv();

        engine.apply_settings(
            &MeterConfig {
                encounter_reset_timer_seconds: 10,
                ..Default::default()
            },
            3_000,
        );
        assert!(engine.current().unwrap().is_active);
        assert_eq!(timer.try_recv().unwrap(), 10_000);
    }

    #[test]
    fn damage_totals_match_events_and_skills() {
        let (mut engine, _events, _timer) = engine();
        engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 1714, 100, 0), 0);
        engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 1734, 250, 0), 10);
        engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 1714, 50, 2), 20); // heal
        engine.process_damage(PLAYER_RAW, &damage(MONSTER_RAW, 5, 999, 0), 30); // monster

        let encounter = engine.current().unwrap();
        let character_damage: u64 = encounter
            .all_events
            .iter()
            .filter(|e| {
                !matches!(e.kind, DamageKind::Miss | DamageKind::Heal)
                    && encounter.attackers.contains_key(&e.attacker_uid)
            })
            .map(|e| e.amount)
            .sum();
        let stats_total: u64 = encounter.attackers.values().map(|s| s.total_damage).sum();
        assert_eq!(stats_total, character_damage);

        for stats in encounter.attackers.values() {
            assert_eq!(
                stats.damage_by_skill.values().sum::<u64>(),
                stats.total_damage
            );
            assert!(stats.crit_count <= stats.damage_count);
        }
        assert!(encounter.start_ms <= encounter.last_activity_ms);
    }

    #[test]
    fn select_encounter_emits_snapshot() {
        let (mut engine, events, _timer) = engine();
        engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 1714, 100, 0), 0);
        engine.on_idle_timeout(10_000);
        drain(&events);

        engine.select_encounter(Some(0), 11_000);
        let emitted = drain(&events);
        let MeterEvent::SelectedEncounterChanged(Some(snapshot)) = &emitted[0] else {
            panic!("expected selection event, got {:?}", emitted[0]);
        };
        assert_eq!(snapshot.total_damage, 100);
        assert_eq!(engine.selected(), Some(0));

        // out-of-range selection is refused
        engine.select_encounter(Some(9), 11_000);
        assert!(drain(&events).is_empty());
        assert_eq!(engine.selected(), Some(0));

        engine.select_encounter(None, 11_000);
        assert!(matches!(
            drain(&events)[0],
            MeterEvent::SelectedEncounterChanged(Some(_))
        ));
        assert_eq!(engine.selected(), None);
    }

    #[test]
    fn near_delta_record_flows_into_stats() {
        let (mut engine, _events, _timer) = engine();
        let payload = encode_near_delta(MONSTER_RAW, &[damage(PLAYER_RAW, 1714, 1000, 0)]);
        engine.handle_record(
            &OpcodeRecord {
                opcode: Opcode::SyncNearDeltaInfo,
                payload,
            },
            0,
        );
        assert_eq!(
            engine.current().unwrap().attackers[&PLAYER_UID].total_damage,
            1000
        );
    }

    #[test]
    fn to_me_delta_binds_local_player() {
        let (mut engine, _events, _timer) = engine();
        let inner = encode_near_delta(PLAYER_RAW, &[]);
        let mut r = crate::protocol::reader::WireReader::new(&inner);
        let _ = r.read_tag();
        let delta = r.read_bytes().to_vec();
        let mut container = Vec::new();
        put_len_field(&mut container, 2, &delta);
        let mut payload = Vec::new();
        put_len_field(&mut payload, 1, &container);

        engine.handle_record(
            &OpcodeRecord {
                opcode: Opcode::SyncToMeDeltaInfo,
                payload,
            },
            0,
        );
        assert_eq!(engine.local_player_uid(), Some(PLAYER_UID));

        // a server change clears the binding
        engine.handle_record(
            &OpcodeRecord {
                opcode: Opcode::ServerChange,
                payload: Vec::new(),
            },
            10,
        );
        assert_eq!(engine.local_player_uid(), None);
    }

    #[test]
    fn container_data_merges_into_player_cache() {
        let (mut engine, _events, _timer) = engine();
        let payload = encode_container_data(PLAYER_UID, "Starlight", 8421, 11);
        engine.handle_record(
            &OpcodeRecord {
                opcode: Opcode::SyncContainerData,
                payload,
            },
            0,
        );

        // the cached identity seeds the attacker row on first damage
        engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 42, 10, 0), 100);
        let stats = &engine.current().unwrap().attackers[&PLAYER_UID];
        assert_eq!(stats.name.as_deref(), Some("Starlight"));
        assert_eq!(stats.class_id, Some(11));
        assert_eq!(stats.ability_score, Some(8421));
    }

    #[test]
    fn near_entities_populate_cache_and_entities() {
        let (mut engine, _events, _timer) = engine();
        // an encounter must exist for the entity table to fill
        engine.process_damage(MONSTER_RAW, &damage(PLAYER_RAW, 42, 10, 0), 0);

        let entity = encode_sync_entity(0x1111_0280, 1, Some(("Rin", 2)));
        let mut payload = Vec::new();
        put_len_field(&mut payload, 1, &entity);
        engine.handle_record(
            &OpcodeRecord {
                opcode: Opcode::SyncNearEntities,
                payload,
            },
            10,
        );

        let encounter = engine.current().unwrap();
        let info = &encounter.entities[&0x1111];
        assert_eq!(info.kind, EntityKind::Character);
        assert_eq!(info.name.as_deref(), Some("Rin"));
        assert_eq!(info.class_id, Some(2));
    }
}
