//! Wire-level message shapes for the combat stream.
//!
//! Every field is optional: the parser fills in what it can decode and the
//! consumers treat absent values as unknown.

/// Fixed identifier of the game's application service inside Notify frames.
pub const SERVICE_UUID: u64 = 0x0000_0000_6333_5342;

/// Envelope type carried in the frame header (bit 15 is the zstd flag).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Envelope {
    Notify,
    FrameDown,
    Other(u16),
}

impl Envelope {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Envelope::Notify,
            6 => Envelope::FrameDown,
            other => Envelope::Other(other),
        }
    }
}

/// Method ids the pipeline understands. `ServerChange` is a synthetic
/// sentinel enqueued by the capture driver, never seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    ServerChange,
    SyncNearEntities,
    SyncContainerData,
    SyncServerTime,
    SyncNearDeltaInfo,
    SyncToMeDeltaInfo,
}

impl Opcode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0xffff_ffff => Some(Opcode::ServerChange),
            0x06 => Some(Opcode::SyncNearEntities),
            0x15 => Some(Opcode::SyncContainerData),
            0x2b => Some(Opcode::SyncServerTime),
            0x2d => Some(Opcode::SyncNearDeltaInfo),
            0x2e => Some(Opcode::SyncToMeDeltaInfo),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Opcode::ServerChange => 0xffff_ffff,
            Opcode::SyncNearEntities => 0x06,
            Opcode::SyncContainerData => 0x15,
            Opcode::SyncServerTime => 0x2b,
            Opcode::SyncNearDeltaInfo => 0x2d,
            Opcode::SyncToMeDeltaInfo => 0x2e,
        }
    }
}

/// A decoded `(opcode, payload)` record on its way to the encounter engine.
#[derive(Debug, Clone)]
pub struct OpcodeRecord {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Damage classification from the wire. Only `Normal` and `Heal` extend an
/// encounter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DamageKind {
    Normal,
    Miss,
    Heal,
    Immune,
    Fall,
    Absorbed,
    Other(u32),
}

impl DamageKind {
    pub fn from_u32(value: u32) -> Self {
        match value {
            0 => DamageKind::Normal,
            1 => DamageKind::Miss,
            2 => DamageKind::Heal,
            3 => DamageKind::Immune,
            4 => DamageKind::Fall,
            5 => DamageKind::Absorbed,
            other => DamageKind::Other(other),
        }
    }

    /// Normal and Heal reset the idle timer; nothing else does.
    pub fn extends_encounter(self) -> bool {
        matches!(self, DamageKind::Normal | DamageKind::Heal)
    }
}

/// Entity classification from the low 16 bits of a raw wire id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntityKind {
    Monster,
    Character,
    #[default]
    Error,
}

impl EntityKind {
    pub fn from_raw(raw_id: u64) -> Self {
        match raw_id & 0xffff {
            64 => EntityKind::Monster,
            640 => EntityKind::Character,
            _ => EntityKind::Error,
        }
    }
}

/// Stable identifier used everywhere above the parser.
pub fn shift_uid(raw_id: u64) -> u64 {
    raw_id >> 16
}

/// One damage/heal tick inside a `SkillEffect`. Tag numbers 1-18, 21, 24, 25.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DamageInfo {
    pub damage_source: Option<u32>,       // 1
    pub is_miss: Option<bool>,            // 2
    pub is_crit: Option<bool>,            // 3
    pub kind: Option<u32>,                // 4
    pub type_flag: Option<u32>,           // 5
    pub value: Option<u64>,               // 6
    pub actual_value: Option<u64>,        // 7
    pub lucky_value: Option<u64>,         // 8
    pub hp_lessen_value: Option<u64>,     // 9
    pub shield_lessen_value: Option<u64>, // 10
    pub attacker_uuid: Option<u64>,       // 11
    pub owner_id: Option<u32>,            // 12, the skill id
    pub owner_level: Option<u32>,         // 13
    pub owner_stage: Option<u32>,         // 14
    pub hit_event_id: Option<u32>,        // 15
    pub is_normal: Option<bool>,          // 16
    pub is_dead: Option<bool>,            // 17
    pub property: Option<u32>,            // 18
    pub top_summoner_id: Option<u64>,     // 21
    pub is_rainbow: Option<bool>,         // 24
    pub damage_mode: Option<u32>,         // 25
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrPair {
    pub id: u32,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttrCollection {
    pub uuid: Option<u64>,
    pub attrs: Vec<AttrPair>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkillEffect {
    pub uuid: Option<u64>,
    pub damages: Vec<DamageInfo>,
    pub total_value: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AoiSyncDelta {
    pub uuid: Option<u64>,
    pub attrs: Option<AttrCollection>,
    pub skill_effect: Option<SkillEffect>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NearDeltaInfo {
    pub deltas: Vec<AoiSyncDelta>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToMeDeltaInfo {
    pub base_delta: Option<AoiSyncDelta>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncEntity {
    pub uuid: Option<u64>,
    pub ent_type: Option<u32>,
    pub attrs: Option<AttrCollection>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NearEntities {
    pub entities: Vec<SyncEntity>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CharBaseInfo {
    pub char_id: Option<u64>,  // 1
    pub name: Option<String>,  // 5
    pub fight_point: Option<u64>, // 35
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfessionList {
    pub cur_profession_id: Option<u32>, // 1 or 2
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CharSerialize {
    pub base: Option<CharBaseInfo>,       // 2
    pub professions: Option<ProfessionList>, // 61
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerData {
    pub character: Option<CharSerialize>, // 1
}

/// Attribute ids interpreted out of an `AttrCollection`.
pub mod attr_id {
    pub const NAME: u32 = 0x01;
    pub const ENTITY_ID: u32 = 0x0a;
    pub const PROFESSION_ID: u32 = 0xdc;
    pub const FIGHT_POINT: u32 = 0x272e;
    pub const CUR_HP: u32 = 0x2c2e;
    pub const MAX_HP: u32 = 0x2c38;
}

/// The subset of attribute data the pipeline keeps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedAttrs {
    pub name: Option<String>,
    pub class_id: Option<u32>,
    pub fight_point: Option<u64>,
    pub entity_id: Option<u64>,
}
