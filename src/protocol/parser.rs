//! Lenient decoders for the handful of combat messages the pipeline needs.
//!
//! Every parser walks the field stream tag by tag: known fields with the
//! expected wire type are decoded, everything else goes through
//! `safe_skip_last_field`. Parse problems never escape a field boundary;
//! the worst case is a partially-filled message.

use std::collections::HashSet;
use std::sync::Mutex;

use lazy_static::lazy_static;

use crate::protocol::reader::{WireReader, WIRE_LEN, WIRE_VARINT};
use crate::protocol::types::*;

// Entity lists nest speculatively; keep that bounded.
const MAX_ENTITY_NESTING: u8 = 4;
const MAX_NAME_SALVAGE_DEPTH: u8 = 3;

lazy_static! {
    // Tracks unknown field numbers already reported, to keep discovery
    // logging to one line per field.
    static ref DISCOVERED_FIELDS: Mutex<HashSet<(&'static str, u32)>> = Mutex::new(HashSet::new());
}

fn log_unknown_field(message: &'static str, field: u32, wire: u8) {
    let mut seen = DISCOVERED_FIELDS.lock().unwrap();
    if seen.insert((message, field)) {
        log::debug!("{message}: unhandled field #{field} (wire {wire})");
    }
}

pub fn parse_near_delta_info(data: &[u8]) -> NearDeltaInfo {
    let mut out = NearDeltaInfo::default();
    let mut r = WireReader::new(data);
    loop {
        let (field, wire) = r.read_tag();
        if field == 0 {
            break;
        }
        match (field, wire) {
            (1, WIRE_LEN) => out.deltas.push(parse_aoi_sync_delta(r.read_bytes())),
            _ => {
                log_unknown_field("near-delta", field, wire);
                r.safe_skip_last_field();
            }
        }
    }
    out
}

pub fn parse_to_me_delta_info(data: &[u8]) -> ToMeDeltaInfo {
    let mut out = ToMeDeltaInfo::default();
    let mut r = WireReader::new(data);
    loop {
        let (field, wire) = r.read_tag();
        if field == 0 {
            break;
        }
        match (field, wire) {
            (1, WIRE_LEN) => {
                // delta container; the base delta sits at field 2 inside
                let container = r.read_bytes();
                let mut inner = WireReader::new(container);
                loop {
                    let (field, wire) = inner.read_tag();
                    if field == 0 {
                        break;
                    }
                    match (field, wire) {
                        (2, WIRE_LEN) => {
                            out.base_delta = Some(parse_aoi_sync_delta(inner.read_bytes()));
                        }
                        _ => inner.safe_skip_last_field(),
                    }
                }
            }
            _ => r.safe_skip_last_field(),
        }
    }
    out
}

fn parse_aoi_sync_delta(data: &[u8]) -> AoiSyncDelta {
    let mut out = AoiSyncDelta::default();
    let mut r = WireReader::new(data);
    loop {
        let (field, wire) = r.read_tag();
        if field == 0 {
            break;
        }
        match (field, wire) {
            (1, WIRE_VARINT) => out.uuid = Some(r.read_varint()),
            (6, WIRE_LEN) => out.attrs = Some(parse_attr_collection(r.read_bytes())),
            (7, WIRE_LEN) => out.skill_effect = Some(parse_skill_effect(r.read_bytes())),
            _ => {
                log_unknown_field("aoi-delta", field, wire);
                r.safe_skip_last_field();
            }
        }
    }
    out
}

fn parse_skill_effect(data: &[u8]) -> SkillEffect {
    let mut out = SkillEffect::default();
    let mut r = WireReader::new(data);
    loop {
        let (field, wire) = r.read_tag();
        if field == 0 {
            break;
        }
        match (field, wire) {
            (1, WIRE_VARINT) => out.uuid = Some(r.read_varint()),
            (2, WIRE_LEN) => out.damages.push(parse_damage_info(r.read_bytes())),
            (3, WIRE_VARINT) => out.total_value = Some(r.read_varint()),
            _ => r.safe_skip_last_field(),
        }
    }
    out
}

fn parse_damage_info(data: &[u8]) -> DamageInfo {
    let mut out = DamageInfo::default();
    let mut r = WireReader::new(data);
    loop {
        let (field, wire) = r.read_tag();
        if field == 0 {
            break;
        }
        if wire != WIRE_VARINT {
            log_unknown_field("damage-info", field, wire);
            r.safe_skip_last_field();
            continue;
        }
        let v = r.read_varint();
        match field {
            1 => out.damage_source = Some(v as u32),
            2 => out.is_miss = Some(v != 0),
            3 => out.is_crit = Some(v != 0),
            4 => out.kind = Some(v as u32),
            5 => out.type_flag = Some(v as u32),
            6 => out.value = Some(v),
            7 => out.actual_value = Some(v),
            8 => out.lucky_value = Some(v),
            9 => out.hp_lessen_value = Some(v),
            10 => out.shield_lessen_value = Some(v),
            11 => out.attacker_uuid = Some(v),
            12 => out.owner_id = Some(v as u32),
            13 => out.owner_level = Some(v as u32),
            14 => out.owner_stage = Some(v as u32),
            15 => out.hit_event_id = Some(v as u32),
            16 => out.is_normal = Some(v != 0),
            17 => out.is_dead = Some(v != 0),
            18 => out.property = Some(v as u32),
            21 => out.top_summoner_id = Some(v),
            24 => out.is_rainbow = Some(v != 0),
            25 => out.damage_mode = Some(v as u32),
            _ => log_unknown_field("damage-info", field, wire),
        }
    }
    out
}

pub fn parse_near_entities(data: &[u8]) -> NearEntities {
    parse_near_entities_nested(data, 0)
}

fn parse_near_entities_nested(data: &[u8], depth: u8) -> NearEntities {
    let mut out = NearEntities::default();
    if depth >= MAX_ENTITY_NESTING {
        return out;
    }
    let mut r = WireReader::new(data);
    loop {
        let (field, wire) = r.read_tag();
        if field == 0 {
            break;
        }
        if wire != WIRE_LEN {
            r.safe_skip_last_field();
            continue;
        }
        let bytes = r.read_bytes();
        if field == 1 {
            out.entities.push(parse_sync_entity(bytes));
            continue;
        }
        // Some server builds move the entity list to other field numbers.
        // Try the subtree as an entity, then as a nested entity list, and
        // stay silent when neither works.
        let speculative = parse_sync_entity(bytes);
        if speculative.uuid.is_some() || speculative.attrs.is_some() {
            out.entities.push(speculative);
        } else {
            let nested = parse_near_entities_nested(bytes, depth + 1);
            out.entities.extend(nested.entities);
        }
    }
    out
}

fn parse_sync_entity(data: &[u8]) -> SyncEntity {
    let mut out = SyncEntity::default();
    let mut r = WireReader::new(data);
    loop {
        let (field, wire) = r.read_tag();
        if field == 0 {
            break;
        }
        match (field, wire) {
            (1, WIRE_VARINT) => out.uuid = Some(r.read_varint()),
            (2, WIRE_VARINT) => out.ent_type = Some(r.read_varint() as u32),
            (3, WIRE_LEN) => out.attrs = Some(parse_attr_collection(r.read_bytes())),
            _ => r.safe_skip_last_field(),
        }
    }
    out
}

fn parse_attr_collection(data: &[u8]) -> AttrCollection {
    let mut out = AttrCollection::default();
    let mut r = WireReader::new(data);
    loop {
        let (field, wire) = r.read_tag();
        if field == 0 {
            break;
        }
        match (field, wire) {
            (1, WIRE_VARINT) => out.uuid = Some(r.read_varint()),
            (2, WIRE_LEN) => {
                let pair = parse_attr_pair(r.read_bytes());
                out.attrs.push(pair);
            }
            _ => r.safe_skip_last_field(),
        }
    }
    out
}

fn parse_attr_pair(data: &[u8]) -> AttrPair {
    let mut out = AttrPair::default();
    let mut r = WireReader::new(data);
    loop {
        let (field, wire) = r.read_tag();
        if field == 0 {
            break;
        }
        match (field, wire) {
            (1, WIRE_VARINT) => out.id = r.read_varint() as u32,
            (2, WIRE_LEN) => out.raw = r.read_bytes().to_vec(),
            _ => r.safe_skip_last_field(),
        }
    }
    out
}

pub fn parse_container_data(data: &[u8]) -> ContainerData {
    let mut out = ContainerData::default();
    let mut r = WireReader::new(data);
    loop {
        let (field, wire) = r.read_tag();
        if field == 0 {
            break;
        }
        match (field, wire) {
            (1, WIRE_LEN) => out.character = Some(parse_char_serialize(r.read_bytes())),
            _ => r.safe_skip_last_field(),
        }
    }
    out
}

fn parse_char_serialize(data: &[u8]) -> CharSerialize {
    let mut out = CharSerialize::default();
    let mut r = WireReader::new(data);
    loop {
        let (field, wire) = r.read_tag();
        if field == 0 {
            break;
        }
        match (field, wire) {
            (2, WIRE_LEN) => out.base = Some(parse_char_base_info(r.read_bytes())),
            (61, WIRE_LEN) => out.professions = Some(parse_profession_list(r.read_bytes())),
            _ => r.safe_skip_last_field(),
        }
    }
    out
}

fn parse_char_base_info(data: &[u8]) -> CharBaseInfo {
    let mut out = CharBaseInfo::default();
    let mut r = WireReader::new(data);
    loop {
        let (field, wire) = r.read_tag();
        if field == 0 {
            break;
        }
        match (field, wire) {
            (1, WIRE_VARINT) => out.char_id = Some(r.read_varint()),
            (5, WIRE_LEN) => {
                if let Ok(name) = std::str::from_utf8(r.read_bytes()) {
                    if is_plausible_name(name) {
                        out.name = Some(name.to_string());
                    }
                }
            }
            (35, WIRE_VARINT) => out.fight_point = Some(r.read_varint()),
            _ => r.safe_skip_last_field(),
        }
    }
    out
}

fn parse_profession_list(data: &[u8]) -> ProfessionList {
    let mut out = ProfessionList::default();
    let mut r = WireReader::new(data);
    loop {
        let (field, wire) = r.read_tag();
        if field == 0 {
            break;
        }
        match (field, wire) {
            (1, WIRE_VARINT) | (2, WIRE_VARINT) => {
                let v = r.read_varint() as u32;
                if out.cur_profession_id.is_none() {
                    out.cur_profession_id = Some(v);
                }
            }
            _ => r.safe_skip_last_field(),
        }
    }
    out
}

// --- ATTRIBUTE DICTIONARY ---

/// Interpret the attribute pairs the pipeline cares about. HP attrs are
/// decoded only for debug logging; they are not retained in stats.
pub fn decode_attrs(collection: &AttrCollection) -> DecodedAttrs {
    let mut out = DecodedAttrs::default();
    for pair in &collection.attrs {
        match pair.id {
            attr_id::NAME => {
                if out.name.is_none() {
                    out.name = salvage_name(&pair.raw);
                }
            }
            attr_id::PROFESSION_ID => {
                let v = varint_value(&pair.raw) as u32;
                if v > 0 {
                    out.class_id = Some(v);
                }
            }
            attr_id::FIGHT_POINT => {
                let v = varint_value(&pair.raw);
                if v > 0 {
                    out.fight_point = Some(v);
                }
            }
            attr_id::ENTITY_ID => out.entity_id = Some(varint_value(&pair.raw)),
            attr_id::CUR_HP | attr_id::MAX_HP => {
                log::trace!("hp attr {:#x} = {}", pair.id, varint_value(&pair.raw));
            }
            other => log_unknown_field("attr", other, WIRE_LEN),
        }
    }
    out
}

fn varint_value(raw: &[u8]) -> u64 {
    crate::protocol::reader::varint_at(raw, 0).0
}

// --- NAME SALVAGE ---

/// Pull a plausible display name out of an attribute blob.
///
/// The primary encoding is a one-byte prefix followed by UTF-8; broken
/// server builds have shipped plain UTF-8 at offsets 0..4, UTF-16 in either
/// byte order, and names wrapped in a nested message. Candidates are tried
/// in that order and the first one passing the validity filter wins.
pub fn salvage_name(raw: &[u8]) -> Option<String> {
    salvage_name_at_depth(raw, 0)
}

fn salvage_name_at_depth(raw: &[u8], depth: u8) -> Option<String> {
    if raw.is_empty() || depth >= MAX_NAME_SALVAGE_DEPTH {
        return None;
    }

    if let Some(name) = utf8_candidate(&raw[1..]) {
        return Some(name);
    }
    for offset in 0..=4usize.min(raw.len()) {
        if let Some(name) = utf8_candidate(&raw[offset..]) {
            return Some(name);
        }
    }
    for offset in 0..=4usize.min(raw.len()) {
        if let Some(name) = utf16_candidate(&raw[offset..], true) {
            return Some(name);
        }
        if let Some(name) = utf16_candidate(&raw[offset..], false) {
            return Some(name);
        }
    }

    // Last resort: treat the blob as a nested message and salvage from any
    // length-delimited subtree.
    let mut r = WireReader::new(raw);
    loop {
        let (field, wire) = r.read_tag();
        if field == 0 {
            break;
        }
        if wire == WIRE_LEN {
            if let Some(name) = salvage_name_at_depth(r.read_bytes(), depth + 1) {
                return Some(name);
            }
        } else {
            r.safe_skip_last_field();
        }
    }
    None
}

fn utf8_candidate(bytes: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(bytes).ok()?;
    let trimmed = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if is_plausible_name(trimmed) {
        Some(trimmed.to_string())
    } else {
        None
    }
}

fn utf16_candidate(bytes: &[u8], little_endian: bool) -> Option<String> {
    if bytes.len() < 2 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| {
            if little_endian {
                u16::from_le_bytes([c[0], c[1]])
            } else {
                u16::from_be_bytes([c[0], c[1]])
            }
        })
        .collect();
    let text = String::from_utf16(&units).ok()?;
    let trimmed = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if is_plausible_name(trimmed) {
        Some(trimmed.to_string())
    } else {
        None
    }
}

/// Validity filter for display names. Placeholder strings containing
/// "Unknown" never pass, so a real name is never clobbered by one.
pub fn is_plausible_name(name: &str) -> bool {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return false;
    }
    let total = trimmed.chars().count();
    if total > 64 {
        return false;
    }
    let friendly = trimmed
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || "-_.'".contains(*c))
        .count();
    friendly * 2 >= total
        && trimmed.chars().any(|c| c.is_alphabetic())
        && !trimmed.to_lowercase().contains("unknown")
}
