//! Wire-building helpers for tests: varint/tag encoders plus frame and
//! message constructors matching the formats the decoders consume.

use crate::protocol::types::DamageInfo;

pub fn encode_varint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
    out
}

pub fn put_varint_field(buf: &mut Vec<u8>, field: u32, value: u64) {
    buf.extend_from_slice(&encode_varint((field as u64) << 3));
    buf.extend_from_slice(&encode_varint(value));
}

pub fn put_len_field(buf: &mut Vec<u8>, field: u32, bytes: &[u8]) {
    buf.extend_from_slice(&encode_varint(((field as u64) << 3) | 2));
    buf.extend_from_slice(&encode_varint(bytes.len() as u64));
    buf.extend_from_slice(bytes);
}

pub fn encode_damage_info(info: &DamageInfo) -> Vec<u8> {
    let mut buf = Vec::new();
    let bool_v = |b: bool| if b { 1 } else { 0 };
    if let Some(v) = info.damage_source {
        put_varint_field(&mut buf, 1, v as u64);
    }
    if let Some(v) = info.is_miss {
        put_varint_field(&mut buf, 2, bool_v(v));
    }
    if let Some(v) = info.is_crit {
        put_varint_field(&mut buf, 3, bool_v(v));
    }
    if let Some(v) = info.kind {
        put_varint_field(&mut buf, 4, v as u64);
    }
    if let Some(v) = info.type_flag {
        put_varint_field(&mut buf, 5, v as u64);
    }
    if let Some(v) = info.value {
        put_varint_field(&mut buf, 6, v);
    }
    if let Some(v) = info.actual_value {
        put_varint_field(&mut buf, 7, v);
    }
    if let Some(v) = info.lucky_value {
        put_varint_field(&mut buf, 8, v);
    }
    if let Some(v) = info.hp_lessen_value {
        put_varint_field(&mut buf, 9, v);
    }
    if let Some(v) = info.shield_lessen_value {
        put_varint_field(&mut buf, 10, v);
    }
    if let Some(v) = info.attacker_uuid {
        put_varint_field(&mut buf, 11, v);
    }
    if let Some(v) = info.owner_id {
        put_varint_field(&mut buf, 12, v as u64);
    }
    if let Some(v) = info.owner_level {
        put_varint_field(&mut buf, 13, v as u64);
    }
    if let Some(v) = info.owner_stage {
        put_varint_field(&mut buf, 14, v as u64);
    }
    if let Some(v) = info.hit_event_id {
        put_varint_field(&mut buf, 15, v as u64);
    }
    if let Some(v) = info.is_normal {
        put_varint_field(&mut buf, 16, bool_v(v));
    }
    if let Some(v) = info.is_dead {
        put_varint_field(&mut buf, 17, bool_v(v));
    }
    if let Some(v) = info.property {
        put_varint_field(&mut buf, 18, v as u64);
    }
    if let Some(v) = info.top_summoner_id {
        put_varint_field(&mut buf, 21, v);
    }
    if let Some(v) = info.is_rainbow {
        put_varint_field(&mut buf, 24, bool_v(v));
    }
    if let Some(v) = info.damage_mode {
        put_varint_field(&mut buf, 25, v as u64);
    }
    buf
}

/// A near-delta payload holding one `AoiSyncDelta` with the given target id
/// and damage ticks.
pub fn encode_near_delta(target_uuid: u64, damages: &[DamageInfo]) -> Vec<u8> {
    let mut effect = Vec::new();
    put_varint_field(&mut effect, 1, target_uuid);
    for info in damages {
        put_len_field(&mut effect, 2, &encode_damage_info(info));
    }

    let mut delta = Vec::new();
    put_varint_field(&mut delta, 1, target_uuid);
    put_len_field(&mut delta, 7, &effect);

    let mut payload = Vec::new();
    put_len_field(&mut payload, 1, &delta);
    payload
}

pub fn encode_sync_entity(uuid: u64, ent_type: u32, attrs: Option<(&str, u32)>) -> Vec<u8> {
    let mut buf = Vec::new();
    put_varint_field(&mut buf, 1, uuid);
    put_varint_field(&mut buf, 2, ent_type as u64);
    if let Some((name, class_id)) = attrs {
        let mut name_raw = vec![name.len() as u8];
        name_raw.extend_from_slice(name.as_bytes());
        let mut name_pair = Vec::new();
        put_varint_field(&mut name_pair, 1, 0x01);
        put_len_field(&mut name_pair, 2, &name_raw);
        let mut class_pair = Vec::new();
        put_varint_field(&mut class_pair, 1, 0xdc);
        put_len_field(&mut class_pair, 2, &encode_varint(class_id as u64));

        let mut collection = Vec::new();
        put_varint_field(&mut collection, 1, uuid);
        put_len_field(&mut collection, 2, &name_pair);
        put_len_field(&mut collection, 2, &class_pair);
        put_len_field(&mut buf, 3, &collection);
    }
    buf
}

pub fn encode_container_data(char_id: u64, name: &str, fight_point: u64, profession: u32) -> Vec<u8> {
    let mut base = Vec::new();
    put_varint_field(&mut base, 1, char_id);
    put_len_field(&mut base, 5, name.as_bytes());
    put_varint_field(&mut base, 35, fight_point);

    let mut professions = Vec::new();
    put_varint_field(&mut professions, 1, profession as u64);

    let mut serialize = Vec::new();
    put_len_field(&mut serialize, 2, &base);
    put_len_field(&mut serialize, 61, &professions);

    let mut payload = Vec::new();
    put_len_field(&mut payload, 1, &serialize);
    payload
}

/// Build a complete Notify frame carrying `payload` under `method_id`.
pub fn build_notify_frame(method_id: u32, payload: &[u8], compress: bool) -> Vec<u8> {
    let body = if compress {
        zstd::encode_all(payload, 0).expect("zstd encode")
    } else {
        payload.to_vec()
    };

    let mut frame = Vec::new();
    let size = 4 + 2 + 8 + 4 + 4 + body.len();
    frame.extend_from_slice(&(size as u32).to_be_bytes());
    let packet_type: u16 = 1 | if compress { 0x8000 } else { 0 };
    frame.extend_from_slice(&packet_type.to_be_bytes());
    frame.extend_from_slice(&crate::protocol::types::SERVICE_UUID.to_be_bytes());
    frame.extend_from_slice(&[0u8; 4]); // stub id
    frame.extend_from_slice(&method_id.to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Same shape as `build_notify_frame` but with a foreign service uuid.
pub fn build_foreign_notify_frame(method_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = build_notify_frame(method_id, payload, false);
    frame[6..14].copy_from_slice(&0xdead_beef_u64.to_be_bytes());
    frame
}

/// Wrap already-framed bytes in a FrameDown envelope.
pub fn build_frame_down(nested: &[u8], compress: bool) -> Vec<u8> {
    let body = if compress {
        zstd::encode_all(nested, 0).expect("zstd encode")
    } else {
        nested.to_vec()
    };
    let mut frame = Vec::new();
    let size = 4 + 2 + 4 + body.len();
    frame.extend_from_slice(&(size as u32).to_be_bytes());
    let packet_type: u16 = 6 | if compress { 0x8000 } else { 0 };
    frame.extend_from_slice(&packet_type.to_be_bytes());
    frame.extend_from_slice(&7u32.to_be_bytes()); // server sequence id
    frame.extend_from_slice(&body);
    frame
}

/// The 98-byte login payload both server detectors accept.
pub fn login_signature_payload() -> Vec<u8> {
    let mut payload = vec![0u8; 98];
    payload[0..10].copy_from_slice(&[0x00, 0x00, 0x00, 0x62, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01]);
    payload[14..20].copy_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x0a, 0x4e]);
    payload
}

/// A payload matching the fragment signature scan.
pub fn fragment_signature_payload() -> Vec<u8> {
    let mut fragment_body = vec![0u8; 16];
    fragment_body[5..11].copy_from_slice(&[0x00, 0x63, 0x33, 0x53, 0x42, 0x00]);

    let mut payload = vec![0u8; 10];
    // payload[4] must be zero; it already is
    payload.extend_from_slice(&((fragment_body.len() as u32 + 4).to_be_bytes()));
    payload.extend_from_slice(&fragment_body);
    payload
}
