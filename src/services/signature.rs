//! Payload signatures that identify the game server's flow. These two are
//! the only identification mechanisms; if the wire format drifts, capture
//! silently degrades to "no active server".

use crate::errors::OutOfBounds;
use crate::protocol::reader::ByteReader;

/// "c3SB" service marker as it appears inside early fragments.
pub const GAME_SIGNATURE: [u8; 6] = [0x00, 0x63, 0x33, 0x53, 0x42, 0x00];

const LOGIN_PREFIX: [u8; 10] = [0x00, 0x00, 0x00, 0x62, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01];
const LOGIN_MARKER: [u8; 6] = [0x00, 0x00, 0x00, 0x00, 0x0a, 0x4e];
const LOGIN_PAYLOAD_LEN: usize = 98;

const MAX_FRAGMENT_SCAN: usize = 1000;

/// Scan a length-prefixed fragment list for the service marker.
pub fn matches_fragment_signature(payload: &[u8]) -> bool {
    if payload.len() < 10 || payload[4] != 0 {
        return false;
    }
    let mut reader = ByteReader::new(&payload[10..]);
    for _ in 0..MAX_FRAGMENT_SCAN {
        match scan_one_fragment(&mut reader) {
            Ok(true) => return true,
            Ok(false) => continue,
            Err(_) => return false,
        }
    }
    log::warn!("fragment signature scan exceeded {MAX_FRAGMENT_SCAN} iterations, giving up");
    false
}

fn scan_one_fragment(reader: &mut ByteReader<'_>) -> Result<bool, OutOfBounds> {
    let frag_len = reader.read_u32_be()?;
    if frag_len < 4 {
        return Err(OutOfBounds { at: reader.position(), wanted: 4, len: 0 });
    }
    let fragment = reader.read_bytes(frag_len as usize - 4)?;
    Ok(fragment.len() >= 11 && fragment[5..11] == GAME_SIGNATURE)
}

/// The fixed-size login response shape.
pub fn matches_login_signature(payload: &[u8]) -> bool {
    payload.len() == LOGIN_PAYLOAD_LEN
        && payload[0..10] == LOGIN_PREFIX
        && payload[14..20] == LOGIN_MARKER
}

pub fn identifies_game_server(payload: &[u8]) -> bool {
    matches_fragment_signature(payload) || matches_login_signature(payload)
}
