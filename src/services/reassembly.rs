//! Per-flow TCP reassembly: out-of-order segments are cached by sequence
//! number and appended to a contiguous stream once the gap closes.

use std::collections::BTreeMap;

// Guards against malformed-input pathology in the append loop.
const MAX_APPEND_ITERATIONS: usize = 1000;

/// Reassembles one flow. `anchor` is the next expected sequence number;
/// after every append the stream ends exactly at the anchor.
#[derive(Debug, Default)]
pub struct TcpReassembler {
    anchor: Option<u32>,
    cache: BTreeMap<u32, Vec<u8>>,
    stream: Vec<u8>,
}

impl TcpReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything and restart the stream at `seq`.
    pub fn clear(&mut self, seq: u32) {
        self.cache.clear();
        self.stream.clear();
        self.anchor = Some(seq);
    }

    /// Move the anchor without touching buffered stream bytes.
    pub fn set_next(&mut self, seq: u32) {
        self.anchor = Some(seq);
    }

    pub fn anchor(&self) -> Option<u32> {
        self.anchor
    }

    pub fn stream(&self) -> &[u8] {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut Vec<u8> {
        &mut self.stream
    }

    pub fn cached_segments(&self) -> usize {
        self.cache.len()
    }

    /// Buffer a segment and flush everything contiguous from the anchor.
    /// A repeated sequence number overwrites the cached copy.
    pub fn push_segment(&mut self, seq: u32, payload: &[u8]) {
        self.cache.insert(seq, payload.to_vec());
        if self.anchor.is_none() {
            self.anchor = Some(seq);
        }

        let mut iterations = 0;
        while let Some(next) = self.anchor {
            let Some(segment) = self.cache.remove(&next) else {
                break;
            };
            self.stream.extend_from_slice(&segment);
            self.anchor = Some(next.wrapping_add(segment.len() as u32));

            iterations += 1;
            if iterations >= MAX_APPEND_ITERATIONS {
                log::warn!("reassembly append loop hit {MAX_APPEND_ITERATIONS} iterations, breaking");
                break;
            }
        }
    }
}
