//! Frame decoder: pulls length-prefixed frames off the reassembled stream,
//! classifies the envelope, optionally decompresses, and queues
//! `(opcode, payload)` records for the encounter engine.

use crossbeam_channel::Sender;

use crate::errors::OutOfBounds;
use crate::protocol::reader::ByteReader;
use crate::protocol::types::{Envelope, Opcode, OpcodeRecord, SERVICE_UUID};

// A frame is at least the 4-byte size plus the 2-byte type.
const MIN_FRAME_SIZE: usize = 6;
const MAX_FRAMES_PER_DRAIN: usize = 1000;
// FrameDown envelopes nest; adversarial nesting gets cut off here.
const MAX_NESTING_DEPTH: u8 = 8;

pub struct FrameDecoder {
    out: Sender<OpcodeRecord>,
}

impl FrameDecoder {
    pub fn new(out: Sender<OpcodeRecord>) -> Self {
        Self { out }
    }

    /// Queue the synthetic server-change sentinel.
    pub fn enqueue_server_change(&self) {
        let _ = self.out.send(OpcodeRecord {
            opcode: Opcode::ServerChange,
            payload: Vec::new(),
        });
    }

    /// Extract every complete frame from the stream. Stops at the first
    /// incomplete frame and leaves it untouched; a bad frame is dropped
    /// without ending the loop.
    pub fn drain_stream(&self, stream: &mut Vec<u8>) {
        self.drain_buffer(stream, 0);
    }

    fn drain_buffer(&self, buffer: &mut Vec<u8>, depth: u8) {
        let mut frames = 0;
        while buffer.len() >= 4 {
            let Ok(size) = ByteReader::new(buffer).peek_u32_be() else {
                break;
            };
            let size = size as usize;
            if size < MIN_FRAME_SIZE || buffer.len() < size {
                break;
            }
            let frame: Vec<u8> = buffer.drain(..size).collect();
            if let Err(e) = self.decode_frame(&frame, depth) {
                log::debug!("dropping malformed frame: {e}");
            }

            frames += 1;
            if frames >= MAX_FRAMES_PER_DRAIN {
                log::warn!("frame drain hit {MAX_FRAMES_PER_DRAIN} iterations, breaking");
                break;
            }
        }
    }

    fn decode_frame(&self, frame: &[u8], depth: u8) -> Result<(), OutOfBounds> {
        let mut reader = ByteReader::new(frame);
        reader.skip(4)?; // size, already validated
        let packet_type = reader.read_u16_be()?;
        let is_zstd = packet_type & 0x8000 != 0;

        match Envelope::from_u16(packet_type & 0x7fff) {
            Envelope::Notify => {
                let service_uuid = reader.read_u64_be()?;
                reader.skip(4)?; // stub id
                let method_id = reader.read_u32_be()?;
                if service_uuid != SERVICE_UUID {
                    log::debug!("dropping frame for foreign service {service_uuid:#018x}");
                    return Ok(());
                }
                let Some(payload) = self.maybe_decompress(reader.read_remaining(), is_zstd) else {
                    return Ok(());
                };
                match Opcode::from_u32(method_id) {
                    Some(opcode) => {
                        let _ = self.out.send(OpcodeRecord { opcode, payload });
                    }
                    None => log::trace!("unknown method id {method_id:#x}"),
                }
            }
            Envelope::FrameDown => {
                if depth + 1 >= MAX_NESTING_DEPTH {
                    log::warn!("frame nesting exceeded depth {MAX_NESTING_DEPTH}, dropping");
                    return Ok(());
                }
                reader.skip(4)?; // server sequence id
                let Some(nested) = self.maybe_decompress(reader.read_remaining(), is_zstd) else {
                    return Ok(());
                };
                let mut nested = nested;
                self.drain_buffer(&mut nested, depth + 1);
            }
            Envelope::Other(kind) => log::trace!("unhandled envelope type {kind}"),
        }
        Ok(())
    }

    // Streaming decode, output size unknown up front. None = frame dropped.
    fn maybe_decompress(&self, payload: &[u8], is_zstd: bool) -> Option<Vec<u8>> {
        if !is_zstd {
            return Some(payload.to_vec());
        }
        match zstd::decode_all(payload) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                log::debug!("zstd decompression failed, dropping frame: {e}");
                None
            }
        }
    }
}
