//! Packet capture driver: enumerates interfaces, captures TCP in
//! promiscuous mode, and routes each segment through server identification
//! and reassembly into the frame decoder.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use etherparse::{NetHeaders, PacketHeaders, TransportHeader};

use crate::errors::MeterError;
use crate::protocol::types::OpcodeRecord;
use crate::services::decoder::FrameDecoder;
use crate::services::reassembly::TcpReassembler;
use crate::services::signature;

// Adapters that never carry game traffic.
const DEVICE_BLOCKLIST: [&str; 2] = ["loopback", "bluetooth"];

// Capture read timeout; doubles as the cancellation poll interval.
pub const CAPTURE_POLL_MS: i32 = 400;

/// Five-tuple key (minus protocol) identifying a server flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: [u8; 4],
    pub src_port: u16,
    pub dst_ip: [u8; 4],
    pub dst_port: u16,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}:{} -> {}.{}.{}.{}:{}",
            self.src_ip[0], self.src_ip[1], self.src_ip[2], self.src_ip[3], self.src_port,
            self.dst_ip[0], self.dst_ip[1], self.dst_ip[2], self.dst_ip[3], self.dst_port,
        )
    }
}

#[derive(Debug, Default)]
pub struct CaptureStats {
    pub packets_seen: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub segments_reassembled: AtomicU64,
    pub servers_identified: AtomicU64,
}

impl CaptureStats {
    pub fn log_summary(&self) {
        log::info!(
            "capture stats: {} packets seen, {} dropped, {} segments reassembled, {} servers identified",
            self.packets_seen.load(Ordering::Relaxed),
            self.packets_dropped.load(Ordering::Relaxed),
            self.segments_reassembled.load(Ordering::Relaxed),
            self.servers_identified.load(Ordering::Relaxed),
        );
    }
}

/// Owns the flow-to-reassembler binding. One flow is active at a time;
/// known flows accumulate as their signatures are observed.
pub struct PacketRouter {
    known: HashSet<FlowKey>,
    active: Option<FlowKey>,
    reassembler: TcpReassembler,
    decoder: FrameDecoder,
    stats: Arc<CaptureStats>,
}

impl PacketRouter {
    pub fn new(out: Sender<OpcodeRecord>, stats: Arc<CaptureStats>) -> Self {
        Self {
            known: HashSet::new(),
            active: None,
            reassembler: TcpReassembler::new(),
            decoder: FrameDecoder::new(out),
            stats,
        }
    }

    pub fn active(&self) -> Option<FlowKey> {
        self.active
    }

    pub fn reassembler(&self) -> &TcpReassembler {
        &self.reassembler
    }

    pub fn handle_segment(&mut self, flow: FlowKey, seq: u32, payload: &[u8]) {
        self.stats.packets_seen.fetch_add(1, Ordering::Relaxed);

        if self.active == Some(flow) {
            self.reassembler.push_segment(seq, payload);
            self.stats.segments_reassembled.fetch_add(1, Ordering::Relaxed);
            self.decoder.drain_stream(self.reassembler.stream_mut());
            return;
        }

        if self.known.contains(&flow) {
            log::info!("switching active server to known flow {flow}");
            self.promote(flow, seq, payload.len());
            return;
        }

        if signature::identifies_game_server(payload) {
            log::info!("game server identified: {flow}");
            self.known.insert(flow);
            self.stats.servers_identified.fetch_add(1, Ordering::Relaxed);
            self.promote(flow, seq, payload.len());
            return;
        }

        self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // The triggering segment is consumed here, not reassembled: the stream
    // restarts right after it.
    fn promote(&mut self, flow: FlowKey, seq: u32, payload_len: usize) {
        self.active = Some(flow);
        self.reassembler.clear(seq.wrapping_add(payload_len as u32));
        self.decoder.enqueue_server_change();
    }
}

fn device_is_usable(device: &pcap::Device) -> bool {
    let description = device.desc.as_deref().unwrap_or("").to_lowercase();
    let name = device.name.to_lowercase();
    !DEVICE_BLOCKLIST
        .iter()
        .any(|keyword| description.contains(keyword) || name.contains(keyword))
}

/// Enumerate live-capture devices, minus the blocklist. With a non-empty
/// `preferred` name only that device is returned.
pub fn usable_devices(preferred: &str) -> Result<Vec<pcap::Device>, MeterError> {
    let mut devices: Vec<pcap::Device> = pcap::Device::list()
        .map_err(|e| {
            log::error!("device enumeration failed: {e}");
            MeterError::TransportUnavailable
        })?
        .into_iter()
        .filter(device_is_usable)
        .collect();

    if !preferred.is_empty() {
        devices.retain(|d| d.name == preferred);
    }
    if devices.is_empty() {
        return Err(MeterError::TransportUnavailable);
    }
    Ok(devices)
}

/// Open one device in promiscuous mode with the TCP filter applied.
pub fn open_device(device: pcap::Device) -> Result<pcap::Capture<pcap::Active>, MeterError> {
    let name = device.name.clone();
    let flow_open = |e: pcap::Error| MeterError::FlowOpen {
        device: name.clone(),
        reason: e.to_string(),
    };

    let mut capture = pcap::Capture::from_device(device)
        .map_err(flow_open)?
        .promisc(true)
        .immediate_mode(true)
        .timeout(CAPTURE_POLL_MS)
        .open()
        .map_err(flow_open)?;
    capture.filter("tcp", true).map_err(flow_open)?;
    Ok(capture)
}

/// Per-device capture loop. Polls the cancellation flag on every read
/// timeout and hands IPv4/TCP segments with payload to the router.
pub fn run_capture_loop(
    device_name: &str,
    mut capture: pcap::Capture<pcap::Active>,
    router: Arc<Mutex<PacketRouter>>,
    cancel: Arc<AtomicBool>,
) {
    log::info!("capture started on {device_name}");
    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        match capture.next_packet() {
            Ok(packet) => handle_raw_packet(packet.data, &router),
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                log::warn!("capture on {device_name} stopped: {e}");
                break;
            }
        }
    }
    log::info!("capture stopped on {device_name}");
}

fn handle_raw_packet(data: &[u8], router: &Arc<Mutex<PacketRouter>>) {
    let headers = match PacketHeaders::from_ethernet_slice(data) {
        Ok(headers) => headers,
        Err(_) => return,
    };
    let Some(NetHeaders::Ipv4(ipv4, _)) = headers.net else {
        return;
    };
    let Some(TransportHeader::Tcp(tcp)) = headers.transport else {
        return;
    };
    let payload = headers.payload.slice();
    if payload.is_empty() {
        return;
    }

    let flow = FlowKey {
        src_ip: ipv4.source,
        src_port: tcp.source_port,
        dst_ip: ipv4.destination,
        dst_port: tcp.destination_port,
    };
    let mut router = router.lock().unwrap();
    router.handle_segment(flow, tcp.sequence_number, payload);
}
