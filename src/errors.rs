use thiserror::Error;

/// Failures that can surface from the meter service.
///
/// Only `TransportUnavailable` ever crosses the service boundary; everything
/// else is logged and recovered where it happens.
#[derive(Debug, Error)]
pub enum MeterError {
    #[error("no usable capture interface found")]
    TransportUnavailable,

    #[error("failed to open capture device {device}: {reason}")]
    FlowOpen { device: String, reason: String },
}

/// Bounds failure from the big-endian byte reader.
///
/// Frame decoding treats this as "drop the frame and keep going"; it never
/// escapes the decode loop.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("read of {wanted} bytes at offset {at} exceeds buffer of {len}")]
pub struct OutOfBounds {
    pub at: usize,
    pub wanted: usize,
    pub len: usize,
}
