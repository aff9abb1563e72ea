//! # Pump Controller Wire Protocol
//!
//! Frame construction and validation for the serial link to the pump
//! controller. The controller speaks a fixed-layout binary protocol:
//! every frame is bounded by role-specific start/end markers and carries a
//! single XOR checksum byte.
//!
//! Three command frames are sent by the gateway:
//!
//! - *startup announce* — `7D 33 55 <ck> 7E`, sent at boot and as a
//!   keep-alive poll when the delivery path has been idle.
//! - *read-by-position* — `C8 <hi> <lo> <ck> C9`, requests the transaction
//!   stored at a controller-side position in `[1, 2046]`.
//! - *set-time* — `5D <id> <d> <m> <y%100> <H> <M> <S> <ck> 5E`, syncs the
//!   controller clock.
//!
//! The controller answers with fixed 32-byte transaction frames validated by
//! four structural markers and a checksum. [`RecordScanner`] accumulates raw
//! serial bytes and yields whole validated frames, resynchronizing a byte at
//! a time on garbage — the same discipline as a length-delimited framer, but
//! marker-based.
//!
//! All checksums use the same algorithm: seed `0xA5`, XOR-folded across the
//! designated payload range. This must stay bit-exact or the controller
//! silently ignores our commands.

use bytes::{Buf, BytesMut};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::Serialize;
use thiserror::Error;

/// Checksum seed shared by every frame kind.
pub const CHECKSUM_SEED: u8 = 0xA5;

/// Size of a transaction record frame on the wire.
pub const RECORD_SIZE: usize = 32;

/// Valid range for read-by-position requests.
pub const POSITION_MIN: u16 = 1;
pub const POSITION_MAX: u16 = 2046;

/// Largest command frame we ever build (set-time).
const MAX_FRAME_LEN: usize = 10;

/// Start/end marker pairs of the command frame kinds.
const MARKER_PAIRS: [(u8, u8); 3] = [(0x7D, 0x7E), (0xC8, 0xC9), (0x5D, 0x5E)];

// Structural markers of a transaction record frame.
const REC_MARK_0: u8 = 1;
const REC_MARK_1: u8 = 2;
const REC_MARK_29: u8 = 3;
const REC_MARK_31: u8 = 4;
const REC_CHECKSUM_AT: usize = 30;

/// Errors produced while building or decoding frames.
///
/// Per the error policy, decode failures are discarded silently by the read
/// loop; they never propagate past the protocol layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Read-by-position argument outside `[1, 2046]`.
    #[error("position {0} outside valid range {POSITION_MIN}..={POSITION_MAX}")]
    PositionOutOfRange(u16),

    /// A structural marker byte did not match its expected value.
    #[error("record marker mismatch at byte {index}: expected {expected:#04x}, got {found:#04x}")]
    BadMarker {
        index: usize,
        expected: u8,
        found: u8,
    },

    /// Checksum over the record payload did not match byte 30.
    #[error("record checksum mismatch: expected {expected:#04x}, got {found:#04x}")]
    BadChecksum { expected: u8, found: u8 },
}

/// XOR-fold `bytes` into the fixed seed.
#[inline]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(CHECKSUM_SEED, |acc, b| acc ^ b)
}

/// A built command frame. Fixed backing array, no allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    buf: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl Frame {
    fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = [0u8; MAX_FRAME_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Self {
            buf,
            len: bytes.len(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Build the startup announce frame (`7D 33 55 <ck> 7E`).
pub fn build_startup() -> Frame {
    let mut f = [0x7D, 0x33, 0x55, 0, 0x7E];
    f[3] = checksum(&f[1..3]);
    Frame::from_slice(&f)
}

/// Build a read-by-position frame (`C8 <hi> <lo> <ck> C9`).
///
/// Fails without building anything when `position` falls outside
/// `[1, 2046]` — the controller treats out-of-range reads as undefined.
pub fn build_read_by_position(position: u16) -> Result<Frame, ProtocolError> {
    if !(POSITION_MIN..=POSITION_MAX).contains(&position) {
        return Err(ProtocolError::PositionOutOfRange(position));
    }
    let mut f = [0xC8, (position >> 8) as u8, (position & 0xFF) as u8, 0, 0xC9];
    f[3] = checksum(&f[1..3]);
    Ok(Frame::from_slice(&f))
}

/// Build a set-time frame carrying the controller clock fields.
pub fn build_set_time(device_id: u8, when: DateTime<Utc>) -> Frame {
    let mut f = [
        0x5D,
        device_id,
        when.day() as u8,
        when.month() as u8,
        (when.year() % 100) as u8,
        when.hour() as u8,
        when.minute() as u8,
        when.second() as u8,
        0,
        0x5E,
    ];
    f[8] = checksum(&f[1..8]);
    Frame::from_slice(&f)
}

/// Verify a whole command frame built by this module: the start/end bytes
/// must form one of the known marker pairs and the checksum must match.
///
/// The markers sit outside the checksummed range, so checking them here is
/// what makes corruption of any byte of the frame detectable.
pub fn verify_checksum(frame: &[u8]) -> bool {
    if frame.len() < 4 {
        return false;
    }
    let last = frame.len() - 1;
    if !MARKER_PAIRS
        .iter()
        .any(|&(start, end)| frame[0] == start && frame[last] == end)
    {
        return false;
    }
    checksum(&frame[1..last - 1]) == frame[last - 1]
}

/// One decoded pump transaction.
///
/// Carries both the structured fields and the raw wire frame: the store
/// persists the frame verbatim so a read-back decodes to the identical
/// record, and the broker payload serializes the structured fields only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionRecord {
    /// Pump column / nozzle position on the forecourt.
    pub column: u8,
    /// Controller-side data position the record was read from.
    pub data_position: u8,
    /// Transaction amount in cents.
    pub amount: u32,
    /// Unit price in cents per litre.
    pub unit_price: u32,
    /// Dispensed volume in centilitres.
    pub volume: u32,
    /// Monotonic per-device sequence counter assigned by the controller.
    pub sequence: u32,
    /// Raw 32-byte frame as read from the bus.
    #[serde(skip)]
    pub frame: [u8; RECORD_SIZE],
}

impl TransactionRecord {
    /// Decode and validate a 32-byte transaction frame.
    ///
    /// All four structural markers and the checksum must match; any mismatch
    /// invalidates the whole frame.
    pub fn decode(frame: &[u8; RECORD_SIZE]) -> Result<Self, ProtocolError> {
        for (index, expected) in [
            (0usize, REC_MARK_0),
            (1, REC_MARK_1),
            (29, REC_MARK_29),
            (31, REC_MARK_31),
        ] {
            if frame[index] != expected {
                return Err(ProtocolError::BadMarker {
                    index,
                    expected,
                    found: frame[index],
                });
            }
        }
        let expected = checksum(&frame[2..REC_CHECKSUM_AT - 1]);
        if frame[REC_CHECKSUM_AT] != expected {
            return Err(ProtocolError::BadChecksum {
                expected,
                found: frame[REC_CHECKSUM_AT],
            });
        }
        Ok(Self {
            column: frame[2],
            data_position: frame[3],
            amount: u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]),
            unit_price: u32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]),
            volume: u32::from_be_bytes([frame[12], frame[13], frame[14], frame[15]]),
            sequence: u32::from_be_bytes([frame[16], frame[17], frame[18], frame[19]]),
            frame: *frame,
        })
    }

    /// Assemble a frame from structured fields (controller-side encoding,
    /// used by the smoketest command and tests).
    pub fn encode(
        column: u8,
        data_position: u8,
        amount: u32,
        unit_price: u32,
        volume: u32,
        sequence: u32,
    ) -> [u8; RECORD_SIZE] {
        let mut f = [0u8; RECORD_SIZE];
        f[0] = REC_MARK_0;
        f[1] = REC_MARK_1;
        f[2] = column;
        f[3] = data_position;
        f[4..8].copy_from_slice(&amount.to_be_bytes());
        f[8..12].copy_from_slice(&unit_price.to_be_bytes());
        f[12..16].copy_from_slice(&volume.to_be_bytes());
        f[16..20].copy_from_slice(&sequence.to_be_bytes());
        f[29] = REC_MARK_29;
        f[30] = checksum(&f[2..REC_CHECKSUM_AT - 1]);
        f[31] = REC_MARK_31;
        f
    }
}

/// Incremental scanner for transaction record frames.
///
/// Fed arbitrary chunks from the serial bus; yields whole validated records
/// when available. On a malformed candidate it advances one byte and rescans
/// (simple resynchronization), so a corrupted frame costs at most 31 extra
/// comparisons and never desynchronizes the stream permanently.
pub struct RecordScanner {
    buf: BytesMut,
    rejected: u64,
}

impl RecordScanner {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4 * RECORD_SIZE),
            rejected: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Frames discarded due to marker or checksum failure since creation.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Attempt to extract the next validated record. Returns `None` when no
    /// complete valid frame is buffered yet.
    pub fn next_record(&mut self) -> Option<TransactionRecord> {
        loop {
            // Skip to a plausible frame start.
            while !self.buf.is_empty() && self.buf[0] != REC_MARK_0 {
                self.buf.advance(1);
            }
            if self.buf.len() < RECORD_SIZE {
                return None;
            }
            let mut candidate = [0u8; RECORD_SIZE];
            candidate.copy_from_slice(&self.buf[..RECORD_SIZE]);
            match TransactionRecord::decode(&candidate) {
                Ok(record) => {
                    self.buf.advance(RECORD_SIZE);
                    return Some(record);
                }
                Err(_) => {
                    // Silent discard per protocol policy; advance one byte
                    // so an embedded genuine frame is still found.
                    self.rejected += 1;
                    self.buf.advance(1);
                }
            }
        }
    }
}

impl Default for RecordScanner {
    fn default() -> Self {
        Self::new()
    }
}
