//! Ringline wire format — on-wire frames for the replication protocol.
//!
//! These types ARE the protocol. Every field, every size is part of the
//! wire format; the same RecordHeader bytes that travel the wire are stored
//! verbatim in ring slots, which is what makes slot self-verification work.
//!
//! All types are #[repr(C, packed)] for deterministic layout and use
//! zerocopy derives for safe, allocation-free serialization. There is no
//! unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::seq::Seq;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Leading synchronization marker on every frame ("RL").
pub const FRAME_MARKER: u16 = 0x524C;

/// Default slot/record size in bytes. Deployments tune this per station.
pub const DEFAULT_RECORD_SIZE: u32 = 512;

/// Flag bit on DATA frames: this record fills a declared gap and must not
/// advance the receiver's `next_out`.
pub const FLAG_BACKFILL: u8 = 0x01;

/// Flag bit on HELLO frames: the receiver accepts multiple concurrently
/// declared gaps (the conservative default is one at a time).
pub const FLAG_MULTI_GAP: u8 = 0x01;

// ── Frame kinds ───────────────────────────────────────────────────────────────

/// Discriminates the frame following a [`Prelude`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Receiver → sender: resume point and ring geometry.
    Hello = 0x01,
    /// Sender → receiver: the first sequence that will actually be sent.
    HelloAck = 0x02,
    /// One sequenced record, header + payload.
    Data = 0x03,
    /// Receiver → sender: contiguous run durably stored.
    Ack = 0x04,
    /// Either side: inclusive range known missing.
    GapDeclare = 0x05,
    /// Sender → receiver: a declared gap is unrecoverable.
    GapAbandon = 0x06,
    /// Keepalive when the sender has nothing to stream.
    Heartbeat = 0x07,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Hello),
            0x02 => Ok(FrameKind::HelloAck),
            0x03 => Ok(FrameKind::Data),
            0x04 => Ok(FrameKind::Ack),
            0x05 => Ok(FrameKind::GapDeclare),
            0x06 => Ok(FrameKind::GapAbandon),
            0x07 => Ok(FrameKind::Heartbeat),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

// ── Prelude ───────────────────────────────────────────────────────────────────

/// First four bytes of every frame. A HEARTBEAT is a bare prelude.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Prelude {
    pub marker: u16,
    pub kind: u8,
    pub flags: u8,
}

assert_eq_size!(Prelude, [u8; 4]);

impl Prelude {
    pub fn new(kind: FrameKind, flags: u8) -> Self {
        Self {
            marker: FRAME_MARKER,
            kind: kind as u8,
            flags,
        }
    }

    /// Validate the marker and decode the kind.
    pub fn classify(&self) -> Result<FrameKind, WireError> {
        let marker = self.marker;
        if marker != FRAME_MARKER {
            return Err(WireError::BadMarker(marker));
        }
        FrameKind::try_from(self.kind)
    }
}

// ── Record header ─────────────────────────────────────────────────────────────

/// Header of a DATA frame, followed by `length` payload bytes.
///
/// The same 24 bytes are written at the front of each ring slot, so a slot
/// carries its own sequence (for overwrite detection) and the payload
/// timestamp (for archive-windowed backfill).
///
/// Wire size: 24 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RecordHeader {
    pub marker: u16,
    pub kind: u8,
    pub flags: u8,

    /// Sequence number of this record.
    pub seq: u32,

    /// Payload length in bytes, not including this header.
    pub length: u32,

    /// CRC32 of the payload bytes.
    pub checksum: u32,

    /// Producer timestamp, microseconds since the Unix epoch. 0 = unknown.
    pub time_us: u64,
}

assert_eq_size!(RecordHeader, [u8; 24]);

impl RecordHeader {
    pub const SIZE: usize = std::mem::size_of::<RecordHeader>();

    pub fn new(seq: Seq, payload: &[u8], time_us: u64, backfill: bool) -> Self {
        Self {
            marker: FRAME_MARKER,
            kind: FrameKind::Data as u8,
            flags: if backfill { FLAG_BACKFILL } else { 0 },
            seq: seq.value(),
            length: payload.len() as u32,
            checksum: checksum(payload),
            time_us,
        }
    }

    pub fn seq(&self) -> Seq {
        Seq::new(self.seq)
    }

    pub fn is_backfill(&self) -> bool {
        self.flags & FLAG_BACKFILL != 0
    }

    /// Verify the payload against the embedded checksum.
    pub fn verify(&self, payload: &[u8]) -> Result<(), WireError> {
        let expected = self.checksum;
        let found = checksum(payload);
        if expected != found {
            return Err(WireError::ChecksumMismatch {
                seq: self.seq,
                expected,
                found,
            });
        }
        Ok(())
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

/// HELLO — sent by the receiver immediately after connecting.
///
/// `resume` is the receiver's persisted `next_out`, or -1 for "I have no
/// prior state, send everything you retain from the beginning".
///
/// Wire size: 32 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct Hello {
    pub marker: u16,
    pub kind: u8,
    pub flags: u8,

    /// Requested resume sequence, -1 if unknown.
    pub resume: i32,

    /// Receiver ring capacity in slots.
    pub capacity: u32,

    /// Receiver slot size in bytes. Must match the sender's.
    pub record_size: u32,

    /// Receiver node identity, NUL-padded UTF-8.
    pub node: [u8; 16],
}

assert_eq_size!(Hello, [u8; 32]);

impl Hello {
    pub fn new(resume: Option<Seq>, capacity: u32, record_size: u32, node: &str, multi_gap: bool) -> Self {
        Self {
            marker: FRAME_MARKER,
            kind: FrameKind::Hello as u8,
            flags: if multi_gap { FLAG_MULTI_GAP } else { 0 },
            resume: Seq::encode_opt(resume),
            capacity,
            record_size,
            node: encode_node(node),
        }
    }
}

/// HELLO_ACK — the sender's answer: the first sequence it will deliver.
/// If this is ahead of the requested resume point the receiver opens a gap
/// covering the difference instead of silently skipping.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct HelloAck {
    pub marker: u16,
    pub kind: u8,
    pub flags: u8,

    /// First sequence the sender will deliver, -1 if it has nothing yet.
    pub start: i32,
}

assert_eq_size!(HelloAck, [u8; 8]);

impl HelloAck {
    pub fn new(start: Option<Seq>) -> Self {
        Self {
            marker: FRAME_MARKER,
            kind: FrameKind::HelloAck as u8,
            flags: 0,
            start: Seq::encode_opt(start),
        }
    }
}

// ── Ack and gap frames ────────────────────────────────────────────────────────

/// ACK — an unbroken run `[low, high]` the receiver has durably stored.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct AckFrame {
    pub marker: u16,
    pub kind: u8,
    pub flags: u8,
    pub low: u32,
    pub high: u32,
}

assert_eq_size!(AckFrame, [u8; 12]);

impl AckFrame {
    pub fn new(low: Seq, high: Seq) -> Self {
        Self {
            marker: FRAME_MARKER,
            kind: FrameKind::Ack as u8,
            flags: 0,
            low: low.value(),
            high: high.value(),
        }
    }
}

/// GAP_DECLARE / GAP_ABANDON — an inclusive missing range. The kind byte
/// distinguishes "please backfill this" from "this is unrecoverable".
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct GapFrame {
    pub marker: u16,
    pub kind: u8,
    pub flags: u8,
    pub start: u32,
    pub end: u32,
}

assert_eq_size!(GapFrame, [u8; 12]);

impl GapFrame {
    pub fn declare(start: Seq, end: Seq) -> Self {
        Self {
            marker: FRAME_MARKER,
            kind: FrameKind::GapDeclare as u8,
            flags: 0,
            start: start.value(),
            end: end.value(),
        }
    }

    pub fn abandon(start: Seq, end: Seq) -> Self {
        Self {
            marker: FRAME_MARKER,
            kind: FrameKind::GapAbandon as u8,
            flags: 0,
            start: start.value(),
            end: end.value(),
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// CRC32 over the record payload.
pub fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// NUL-pad a node identity into its fixed wire field. Longer names are
/// truncated at a UTF-8 boundary-agnostic byte cut; identities should be
/// short ASCII station codes.
pub fn encode_node(node: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let bytes = node.as_bytes();
    let n = bytes.len().min(16);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Recover a node identity from its wire field.
pub fn decode_node(field: &[u8; 16]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(16);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("bad frame marker: 0x{0:04x}")]
    BadMarker(u16),

    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("checksum mismatch on seq {seq}: expected 0x{expected:08x}, found 0x{found:08x}")]
    ChecksumMismatch { seq: u32, expected: u32, found: u32 },

    #[error("payload length {length} exceeds record size {record_size}")]
    PayloadTooLarge { length: usize, record_size: usize },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
