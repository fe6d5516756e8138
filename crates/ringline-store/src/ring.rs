//! RingStore — a fixed-capacity circular file of fixed-size slots.
//!
//! File layout: slot 0 holds the control record (`next_out`, `capacity`,
//! `last_acked`, three little int32s), slots 1..=capacity hold data records
//! addressed by `1 + (seq mod capacity)`. Each data slot starts with the
//! same 24-byte RecordHeader that travels the wire, so a slot can prove it
//! holds the sequence the caller asked for — a mismatch means the ring has
//! lapped that offset and the record is gone.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use ringline_core::seq::{Seq, SEQ_MODULUS, SEQ_UNSET};
use ringline_core::wire::{RecordHeader, FRAME_MARKER};

// ── Control record ────────────────────────────────────────────────────────────

/// On-disk shape of slot 0. Written in a single positioned write so a crash
/// leaves either the old record or the new one, and a torn combination is
/// detectable (see [`Control::resume_uncertain`]).
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct ControlRaw {
    next_out: i32,
    capacity: i32,
    last_acked: i32,
}

assert_eq_size!(ControlRaw, [u8; 12]);

/// Decoded control record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Control {
    /// Next sequence to move through this ring. `None` = fresh ring.
    pub next_out: Option<Seq>,

    /// Highest contiguous sequence the peer has acknowledged.
    pub last_acked: Option<Seq>,

    /// True when the stored combination is impossible (torn write or field
    /// corruption). Resume conservatively: replay the last window rather
    /// than trust either field.
    resume_uncertain: bool,
}

impl Control {
    fn fresh() -> Self {
        Self {
            next_out: None,
            last_acked: None,
            resume_uncertain: false,
        }
    }

    fn decode(raw: &ControlRaw) -> Self {
        let next_raw = raw.next_out;
        let acked_raw = raw.last_acked;

        let field_ok = |v: i32| v == SEQ_UNSET || (v >= 0 && (v as u32) < SEQ_MODULUS);
        let mut uncertain = !field_ok(next_raw) || !field_ok(acked_raw);

        let next_out = Seq::decode(next_raw);
        let last_acked = Seq::decode(acked_raw);

        // last_acked ahead of next_out cannot happen in a consistent record.
        if let (Some(n), Some(a)) = (next_out, last_acked) {
            if a.distance(n) > 0 {
                uncertain = true;
            }
        }
        if next_out.is_none() && last_acked.is_some() {
            uncertain = true;
        }

        Self {
            next_out: if uncertain { None } else { next_out },
            last_acked: if uncertain { None } else { last_acked },
            resume_uncertain: uncertain,
        }
    }

    pub fn resume_uncertain(&self) -> bool {
        self.resume_uncertain
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("ring i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ring geometry mismatch at {path}: {detail}")]
    Geometry { path: PathBuf, detail: String },

    #[error("slot for seq {0} is empty")]
    SlotEmpty(u32),

    #[error("slot mismatch: expected seq {expected}, slot holds {found}")]
    SlotMismatch { expected: u32, found: u32 },

    #[error("slot for seq {0} is corrupt: {1}")]
    SlotCorrupt(u32, &'static str),

    #[error("record of {length} bytes does not fit record size {record_size}")]
    RecordTooLarge { length: usize, record_size: u32 },
}

// ── RingStore ─────────────────────────────────────────────────────────────────

pub struct RingStore {
    file: File,
    path: PathBuf,
    capacity: u32,
    record_size: u32,
    control: Control,
}

impl RingStore {
    /// Open or create a ring file.
    ///
    /// A missing file is created zero-filled with the requested geometry.
    /// A stored capacity smaller than requested grows the allocation in
    /// place, preserving slot bytes, and conservatively sets
    /// `last_acked := next_out`. A stored capacity larger than requested is
    /// kept — the ring never shrinks. A record-size mismatch cannot be
    /// repaired in place and is an error.
    pub fn open(path: &Path, capacity: u32, record_size: u32) -> Result<Self, RingError> {
        if record_size as usize <= RecordHeader::SIZE || capacity == 0 {
            return Err(RingError::Geometry {
                path: path.to_path_buf(),
                detail: format!("unusable geometry: capacity {capacity}, record size {record_size}"),
            });
        }

        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        if !existed {
            file.set_len((1 + capacity as u64) * record_size as u64)?;
            let mut store = Self {
                file,
                path: path.to_path_buf(),
                capacity,
                record_size,
                control: Control::fresh(),
            };
            store.write_control()?;
            tracing::info!(path = %store.path.display(), capacity, record_size, "created ring");
            return Ok(store);
        }

        let mut raw = ControlRaw::new_zeroed();
        file.read_exact_at(raw.as_bytes_mut(), 0)?;

        let stored_capacity = raw.capacity;
        let file_len = file.metadata()?.len();

        if stored_capacity <= 0 {
            return Err(RingError::Geometry {
                path: path.to_path_buf(),
                detail: format!("stored capacity {stored_capacity} is not positive"),
            });
        }
        let stored_capacity = stored_capacity as u32;

        // The record size is not stored separately; it is implied by the
        // file length. A length that does not divide evenly means the ring
        // was written with a different record size.
        if file_len != (1 + stored_capacity as u64) * record_size as u64 {
            return Err(RingError::Geometry {
                path: path.to_path_buf(),
                detail: format!(
                    "file length {file_len} does not match capacity {stored_capacity} x record size {record_size}"
                ),
            });
        }

        let mut control = Control::decode(&raw);
        if control.resume_uncertain() {
            // copy out of the packed struct before logging
            let next_raw = raw.next_out;
            let acked_raw = raw.last_acked;
            tracing::warn!(
                path = %path.display(),
                next_out = next_raw,
                last_acked = acked_raw,
                "control record inconsistent, resuming uncertain — last window will be replayed"
            );
        }

        let mut store = Self {
            file,
            path: path.to_path_buf(),
            capacity: stored_capacity,
            record_size,
            control,
        };

        if stored_capacity < capacity {
            tracing::warn!(
                path = %path.display(),
                from = stored_capacity,
                to = capacity,
                "growing ring in place; unacked tail will be resent"
            );
            store.file.set_len((1 + capacity as u64) * record_size as u64)?;
            store.capacity = capacity;
            control.last_acked = control.next_out;
            store.control = control;
            store.write_control()?;
        } else if stored_capacity > capacity {
            tracing::info!(
                path = %path.display(),
                stored = stored_capacity,
                requested = capacity,
                "keeping stored capacity; rings never shrink"
            );
        }

        Ok(store)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn record_size(&self) -> u32 {
        self.record_size
    }

    pub fn control(&self) -> Control {
        self.control
    }

    pub fn set_next_out(&mut self, seq: Option<Seq>) {
        self.control.next_out = seq;
        self.control.resume_uncertain = false;
    }

    pub fn set_last_acked(&mut self, seq: Option<Seq>) {
        self.control.last_acked = seq;
    }

    /// Persist the control record. One 12-byte positioned write; a failure
    /// is reported but the cached control stays, so the next flush tick
    /// retries naturally.
    pub fn write_control(&mut self) -> Result<(), RingError> {
        let raw = ControlRaw {
            next_out: Seq::encode_opt(self.control.next_out),
            capacity: self.capacity as i32,
            last_acked: Seq::encode_opt(self.control.last_acked),
        };
        self.file.write_all_at(raw.as_bytes(), 0)?;
        Ok(())
    }

    fn slot_offset(&self, seq: Seq) -> u64 {
        (1 + (seq.value() % self.capacity) as u64) * self.record_size as u64
    }

    /// Write a record into its slot. The slot is fully overwritten (zero
    /// padded) so stale tail bytes from a longer prior record cannot leak.
    pub fn write_slot(&mut self, header: &RecordHeader, payload: &[u8]) -> Result<(), RingError> {
        let total = RecordHeader::SIZE + payload.len();
        if total > self.record_size as usize {
            return Err(RingError::RecordTooLarge {
                length: total,
                record_size: self.record_size,
            });
        }

        let mut buf = vec![0u8; self.record_size as usize];
        buf[..RecordHeader::SIZE].copy_from_slice(header.as_bytes());
        buf[RecordHeader::SIZE..total].copy_from_slice(payload);

        self.file.write_all_at(&buf, self.slot_offset(header.seq()))?;
        Ok(())
    }

    /// Producer entry point: store `payload` at the current `next_out` and
    /// advance it. Local acquisition writes through this; the replication
    /// session only reads.
    pub fn append(&mut self, payload: &[u8], time_us: u64) -> Result<Seq, RingError> {
        let seq = self.control.next_out.unwrap_or(Seq::ZERO);
        let header = RecordHeader::new(seq, payload, time_us, false);
        self.write_slot(&header, payload)?;
        self.control.next_out = Some(seq.next());
        Ok(seq)
    }

    /// Read the record for `seq`, verifying the slot's embedded sequence.
    ///
    /// Returns `SlotEmpty` for a never-written slot, `SlotMismatch` when the
    /// ring has lapped the offset, and `SlotCorrupt` for an impossible
    /// length field. None of these are trusted as data.
    pub fn read_slot(&self, seq: Seq) -> Result<(RecordHeader, Vec<u8>), RingError> {
        let mut buf = vec![0u8; self.record_size as usize];
        self.file.read_exact_at(&mut buf, self.slot_offset(seq))?;

        let header = RecordHeader::read_from_prefix(&buf[..])
            .ok_or(RingError::SlotCorrupt(seq.value(), "short slot"))?;

        if header.marker != FRAME_MARKER {
            return Err(RingError::SlotEmpty(seq.value()));
        }
        if header.seq != seq.value() {
            return Err(RingError::SlotMismatch {
                expected: seq.value(),
                found: header.seq,
            });
        }
        let length = header.length as usize;
        if RecordHeader::SIZE + length > self.record_size as usize {
            return Err(RingError::SlotCorrupt(seq.value(), "length exceeds slot"));
        }

        let payload = buf[RecordHeader::SIZE..RecordHeader::SIZE + length].to_vec();
        Ok((header, payload))
    }

    /// Does the ring still hold a valid record for `seq`?
    pub fn retains(&self, seq: Seq) -> bool {
        self.read_slot(seq).is_ok()
    }

    /// Oldest sequence still contiguously retained below `next_out`.
    /// Walks backwards from the newest record; bounded by capacity.
    pub fn oldest_retained(&self) -> Option<Seq> {
        let next_out = self.control.next_out?;
        let mut oldest = None;
        let mut cursor = next_out.prev();
        for _ in 0..self.capacity {
            if !self.retains(cursor) {
                break;
            }
            oldest = Some(cursor);
            cursor = cursor.prev();
        }
        oldest
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
