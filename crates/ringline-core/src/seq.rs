//! Sequence number arithmetic — the single wraparound authority.
//!
//! Every sequence comparison in ringline goes through this module. The
//! half-modulus rule lives here and nowhere else: a difference whose
//! magnitude exceeds SEQ_MODULUS/2 is interpreted as having wrapped.

use std::cmp::Ordering;
use std::fmt;

/// Sequence numbers live in `[0, SEQ_MODULUS)` and wrap.
pub const SEQ_MODULUS: u32 = 1 << 31;

const HALF: u32 = SEQ_MODULUS / 2;

/// Sentinel used in on-disk and on-wire `i32` fields for "no sequence yet".
pub const SEQ_UNSET: i32 = -1;

/// A wrapping sequence number.
///
/// Deliberately does not implement `Ord` — there is no total order on a
/// circle. Use [`Seq::seq_cmp`] or [`Seq::distance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Seq(u32);

impl Seq {
    pub const ZERO: Seq = Seq(0);

    pub fn new(value: u32) -> Self {
        Seq(value % SEQ_MODULUS)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// `self + 1 (mod M)`.
    pub fn next(self) -> Seq {
        self.add(1)
    }

    /// `self - 1 (mod M)`.
    pub fn prev(self) -> Seq {
        self.sub(1)
    }

    pub fn add(self, n: u32) -> Seq {
        Seq((self.0 + n % SEQ_MODULUS) % SEQ_MODULUS)
    }

    pub fn sub(self, n: u32) -> Seq {
        Seq((self.0 + SEQ_MODULUS - n % SEQ_MODULUS) % SEQ_MODULUS)
    }

    /// Signed distance `self - other` under the half-modulus rule.
    ///
    /// Positive means `self` is ahead of `other`, negative behind.
    pub fn distance(self, other: Seq) -> i64 {
        let d = (self.0 + SEQ_MODULUS - other.0) % SEQ_MODULUS;
        if d >= HALF {
            d as i64 - SEQ_MODULUS as i64
        } else {
            d as i64
        }
    }

    /// Wraparound-aware comparison.
    pub fn seq_cmp(self, other: Seq) -> Ordering {
        self.distance(other).cmp(&0)
    }

    /// Inclusive count of sequences in `[self, end]`. Zero if `end` is
    /// behind `self`.
    pub fn span_to(self, end: Seq) -> u64 {
        let d = end.distance(self);
        if d < 0 {
            0
        } else {
            d as u64 + 1
        }
    }

    /// Encode for an `i32` wire/disk field.
    pub fn encode(self) -> i32 {
        self.0 as i32
    }

    /// Encode an optional sequence; `None` becomes [`SEQ_UNSET`].
    pub fn encode_opt(seq: Option<Seq>) -> i32 {
        seq.map(Seq::encode).unwrap_or(SEQ_UNSET)
    }

    /// Decode an `i32` field. Anything outside `[0, SEQ_MODULUS)` — the
    /// unset sentinel included — decodes to `None`; callers that must
    /// distinguish "unset" from "garbage" inspect the raw value.
    pub fn decode(raw: i32) -> Option<Seq> {
        if raw < 0 {
            None
        } else {
            Some(Seq(raw as u32))
        }
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
