//! ringline-store — the durable ring file and the persisted gap list.

pub mod gaps;
pub mod ring;

pub use gaps::{Gap, GapTracker};
pub use ring::{Control, RingError, RingStore};
