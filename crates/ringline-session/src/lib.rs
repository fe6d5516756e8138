//! ringline-session — the per-connection replication state machine.
//!
//! A session owns one RingStore and one GapTracker and drives one end of
//! the wire protocol: the receiver dials, resumes, acks and declares gaps;
//! the sender listens, streams its ring, and backfills declared gaps from
//! the ring or an external archive under a rate ceiling.

pub mod backfill;
pub mod framing;
pub mod governor;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod session;

pub use backfill::{Archive, NullArchive};
pub use receiver::ReceiverSession;
pub use registry::{new_registry, SessionRegistry};
pub use sender::SenderEndpoint;
pub use session::{SessionHandle, SessionState};
