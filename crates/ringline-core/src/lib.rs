//! ringline-core — sequence arithmetic, wire format, and configuration.
//! All other ringline crates depend on this one.

pub mod config;
pub mod seq;
pub mod wire;

pub use seq::Seq;
