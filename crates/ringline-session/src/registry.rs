//! Process-wide session registry, keyed by peer node identity.
//!
//! Passed to sessions at construction — never ambient global state — so
//! sessions stay independently testable.

use std::sync::Arc;

use dashmap::DashMap;

use crate::session::SessionHandle;

/// Shared registry of live sessions by peer identity.
pub type SessionRegistry = Arc<DashMap<String, SessionHandle>>;

pub fn new_registry() -> SessionRegistry {
    Arc::new(DashMap::new())
}

/// Terminate every registered session. Sessions flush their own state on
/// the way out; this only delivers the signal.
pub fn terminate_all(registry: &SessionRegistry) {
    for entry in registry.iter() {
        entry.value().terminate();
    }
}
