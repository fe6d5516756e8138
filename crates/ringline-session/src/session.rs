//! Shared session state, lifecycle handle, and the session error taxonomy.
//!
//! A session's ring and gap tracker are mutated from several logical places
//! (stream delivery, ack timer, backfill). All of them go through one
//! tokio Mutex — two writers racing on gap-splitting is the primary
//! corruption risk this design rules out.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};

use ringline_core::config::SessionConfig;
use ringline_store::{GapTracker, RingError, RingStore};

/// Protocol state, published through a watch channel for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshake,
    Streaming,
    GapFilling,
    Closing,
}

/// The single-writer state of one session: its ring and its gap tracker.
pub struct SessionShared {
    pub ring: RingStore,
    pub gaps: GapTracker,
    gap_path: PathBuf,
}

pub type Shared = Arc<Mutex<SessionShared>>;

impl SessionShared {
    /// Open the ring and load the gap artifact for a session.
    pub fn open(config: &SessionConfig) -> Result<Shared, RingError> {
        let ring = RingStore::open(
            &config.ring.path,
            config.ring.capacity,
            config.ring.record_size,
        )?;
        let gaps = GapTracker::load(&config.gap_path(), &config.node);
        Ok(Arc::new(Mutex::new(SessionShared {
            ring,
            gaps,
            gap_path: config.gap_path(),
        })))
    }

    /// Flush the control record and the gap list. Failures are logged, not
    /// fatal: the control write retries on the next flush tick, and the gap
    /// tracker is the independent resumption signal either way.
    pub fn flush(&mut self) {
        // Trim first so the persisted artifact never carries ranges the ring
        // can no longer represent.
        if let Some(high) = self.gaps.high() {
            let floor = high.sub(self.ring.capacity());
            if !self.gaps.is_empty() {
                self.gaps.trim(floor);
            }
        }
        if let Err(e) = self.ring.write_control() {
            tracing::warn!(error = %e, "control record write failed, will retry on next flush");
        }
        if let Err(e) = self.gaps.persist(&self.gap_path) {
            tracing::warn!(error = %e, path = %self.gap_path.display(), "gap list persist failed");
        }
    }
}

/// Handle to a spawned session: terminate and observe.
///
/// `terminate` is idempotent; the session task flushes its control record
/// and gap list on every exit path before it finishes.
#[derive(Clone)]
pub struct SessionHandle {
    pub node: String,
    pub peer: String,
    state: watch::Receiver<SessionState>,
    shutdown: broadcast::Sender<()>,
}

impl SessionHandle {
    pub(crate) fn new(
        config: &SessionConfig,
        state: watch::Receiver<SessionState>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            node: config.node.clone(),
            peer: config.peer.clone(),
            state,
            shutdown,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Request shutdown. Safe to call more than once; the transport is
    /// closed to unblock any pending read.
    pub fn terminate(&self) {
        let _ = self.shutdown.send(());
    }

    /// Wait until the session reaches `Closing`.
    pub async fn closed(&mut self) {
        while *self.state.borrow() != SessionState::Closing {
            if self.state.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringline_core::seq::Seq;

    fn config(name: &str) -> SessionConfig {
        let dir =
            std::env::temp_dir().join(format!("ringline-session-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut config = SessionConfig::default();
        config.node = "STA1".into();
        config.ring.path = dir.join(name);
        config.ring.capacity = 8;
        config.ring.record_size = 64;
        let _ = std::fs::remove_file(&config.ring.path);
        let _ = std::fs::remove_file(config.gap_path());
        config
    }

    #[test]
    fn flush_trims_below_retention_before_persisting() {
        let config = config("flush-trim.ring");
        let shared = SessionShared::open(&config).unwrap();

        {
            let mut shared = shared.try_lock().unwrap();
            shared.gaps.widen_to(Seq::new(100));
            shared.gaps.add_gap(Seq::new(50), Seq::new(60));
            shared.ring.set_next_out(Some(Seq::new(101)));
            shared.flush();
        }

        // [50,60] is below the retention floor (100 - 8); the artifact
        // written by this flush must not carry it.
        let loaded = GapTracker::load(&config.gap_path(), "STA1");
        assert!(loaded.is_empty());
    }
}

/// Session-scoped failures. None of these escape the session's reconnect
/// loop; they decide whether to reconnect and what to log.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] crate::framing::FrameError),

    #[error("ring error: {0}")]
    Ring(#[from] RingError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("no bytes within idle timeout, forcing reconnect")]
    IdleTimeout,

    #[error("terminated")]
    Terminated,
}
