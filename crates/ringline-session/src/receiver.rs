//! Receiver session — dials the sender, resumes, delivers, acks, declares.
//!
//! The receiver owns the reconnect loop: connect with bounded exponential
//! backoff, handshake with the persisted resume point, then deliver records
//! into the ring until the transport dies or `terminate()` is called. All
//! protocol failures are session-scoped and heal through reconnect.

use std::time::Instant;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;

use ringline_core::config::SessionConfig;
use ringline_core::seq::Seq;
use ringline_core::wire::{AckFrame, GapFrame, Hello, RecordHeader};
use ringline_store::Gap;

use crate::framing::{self, Frame, FrameError};
use crate::registry::SessionRegistry;
use crate::session::{SessionError, SessionHandle, SessionShared, SessionState, Shared};

/// Upper bound on concurrently declared gaps in multi-gap mode. Single-gap
/// mode (the conservative default) always uses 1.
const MULTI_GAP_LIMIT: usize = 8;

pub struct ReceiverSession {
    config: SessionConfig,
    shared: Shared,
    state_tx: watch::Sender<SessionState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ReceiverSession {
    /// Open the ring and gap list, register the session, and spawn its task.
    /// Returns the handle and the shared state (for inspection by owners).
    pub fn spawn(
        config: SessionConfig,
        registry: &SessionRegistry,
    ) -> anyhow::Result<(SessionHandle, Shared)> {
        let shared = SessionShared::open(&config)?;
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let (shutdown_tx, _) = broadcast::channel(4);
        let handle = SessionHandle::new(&config, state_rx, shutdown_tx.clone());
        registry.insert(config.peer.clone(), handle.clone());

        let session = ReceiverSession {
            config,
            shared: shared.clone(),
            state_tx,
            shutdown_tx,
        };
        tokio::spawn(async move {
            if let Err(e) = session.run().await {
                tracing::error!(error = %e, "receiver session task failed");
            }
        });

        Ok((handle, shared))
    }

    async fn run(self) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut backoff = self.config.timing.backoff_min();

        loop {
            self.state_tx.send_replace(SessionState::Connecting);

            let connected = tokio::select! {
                r = TcpStream::connect(&self.config.peer_addr) => Some(r),
                _ = shutdown.recv() => None,
            };
            let Some(connected) = connected else { break };

            match connected {
                Ok(stream) => {
                    backoff = self.config.timing.backoff_min();
                    match self.drive(stream, &mut shutdown).await {
                        Err(SessionError::Terminated) => break,
                        Err(e) => {
                            tracing::warn!(peer = %self.config.peer, error = %e, "session dropped, reconnecting");
                        }
                        Ok(()) => break,
                    }
                }
                Err(e) => {
                    tracing::warn!(peer_addr = %self.config.peer_addr, error = %e, "connect failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.recv() => break,
            }
            backoff = (backoff * 2).min(self.config.timing.backoff_max());
        }

        // The one shutdown ordering guarantee: control record and gap list
        // are flushed before the task exits, on every path.
        self.shared.lock().await.flush();
        self.state_tx.send_replace(SessionState::Closing);
        tracing::info!(peer = %self.config.peer, "receiver session closed");
        Ok(())
    }

    /// One connection's lifetime: handshake then steady-state delivery.
    async fn drive(
        &self,
        stream: TcpStream,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), SessionError> {
        stream.set_nodelay(true).ok();
        let (mut rd, mut wr) = stream.into_split();
        let max_payload = self.config.ring.record_size as usize;
        let idle = self.config.timing.idle_timeout();

        // ── handshake ────────────────────────────────────────────────────────
        self.state_tx.send_replace(SessionState::Handshake);

        let resume = self.shared.lock().await.ring.control().next_out;
        let hello = Hello::new(
            resume,
            self.config.ring.capacity,
            self.config.ring.record_size,
            &self.config.node,
            self.config.backfill.multi_gap,
        );
        framing::write_frame(&mut wr, &hello).await?;

        // terminate() must unblock a handshake the sender never answers.
        let frame = tokio::select! {
            r = timeout(idle, framing::read_frame(&mut rd, max_payload)) => {
                r.map_err(|_| SessionError::IdleTimeout)??
            }
            _ = shutdown.recv() => return Err(SessionError::Terminated),
        };
        let start = match frame {
            Frame::HelloAck(ack) => Seq::decode(ack.start),
            other => {
                return Err(SessionError::Handshake(format!(
                    "expected HELLO_ACK, got {other:?}"
                )))
            }
        };

        {
            let mut shared = self.shared.lock().await;
            match (resume, start) {
                (Some(resume), Some(start)) if start.distance(resume) > 0 => {
                    // The sender no longer retains our resume point. Account
                    // the difference as a gap instead of silently skipping.
                    tracing::warn!(
                        peer = %self.config.peer,
                        %resume,
                        %start,
                        "sender cannot resume where requested, opening gap"
                    );
                    shared.gaps.widen_to(start.prev());
                    shared.gaps.add_gap(resume, start.prev());
                    shared.ring.set_next_out(Some(start));
                }
                (None, Some(start)) => {
                    shared.ring.set_next_out(Some(start));
                }
                _ => {}
            }
        }

        tracing::info!(
            peer = %self.config.peer,
            resume = resume.map(|s| s.value() as i64).unwrap_or(-1),
            start = start.map(|s| s.value() as i64).unwrap_or(-1),
            "handshake complete, streaming"
        );
        self.state_tx.send_replace(SessionState::Streaming);

        // ── steady state ─────────────────────────────────────────────────────
        // Reads run on their own task: read_exact is not cancel-safe inside
        // select, and a reader task also lets terminate() unblock us.
        let (frame_tx, mut frame_rx) = mpsc::channel::<Result<Frame, FrameError>>(64);
        let reader = tokio::spawn(async move {
            loop {
                match framing::read_frame(&mut rd, max_payload).await {
                    Ok(frame) => {
                        if frame_tx.send(Ok(frame)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = frame_tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        let result = self
            .steady_state(&mut wr, &mut frame_rx, shutdown, start)
            .await;

        reader.abort();
        result
    }

    async fn steady_state(
        &self,
        wr: &mut tokio::net::tcp::OwnedWriteHalf,
        frame_rx: &mut mpsc::Receiver<Result<Frame, FrameError>>,
        shutdown: &mut broadcast::Receiver<()>,
        start: Option<Seq>,
    ) -> Result<(), SessionError> {
        let idle = self.config.timing.idle_timeout();
        let mut ack_tick = tokio::time::interval(self.config.timing.ack_interval());
        ack_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut flush_tick = tokio::time::interval(self.config.timing.control_flush());
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut watchdog = tokio::time::interval(idle);
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut last_rx = Instant::now();
        let mut pending_since_ack: u32 = 0;
        let mut last_ack: Option<(Seq, Seq)> = None;
        let mut session_low = start;
        let mut declared: Vec<Gap> = Vec::new();

        // Gaps carried over from before the reconnect are declared up front.
        self.maybe_declare(wr, &mut declared).await?;

        loop {
            tokio::select! {
                maybe = frame_rx.recv() => {
                    let frame = match maybe {
                        None => {
                            return Err(SessionError::Io(std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "sender closed the connection",
                            )))
                        }
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(frame)) => frame,
                    };
                    last_rx = Instant::now();

                    match frame {
                        Frame::Data { header, payload } => {
                            // A corrupted stream is torn down, not skipped.
                            header.verify(&payload).map_err(FrameError::from)?;
                            self.deliver(&header, &payload).await?;
                            if session_low.is_none() {
                                session_low = Some(header.seq());
                            }
                            pending_since_ack += 1;
                            if pending_since_ack >= self.config.timing.ack_every_records {
                                self.send_ack(wr, &mut last_ack, session_low).await?;
                                pending_since_ack = 0;
                            }
                        }
                        Frame::GapDeclare(gap) => {
                            // The sender's ring lost this range before it was
                            // sent; it will never arrive in-stream.
                            tracing::warn!(peer = %self.config.peer, %gap, "sender declared gap");
                            let mut shared = self.shared.lock().await;
                            shared.gaps.widen_to(gap.end);
                            shared.gaps.add_gap(gap.start, gap.end);
                            let jump = shared
                                .ring
                                .control()
                                .next_out
                                .map_or(true, |n| gap.end.distance(n) >= 0);
                            if jump {
                                shared.ring.set_next_out(Some(gap.end.next()));
                            }
                        }
                        Frame::GapAbandon(gap) => {
                            let mut shared = self.shared.lock().await;
                            shared.gaps.mark_unfillable(gap);
                        }
                        Frame::Heartbeat => {}
                        other => {
                            return Err(SessionError::Protocol(format!(
                                "unexpected frame at receiver: {other:?}"
                            )))
                        }
                    }

                    self.maybe_declare(wr, &mut declared).await?;
                }

                _ = ack_tick.tick() => {
                    if pending_since_ack > 0 {
                        self.send_ack(wr, &mut last_ack, session_low).await?;
                        pending_since_ack = 0;
                    }
                }

                _ = flush_tick.tick() => {
                    self.shared.lock().await.flush();
                }

                _ = watchdog.tick() => {
                    if last_rx.elapsed() >= idle {
                        return Err(SessionError::IdleTimeout);
                    }
                }

                _ = shutdown.recv() => {
                    return Err(SessionError::Terminated);
                }
            }
        }
    }

    /// Durably store one record and run the sequencing rules.
    async fn deliver(&self, header: &RecordHeader, payload: &[u8]) -> Result<(), SessionError> {
        let seq = header.seq();
        let mut shared = self.shared.lock().await;

        // A record older than the ring window maps to a slot that now holds
        // a newer sequence; storing it would destroy retained data.
        if let Some(expected) = shared.ring.control().next_out {
            if expected.distance(seq) > shared.ring.capacity() as i64 {
                tracing::warn!(peer = %self.config.peer, %seq, %expected, "record below retention window dropped");
                return Ok(());
            }
        }

        // Store the canonical (non-backfill-flagged) form.
        let time_us = header.time_us;
        let stored = RecordHeader::new(seq, payload, time_us, false);
        shared.ring.write_slot(&stored, payload)?;

        if header.is_backfill() {
            // Out-of-band fill: never touches next_out.
            shared.gaps.got_seq(seq);
            return Ok(());
        }

        match shared.ring.control().next_out {
            None => {
                shared.gaps.got_seq(seq);
                shared.ring.set_next_out(Some(seq.next()));
            }
            Some(expected) => {
                let d = seq.distance(expected);
                if d == 0 {
                    shared.gaps.got_seq(seq);
                    shared.ring.set_next_out(Some(seq.next()));
                } else if d > 0 {
                    tracing::warn!(
                        peer = %self.config.peer,
                        %seq,
                        %expected,
                        "hole in stream, opening gap"
                    );
                    shared.gaps.widen_to(seq);
                    shared.gaps.add_gap(expected, seq.prev());
                    shared.gaps.got_seq(seq);
                    shared.ring.set_next_out(Some(seq.next()));
                } else {
                    // Late or duplicate: storing again is idempotent.
                    shared.gaps.got_seq(seq);
                }
            }
        }
        Ok(())
    }

    /// Declare open gaps to the sender, bounded by the gap mode.
    async fn maybe_declare(
        &self,
        wr: &mut tokio::net::tcp::OwnedWriteHalf,
        declared: &mut Vec<Gap>,
    ) -> Result<(), SessionError> {
        let limit = if self.config.backfill.multi_gap {
            MULTI_GAP_LIMIT
        } else {
            1
        };

        let to_declare: Vec<Gap> = {
            let shared = self.shared.lock().await;
            // A declaration is spent once nothing it covered is still open.
            declared.retain(|d| shared.gaps.ranges().iter().any(|g| overlaps(*g, *d)));

            shared
                .gaps
                .ranges()
                .iter()
                .filter(|g| !declared.iter().any(|d| overlaps(**g, *d)))
                .take(limit.saturating_sub(declared.len()))
                .copied()
                .collect()
        };

        for gap in to_declare {
            tracing::info!(peer = %self.config.peer, %gap, "declaring gap for backfill");
            framing::write_frame(wr, &GapFrame::declare(gap.start, gap.end)).await?;
            declared.push(gap);
        }

        self.state_tx.send_replace(if declared.is_empty() {
            SessionState::Streaming
        } else {
            SessionState::GapFilling
        });
        Ok(())
    }

    /// Send the contiguous-run ack, suppressing repeats.
    async fn send_ack(
        &self,
        wr: &mut tokio::net::tcp::OwnedWriteHalf,
        last_ack: &mut Option<(Seq, Seq)>,
        session_low: Option<Seq>,
    ) -> Result<(), SessionError> {
        let (next_out, first_gap) = {
            let shared = self.shared.lock().await;
            (shared.ring.control().next_out, shared.gaps.next_gap())
        };
        let Some(next_out) = next_out else { return Ok(()) };

        // The run stops below the lowest open gap.
        let mut high = next_out.prev();
        if let Some(gap) = first_gap {
            if gap.start.distance(next_out) < 0 {
                high = gap.start.prev();
            }
        }

        let low = match *last_ack {
            Some((_, prev_high)) => prev_high.next(),
            None => session_low.unwrap_or(high),
        };

        if high.distance(low) < 0 {
            return Ok(()); // run has not advanced
        }
        if *last_ack == Some((low, high)) {
            return Ok(()); // identical ack suppressed
        }
        if let Some((_, prev_high)) = *last_ack {
            if prev_high == high {
                return Ok(());
            }
        }

        framing::write_frame(wr, &AckFrame::new(low, high)).await?;
        tracing::debug!(peer = %self.config.peer, %low, %high, "acked");
        *last_ack = Some((low, high));
        Ok(())
    }
}

fn overlaps(a: Gap, b: Gap) -> bool {
    a.start.distance(b.end) <= 0 && b.start.distance(a.end) <= 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::new_registry;
    use std::time::Duration;

    #[tokio::test]
    async fn terminate_unblocks_a_stalled_handshake() {
        // A sender that accepts the connection but never answers the HELLO.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_held, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let dir = std::env::temp_dir()
            .join(format!("ringline-receiver-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut config = SessionConfig::default();
        config.node = "STA1".into();
        config.peer = "HUB".into();
        config.peer_addr = addr.to_string();
        config.ring.path = dir.join("stalled-handshake-rx.ring");
        config.ring.capacity = 16;
        config.ring.record_size = 128;
        let _ = std::fs::remove_file(&config.ring.path);
        let _ = std::fs::remove_file(config.gap_path());

        let registry = new_registry();
        let (mut handle, _shared) = ReceiverSession::spawn(config, &registry).unwrap();

        // Let the dial land and the HELLO go out; the reply never comes.
        // The default idle timeout is a minute; terminate must not wait for it.
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.terminate();
        tokio::time::timeout(Duration::from_secs(2), handle.closed())
            .await
            .expect("terminate should close a session stuck in handshake");
    }
}
