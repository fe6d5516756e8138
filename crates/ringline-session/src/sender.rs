//! Sender endpoint — listens, negotiates resume, streams the ring.
//!
//! The sender is the passive side of the transport and the active side of
//! the data flow: it accepts one receiver connection at a time, answers the
//! HELLO with the sequence it can actually start from, then pumps its ring
//! cursor toward `next_out` on a poll tick. Declared gaps spawn a
//! [`BackfillAgent`]; its records are paced inside the agent task by the
//! shared [`RateGovernor`] before entering a bounded channel, so catch-up
//! traffic never crowds out — or stalls — real time.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::time::timeout;

use ringline_core::config::SessionConfig;
use ringline_core::seq::Seq;
use ringline_core::wire::{
    decode_node, FrameKind, GapFrame, HelloAck, Prelude, RecordHeader, FLAG_MULTI_GAP,
};
use ringline_store::{Gap, RingError};

use crate::backfill::{Archive, BackfillAgent, BackfillItem};
use crate::framing::{self, Frame, FrameError};
use crate::governor::RateGovernor;
use crate::registry::SessionRegistry;
use crate::session::{SessionError, SessionHandle, SessionShared, SessionState, Shared};

/// Records pulled from the ring per poll tick. Bounds how long the shared
/// lock is held and how far one tick can starve the ack path.
const MAX_BURST: usize = 256;

pub struct SenderEndpoint {
    config: SessionConfig,
    shared: Shared,
    archive: Arc<dyn Archive>,
    state_tx: watch::Sender<SessionState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SenderEndpoint {
    /// Open the ring, bind the listen address, register, and spawn the
    /// accept loop. The bound address is returned so callers configured
    /// with port 0 can learn the real port.
    pub async fn spawn(
        config: SessionConfig,
        registry: &SessionRegistry,
        archive: Arc<dyn Archive>,
    ) -> anyhow::Result<(SessionHandle, Shared, SocketAddr)> {
        let shared = SessionShared::open(&config)?;
        let listener = TcpListener::bind(&config.peer_addr).await?;
        let local_addr = listener.local_addr()?;

        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let (shutdown_tx, _) = broadcast::channel(4);
        let handle = SessionHandle::new(&config, state_rx, shutdown_tx.clone());
        registry.insert(config.peer.clone(), handle.clone());

        let endpoint = SenderEndpoint {
            config,
            shared: shared.clone(),
            archive,
            state_tx,
            shutdown_tx,
        };
        tokio::spawn(async move {
            if let Err(e) = endpoint.run(listener).await {
                tracing::error!(error = %e, "sender endpoint task failed");
            }
        });

        Ok((handle, shared, local_addr))
    }

    /// Accept loop. One receiver at a time; a replacement connection is not
    /// accepted until the current one is gone.
    async fn run(self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            self.state_tx.send_replace(SessionState::Connecting);

            let accepted = tokio::select! {
                r = listener.accept() => Some(r),
                _ = shutdown.recv() => None,
            };
            let Some(accepted) = accepted else { break };

            match accepted {
                Ok((stream, addr)) => {
                    tracing::info!(%addr, "receiver connected");
                    match self.serve(stream, &mut shutdown).await {
                        Err(SessionError::Terminated) => break,
                        Err(e) => {
                            tracing::warn!(%addr, error = %e, "connection ended");
                        }
                        Ok(()) => break,
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            }
        }

        self.shared.lock().await.flush();
        self.state_tx.send_replace(SessionState::Closing);
        tracing::info!(node = %self.config.node, "sender endpoint closed");
        Ok(())
    }

    async fn serve(
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

        // terminate() must unblock a handshake that never completes.
        let frame = tokio::select! {
            r = timeout(idle, framing::read_frame(&mut rd, max_payload)) => {
                r.map_err(|_| SessionError::IdleTimeout)??
            }
            _ = shutdown.recv() => return Err(SessionError::Terminated),
        };
        let hello = match frame {
            Frame::Hello(h) => h,
            other => {
                return Err(SessionError::Handshake(format!(
                    "expected HELLO, got {other:?}"
                )))
            }
        };

        let peer_record_size = hello.record_size;
        if peer_record_size != self.config.ring.record_size {
            return Err(SessionError::Handshake(format!(
                "record size mismatch: peer {} vs local {}",
                peer_record_size, self.config.ring.record_size
            )));
        }
        let resume = Seq::decode(hello.resume);
        let multi_gap = hello.flags & FLAG_MULTI_GAP != 0;
        let peer_node = decode_node(&hello.node);

        let start = {
            let shared = self.shared.lock().await;
            negotiate_start(&shared.ring, resume)
        };
        framing::write_frame(&mut wr, &HelloAck::new(start)).await?;

        tracing::info!(
            peer = %peer_node,
            resume = resume.map(|s| s.value() as i64).unwrap_or(-1),
            start = start.map(|s| s.value() as i64).unwrap_or(-1),
            multi_gap,
            "handshake complete, streaming"
        );
        self.state_tx.send_replace(SessionState::Streaming);

        // Reads on their own task: read_exact is not cancel-safe in select.
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
            .stream_loop(&mut wr, &mut frame_rx, shutdown, start, multi_gap)
            .await;

        reader.abort();
        result
    }

    async fn stream_loop(
        &self,
        wr: &mut OwnedWriteHalf,
        frame_rx: &mut mpsc::Receiver<Result<Frame, FrameError>>,
        shutdown: &mut broadcast::Receiver<()>,
        start: Option<Seq>,
        multi_gap: bool,
    ) -> Result<(), SessionError> {
        let mut poll = tokio::time::interval(self.config.timing.poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut flush_tick = tokio::time::interval(self.config.timing.control_flush());
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let (bf_tx, mut bf_rx) =
            mpsc::channel::<BackfillItem>(self.config.backfill.queue_depth.max(1));
        // Shared with the backfill agents, which pace themselves against it
        // in their own tasks; this loop only feeds it latency observations.
        let governor = Arc::new(Mutex::new(RateGovernor::new(
            self.config.backfill.rate_floor_bps,
            self.config.backfill.rate_ceiling_bps,
        )));
        let mut active_backfills: u32 = 0;

        let heartbeat_after = self.config.timing.idle_timeout() / 2;
        let mut cursor = start;
        let mut last_tx = Instant::now();

        loop {
            tokio::select! {
                maybe = frame_rx.recv() => {
                    let frame = match maybe {
                        None => {
                            return Err(SessionError::Io(std::io::Error::new(
                                std::io::ErrorKind::UnexpectedEof,
                                "receiver closed the connection",
                            )))
                        }
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(frame)) => frame,
                    };

                    match frame {
                        Frame::Ack { low, high } => {
                            self.apply_ack(low, high, start).await;
                        }
                        Frame::GapDeclare(gap) => {
                            if !multi_gap && active_backfills > 0 {
                                tracing::warn!(
                                    %gap,
                                    active = active_backfills,
                                    "gap declared while one is in flight in single-gap mode, ignoring"
                                );
                                continue;
                            }
                            tracing::info!(%gap, "gap declared, starting backfill");
                            active_backfills += 1;
                            self.state_tx.send_replace(SessionState::GapFilling);
                            let agent = BackfillAgent::new(
                                self.shared.clone(),
                                self.archive.clone(),
                                self.config.channel.clone(),
                                self.config.backfill.max_attempts,
                                governor.clone(),
                                bf_tx.clone(),
                            );
                            tokio::spawn(agent.fill(gap));
                        }
                        Frame::Heartbeat => {}
                        other => {
                            return Err(SessionError::Protocol(format!(
                                "unexpected frame at sender: {other:?}"
                            )))
                        }
                    }
                }

                item = bf_rx.recv() => {
                    // bf_tx is held by this loop, so the channel never closes.
                    let Some(item) = item else { continue };
                    match item {
                        BackfillItem::Record { header, payload } => {
                            // Already paced by the agent; just put it on the wire.
                            framing::write_record(wr, &header, &payload).await?;
                            last_tx = Instant::now();
                        }
                        BackfillItem::Abandon(gap) => {
                            framing::write_frame(wr, &GapFrame::abandon(gap.start, gap.end)).await?;
                            last_tx = Instant::now();
                        }
                        BackfillItem::Done(gap) => {
                            tracing::info!(%gap, "backfill complete");
                            active_backfills = active_backfills.saturating_sub(1);
                            if active_backfills == 0 {
                                self.state_tx.send_replace(SessionState::Streaming);
                            }
                        }
                    }
                }

                _ = poll.tick() => {
                    let sent = self.pump(wr, &mut cursor, &governor).await?;
                    if sent {
                        last_tx = Instant::now();
                    } else if last_tx.elapsed() >= heartbeat_after {
                        framing::write_frame(wr, &Prelude::new(FrameKind::Heartbeat, 0)).await?;
                        last_tx = Instant::now();
                    }
                }

                _ = flush_tick.tick() => {
                    self.shared.lock().await.flush();
                }

                _ = shutdown.recv() => {
                    return Err(SessionError::Terminated);
                }
            }
        }
    }

    /// Move the cursor toward `next_out`, sending what the ring retains and
    /// declaring what it has lapped. Returns whether anything was written.
    async fn pump(
        &self,
        wr: &mut OwnedWriteHalf,
        cursor: &mut Option<Seq>,
        governor: &Mutex<RateGovernor>,
    ) -> Result<bool, SessionError> {
        enum Out {
            Rec(RecordHeader, Vec<u8>),
            Declare(Gap),
        }

        let batch: Vec<Out> = {
            let shared = self.shared.lock().await;
            let Some(next_out) = shared.ring.control().next_out else {
                return Ok(false);
            };
            if cursor.is_none() {
                // Producer appended after a handshake on an empty ring.
                *cursor = shared.ring.oldest_retained();
            }
            let Some(mut cur) = *cursor else { return Ok(false) };

            let mut batch = Vec::new();
            let mut miss_start: Option<Seq> = None;
            while cur.distance(next_out) < 0 && batch.len() < MAX_BURST {
                match shared.ring.read_slot(cur) {
                    Ok((header, payload)) => {
                        if let Some(s) = miss_start.take() {
                            batch.push(Out::Declare(Gap::new(s, cur.prev())));
                        }
                        batch.push(Out::Rec(header, payload));
                    }
                    Err(RingError::SlotEmpty(_))
                    | Err(RingError::SlotMismatch { .. })
                    | Err(RingError::SlotCorrupt(..)) => {
                        miss_start.get_or_insert(cur);
                    }
                    Err(e) => {
                        // Read failure on one slot is a one-record gap, not
                        // a dead session; the cursor advances past it.
                        tracing::warn!(seq = %cur, error = %e, "slot read failed, skipping");
                        miss_start.get_or_insert(cur);
                    }
                }
                cur = cur.next();
            }
            if let Some(s) = miss_start.take() {
                batch.push(Out::Declare(Gap::new(s, cur.prev())));
            }
            *cursor = Some(cur);
            batch
        };

        if batch.is_empty() {
            return Ok(false);
        }

        let began = Instant::now();
        let mut sent_records = false;
        for out in batch {
            match out {
                Out::Rec(header, payload) => {
                    framing::write_record(wr, &header, &payload).await?;
                    sent_records = true;
                }
                Out::Declare(gap) => {
                    tracing::warn!(%gap, "ring lapped unsent records, declaring gap");
                    framing::write_frame(wr, &GapFrame::declare(gap.start, gap.end)).await?;
                }
            }
        }
        if sent_records {
            // Real-time send latency is the congestion signal that widens
            // or shrinks the backfill budget.
            governor.lock().await.observe_latency(began.elapsed());
        }
        Ok(true)
    }

    /// Fold an acked run into the control record. Only runs contiguous with
    /// what is already acked (or anchored at the negotiated start) are
    /// trusted; anything else is a stale or confused ack and is dropped.
    async fn apply_ack(&self, low: Seq, high: Seq, start: Option<Seq>) {
        let mut shared = self.shared.lock().await;
        let last_acked = shared.ring.control().last_acked;

        let contiguous = match last_acked {
            None => true,
            Some(la) => low.distance(la.next()) <= 0,
        } || start == Some(low);

        if !contiguous {
            tracing::warn!(%low, %high, last_acked = ?last_acked, "discontiguous ack ignored");
            return;
        }
        let advances = last_acked.map_or(true, |la| high.distance(la) > 0);
        if advances {
            tracing::debug!(%low, %high, "ack advances");
            shared.ring.set_last_acked(Some(high));
        }
    }
}

/// The sender's answer to a resume request: the requested point when the
/// ring still holds it (or nothing newer exists), otherwise the oldest
/// record still retained.
fn negotiate_start(ring: &ringline_store::RingStore, resume: Option<Seq>) -> Option<Seq> {
    let next_out = ring.control().next_out?;
    match resume {
        Some(r) if r == next_out || ring.retains(r) => Some(r),
        _ => ring.oldest_retained().or(Some(next_out)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringline_store::RingStore;
    use std::path::PathBuf;

    fn temp_ring(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ringline-sender-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn ring_with(name: &str, seqs: std::ops::Range<u32>) -> RingStore {
        let mut ring = RingStore::open(&temp_ring(name), 16, 128).unwrap();
        for seq in seqs.clone() {
            let payload = format!("rec-{seq}");
            let header = RecordHeader::new(Seq::new(seq), payload.as_bytes(), 0, false);
            ring.write_slot(&header, payload.as_bytes()).unwrap();
        }
        ring.set_next_out(Some(Seq::new(seqs.end)));
        ring
    }

    #[test]
    fn retained_resume_point_is_honored() {
        let ring = ring_with("honored.ring", 10..20);
        assert_eq!(negotiate_start(&ring, Some(Seq::new(14))), Some(Seq::new(14)));
    }

    #[test]
    fn resume_at_next_out_means_nothing_to_replay() {
        let ring = ring_with("caught-up.ring", 10..20);
        assert_eq!(negotiate_start(&ring, Some(Seq::new(20))), Some(Seq::new(20)));
    }

    #[test]
    fn lapped_resume_point_falls_back_to_oldest_retained() {
        // Capacity 16, records 0..32: only 16..31 survive.
        let ring = ring_with("lapped.ring", 0..32);
        assert_eq!(negotiate_start(&ring, Some(Seq::new(3))), Some(Seq::new(16)));
    }

    #[test]
    fn fresh_receiver_gets_everything_retained() {
        let ring = ring_with("fresh-rx.ring", 10..20);
        assert_eq!(negotiate_start(&ring, None), Some(Seq::new(10)));
    }

    #[test]
    fn fresh_sender_has_no_start() {
        let ring = RingStore::open(&temp_ring("fresh-tx.ring"), 16, 128).unwrap();
        assert_eq!(negotiate_start(&ring, None), None);
        assert_eq!(negotiate_start(&ring, Some(Seq::new(5))), None);
    }

    #[tokio::test]
    async fn terminate_unblocks_a_stalled_handshake() {
        use crate::backfill::NullArchive;
        use crate::registry::new_registry;
        use std::time::Duration;

        let mut config = SessionConfig::default();
        config.node = "HUB".into();
        config.peer = "STA1".into();
        config.peer_addr = "127.0.0.1:0".into();
        config.ring.path = temp_ring("stalled-handshake-tx.ring");
        config.ring.capacity = 16;
        config.ring.record_size = 128;

        let registry = new_registry();
        let (mut handle, _shared, addr) =
            SenderEndpoint::spawn(config, &registry, Arc::new(NullArchive))
                .await
                .unwrap();

        // A receiver that connects but never says HELLO. The default idle
        // timeout is a minute; terminate must not wait for it.
        let _stalled = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.terminate();
        tokio::time::timeout(Duration::from_secs(2), handle.closed())
            .await
            .expect("terminate should close an endpoint stuck in handshake");
    }
}
