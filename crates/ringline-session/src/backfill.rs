//! BackfillAgent — out-of-band delivery for declared gaps.
//!
//! Sources, in priority order: the sender's own ring while the range is
//! still retained, then an external archive queried by the time window of
//! the slots flanking the gap. Records are paced against the shared rate
//! budget here, in the agent's own task, then leave through a bounded
//! channel to the send loop flagged backfill, so the receiver never
//! advances its `next_out` on them and an over-budget backfill sleeps
//! without stalling the real-time stream. A range neither source can
//! produce is explicitly abandoned after a bounded number of attempts —
//! declared loss, never an infinite retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use ringline_core::seq::Seq;
use ringline_core::wire::RecordHeader;
use ringline_store::Gap;

use crate::governor::RateGovernor;
use crate::session::Shared;

/// External archive query interface. Failures and empty results both mean
/// "try later"; the agent bounds its own retries.
#[async_trait]
pub trait Archive: Send + Sync {
    /// Fetch payload records for `channel` covering the given time window,
    /// in sequence order.
    async fn query(
        &self,
        channel: &str,
        start_time_us: u64,
        duration_us: u64,
    ) -> anyhow::Result<Vec<Bytes>>;
}

/// An archive that has nothing. Deployments without an archive use this;
/// gaps the ring cannot satisfy become unfillable immediately.
pub struct NullArchive;

#[async_trait]
impl Archive for NullArchive {
    async fn query(&self, _: &str, _: u64, _: u64) -> anyhow::Result<Vec<Bytes>> {
        Ok(Vec::new())
    }
}

/// What the agent hands to the send loop.
#[derive(Debug)]
pub enum BackfillItem {
    /// One gap record, header already flagged backfill.
    Record { header: RecordHeader, payload: Bytes },

    /// This sub-range is unrecoverable; tell the peer.
    Abandon(Gap),

    /// The whole declared gap has been worked through (filled or abandoned).
    Done(Gap),
}

/// Nominal per-record time span used to window archive queries when the
/// slot above the gap is gone.
const FALLBACK_SPAN_US: u64 = 1_000_000;

/// Pause between archive attempts.
const RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct BackfillAgent {
    shared: Shared,
    archive: Arc<dyn Archive>,
    channel: String,
    max_attempts: u32,
    governor: Arc<Mutex<RateGovernor>>,
    tx: mpsc::Sender<BackfillItem>,
}

impl BackfillAgent {
    pub fn new(
        shared: Shared,
        archive: Arc<dyn Archive>,
        channel: String,
        max_attempts: u32,
        governor: Arc<Mutex<RateGovernor>>,
        tx: mpsc::Sender<BackfillItem>,
    ) -> Self {
        Self {
            shared,
            archive,
            channel,
            max_attempts,
            governor,
            tx,
        }
    }

    /// Pace one record against the backfill budget, then hand it to the
    /// send loop. False when the session side of the channel is gone.
    async fn send_record(&self, header: RecordHeader, payload: Bytes) -> bool {
        let wait = {
            let mut governor = self.governor.lock().await;
            governor.reserve((RecordHeader::SIZE + payload.len()) as u64)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        self.tx
            .send(BackfillItem::Record { header, payload })
            .await
            .is_ok()
    }

    /// Work one declared gap to completion. Ring first, archive for the
    /// leftovers, abandon what neither has.
    pub async fn fill(self, gap: Gap) {
        tracing::info!(%gap, "backfill started");

        let mut missing: Vec<Gap> = Vec::new();
        let mut run_start: Option<Seq> = None;
        let mut seq = gap.start;

        loop {
            // Lock per record so a long gap never starves the stream loop.
            let slot = {
                let shared = self.shared.lock().await;
                shared.ring.read_slot(seq)
            };

            match slot {
                Ok((header, payload)) => {
                    if let Some(start) = run_start.take() {
                        missing.push(Gap::new(start, seq.prev()));
                    }
                    let time_us = header.time_us;
                    let resend = RecordHeader::new(seq, &payload, time_us, true);
                    if !self.send_record(resend, Bytes::from(payload)).await {
                        return; // session gone
                    }
                }
                Err(e) => {
                    tracing::debug!(%seq, error = %e, "gap record not in ring");
                    run_start.get_or_insert(seq);
                }
            }

            if seq == gap.end {
                break;
            }
            seq = seq.next();
        }
        if let Some(start) = run_start.take() {
            missing.push(Gap::new(start, gap.end));
        }

        for run in missing {
            if let Some(rest) = self.fill_from_archive(run).await {
                tracing::warn!(gap = %rest, "gap unfillable from ring and archive");
                if self.tx.send(BackfillItem::Abandon(rest)).await.is_err() {
                    return;
                }
            }
        }

        let _ = self.tx.send(BackfillItem::Done(gap)).await;
        tracing::info!(%gap, "backfill finished");
    }

    /// Try the archive for one contiguous missing run. Responses shorter
    /// than the run are taken as a prefix: what arrived is delivered right
    /// away and only the remainder is retried. Returns the sub-range still
    /// missing after bounded attempts, `None` when everything was delivered
    /// (or the session is gone and there is nothing left to report).
    async fn fill_from_archive(&self, run: Gap) -> Option<Gap> {
        let Some((start_time_us, duration_us)) = self.time_window(run).await else {
            tracing::warn!(gap = %run, "no time window derivable, skipping archive");
            return Some(run);
        };

        let total = run.len();
        let mut done: u64 = 0;
        for attempt in 1..=self.max_attempts {
            match self.archive.query(&self.channel, start_time_us, duration_us).await {
                Ok(records) => {
                    // Responses are positional from run.start; skip what a
                    // previous attempt already delivered.
                    let fresh = records
                        .into_iter()
                        .skip(done as usize)
                        .take((total - done) as usize);
                    for payload in fresh {
                        let seq = run.start.add(done as u32);
                        let header = RecordHeader::new(seq, &payload, start_time_us, true);
                        if !self.send_record(header, payload).await {
                            return None;
                        }
                        done += 1;
                    }
                    if done == total {
                        return None;
                    }
                    tracing::debug!(
                        gap = %run,
                        attempt,
                        done,
                        total,
                        "archive response incomplete, will retry"
                    );
                }
                Err(e) => {
                    tracing::warn!(gap = %run, attempt, error = %e, "archive query failed");
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
        Some(Gap::new(run.start.add(done as u32), run.end))
    }

    /// Derive the archive time window from the slots flanking the run.
    async fn time_window(&self, run: Gap) -> Option<(u64, u64)> {
        let shared = self.shared.lock().await;
        let below = shared.ring.read_slot(run.start.prev()).ok().map(|(h, _)| h.time_us);
        let above = shared.ring.read_slot(run.end.next()).ok().map(|(h, _)| h.time_us);
        drop(shared);

        let start = below?;
        let duration = match above {
            Some(t) if t > start => t - start,
            _ => run.len().saturating_mul(FALLBACK_SPAN_US),
        };
        Some((start, duration))
    }
}
