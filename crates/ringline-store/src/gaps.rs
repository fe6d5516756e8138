//! GapTracker — the persisted set of missing sequence ranges.
//!
//! Ranges are kept sorted, disjoint, and non-adjacent; adjacent or
//! overlapping additions merge. The whole list round-trips through a small
//! text artifact so a restarted session knows exactly what it is still owed
//! even if the control record is stale.

use std::path::Path;

use ringline_core::seq::Seq;

/// An inclusive range of sequences known to be missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub start: Seq,
    pub end: Seq,
}

impl Gap {
    pub fn new(start: Seq, end: Seq) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, seq: Seq) -> bool {
        seq.distance(self.start) >= 0 && self.end.distance(seq) >= 0
    }

    pub fn len(&self) -> u64 {
        self.start.span_to(self.end)
    }
}

impl std::fmt::Display for Gap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.start, self.end)
    }
}

/// Tracks missing ranges inside the window `[low, high]`.
#[derive(Debug)]
pub struct GapTracker {
    node: String,

    /// Sorted ascending by start, disjoint, non-adjacent.
    ranges: Vec<Gap>,

    /// Window bounds. `low` advances as the oldest sequence is delivered,
    /// `high` follows the newest sequence observed.
    low: Option<Seq>,
    high: Option<Seq>,

    /// Ranges closed without data — true loss, kept for operators.
    unfillable: Vec<Gap>,
}

impl GapTracker {
    pub fn new(node: &str) -> Self {
        Self {
            node: node.to_string(),
            ranges: Vec::new(),
            low: None,
            high: None,
            unfillable: Vec::new(),
        }
    }

    pub fn ranges(&self) -> &[Gap] {
        &self.ranges
    }

    pub fn unfillable(&self) -> &[Gap] {
        &self.unfillable
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn low(&self) -> Option<Seq> {
        self.low
    }

    pub fn high(&self) -> Option<Seq> {
        self.high
    }

    /// Extend the observed window to include `seq` without marking anything
    /// received. Used when the peer vouches for sequences this node never
    /// saw (handshake resume skips, sender-declared gaps).
    pub fn widen_to(&mut self, seq: Seq) {
        match self.high {
            Some(high) if seq.distance(high) <= 0 => {}
            _ => self.high = Some(seq),
        }
        if self.low.is_none() {
            self.low = Some(seq);
        }
    }

    /// Note that `seq` has been observed (delivered or backfilled), moving
    /// the window and clearing it from any open range.
    pub fn got_seq(&mut self, seq: Seq) {
        self.widen_to(seq);

        if let Some(idx) = self.ranges.iter().position(|g| g.contains(seq)) {
            let gap = self.ranges[idx];
            if gap.start == seq && gap.end == seq {
                self.ranges.remove(idx);
            } else if gap.start == seq {
                self.ranges[idx].start = seq.next();
            } else if gap.end == seq {
                self.ranges[idx].end = seq.prev();
            } else {
                // Strictly inside: split into two.
                self.ranges[idx].end = seq.prev();
                self.ranges.insert(idx + 1, Gap::new(seq.next(), gap.end));
            }
        }

        if self.low == Some(seq) {
            self.low = Some(seq.next());
        }
    }

    /// Record a new missing range, merging with neighbors.
    ///
    /// Inverted ranges and ranges entirely above the observed window are
    /// rejected as logged no-ops — they describe data nobody has seen yet.
    pub fn add_gap(&mut self, start: Seq, end: Seq) {
        if end.distance(start) < 0 {
            tracing::warn!(node = %self.node, %start, %end, "rejecting inverted gap");
            return;
        }
        if let Some(high) = self.high {
            if start.distance(high) > 0 {
                tracing::warn!(node = %self.node, %start, %end, %high, "rejecting gap above window");
                return;
            }
        } else {
            tracing::warn!(node = %self.node, %start, %end, "rejecting gap before any sequence observed");
            return;
        }

        let mut merged = Gap::new(start, end);

        // Absorb every range that overlaps or touches the new one, then
        // re-insert in sorted position.
        self.ranges.retain(|g| {
            let disjoint_below = g.end.next().distance(merged.start) < 0;
            let disjoint_above = merged.end.next().distance(g.start) < 0;
            if disjoint_below || disjoint_above {
                true
            } else {
                if g.start.distance(merged.start) < 0 {
                    merged.start = g.start;
                }
                if g.end.distance(merged.end) > 0 {
                    merged.end = g.end;
                }
                false
            }
        });

        let pos = self
            .ranges
            .iter()
            .position(|g| g.start.distance(merged.start) > 0)
            .unwrap_or(self.ranges.len());
        self.ranges.insert(pos, merged);

        if self.low.map_or(true, |low| merged.start.distance(low) < 0) {
            self.low = Some(merged.start);
        }
    }

    /// Drop or clip ranges below `floor` — the ring can no longer source
    /// them, so carrying them would promise data that cannot be delivered.
    pub fn trim(&mut self, floor: Seq) {
        let node = self.node.clone();
        self.ranges.retain_mut(|g| {
            if g.end.distance(floor) < 0 {
                tracing::warn!(node = %node, gap = %g, %floor, "dropping gap below retention floor");
                return false;
            }
            if g.start.distance(floor) < 0 {
                tracing::warn!(node = %node, gap = %g, %floor, "clipping gap at retention floor");
                g.start = floor;
            }
            true
        });
        if let Some(low) = self.low {
            if low.distance(floor) < 0 {
                self.low = Some(floor);
            }
        }
    }

    /// Lowest open range — the next candidate for backfill, oldest first so
    /// staleness stays bounded.
    pub fn next_gap(&self) -> Option<Gap> {
        self.ranges.first().copied()
    }

    /// Close a range without data. Distinct from filling it: the range is
    /// remembered so operators can tell real loss from transient failure.
    pub fn mark_unfillable(&mut self, gap: Gap) {
        self.ranges.retain(|g| {
            let overlaps = g.start.distance(gap.end) <= 0 && gap.start.distance(g.end) <= 0;
            !overlaps
        });
        tracing::error!(node = %self.node, %gap, "gap declared unrecoverable — data is lost");
        self.unfillable.push(gap);
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    /// Serialize to the gap-list artifact. Format: one header line
    /// `ringline-gaps v1 <node> <low> <high>` then `start,end` per range.
    pub fn persist(&self, path: &Path) -> std::io::Result<()> {
        let mut text = format!(
            "ringline-gaps v1 {} {} {}\n",
            self.node,
            Seq::encode_opt(self.low),
            Seq::encode_opt(self.high),
        );
        for gap in &self.ranges {
            text.push_str(&format!("{},{}\n", gap.start, gap.end));
        }
        std::fs::write(path, text)
    }

    /// Load the artifact. A missing or unparseable file yields an empty
    /// tracker — optimistic, but logged loudly because it can hide loss.
    pub fn load(path: &Path, node: &str) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "no gap list artifact — assuming no gaps");
                return Self::new(node);
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "gap list unreadable — assuming no gaps");
                return Self::new(node);
            }
        };

        match Self::parse(&text, node) {
            Some(tracker) => tracker,
            None => {
                tracing::error!(path = %path.display(), "gap list corrupt — assuming no gaps");
                Self::new(node)
            }
        }
    }

    fn parse(text: &str, node: &str) -> Option<Self> {
        let mut lines = text.lines();
        let header = lines.next()?;
        let mut fields = header.split_whitespace();
        if fields.next()? != "ringline-gaps" || fields.next()? != "v1" {
            return None;
        }
        let stored_node = fields.next()?;
        let low = Seq::decode(fields.next()?.parse::<i32>().ok()?);
        let high = Seq::decode(fields.next()?.parse::<i32>().ok()?);

        if stored_node != node {
            tracing::warn!(stored = stored_node, expected = node, "gap list belongs to another node");
        }

        let mut tracker = Self::new(node);
        tracker.low = low;
        tracker.high = high;
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (start, end) = line.split_once(',')?;
            let start = Seq::new(start.trim().parse::<u32>().ok()?);
            let end = Seq::new(end.trim().parse::<u32>().ok()?);
            if end.distance(start) < 0 {
                return None;
            }
            tracker.ranges.push(Gap::new(start, end));
        }
        Some(tracker)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
