//! Ringline integration tests.
//!
//! Each test runs a real sender endpoint and receiver session over loopback
//! TCP with ring files in a per-test temp directory. Timings are tightened
//! far below production defaults so the suite stays fast; the protocol
//! behavior under test does not depend on the absolute values.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ringline_core::config::SessionConfig;
use ringline_core::seq::Seq;
use ringline_core::wire::RecordHeader;
use ringline_session::{new_registry, NullArchive, ReceiverSession, SenderEndpoint};
use ringline_store::{Gap, RingError, RingStore};

// ── Harness ───────────────────────────────────────────────────────────────────

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

fn temp_dir(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ringline-it-{}-{}", test, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Fast timings for tests; capacity and record size per call site.
fn config(node: &str, peer: &str, addr: &str, ring_path: PathBuf, capacity: u32) -> SessionConfig {
    let mut config = SessionConfig::default();
    config.node = node.into();
    config.peer = peer.into();
    config.peer_addr = addr.into();
    config.channel = "CH1".into();
    config.ring.path = ring_path;
    config.ring.capacity = capacity;
    config.ring.record_size = 64;
    config.timing.ack_every_records = 50;
    config.timing.ack_interval_ms = 50;
    config.timing.control_flush_ms = 100;
    config.timing.idle_timeout_ms = 5_000;
    config.timing.backoff_min_ms = 20;
    config.timing.backoff_max_ms = 200;
    config.timing.poll_interval_ms = 5;
    config
}

/// Poll `check` until it holds or the deadline passes.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        if check().await {
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn payload_for(seq: u32) -> Vec<u8> {
    format!("sample-{seq}").into_bytes()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// The full lifecycle: stream a thousand records, kill the receiver after
/// 730, reconnect, and end with every record the receiver's ring can hold —
/// each exactly once, no gaps.
#[tokio::test(flavor = "multi_thread")]
async fn replication_survives_a_receiver_restart() {
    init_tracing();
    let dir = temp_dir("restart");
    let registry = new_registry();

    let tx_config = config("HUB", "STA1", "127.0.0.1:0", dir.join("tx.ring"), 1000);
    let (tx_handle, tx_shared, addr) =
        SenderEndpoint::spawn(tx_config, &registry, Arc::new(NullArchive))
            .await
            .unwrap();

    let rx_config = config("STA1", "HUB", &addr.to_string(), dir.join("rx.ring"), 500);

    // First 730 records, then the receiver comes up and catches up.
    {
        let mut shared = tx_shared.lock().await;
        for seq in 0..730u32 {
            shared.ring.append(&payload_for(seq), seq as u64 * 1_000).unwrap();
        }
    }

    let (rx_handle, rx_shared) = ReceiverSession::spawn(rx_config.clone(), &registry).unwrap();
    eventually("receiver to reach seq 730", || {
        let rx_shared = rx_shared.clone();
        async move {
            let shared = rx_shared.lock().await;
            shared.ring.control().next_out == Some(Seq::new(730))
        }
    })
    .await;

    // Kill the receiver mid-stream.
    rx_handle.terminate();
    rx_handle.clone().closed().await;
    drop(rx_shared);

    // The sender keeps producing while the receiver is down.
    {
        let mut shared = tx_shared.lock().await;
        for seq in 730..1000u32 {
            shared.ring.append(&payload_for(seq), seq as u64 * 1_000).unwrap();
        }
    }

    // Reconnect: the persisted control record resumes at 730.
    let (rx_handle, rx_shared) = ReceiverSession::spawn(rx_config, &registry).unwrap();
    eventually("receiver to reach seq 1000 with no gaps", || {
        let rx_shared = rx_shared.clone();
        async move {
            let shared = rx_shared.lock().await;
            shared.ring.control().next_out == Some(Seq::new(1000)) && shared.gaps.is_empty()
        }
    })
    .await;

    // Exactly-once, verifiable content: the receiver's ring holds the most
    // recent capacity-worth of records and nothing stale.
    {
        let shared = rx_shared.lock().await;
        for seq in [500u32, 730, 999] {
            let (header, payload) = shared.ring.read_slot(Seq::new(seq)).unwrap();
            assert_eq!(payload, payload_for(seq));
            header.verify(&payload).unwrap();
        }
        assert!(matches!(
            shared.ring.read_slot(Seq::new(100)),
            Err(RingError::SlotMismatch { expected: 100, found: 600 })
        ));
    }

    // Acks flowed back: the sender knows the whole stream is durable.
    eventually("sender to see seq 999 acked", || {
        let tx_shared = tx_shared.clone();
        async move {
            let shared = tx_shared.lock().await;
            shared.ring.control().last_acked == Some(Seq::new(999))
        }
    })
    .await;

    rx_handle.terminate();
    tx_handle.terminate();
    let _ = std::fs::remove_dir_all(&dir);
}

/// When the sender can no longer resume where the receiver asks, the
/// receiver records the difference as a gap instead of silently skipping;
/// with nothing able to source it, the gap ends up explicitly unfillable.
#[tokio::test(flavor = "multi_thread")]
async fn lapped_resume_point_becomes_an_accounted_gap() {
    init_tracing();
    let dir = temp_dir("lapped");
    let registry = new_registry();

    // Sender ring of 8 slots holding 0..20: only 12..19 survive.
    let tx_config = config("HUB", "STA1", "127.0.0.1:0", dir.join("tx.ring"), 8);
    let (tx_handle, tx_shared, addr) =
        SenderEndpoint::spawn(tx_config, &registry, Arc::new(NullArchive))
            .await
            .unwrap();
    {
        let mut shared = tx_shared.lock().await;
        for seq in 0..20u32 {
            shared.ring.append(&payload_for(seq), seq as u64 * 1_000).unwrap();
        }
    }

    // Receiver whose persisted state says "resume at 5".
    let rx_config = config("STA1", "HUB", &addr.to_string(), dir.join("rx.ring"), 64);
    {
        let mut ring = RingStore::open(&rx_config.ring.path, 64, 64).unwrap();
        ring.set_next_out(Some(Seq::new(5)));
        ring.write_control().unwrap();
    }

    let (rx_handle, rx_shared) = ReceiverSession::spawn(rx_config, &registry).unwrap();

    eventually("gap [5,11] to be declared unrecoverable", || {
        let rx_shared = rx_shared.clone();
        async move {
            let shared = rx_shared.lock().await;
            shared.gaps.is_empty()
                && shared.gaps.unfillable() == [Gap::new(Seq::new(5), Seq::new(11))]
                && shared.ring.control().next_out == Some(Seq::new(20))
        }
    })
    .await;

    // The retained tail still arrived normally.
    {
        let shared = rx_shared.lock().await;
        for seq in 12..20u32 {
            let (_, payload) = shared.ring.read_slot(Seq::new(seq)).unwrap();
            assert_eq!(payload, payload_for(seq));
        }
    }

    rx_handle.terminate();
    tx_handle.terminate();
    let _ = std::fs::remove_dir_all(&dir);
}

/// A gap persisted in the artifact is re-declared on connect and filled out
/// of band from the sender's ring, without moving the realtime cursor.
#[tokio::test(flavor = "multi_thread")]
async fn persisted_gap_is_backfilled_from_the_sender_ring() {
    init_tracing();
    let dir = temp_dir("backfill");
    let registry = new_registry();

    let tx_config = config("HUB", "STA1", "127.0.0.1:0", dir.join("tx.ring"), 64);
    let (tx_handle, tx_shared, addr) =
        SenderEndpoint::spawn(tx_config, &registry, Arc::new(NullArchive))
            .await
            .unwrap();
    {
        let mut shared = tx_shared.lock().await;
        for seq in 0..20u32 {
            shared.ring.append(&payload_for(seq), seq as u64 * 1_000).unwrap();
        }
    }

    // Receiver already caught up to 20 but owes itself [5,9] from a past
    // incident, recorded in the gap artifact.
    let rx_config = config("STA1", "HUB", &addr.to_string(), dir.join("rx.ring"), 64);
    {
        let mut ring = RingStore::open(&rx_config.ring.path, 64, 64).unwrap();
        ring.set_next_out(Some(Seq::new(20)));
        ring.write_control().unwrap();
        std::fs::write(rx_config.gap_path(), "ringline-gaps v1 STA1 5 19\n5,9\n").unwrap();
    }

    let (rx_handle, rx_shared) = ReceiverSession::spawn(rx_config, &registry).unwrap();

    eventually("gap [5,9] to be backfilled", || {
        let rx_shared = rx_shared.clone();
        async move {
            let shared = rx_shared.lock().await;
            shared.gaps.is_empty() && shared.gaps.unfillable().is_empty()
        }
    })
    .await;

    {
        let shared = rx_shared.lock().await;
        for seq in 5..10u32 {
            let (header, payload) = shared.ring.read_slot(Seq::new(seq)).unwrap();
            assert_eq!(payload, payload_for(seq));
            // Stored canonically, not with the wire-level backfill flag.
            assert!(!header.is_backfill());
        }
        // Out-of-band fills never advance the realtime cursor.
        assert_eq!(shared.ring.control().next_out, Some(Seq::new(20)));
    }

    rx_handle.terminate();
    tx_handle.terminate();
    let _ = std::fs::remove_dir_all(&dir);
}

/// Backfill pacing happens in the backfill agent's task, so a starved byte
/// budget slows the gap fill and nothing else: a record appended while a
/// backfill is crawling still arrives promptly.
#[tokio::test(flavor = "multi_thread")]
async fn throttled_backfill_never_delays_the_realtime_stream() {
    init_tracing();
    let dir = temp_dir("throttled");
    let registry = new_registry();

    // One byte per second: every backfill record spends most of a window
    // asleep in the governor.
    let mut tx_config = config("HUB", "STA1", "127.0.0.1:0", dir.join("tx.ring"), 64);
    tx_config.backfill.rate_floor_bps = 1;
    tx_config.backfill.rate_ceiling_bps = 1;
    let (tx_handle, tx_shared, addr) =
        SenderEndpoint::spawn(tx_config, &registry, Arc::new(NullArchive))
            .await
            .unwrap();
    {
        let mut shared = tx_shared.lock().await;
        for seq in 0..20u32 {
            shared.ring.append(&payload_for(seq), seq as u64 * 1_000).unwrap();
        }
    }

    // Receiver caught up to 20 but owing [0,7]; it will declare the gap on
    // connect and start the crawl.
    let rx_config = config("STA1", "HUB", &addr.to_string(), dir.join("rx.ring"), 64);
    {
        let mut ring = RingStore::open(&rx_config.ring.path, 64, 64).unwrap();
        ring.set_next_out(Some(Seq::new(20)));
        ring.write_control().unwrap();
        std::fs::write(rx_config.gap_path(), "ringline-gaps v1 STA1 0 19\n0,7\n").unwrap();
    }

    let (rx_handle, rx_shared) = ReceiverSession::spawn(rx_config, &registry).unwrap();

    // Let the handshake land and the backfill agent go to sleep on its budget.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let t0 = Instant::now();
    {
        let mut shared = tx_shared.lock().await;
        shared.ring.append(&payload_for(20), 20_000).unwrap();
    }
    eventually("realtime record 20 to arrive", || {
        let rx_shared = rx_shared.clone();
        async move {
            let shared = rx_shared.lock().await;
            shared.ring.control().next_out == Some(Seq::new(21))
        }
    })
    .await;
    assert!(
        t0.elapsed() < Duration::from_millis(800),
        "realtime delivery took {:?} while a backfill was throttled",
        t0.elapsed()
    );

    rx_handle.terminate();
    tx_handle.terminate();
    let _ = std::fs::remove_dir_all(&dir);
}

/// A declared gap neither the ring nor the archive can produce is abandoned
/// after bounded attempts and surfaces as unfillable on the receiver.
#[tokio::test(flavor = "multi_thread")]
async fn unsourceable_gap_is_abandoned_not_retried_forever() {
    init_tracing();
    let dir = temp_dir("abandon");
    let registry = new_registry();

    // Sender ring holds only 10..19; 5..9 were never written.
    let tx_config = config("HUB", "STA1", "127.0.0.1:0", dir.join("tx.ring"), 64);
    let (tx_handle, tx_shared, addr) =
        SenderEndpoint::spawn(tx_config, &registry, Arc::new(NullArchive))
            .await
            .unwrap();
    {
        let mut shared = tx_shared.lock().await;
        for seq in 10..20u32 {
            let payload = payload_for(seq);
            let header = RecordHeader::new(Seq::new(seq), &payload, seq as u64 * 1_000, false);
            shared.ring.write_slot(&header, &payload).unwrap();
        }
        shared.ring.set_next_out(Some(Seq::new(20)));
    }

    let rx_config = config("STA1", "HUB", &addr.to_string(), dir.join("rx.ring"), 64);
    {
        let mut ring = RingStore::open(&rx_config.ring.path, 64, 64).unwrap();
        ring.set_next_out(Some(Seq::new(20)));
        ring.write_control().unwrap();
        std::fs::write(rx_config.gap_path(), "ringline-gaps v1 STA1 5 19\n5,9\n").unwrap();
    }

    let (rx_handle, rx_shared) = ReceiverSession::spawn(rx_config, &registry).unwrap();

    eventually("gap [5,9] to be abandoned", || {
        let rx_shared = rx_shared.clone();
        async move {
            let shared = rx_shared.lock().await;
            shared.gaps.is_empty()
                && shared.gaps.unfillable() == [Gap::new(Seq::new(5), Seq::new(9))]
        }
    })
    .await;

    rx_handle.terminate();
    tx_handle.terminate();
    let _ = std::fs::remove_dir_all(&dir);
}
