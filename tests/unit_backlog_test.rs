// tests/unit_backlog_test.rs

//! Unit tests for the replication backlog: feeding, trimming, cursor reads,
//! and the partial-resync seek semantics.

use quartzkv::core::replication::backlog::{BACKLOG_MIN_BLOCK, ReplBacklog};

/// Feeds `total` bytes in `chunk`-sized pieces, starting at offset 1, and
/// returns the full byte history for comparison.
fn feed_pattern(backlog: &ReplBacklog, total: usize, chunk: usize) -> Vec<u8> {
    let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    let mut offset = 1u64;
    for piece in data.chunks(chunk) {
        backlog.feed(piece, offset);
        offset += piece.len() as u64;
    }
    data
}

#[test]
fn cursor_reads_back_the_exact_history() {
    let (backlog, _rx) = ReplBacklog::new(1024 * 1024);
    let data = feed_pattern(&backlog, 100_000, 7_001);

    let cursor = backlog.seek(1).expect("offset 1 must be retained");
    let mut out = Vec::new();
    loop {
        let chunk = backlog.read(cursor, 4096);
        if chunk.is_empty() {
            break;
        }
        out.extend_from_slice(&chunk);
    }
    assert_eq!(out, data);
    assert_eq!(backlog.cursor_offset(cursor), Some(100_001));
    backlog.release(cursor);
}

#[test]
fn partial_resync_at_offset_1001_yields_the_tail() {
    // A replica that processed 1000 bytes asks for 1001; it must receive
    // exactly bytes 1001..=1500 of the history.
    let (backlog, _rx) = ReplBacklog::new(1024 * 1024);
    let data = feed_pattern(&backlog, 1500, 300);

    let cursor = backlog.seek(1001).expect("1001 is retained");
    let tail = backlog.read(cursor, 10_000);
    assert_eq!(tail.len(), 500);
    assert_eq!(&tail[..], &data[1000..]);
    assert_eq!(backlog.cursor_offset(cursor), Some(1501));
    backlog.release(cursor);
}

#[test]
fn seek_bounds_follow_offset_and_histlen() {
    let (backlog, _rx) = ReplBacklog::new(1024 * 1024);
    feed_pattern(&backlog, 5000, 512);

    // One past the last byte is a valid (empty) attach point.
    let at_end = backlog.seek(5001).expect("end attach");
    assert!(backlog.read(at_end, 64).is_empty());
    backlog.release(at_end);

    assert!(backlog.seek(0).is_none());
    assert!(backlog.seek(5002).is_none());
}

#[test]
fn trimming_keeps_at_least_the_configured_history() {
    let limit = 4 * BACKLOG_MIN_BLOCK;
    let (backlog, _rx) = ReplBacklog::new(limit);
    feed_pattern(&backlog, 40 * BACKLOG_MIN_BLOCK, BACKLOG_MIN_BLOCK);

    let stats = backlog.stats();
    assert!(
        stats.histlen >= limit as u64,
        "retained history {} dropped below the limit {limit}",
        stats.histlen
    );
    // The first retained byte must line up with the total fed minus histlen.
    let total = (40 * BACKLOG_MIN_BLOCK) as u64;
    assert_eq!(stats.offset, total - stats.histlen + 1);
}

#[test]
fn trim_is_idempotent_without_new_feeds() {
    let limit = 2 * BACKLOG_MIN_BLOCK;
    let (backlog, _rx) = ReplBacklog::new(limit);
    feed_pattern(&backlog, 20 * BACKLOG_MIN_BLOCK, BACKLOG_MIN_BLOCK / 3);

    backlog.trim();
    let first = backlog.stats();
    backlog.trim();
    backlog.trim();
    assert_eq!(backlog.stats(), first);
}

#[test]
fn consumers_pin_the_head_block() {
    let limit = 2 * BACKLOG_MIN_BLOCK;
    let (backlog, _rx) = ReplBacklog::new(limit);
    feed_pattern(&backlog, BACKLOG_MIN_BLOCK, 1024);

    let cursor = backlog.seek(1).expect("attach at head");
    // Push far past the limit; the head chunk must survive because the
    // cursor still references it.
    let more: Vec<u8> = vec![9u8; 10 * BACKLOG_MIN_BLOCK];
    backlog.feed(&more, BACKLOG_MIN_BLOCK as u64 + 1);

    assert_eq!(backlog.first_offset(), 1, "head pinned by cursor");

    // Reading through releases the pin and a trim pass reclaims history.
    loop {
        if backlog.read(cursor, 64 * 1024).is_empty() {
            break;
        }
    }
    backlog.release(cursor);
    backlog.trim();
    assert!(backlog.first_offset() > 1, "head reclaimed after release");
}

#[test]
fn cursor_survives_interleaved_feeds() {
    let (backlog, _rx) = ReplBacklog::new(1024 * 1024);
    let mut history: Vec<u8> = Vec::new();
    let mut offset = 1u64;

    let cursor = {
        backlog.feed(b"hello-", offset);
        history.extend_from_slice(b"hello-");
        offset += 6;
        backlog.seek(1).expect("attach")
    };

    let mut seen = Vec::new();
    seen.extend_from_slice(&backlog.read(cursor, 1024));

    for round in 0..100 {
        let piece = format!("chunk-{round:03}-");
        backlog.feed(piece.as_bytes(), offset);
        offset += piece.len() as u64;
        history.extend_from_slice(piece.as_bytes());
        seen.extend_from_slice(&backlog.read(cursor, 1024));
    }
    assert_eq!(seen, history);
    backlog.release(cursor);
}

#[tokio::test]
async fn feed_wakes_offset_watchers() {
    let (backlog, mut rx) = ReplBacklog::new(64 * 1024);
    assert_eq!(*rx.borrow(), 0);
    backlog.feed(b"0123456789", 1);
    rx.changed().await.expect("sender alive");
    assert_eq!(*rx.borrow(), 10);
}
