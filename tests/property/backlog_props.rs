// tests/property/backlog_props.rs

//! Backlog invariants under arbitrary feed patterns:
//! - retained history accounting (`offset == produced - histlen + 1`),
//! - a seek at any retained offset replays the exact byte tail,
//! - trimming is idempotent between feeds.

use proptest::prelude::*;
use quartzkv::core::replication::backlog::ReplBacklog;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    #[test]
    fn history_accounting_holds(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..4096), 1..40),
        limit in 1024usize..65536,
    ) {
        let (backlog, _rx) = ReplBacklog::new(limit);
        let mut produced: u64 = 0;
        for chunk in &chunks {
            backlog.feed(chunk, produced + 1);
            produced += chunk.len() as u64;
        }
        let stats = backlog.stats();
        prop_assert_eq!(stats.offset, produced - stats.histlen + 1);
        prop_assert!(stats.histlen <= produced);

        backlog.trim();
        let once = backlog.stats();
        backlog.trim();
        prop_assert_eq!(backlog.stats(), once);
    }

    #[test]
    fn seek_replays_the_exact_tail(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..2048), 1..30),
        pick in 0.0f64..=1.0,
    ) {
        let (backlog, _rx) = ReplBacklog::new(512 * 1024);
        let mut history: Vec<u8> = Vec::new();
        for chunk in &chunks {
            backlog.feed(chunk, history.len() as u64 + 1);
            history.extend_from_slice(chunk);
        }
        let stats = backlog.stats();
        // Any offset within [offset, offset + histlen] is a valid seek; the
        // cursor must yield exactly the bytes from there to the end.
        let span = stats.histlen;
        let wanted = stats.offset + ((span as f64) * pick) as u64;

        let cursor = backlog.seek(wanted).expect("offset within retained range");
        let mut replayed = Vec::new();
        loop {
            let chunk = backlog.read(cursor, 777);
            if chunk.is_empty() {
                break;
            }
            replayed.extend_from_slice(&chunk);
        }
        backlog.release(cursor);

        let expected_len = (stats.offset + stats.histlen - wanted) as usize;
        prop_assert_eq!(replayed.len(), expected_len);
        let tail_start = (wanted - 1) as usize;
        prop_assert_eq!(&replayed[..], &history[tail_start..]);
    }
}
