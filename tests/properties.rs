//! Property tests over random operation sequences.

mod common;

use common::{loc, page, TestCluster};
use proptest::prelude::*;
use relstore::durability::{LogRecord, LoggedRecord, XlSmgrCreate, XlSmgrTruncate, SMGR_TRUNCATE_ALL};
use relstore::storage::SmgrHandle;
use relstore::{
    AlignedPage, ForkNumber, Lsn, RedoApplier, RelFileLocator, RelFileLocatorBackend,
    RelPersistence, Session, BLOCK_BYTES,
};

const BLOCKS_PER_SEGMENT: u32 = 8;

#[derive(Debug, Clone)]
enum Op {
    Extend { gap: u32, marker: u8 },
    ZeroExtend { count: u32 },
    Write { at: u32, markers: Vec<u8> },
    Truncate { keep_percent: u32 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u32..12, 1u8..=255).prop_map(|(gap, marker)| Op::Extend { gap, marker }),
        1 => (1u32..10).prop_map(|count| Op::ZeroExtend { count }),
        3 => (any::<u32>(), prop::collection::vec(1u8..=255, 1..4))
            .prop_map(|(at, markers)| Op::Write { at, markers }),
        1 => (0u32..=100).prop_map(|keep_percent| Op::Truncate { keep_percent }),
    ]
}

// Expected block contents: 0 for a zero page, else the page marker.
fn apply(s: &mut Session, h: SmgrHandle, model: &mut Vec<u8>, op: &Op) {
    let fork = ForkNumber::Main;
    match op {
        Op::Extend { gap, marker } => {
            let blkno = model.len() as u32 + gap;
            s.smgr().extend(h, fork, blkno, &page(*marker)[..], false).unwrap();
            model.resize(blkno as usize, 0);
            model.push(*marker);
        }
        Op::ZeroExtend { count } => {
            s.smgr()
                .zeroextend(h, fork, model.len() as u32, *count, false)
                .unwrap();
            model.resize(model.len() + *count as usize, 0);
        }
        Op::Write { at, markers } => {
            if model.len() < markers.len() {
                return;
            }
            let start = at % (model.len() - markers.len() + 1) as u32;
            let pages: Vec<_> = markers.iter().map(|m| page(*m)).collect();
            let bufs: Vec<&[u8]> = pages.iter().map(|p| &p[..]).collect();
            s.smgr().writev(h, fork, start, &bufs, false).unwrap();
            for (i, m) in markers.iter().enumerate() {
                model[start as usize + i] = *m;
            }
        }
        Op::Truncate { keep_percent } => {
            let target = (model.len() as u32 * keep_percent) / 100;
            s.smgr().truncate(h, &[fork], &[target]).unwrap();
            model.truncate(target as usize);
        }
    }
}

fn segment_sizes(tc: &TestCluster, rel: &RelFileLocatorBackend) -> Vec<u64> {
    let md = tc.cluster().registry().md();
    (0..)
        .map(|segno| md.segment_path(rel, ForkNumber::Main, segno))
        .map_while(|path| std::fs::metadata(path).ok().map(|m| m.len()))
        .collect()
}

fn check_block(s: &mut Session, h: SmgrHandle, blkno: u32, marker: u8) {
    let mut buf = AlignedPage::zeroed();
    s.smgr()
        .read(h, ForkNumber::Main, blkno, &mut buf[..])
        .unwrap();
    if marker == 0 {
        assert!(buf.iter().all(|&b| b == 0), "block {} should be zero", blkno);
    } else {
        assert_eq!(buf[..], page(marker)[..], "block {}", blkno);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_fork_matches_model(ops in prop::collection::vec(op(), 1..24)) {
        let tc = TestCluster::with_config(
            relstore::SmgrConfig::for_testing().with_blocks_per_segment(BLOCKS_PER_SEGMENT),
        );
        let mut s = tc.cluster().session();
        let rel = RelFileLocatorBackend::shared(loc(1));
        let h = s.smgr().open(rel).unwrap();
        s.smgr().create(h, ForkNumber::Main, false).unwrap();

        let mut model = Vec::new();
        for op in &ops {
            apply(&mut s, h, &mut model, op);

            // Every segment before the last one present is full.
            let sizes = segment_sizes(&tc, &rel);
            let full = BLOCKS_PER_SEGMENT as u64 * BLOCK_BYTES as u64;
            for i in 1..sizes.len() {
                if sizes[i] > 0 {
                    prop_assert_eq!(sizes[i - 1], full, "segment {} after {:?}", i - 1, op);
                }
            }

            // The block count agrees with the files.
            let total: u64 = sizes.iter().sum();
            let n = s.smgr().nblocks(h, ForkNumber::Main).unwrap();
            prop_assert_eq!(n as u64, total / BLOCK_BYTES as u64);
            prop_assert_eq!(n as usize, model.len());
        }

        // Contents round-trip; gaps read as zeros.
        for (blkno, marker) in model.iter().enumerate() {
            check_block(&mut s, h, blkno as u32, *marker);
        }
    }

    #[test]
    fn test_create_then_abort_leaves_nothing(rel in 0u32..10_000) {
        let tc = TestCluster::new();
        let mut s = tc.cluster().session();
        s.begin().unwrap();
        let h = s.record_create(loc(rel), RelPersistence::Permanent).unwrap();
        s.smgr().zeroextend(h, ForkNumber::Main, 0, 3, false).unwrap();
        s.on_xact_abort().unwrap();

        let path = tc.cluster().registry().md().segment_path(&h.rel(), ForkNumber::Main, 0);
        prop_assert!(!path.exists());
    }

    #[test]
    fn test_drop_then_abort_keeps_files(rel in 0u32..10_000) {
        let tc = TestCluster::new();
        let mut s = tc.cluster().session();
        s.begin().unwrap();
        let h = s.record_create(loc(rel), RelPersistence::Permanent).unwrap();
        s.on_xact_commit().unwrap();

        s.begin().unwrap();
        s.record_drop(h).unwrap();
        s.on_xact_abort().unwrap();

        let h = s.open(loc(rel), RelPersistence::Permanent).unwrap();
        prop_assert!(s.smgr().exists(h, ForkNumber::Main).unwrap());
    }

    #[test]
    fn test_subxact_commit_promotes_to_top(depth in 1u32..5, commit in any::<bool>()) {
        let tc = TestCluster::new();
        let mut s = tc.cluster().session();
        s.begin().unwrap();
        for _ in 0..depth {
            s.begin_subxact().unwrap();
        }
        s.record_create(loc(1), RelPersistence::Permanent).unwrap();
        for _ in 0..depth {
            s.on_subxact_commit().unwrap();
        }
        let entry = s.transaction().unwrap().pending_deletes()[0];
        prop_assert_eq!(entry.nest_level, 1);

        if commit {
            s.on_xact_commit().unwrap();
        } else {
            s.on_xact_abort().unwrap();
        }
        let h = s.open(loc(1), RelPersistence::Permanent).unwrap();
        prop_assert_eq!(s.smgr().exists(h, ForkNumber::Main).unwrap(), commit);
    }

    #[test]
    fn test_replay_is_idempotent(nblocks in 1u32..20, keep in 0u32..20) {
        let tc = TestCluster::new();
        let locator = loc(1);
        let create = record(LogRecord::SmgrCreate(XlSmgrCreate {
            locator,
            fork: ForkNumber::Main,
        }), 100);
        let truncate = record(LogRecord::SmgrTruncate(XlSmgrTruncate {
            locator,
            blkno: keep,
            flags: SMGR_TRUNCATE_ALL,
        }), 200);

        {
            let mut s = tc.cluster().session();
            let h = s.smgr().open(RelFileLocatorBackend::shared(locator)).unwrap();
            s.smgr().create(h, ForkNumber::Main, false).unwrap();
            for blkno in 0..nblocks {
                s.smgr().extend(h, ForkNumber::Main, blkno, &page(blkno as u8 + 1)[..], false).unwrap();
            }
        }

        let mut applier = RedoApplier::new(tc.cluster());
        applier.apply(&create).unwrap();
        applier.apply(&truncate).unwrap();
        applier.finish().unwrap();
        let once = snapshot(&tc, locator);

        let mut applier = RedoApplier::new(tc.cluster());
        applier.apply(&create).unwrap();
        applier.apply(&truncate).unwrap();
        applier.finish().unwrap();
        prop_assert_eq!(snapshot(&tc, locator), once.clone());
        prop_assert_eq!(once.len() as u32, nblocks.min(keep));
    }
}

fn record(record: LogRecord, end: u64) -> LoggedRecord {
    LoggedRecord {
        start: Lsn(end - 1),
        end: Lsn(end),
        record: record.encode().unwrap(),
    }
}

fn snapshot(tc: &TestCluster, locator: RelFileLocator) -> Vec<Vec<u8>> {
    let mut s = tc.cluster().session();
    let h = s.smgr().open(RelFileLocatorBackend::shared(locator)).unwrap();
    let n = s.smgr().nblocks(h, ForkNumber::Main).unwrap();
    (0..n)
        .map(|blkno| {
            let mut buf = AlignedPage::zeroed();
            s.smgr().read(h, ForkNumber::Main, blkno, &mut buf[..]).unwrap();
            buf.to_vec()
        })
        .collect()
}
