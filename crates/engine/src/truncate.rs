//! Relation truncation
//!
//! Truncating a relation shortens its main fork and, when present, its
//! free-space map and visibility map. Map contents are owned by other
//! subsystems; [`AuxForkTruncation`] asks them where their forks must end.

use relstore_core::{BlockNumber, Error, ForkNumber, RelFileLocatorBackend, RelPersistence, Result};
use relstore_durability::{LogRecord, XlSmgrTruncate, SMGR_TRUNCATE_ALL};
use relstore_storage::SmgrHandle;
use tracing::debug;

use crate::critical::CriticalSection;
use crate::session::Session;

/// Free-space map slots per page.
pub const SLOTS_PER_FSM_PAGE: BlockNumber = 4069;

/// Depth of the free-space map tree.
pub const FSM_TREE_DEPTH: u32 = 3;

/// Heap blocks covered by one visibility map page (two bits each).
pub const VM_HEAPBLOCKS_PER_PAGE: BlockNumber = 8168 * 4;

/// Sizes the auxiliary forks of a relation for a new heap length.
///
/// Each `prepare_*` call returns the new block count of its fork, or
/// `None` when nothing past `heap_nblocks` lives in it.
pub trait AuxForkTruncation: Send + Sync {
    /// New free-space map size.
    fn prepare_fsm_truncate(
        &self,
        rel: &RelFileLocatorBackend,
        fsm_nblocks: BlockNumber,
        heap_nblocks: BlockNumber,
    ) -> Option<BlockNumber>;

    /// New visibility map size.
    fn prepare_vm_truncate(
        &self,
        rel: &RelFileLocatorBackend,
        vm_nblocks: BlockNumber,
        heap_nblocks: BlockNumber,
    ) -> Option<BlockNumber>;

    /// Refresh upper free-space map levels after the map was truncated.
    fn vacuum_fsm(&self, _rel: &RelFileLocatorBackend) {}
}

/// Map sizing from page geometry alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsmVmTruncation;

/// Physical block of a bottom-level free-space map page.
pub fn fsm_logical_to_physical(logical: BlockNumber) -> BlockNumber {
    let mut pages: BlockNumber = 0;
    let mut leafno = logical;
    for _ in 0..FSM_TREE_DEPTH {
        pages += leafno + 1;
        leafno /= SLOTS_PER_FSM_PAGE;
    }
    pages - 1
}

impl AuxForkTruncation for FsmVmTruncation {
    fn prepare_fsm_truncate(
        &self,
        _rel: &RelFileLocatorBackend,
        fsm_nblocks: BlockNumber,
        heap_nblocks: BlockNumber,
    ) -> Option<BlockNumber> {
        let logical = heap_nblocks / SLOTS_PER_FSM_PAGE;
        let slot = heap_nblocks % SLOTS_PER_FSM_PAGE;
        let mut new_nblocks = fsm_logical_to_physical(logical);
        if slot != 0 {
            new_nblocks += 1;
        }
        (new_nblocks < fsm_nblocks).then_some(new_nblocks)
    }

    fn prepare_vm_truncate(
        &self,
        _rel: &RelFileLocatorBackend,
        vm_nblocks: BlockNumber,
        heap_nblocks: BlockNumber,
    ) -> Option<BlockNumber> {
        let mut new_nblocks = heap_nblocks / VM_HEAPBLOCKS_PER_PAGE;
        if heap_nblocks % VM_HEAPBLOCKS_PER_PAGE != 0 {
            new_nblocks += 1;
        }
        (new_nblocks < vm_nblocks).then_some(new_nblocks)
    }
}

/// Forks and target sizes for truncating a relation to `nblocks` heap blocks.
pub(crate) fn plan_truncate(
    session: &mut Session,
    h: SmgrHandle,
    nblocks: BlockNumber,
) -> Result<(Vec<ForkNumber>, Vec<BlockNumber>)> {
    let rel = h.rel();
    let aux = std::sync::Arc::clone(session.cluster().aux_forks());
    let smgr = session.smgr();

    let mut forks = vec![ForkNumber::Main];
    let mut blocks = vec![nblocks];
    if smgr.exists(h, ForkNumber::Fsm)? {
        let current = smgr.nblocks(h, ForkNumber::Fsm)?;
        if let Some(n) = aux.prepare_fsm_truncate(&rel, current, nblocks) {
            forks.push(ForkNumber::Fsm);
            blocks.push(n);
        }
    }
    if smgr.exists(h, ForkNumber::VisibilityMap)? {
        let current = smgr.nblocks(h, ForkNumber::VisibilityMap)?;
        if let Some(n) = aux.prepare_vm_truncate(&rel, current, nblocks) {
            forks.push(ForkNumber::VisibilityMap);
            blocks.push(n);
        }
    }
    Ok((forks, blocks))
}

impl Session {
    /// Truncate a relation to `nblocks` main-fork blocks.
    ///
    /// The TRUNCATE record is flushed before any file shrinks, and
    /// checkpoints are held off until the files match the record.
    pub fn truncate_relation(
        &mut self,
        h: SmgrHandle,
        persistence: RelPersistence,
        nblocks: BlockNumber,
    ) -> Result<()> {
        let rel = h.rel();
        self.pre_truncate(&rel.locator)?;

        let current = self.smgr().nblocks(h, ForkNumber::Main)?;
        if nblocks > current {
            return Err(Error::InvalidOperation(format!(
                "cannot truncate {} to {} blocks: it's only {} blocks now",
                rel, nblocks, current
            )));
        }
        let (forks, blocks) = plan_truncate(self, h, nblocks)?;
        let needs_wal = self.relation_needs_wal(&rel.locator, persistence);
        let cluster = std::sync::Arc::clone(self.cluster());

        {
            let _delay = cluster.delay_checkpoint();
            let smgr = self.smgr();
            CriticalSection::run("truncate", || {
                if needs_wal {
                    let (_, end) = cluster.log(&LogRecord::SmgrTruncate(XlSmgrTruncate {
                        locator: rel.locator,
                        blkno: nblocks,
                        flags: SMGR_TRUNCATE_ALL,
                    }))?;
                    cluster.flush_wal(end)?;
                }
                smgr.truncate(h, &forks, &blocks)
            });
        }
        if needs_wal {
            self.xact_mut()?.mark_wrote_wal();
        }
        if forks.contains(&ForkNumber::Fsm) {
            cluster.aux_forks().vacuum_fsm(&rel);
        }
        debug!(target: "relstore::smgr", rel = %rel, nblocks, ?forks, needs_wal, "truncated relation");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Cluster;
    use crate::config::{SmgrConfig, WalLevel};
    use relstore_core::RelFileLocator;
    use tempfile::tempdir;

    fn rel() -> RelFileLocatorBackend {
        RelFileLocatorBackend::shared(RelFileLocator::new(1663, 5, 16384))
    }

    #[test]
    fn test_fsm_logical_to_physical() {
        // Leaf 0 sits after the root and one internal page.
        assert_eq!(fsm_logical_to_physical(0), 2);
        assert_eq!(fsm_logical_to_physical(1), 3);
        assert_eq!(
            fsm_logical_to_physical(SLOTS_PER_FSM_PAGE),
            SLOTS_PER_FSM_PAGE + 3
        );
    }

    #[test]
    fn test_fsm_boundary() {
        let aux = FsmVmTruncation;
        assert_eq!(aux.prepare_fsm_truncate(&rel(), 10, 0), Some(2));
        assert_eq!(aux.prepare_fsm_truncate(&rel(), 10, 1), Some(3));
        assert_eq!(aux.prepare_fsm_truncate(&rel(), 3, 1), None);
    }

    #[test]
    fn test_vm_boundary() {
        let aux = FsmVmTruncation;
        assert_eq!(aux.prepare_vm_truncate(&rel(), 4, 0), Some(0));
        assert_eq!(aux.prepare_vm_truncate(&rel(), 4, 1), Some(1));
        assert_eq!(
            aux.prepare_vm_truncate(&rel(), 4, VM_HEAPBLOCKS_PER_PAGE + 1),
            Some(2)
        );
        assert_eq!(aux.prepare_vm_truncate(&rel(), 1, 5), None);
    }

    #[test]
    fn test_aux_fork_truncation_is_object_safe() {
        fn _accepts(_: &dyn AuxForkTruncation) {}
    }

    #[test]
    fn test_truncate_relation_shrinks_forks() {
        let dir = tempdir().unwrap();
        let cluster = Cluster::builder()
            .config(SmgrConfig::for_testing())
            .open(dir.path())
            .unwrap();
        let mut s = cluster.session();
        s.begin().unwrap();
        let h = s
            .record_create(rel().locator, RelPersistence::Permanent)
            .unwrap();
        s.smgr().zeroextend(h, ForkNumber::Main, 0, 10, true).unwrap();
        s.smgr().create(h, ForkNumber::VisibilityMap, false).unwrap();
        s.smgr()
            .zeroextend(h, ForkNumber::VisibilityMap, 0, 3, true)
            .unwrap();

        let before = cluster.wal_insert_position();
        s.truncate_relation(h, RelPersistence::Permanent, 4).unwrap();
        assert_eq!(s.smgr().nblocks(h, ForkNumber::Main).unwrap(), 4);
        assert_eq!(s.smgr().nblocks(h, ForkNumber::VisibilityMap).unwrap(), 1);
        assert!(cluster.wal_insert_position() > before);

        let err = s
            .truncate_relation(h, RelPersistence::Permanent, 5)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn test_truncate_skip_wal_relation_not_logged() {
        let dir = tempdir().unwrap();
        let cluster = Cluster::builder()
            .config(SmgrConfig::for_testing().with_wal_level(WalLevel::Minimal))
            .open(dir.path())
            .unwrap();
        let mut s = cluster.session();
        s.begin().unwrap();
        let h = s
            .record_create(rel().locator, RelPersistence::Permanent)
            .unwrap();
        s.smgr().zeroextend(h, ForkNumber::Main, 0, 4, true).unwrap();

        let before = cluster.wal_insert_position();
        s.truncate_relation(h, RelPersistence::Permanent, 1).unwrap();
        assert_eq!(cluster.wal_insert_position(), before);
        assert!(
            s.transaction()
                .unwrap()
                .pending_sync(&rel().locator)
                .unwrap()
                .is_truncated
        );
    }
}
