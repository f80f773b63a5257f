//! Transaction storage tracker
//!
//! Per-transaction bookkeeping of relation files that must be unlinked at
//! commit or abort, and of relations whose WAL is skipped until commit.
//! This module holds the data structure only; the I/O driven by it lives
//! in [`crate::session`].

use relstore_core::{
    Error, RelFileLocator, RelFileLocatorBackend, Result, REL_FILE_LOCATOR_SIZE,
};
use rustc_hash::{FxHashMap, FxHashSet};

/// Top-level transaction nesting depth.
pub const TOP_LEVEL: u32 = 1;

/// A relation file to unlink when the transaction ends one way or the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDelete {
    /// Relation to unlink
    pub rel: RelFileLocatorBackend,
    /// true: unlink at commit; false: unlink at abort
    pub at_commit: bool,
    /// Subtransaction depth that registered the entry
    pub nest_level: u32,
}

/// A relation created with WAL skipped, to be made durable at commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingSync {
    /// Truncated after creation; forces fsync over WAL-logging.
    pub is_truncated: bool,
}

/// Storage bookkeeping of one open transaction.
#[derive(Debug)]
pub struct TransactionStorage {
    nest_level: u32,
    pending_deletes: Vec<PendingDelete>,
    pending_syncs: FxHashMap<RelFileLocator, PendingSync>,
    wrote_wal: bool,
}

impl TransactionStorage {
    /// Tracker for a new top-level transaction.
    pub fn new() -> Self {
        TransactionStorage {
            nest_level: TOP_LEVEL,
            pending_deletes: Vec::new(),
            pending_syncs: FxHashMap::default(),
            wrote_wal: false,
        }
    }

    /// Current nesting depth; 1 at top level.
    pub fn nest_level(&self) -> u32 {
        self.nest_level
    }

    /// Whether the transaction has written WAL.
    pub fn wrote_wal(&self) -> bool {
        self.wrote_wal
    }

    pub(crate) fn mark_wrote_wal(&mut self) {
        self.wrote_wal = true;
    }

    /// Pending deletes in registration order.
    pub fn pending_deletes(&self) -> &[PendingDelete] {
        &self.pending_deletes
    }

    /// Number of relations whose WAL is being skipped.
    pub fn pending_sync_count(&self) -> usize {
        self.pending_syncs.len()
    }

    /// Pending sync state of `locator`, if WAL is skipped for it.
    pub fn pending_sync(&self, locator: &RelFileLocator) -> Option<PendingSync> {
        self.pending_syncs.get(locator).copied()
    }

    /// Enter a subtransaction.
    pub fn push_subxact(&mut self) {
        self.nest_level += 1;
    }

    /// Register `rel` for unlink at commit or abort of the current level.
    pub fn add_delete(&mut self, rel: RelFileLocatorBackend, at_commit: bool) {
        self.pending_deletes.push(PendingDelete {
            rel,
            at_commit,
            nest_level: self.nest_level,
        });
    }

    /// Skip WAL for `locator` until commit.
    pub fn add_sync(&mut self, locator: RelFileLocator) {
        self.pending_syncs.entry(locator).or_default();
    }

    /// Remove every pending delete of `locator` with the given timing.
    /// Returns how many entries were removed.
    pub fn preserve(&mut self, locator: &RelFileLocator, at_commit: bool) -> usize {
        let before = self.pending_deletes.len();
        self.pending_deletes
            .retain(|d| !(d.rel.locator == *locator && d.at_commit == at_commit));
        before - self.pending_deletes.len()
    }

    /// Note that `locator` is about to be truncated.
    pub fn pre_truncate(&mut self, locator: &RelFileLocator) {
        if let Some(sync) = self.pending_syncs.get_mut(locator) {
            sync.is_truncated = true;
        }
    }

    /// Whether WAL is currently skipped for `locator`.
    pub fn skipping_wal(&self, locator: &RelFileLocator) -> bool {
        self.pending_syncs.contains_key(locator)
    }

    /// Commit the current subtransaction: its entries move to the parent.
    pub fn subxact_commit(&mut self) -> Result<()> {
        if self.nest_level <= TOP_LEVEL {
            return Err(Error::InvalidOperation(
                "no subtransaction to commit".to_string(),
            ));
        }
        let level = self.nest_level;
        for d in self.pending_deletes.iter_mut().filter(|d| d.nest_level == level) {
            d.nest_level = level - 1;
        }
        self.nest_level -= 1;
        Ok(())
    }

    /// Abort the current subtransaction.
    ///
    /// Removes the level's entries and returns the relations its abort must
    /// unlink. Pending syncs of those relations are dropped too.
    pub fn subxact_abort(&mut self) -> Result<Vec<RelFileLocatorBackend>> {
        if self.nest_level <= TOP_LEVEL {
            return Err(Error::InvalidOperation(
                "no subtransaction to abort".to_string(),
            ));
        }
        let level = self.nest_level;
        let mut unlink = Vec::new();
        self.pending_deletes.retain(|d| {
            if d.nest_level < level {
                return true;
            }
            if !d.at_commit {
                unlink.push(d.rel);
            }
            false
        });
        let unlink = dedup(unlink);
        for rel in &unlink {
            self.pending_syncs.remove(&rel.locator);
        }
        self.nest_level -= 1;
        Ok(unlink)
    }

    /// Fold every open subtransaction into the top level.
    pub fn collapse_subxacts(&mut self) {
        for d in &mut self.pending_deletes {
            d.nest_level = TOP_LEVEL;
        }
        self.nest_level = TOP_LEVEL;
    }

    /// Relations to unlink if the transaction ends with `commit`, deduplicated.
    pub fn deletes_at(&self, commit: bool) -> Vec<RelFileLocatorBackend> {
        dedup(
            self.pending_deletes
                .iter()
                .filter(|d| d.at_commit == commit)
                .map(|d| d.rel)
                .collect(),
        )
    }

    /// Pending syncs to run at commit, sorted by locator.
    ///
    /// Relations scheduled for unlink at commit are left out.
    pub fn syncs_for_commit(&self) -> Vec<(RelFileLocator, PendingSync)> {
        let dropped = self.dropped_at_commit();
        let mut syncs: Vec<_> = self
            .pending_syncs
            .iter()
            .filter(|(locator, _)| !dropped.contains(locator))
            .map(|(locator, sync)| (*locator, *sync))
            .collect();
        syncs.sort_by_key(|(locator, _)| *locator);
        syncs
    }

    fn dropped_at_commit(&self) -> FxHashSet<RelFileLocator> {
        self.pending_deletes
            .iter()
            .filter(|d| d.at_commit)
            .map(|d| d.rel.locator)
            .collect()
    }

    /// Bytes needed by [`Self::serialize_for_worker`].
    pub fn estimate_worker_space(&self) -> usize {
        (self.pending_syncs.len() + 1) * REL_FILE_LOCATOR_SIZE
    }

    /// Encode the skip-WAL set for a parallel worker.
    ///
    /// Locators are written back to back and terminated by an all-zero
    /// locator. Relations scheduled for unlink at commit are omitted.
    pub fn serialize_for_worker(&self, out: &mut Vec<u8>) {
        for (locator, _) in self.syncs_for_commit() {
            out.extend_from_slice(&locator.to_bytes());
        }
        out.extend_from_slice(&RelFileLocator::invalid().to_bytes());
    }

    /// Build the two-phase record and clear both delete lists.
    ///
    /// Temp relations are dropped from the record; they die with the session.
    pub fn take_two_phase(&mut self) -> TwoPhaseStorage {
        let shared = |commit: bool| -> Vec<RelFileLocator> {
            self.deletes_at(commit)
                .into_iter()
                .filter(|rel| !rel.is_temp())
                .map(|rel| rel.locator)
                .collect()
        };
        let record = TwoPhaseStorage {
            commit_deletes: shared(true),
            abort_deletes: shared(false),
        };
        self.pending_deletes.clear();
        record
    }
}

impl Default for TransactionStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn dedup(rels: Vec<RelFileLocatorBackend>) -> Vec<RelFileLocatorBackend> {
    let mut seen = FxHashSet::default();
    rels.into_iter().filter(|rel| seen.insert(*rel)).collect()
}

/// Read-only skip-WAL set received by a parallel worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSyncSet {
    locators: FxHashSet<RelFileLocator>,
}

impl WorkerSyncSet {
    /// Decode a buffer written by [`TransactionStorage::serialize_for_worker`].
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let mut locators = FxHashSet::default();
        for chunk in buf.chunks(REL_FILE_LOCATOR_SIZE) {
            let locator = RelFileLocator::from_bytes(chunk).ok_or_else(|| {
                Error::Corruption("truncated worker sync set".to_string())
            })?;
            if locator.is_invalid() {
                return Ok(WorkerSyncSet { locators });
            }
            locators.insert(locator);
        }
        Err(Error::Corruption(
            "worker sync set is missing its terminator".to_string(),
        ))
    }

    /// Whether the leader skips WAL for `locator`.
    pub fn skipping_wal(&self, locator: &RelFileLocator) -> bool {
        self.locators.contains(locator)
    }

    /// Number of relations in the set.
    pub fn len(&self) -> usize {
        self.locators.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.locators.is_empty()
    }
}

/// Storage work deferred by a prepared transaction.
///
/// Persisted by the two-phase commit machinery and handed back to
/// `Session::finish_prepared`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TwoPhaseStorage {
    /// Unlinked by COMMIT PREPARED
    pub commit_deletes: Vec<RelFileLocator>,
    /// Unlinked by ROLLBACK PREPARED
    pub abort_deletes: Vec<RelFileLocator>,
}

impl TwoPhaseStorage {
    /// Encode: two u32 LE counts followed by the locators.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            8 + (self.commit_deletes.len() + self.abort_deletes.len()) * REL_FILE_LOCATOR_SIZE,
        );
        out.extend_from_slice(&(self.commit_deletes.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.abort_deletes.len() as u32).to_le_bytes());
        for locator in self.commit_deletes.iter().chain(&self.abort_deletes) {
            out.extend_from_slice(&locator.to_bytes());
        }
        out
    }

    /// Decode bytes produced by [`Self::to_bytes`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let corrupt = || Error::Corruption("malformed two-phase storage record".to_string());
        if buf.len() < 8 {
            return Err(corrupt());
        }
        let ncommit = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let nabort = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        let body = &buf[8..];
        if body.len() != (ncommit + nabort) * REL_FILE_LOCATOR_SIZE {
            return Err(corrupt());
        }
        let mut locators = body
            .chunks(REL_FILE_LOCATOR_SIZE)
            .map(|chunk| RelFileLocator::from_bytes(chunk).ok_or_else(corrupt))
            .collect::<Result<Vec<_>>>()?;
        let abort_deletes = locators.split_off(ncommit);
        Ok(TwoPhaseStorage {
            commit_deletes: locators,
            abort_deletes,
        })
    }

    /// Whether there is nothing to do at either outcome.
    pub fn is_empty(&self) -> bool {
        self.commit_deletes.is_empty() && self.abort_deletes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relstore_core::BackendOwner;

    fn loc(rel: u32) -> RelFileLocator {
        RelFileLocator::new(1663, 5, rel)
    }

    fn shared(rel: u32) -> RelFileLocatorBackend {
        RelFileLocatorBackend::shared(loc(rel))
    }

    #[test]
    fn test_deletes_split_by_outcome() {
        let mut xact = TransactionStorage::new();
        xact.add_delete(shared(1), false);
        xact.add_delete(shared(2), true);
        assert_eq!(xact.deletes_at(false), vec![shared(1)]);
        assert_eq!(xact.deletes_at(true), vec![shared(2)]);
    }

    #[test]
    fn test_deletes_deduplicated() {
        let mut xact = TransactionStorage::new();
        xact.add_delete(shared(7), true);
        xact.push_subxact();
        xact.add_delete(shared(7), true);
        xact.subxact_commit().unwrap();
        assert_eq!(xact.deletes_at(true), vec![shared(7)]);
    }

    #[test]
    fn test_preserve_removes_all_matches() {
        let mut xact = TransactionStorage::new();
        xact.add_delete(shared(3), true);
        xact.add_delete(shared(3), true);
        xact.add_delete(shared(3), false);
        assert_eq!(xact.preserve(&loc(3), true), 2);
        assert!(xact.deletes_at(true).is_empty());
        assert_eq!(xact.deletes_at(false), vec![shared(3)]);
        assert_eq!(xact.preserve(&loc(3), true), 0);
    }

    #[test]
    fn test_subxact_commit_promotes() {
        let mut xact = TransactionStorage::new();
        xact.push_subxact();
        xact.add_delete(shared(1), false);
        assert_eq!(xact.pending_deletes()[0].nest_level, 2);
        xact.subxact_commit().unwrap();
        assert_eq!(xact.nest_level(), 1);
        assert_eq!(xact.pending_deletes()[0].nest_level, 1);
    }

    #[test]
    fn test_subxact_abort_returns_created() {
        let mut xact = TransactionStorage::new();
        xact.add_delete(shared(1), false);
        xact.push_subxact();
        xact.add_delete(shared(2), false);
        xact.add_sync(loc(2));
        xact.add_delete(shared(1), true);

        let unlink = xact.subxact_abort().unwrap();
        assert_eq!(unlink, vec![shared(2)]);
        assert!(!xact.skipping_wal(&loc(2)));
        // The drop registered inside the aborted level is forgotten.
        assert!(xact.deletes_at(true).is_empty());
        assert_eq!(xact.deletes_at(false), vec![shared(1)]);
    }

    #[test]
    fn test_subxact_at_top_level_rejected() {
        let mut xact = TransactionStorage::new();
        assert!(xact.subxact_commit().is_err());
        assert!(xact.subxact_abort().is_err());
    }

    #[test]
    fn test_pre_truncate_marks_pending_sync() {
        let mut xact = TransactionStorage::new();
        xact.pre_truncate(&loc(1));
        assert!(xact.pending_sync(&loc(1)).is_none());
        xact.add_sync(loc(1));
        xact.pre_truncate(&loc(1));
        assert!(xact.pending_sync(&loc(1)).unwrap().is_truncated);
    }

    #[test]
    fn test_syncs_for_commit_skip_dropped() {
        let mut xact = TransactionStorage::new();
        xact.add_sync(loc(2));
        xact.add_sync(loc(1));
        xact.add_sync(loc(3));
        xact.add_delete(shared(3), true);
        let syncs: Vec<_> = xact.syncs_for_commit().into_iter().map(|(l, _)| l).collect();
        assert_eq!(syncs, vec![loc(1), loc(2)]);
    }

    #[test]
    fn test_worker_set_round_trip() {
        let mut xact = TransactionStorage::new();
        xact.add_sync(loc(10));
        xact.add_sync(loc(11));
        xact.add_delete(shared(11), true);

        let mut buf = Vec::new();
        xact.serialize_for_worker(&mut buf);
        assert!(buf.len() <= xact.estimate_worker_space());
        assert_eq!(buf.len(), 2 * REL_FILE_LOCATOR_SIZE);

        let set = WorkerSyncSet::deserialize(&buf).unwrap();
        assert!(set.skipping_wal(&loc(10)));
        assert!(!set.skipping_wal(&loc(11)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_worker_set_empty_and_malformed() {
        let xact = TransactionStorage::new();
        let mut buf = Vec::new();
        xact.serialize_for_worker(&mut buf);
        assert!(WorkerSyncSet::deserialize(&buf).unwrap().is_empty());

        let unterminated = loc(1).to_bytes();
        assert!(WorkerSyncSet::deserialize(&unterminated).is_err());
        assert!(WorkerSyncSet::deserialize(&buf[..5]).is_err());
    }

    #[test]
    fn test_two_phase_skips_temp_and_clears() {
        let mut xact = TransactionStorage::new();
        xact.add_delete(shared(1), true);
        xact.add_delete(shared(2), false);
        xact.add_delete(
            RelFileLocatorBackend::new(loc(3), BackendOwner::Temp(4)),
            false,
        );
        let record = xact.take_two_phase();
        assert_eq!(record.commit_deletes, vec![loc(1)]);
        assert_eq!(record.abort_deletes, vec![loc(2)]);
        assert!(xact.pending_deletes().is_empty());

        let decoded = TwoPhaseStorage::from_bytes(&record.to_bytes()).unwrap();
        assert_eq!(decoded, record);
        assert!(TwoPhaseStorage::from_bytes(&[1, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }
}
