//! SMGR relation cache and dispatch
//!
//! [`Smgr`] is the process-local entry point for every storage request. It
//! maps `(locator, owner)` to a cached [`SmgrRelation`], routes each call to
//! the backend the entry was opened with, and keeps the per-fork block-count
//! cache consistent with what the calls do to the files.
//!
//! The cached block count is trusted without asking the backend only during
//! recovery, when no other session can change the files underneath us.

mod registry;
mod relation;

pub use registry::BackendRegistry;
pub use relation::{SmgrHandle, SmgrRelation, SyncIntent};

use relstore_core::{
    BlockNumber, Error, ForkNumber, Oid, RelFileLocator, RelFileLocatorBackend, Result,
    INVALID_BLOCK_NUMBER,
};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::BackendId;
use crate::sync::SyncMatcher;

/// Upcall into the buffer pool made before files shrink or disappear.
pub trait BufferInvalidator: Send + Sync {
    /// Drop buffered pages of `forks` at or above the matching `first_blocks`.
    fn drop_relation_buffers(
        &self,
        _rel: &RelFileLocatorBackend,
        _forks: &[ForkNumber],
        _first_blocks: &[BlockNumber],
    ) {
    }

    /// Drop every buffered page of the given relations.
    fn drop_relations_all_buffers(&self, _rels: &[RelFileLocatorBackend]) {}
}

/// Invalidator for configurations without a buffer pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBufferPool;

impl BufferInvalidator for NoBufferPool {}

/// Cumulative dispatch counters.
///
/// Accumulated over the lifetime of the [`Smgr`] and never reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmgrCounters {
    /// Cache entries created
    pub opens: u64,
    /// Blocks read
    pub reads: u64,
    /// Blocks written
    pub writes: u64,
    /// Blocks added by extend / zeroextend
    pub extends: u64,
    /// Fork truncations performed
    pub truncates: u64,
    /// Relations unlinked
    pub unlinks: u64,
    /// immedsync calls
    pub immedsyncs: u64,
    /// registersync calls
    pub registersyncs: u64,
    /// nblocks answered from the cache
    pub nblocks_cache_hits: u64,
}

/// Process-local relation cache and dispatcher.
pub struct Smgr {
    registry: Arc<BackendRegistry>,
    invalidator: Arc<dyn BufferInvalidator>,
    relations: FxHashMap<RelFileLocatorBackend, SmgrRelation>,
    next_generation: u64,
    in_recovery: bool,
    counters: SmgrCounters,
}

impl Smgr {
    /// Create an empty cache over `registry`.
    pub fn new(registry: Arc<BackendRegistry>, invalidator: Arc<dyn BufferInvalidator>) -> Self {
        Smgr {
            registry,
            invalidator,
            relations: FxHashMap::default(),
            next_generation: 1,
            in_recovery: false,
            counters: SmgrCounters::default(),
        }
    }

    /// Backend registry.
    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    /// Switch recovery mode on or off.
    pub fn set_in_recovery(&mut self, in_recovery: bool) {
        self.in_recovery = in_recovery;
    }

    /// Whether recovery mode is on.
    pub fn in_recovery(&self) -> bool {
        self.in_recovery
    }

    /// Snapshot of the counters.
    pub fn counters(&self) -> SmgrCounters {
        self.counters.clone()
    }

    fn entry(
        relations: &mut FxHashMap<RelFileLocatorBackend, SmgrRelation>,
        h: SmgrHandle,
    ) -> Result<&mut SmgrRelation> {
        match relations.get_mut(&h.key) {
            Some(entry) if entry.generation == h.generation => Ok(entry),
            _ => Err(Error::StaleHandle(h.key.to_string())),
        }
    }

    fn open_entry(&mut self, rel: RelFileLocatorBackend, transient: bool) -> Result<SmgrHandle> {
        if let Some(entry) = self.relations.get_mut(&rel) {
            if !transient {
                entry.transient = false;
            }
            return Ok(entry.handle());
        }

        let (backend_id, backend) = self.registry.active()?;
        let state = backend.open(rel)?;
        self.registry.mark_opened();
        let generation = self.next_generation;
        self.next_generation += 1;
        let entry = SmgrRelation::new(rel, backend_id, backend, generation, state, transient);
        let handle = entry.handle();
        self.relations.insert(rel, entry);
        self.counters.opens += 1;
        debug!(target: "relstore::smgr", %rel, backend = backend_id, generation, "opened relation");
        Ok(handle)
    }

    /// Look up or create the cache entry for `rel`.
    pub fn open(&mut self, rel: RelFileLocatorBackend) -> Result<SmgrHandle> {
        self.open_entry(rel, false)
    }

    /// Like [`Smgr::open`], but a newly created entry is dropped at the end
    /// of the current transaction.
    pub fn open_transient(&mut self, rel: RelFileLocatorBackend) -> Result<SmgrHandle> {
        self.open_entry(rel, true)
    }

    /// Current handle for `rel`, if it is cached.
    pub fn lookup(&self, rel: &RelFileLocatorBackend) -> Option<SmgrHandle> {
        self.relations.get(rel).map(|e| e.handle())
    }

    /// Whether `rel.locator` is cached under an owner other than `rel.owner`.
    pub fn open_under_other_owner(&self, rel: &RelFileLocatorBackend) -> bool {
        self.relations
            .keys()
            .any(|k| k.locator == rel.locator && k.owner != rel.owner)
    }

    /// Whether `h` still refers to a live entry.
    pub fn is_valid(&self, h: SmgrHandle) -> bool {
        self.relations
            .get(&h.key)
            .map(|e| e.generation == h.generation)
            .unwrap_or(false)
    }

    /// Backend id the handle's relation is bound to.
    pub fn backend_id(&mut self, h: SmgrHandle) -> Result<BackendId> {
        Ok(Self::entry(&mut self.relations, h)?.backend_id)
    }

    /// Release the fork's backend resources; the handle stays valid.
    pub fn close(&mut self, h: SmgrHandle, fork: ForkNumber) -> Result<()> {
        let entry = Self::entry(&mut self.relations, h)?;
        entry.backend.close(&mut entry.state, fork);
        entry.invalidate(fork);
        Ok(())
    }

    /// Release the handle and its cache entry.
    pub fn close_all(&mut self, h: SmgrHandle) -> Result<()> {
        Self::entry(&mut self.relations, h)?;
        self.forget_relation(&h.key);
        Ok(())
    }

    /// Drop the cache entry of `rel`, if any. Outstanding handles go stale.
    pub fn forget_relation(&mut self, rel: &RelFileLocatorBackend) {
        if let Some(mut entry) = self.relations.remove(rel) {
            entry.close_forks();
            debug!(target: "relstore::smgr", %rel, "closed relation");
        }
    }

    /// Drop every cache entry of a locator, whatever its owner.
    pub fn forget_locator(&mut self, locator: &RelFileLocator) {
        let keys: Vec<_> = self
            .relations
            .keys()
            .filter(|k| k.locator == *locator)
            .copied()
            .collect();
        for key in keys {
            self.forget_relation(&key);
        }
    }

    /// Close every cached relation of a database, then let each backend
    /// remove the database's files and metadata.
    pub fn drop_database(&mut self, db_oid: Oid) -> Result<()> {
        let keys: Vec<_> = self
            .relations
            .keys()
            .filter(|k| k.locator.db_oid == db_oid)
            .copied()
            .collect();
        for key in keys {
            self.forget_relation(&key);
        }
        self.registry.drop_database(db_oid)?;
        debug!(target: "relstore::smgr", db_oid, "dropped database storage");
        Ok(())
    }

    /// Drop every cache entry (process exit).
    pub fn release_all(&mut self) {
        for (_, mut entry) in self.relations.drain() {
            entry.close_forks();
        }
    }

    /// End-of-transaction cleanup: drop transient entries and forget the
    /// durability requests of the finished transaction.
    pub fn at_eoxact(&mut self) {
        let transient: Vec<_> = self
            .relations
            .values()
            .filter(|e| e.transient)
            .map(|e| e.rel)
            .collect();
        for rel in transient {
            self.forget_relation(&rel);
        }
        for entry in self.relations.values_mut() {
            entry.sync_intent = Default::default();
        }
    }

    /// Create a fork's storage.
    ///
    /// In redo mode an existing file is reused and the cached sizes of the
    /// relation are discarded.
    pub fn create(&mut self, h: SmgrHandle, fork: ForkNumber, is_redo: bool) -> Result<()> {
        let entry = Self::entry(&mut self.relations, h)?;
        if is_redo {
            entry.invalidate_all();
        } else {
            entry.invalidate(fork);
        }
        entry.backend.create(&mut entry.state, fork, is_redo)
    }

    /// Whether the fork exists on disk.
    pub fn exists(&mut self, h: SmgrHandle, fork: ForkNumber) -> Result<bool> {
        let entry = Self::entry(&mut self.relations, h)?;
        entry.backend.exists(&mut entry.state, fork)
    }

    /// Remove every fork of every relation in `rels`.
    ///
    /// Buffered pages are invalidated first and the cache entries are
    /// dropped. Forks that do not exist are skipped. Returns the number of
    /// forks removed.
    pub fn unlink_all(&mut self, rels: &[RelFileLocatorBackend], is_redo: bool) -> Result<usize> {
        if rels.is_empty() {
            return Ok(0);
        }
        self.invalidator.drop_relations_all_buffers(rels);

        let mut removed = 0;
        for rel in rels {
            let backend = match self.relations.remove(rel) {
                Some(mut entry) => {
                    entry.close_forks();
                    entry.backend
                }
                None => self.registry.active()?.1,
            };

            for fork in ForkNumber::ALL {
                match backend.unlink(*rel, fork, is_redo) {
                    Ok(()) => removed += 1,
                    Err(e) if e.is_not_found() => {
                        if fork == ForkNumber::Main && !is_redo {
                            warn!(target: "relstore::smgr", %rel, "relation file already removed");
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            self.counters.unlinks += 1;
            debug!(target: "relstore::smgr", %rel, is_redo, "unlinked relation");
        }
        Ok(removed)
    }

    /// Add one block. Keeps the cached size if it was exact.
    pub fn extend(
        &mut self,
        h: SmgrHandle,
        fork: ForkNumber,
        blkno: BlockNumber,
        buffer: &[u8],
        skip_fsync: bool,
    ) -> Result<()> {
        let entry = Self::entry(&mut self.relations, h)?;
        entry
            .backend
            .extend(&mut entry.state, fork, blkno, buffer, skip_fsync)?;
        if entry.cached(fork) == Some(blkno) {
            entry.set_cached(fork, blkno + 1);
        } else {
            entry.invalidate(fork);
        }
        self.counters.extends += 1;
        Ok(())
    }

    /// Add `nblocks` zero blocks at `blkno`.
    pub fn zeroextend(
        &mut self,
        h: SmgrHandle,
        fork: ForkNumber,
        blkno: BlockNumber,
        nblocks: u32,
        skip_fsync: bool,
    ) -> Result<()> {
        let entry = Self::entry(&mut self.relations, h)?;
        entry
            .backend
            .zeroextend(&mut entry.state, fork, blkno, nblocks, skip_fsync)?;
        if entry.cached(fork) == Some(blkno) {
            entry.set_cached(fork, blkno + nblocks);
        } else {
            entry.invalidate(fork);
        }
        self.counters.extends += nblocks as u64;
        Ok(())
    }

    /// Prefetch hint; returns whether the blocks exist.
    pub fn prefetch(
        &mut self,
        h: SmgrHandle,
        fork: ForkNumber,
        blkno: BlockNumber,
        nblocks: u32,
    ) -> Result<bool> {
        let entry = Self::entry(&mut self.relations, h)?;
        entry.backend.prefetch(&mut entry.state, fork, blkno, nblocks)
    }

    /// Read contiguous blocks.
    pub fn readv(
        &mut self,
        h: SmgrHandle,
        fork: ForkNumber,
        blkno: BlockNumber,
        buffers: &mut [&mut [u8]],
    ) -> Result<()> {
        let entry = Self::entry(&mut self.relations, h)?;
        entry.backend.readv(&mut entry.state, fork, blkno, buffers)?;
        self.counters.reads += buffers.len() as u64;
        Ok(())
    }

    /// Read one block.
    pub fn read(
        &mut self,
        h: SmgrHandle,
        fork: ForkNumber,
        blkno: BlockNumber,
        buffer: &mut [u8],
    ) -> Result<()> {
        self.readv(h, fork, blkno, &mut [buffer])
    }

    /// Write contiguous blocks.
    pub fn writev(
        &mut self,
        h: SmgrHandle,
        fork: ForkNumber,
        blkno: BlockNumber,
        buffers: &[&[u8]],
        skip_fsync: bool,
    ) -> Result<()> {
        let entry = Self::entry(&mut self.relations, h)?;
        entry
            .backend
            .writev(&mut entry.state, fork, blkno, buffers, skip_fsync)?;
        let end = blkno + buffers.len() as BlockNumber;
        if let Some(cached) = entry.cached(fork) {
            if end > cached {
                entry.set_cached(fork, end);
            }
        }
        self.counters.writes += buffers.len() as u64;
        Ok(())
    }

    /// Write one block.
    pub fn write(
        &mut self,
        h: SmgrHandle,
        fork: ForkNumber,
        blkno: BlockNumber,
        buffer: &[u8],
        skip_fsync: bool,
    ) -> Result<()> {
        self.writev(h, fork, blkno, &[buffer], skip_fsync)
    }

    /// Writeback hint.
    pub fn writeback(
        &mut self,
        h: SmgrHandle,
        fork: ForkNumber,
        blkno: BlockNumber,
        nblocks: u32,
    ) -> Result<()> {
        let entry = Self::entry(&mut self.relations, h)?;
        entry.backend.writeback(&mut entry.state, fork, blkno, nblocks)
    }

    /// Block count of a fork.
    pub fn nblocks(&mut self, h: SmgrHandle, fork: ForkNumber) -> Result<BlockNumber> {
        let in_recovery = self.in_recovery;
        let entry = Self::entry(&mut self.relations, h)?;
        if in_recovery {
            if let Some(n) = entry.cached(fork) {
                self.counters.nblocks_cache_hits += 1;
                return Ok(n);
            }
        }
        let n = entry.backend.nblocks(&mut entry.state, fork)?;
        entry.set_cached(fork, n);
        Ok(n)
    }

    /// Cached block count, if known.
    pub fn nblocks_cached(&mut self, h: SmgrHandle, fork: ForkNumber) -> Result<Option<BlockNumber>> {
        Ok(Self::entry(&mut self.relations, h)?.cached(fork))
    }

    /// Truncate `forks[i]` to `nblocks[i]` blocks.
    ///
    /// Buffered pages past the new ends are dropped first. A target beyond
    /// the current end is an error, except during recovery where it is
    /// skipped.
    pub fn truncate(
        &mut self,
        h: SmgrHandle,
        forks: &[ForkNumber],
        nblocks: &[BlockNumber],
    ) -> Result<()> {
        if forks.len() != nblocks.len() {
            return Err(Error::InvalidOperation(format!(
                "truncate given {} forks but {} block counts",
                forks.len(),
                nblocks.len()
            )));
        }
        let in_recovery = self.in_recovery;
        Self::entry(&mut self.relations, h)?;
        self.invalidator.drop_relation_buffers(&h.key, forks, nblocks);

        let entry = Self::entry(&mut self.relations, h)?;
        for (&fork, &target) in forks.iter().zip(nblocks) {
            entry.invalidate(fork);
            let old = entry.backend.nblocks(&mut entry.state, fork)?;
            if target > old {
                if in_recovery {
                    debug!(target: "relstore::smgr", rel = %h.key, %fork, old, target, "fork already shorter than truncate target");
                    entry.set_cached(fork, old);
                    continue;
                }
                return Err(Error::InvalidOperation(format!(
                    "cannot truncate {} fork {} to {} blocks: it's only {} blocks now",
                    h.key, fork, target, old
                )));
            }
            if target < old {
                entry
                    .backend
                    .truncate(&mut entry.state, fork, old, target)?;
                self.counters.truncates += 1;
            }
            entry.set_cached(fork, target);
        }
        Ok(())
    }

    /// Fsync a fork now. Supersedes an earlier registersync of the same
    /// fork in this transaction.
    pub fn immedsync(&mut self, h: SmgrHandle, fork: ForkNumber) -> Result<()> {
        let entry = Self::entry(&mut self.relations, h)?;
        entry.backend.immedsync(&mut entry.state, fork)?;
        if entry.sync_intent[fork.index()] == SyncIntent::Registered && !entry.rel.is_temp() {
            self.registry
                .md()
                .queue()
                .forget(SyncMatcher::Fork(entry.rel.locator, fork));
        }
        entry.sync_intent[fork.index()] = SyncIntent::Immediate;
        self.counters.immedsyncs += 1;
        Ok(())
    }

    /// Leave the fsync of a fork to the next checkpoint.
    pub fn registersync(&mut self, h: SmgrHandle, fork: ForkNumber) -> Result<()> {
        let entry = Self::entry(&mut self.relations, h)?;
        entry.backend.registersync(&mut entry.state, fork)?;
        entry.sync_intent[fork.index()] = SyncIntent::Registered;
        self.counters.registersyncs += 1;
        Ok(())
    }

    /// Durability request recorded for a fork in this transaction.
    pub fn sync_intent(&mut self, h: SmgrHandle, fork: ForkNumber) -> Result<SyncIntent> {
        Ok(Self::entry(&mut self.relations, h)?.sync_intent[fork.index()])
    }

    /// Bulk-write insertion hint.
    pub fn target_block(&mut self, h: SmgrHandle) -> Result<Option<BlockNumber>> {
        let entry = Self::entry(&mut self.relations, h)?;
        Ok(match entry.target_block {
            INVALID_BLOCK_NUMBER => None,
            n => Some(n),
        })
    }

    /// Set the bulk-write insertion hint.
    pub fn set_target_block(&mut self, h: SmgrHandle, blkno: Option<BlockNumber>) -> Result<()> {
        Self::entry(&mut self.relations, h)?.target_block = blkno.unwrap_or(INVALID_BLOCK_NUMBER);
        Ok(())
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.relations.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

impl Drop for Smgr {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl std::fmt::Debug for Smgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Smgr")
            .field("relations", &self.relations.len())
            .field("in_recovery", &self.in_recovery)
            .field("counters", &self.counters)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::md::MdBackend;
    use crate::sync::SyncQueue;
    use parking_lot::Mutex;
    use relstore_core::{BackendOwner, BLOCK_BYTES};
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, Smgr) {
        let dir = tempdir().unwrap();
        let md = Arc::new(MdBackend::new(dir.path(), 4, Arc::new(SyncQueue::with_defaults())));
        let smgr = Smgr::new(Arc::new(BackendRegistry::new(md)), Arc::new(NoBufferPool));
        (dir, smgr)
    }

    fn rel(n: u32) -> RelFileLocatorBackend {
        RelFileLocatorBackend::shared(RelFileLocator::new(1663, 5, n))
    }

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; BLOCK_BYTES]
    }

    #[test]
    fn test_one_entry_per_key() {
        let (_dir, mut smgr) = setup();
        let a = smgr.open(rel(16384)).unwrap();
        let b = smgr.open(rel(16384)).unwrap();
        assert_eq!(a, b);
        assert_eq!(smgr.len(), 1);
        assert_eq!(smgr.counters().opens, 1);
    }

    #[test]
    fn test_stale_handle_after_close_all() {
        let (_dir, mut smgr) = setup();
        let h = smgr.open(rel(16384)).unwrap();
        smgr.close_all(h).unwrap();
        let h2 = smgr.open(rel(16384)).unwrap();
        assert_ne!(h.generation(), h2.generation());
        assert!(matches!(
            smgr.nblocks(h, ForkNumber::Main),
            Err(Error::StaleHandle(_))
        ));
    }

    #[test]
    fn test_transient_entries_dropped_at_eoxact() {
        let (_dir, mut smgr) = setup();
        let t = smgr.open_transient(rel(1)).unwrap();
        let p = smgr.open(rel(2)).unwrap();
        smgr.at_eoxact();
        assert!(!smgr.is_valid(t));
        assert!(smgr.is_valid(p));
    }

    #[test]
    fn test_nblocks_cache_tracks_extend() {
        let (_dir, mut smgr) = setup();
        let h = smgr.open(rel(16384)).unwrap();
        smgr.create(h, ForkNumber::Main, false).unwrap();
        assert_eq!(smgr.nblocks(h, ForkNumber::Main).unwrap(), 0);
        smgr.extend(h, ForkNumber::Main, 0, &page(1), true).unwrap();
        assert_eq!(smgr.nblocks_cached(h, ForkNumber::Main).unwrap(), Some(1));
        // Non-contiguous extend leaves the cache unknown.
        smgr.extend(h, ForkNumber::Main, 5, &page(1), true).unwrap();
        assert_eq!(smgr.nblocks_cached(h, ForkNumber::Main).unwrap(), None);
        assert_eq!(smgr.nblocks(h, ForkNumber::Main).unwrap(), 6);
        smgr.writev(h, ForkNumber::Main, 6, &[page(2).as_slice(), page(3).as_slice()], true).unwrap();
        assert_eq!(smgr.nblocks_cached(h, ForkNumber::Main).unwrap(), Some(8));
    }

    #[test]
    fn test_recovery_uses_cache() {
        let (_dir, mut smgr) = setup();
        let h = smgr.open(rel(16384)).unwrap();
        smgr.create(h, ForkNumber::Main, false).unwrap();
        smgr.set_in_recovery(true);
        smgr.nblocks(h, ForkNumber::Main).unwrap();
        smgr.nblocks(h, ForkNumber::Main).unwrap();
        assert_eq!(smgr.counters().nblocks_cache_hits, 1);
    }

    #[test]
    fn test_truncate_sets_cache_and_rejects_growth() {
        let (_dir, mut smgr) = setup();
        let h = smgr.open(rel(16384)).unwrap();
        smgr.create(h, ForkNumber::Main, false).unwrap();
        smgr.zeroextend(h, ForkNumber::Main, 0, 6, true).unwrap();
        smgr.truncate(h, &[ForkNumber::Main], &[2]).unwrap();
        assert_eq!(smgr.nblocks_cached(h, ForkNumber::Main).unwrap(), Some(2));
        assert!(smgr.truncate(h, &[ForkNumber::Main], &[9]).is_err());

        smgr.set_in_recovery(true);
        smgr.truncate(h, &[ForkNumber::Main], &[9]).unwrap();
        assert_eq!(smgr.nblocks(h, ForkNumber::Main).unwrap(), 2);
    }

    #[derive(Default)]
    struct RecordingInvalidator {
        calls: Mutex<Vec<String>>,
    }

    impl BufferInvalidator for RecordingInvalidator {
        fn drop_relation_buffers(
            &self,
            rel: &RelFileLocatorBackend,
            forks: &[ForkNumber],
            first_blocks: &[BlockNumber],
        ) {
            self.calls
                .lock()
                .push(format!("truncate {} {:?} {:?}", rel, forks, first_blocks));
        }

        fn drop_relations_all_buffers(&self, rels: &[RelFileLocatorBackend]) {
            self.calls.lock().push(format!("drop {}", rels.len()));
        }
    }

    #[test]
    fn test_invalidator_called_before_truncate_and_unlink() {
        let dir = tempdir().unwrap();
        let md = Arc::new(MdBackend::new(dir.path(), 4, Arc::new(SyncQueue::with_defaults())));
        let inval = Arc::new(RecordingInvalidator::default());
        let mut smgr = Smgr::new(Arc::new(BackendRegistry::new(md)), inval.clone());
        let h = smgr.open(rel(16384)).unwrap();
        smgr.create(h, ForkNumber::Main, false).unwrap();
        smgr.zeroextend(h, ForkNumber::Main, 0, 3, true).unwrap();
        smgr.truncate(h, &[ForkNumber::Main], &[1]).unwrap();
        smgr.unlink_all(&[rel(16384)], false).unwrap();

        let calls = inval.calls.lock().clone();
        assert_eq!(calls, vec!["truncate 1663/5/16384 [Main] [1]".to_string(), "drop 1".to_string()]);
    }

    #[test]
    fn test_unlink_all_tolerates_missing() {
        let (dir, mut smgr) = setup();
        let h = smgr.open(rel(16384)).unwrap();
        smgr.create(h, ForkNumber::Main, false).unwrap();
        smgr.create(h, ForkNumber::Fsm, false).unwrap();
        assert_eq!(smgr.unlink_all(&[rel(16384)], false).unwrap(), 2);
        assert!(!smgr.is_valid(h));
        assert!(!dir.path().join("1663/5/16384").exists());
        assert_eq!(smgr.unlink_all(&[rel(16384)], false).unwrap(), 0);
        assert_eq!(smgr.counters().unlinks, 2);
    }

    #[test]
    fn test_immedsync_supersedes_registersync() {
        let (_dir, mut smgr) = setup();
        let h = smgr.open(rel(16384)).unwrap();
        smgr.create(h, ForkNumber::Main, false).unwrap();
        smgr.zeroextend(h, ForkNumber::Main, 0, 2, true).unwrap();
        smgr.registersync(h, ForkNumber::Main).unwrap();
        let queue = smgr.registry().md().queue().clone();
        assert_eq!(queue.pending_len(), 1);

        smgr.immedsync(h, ForkNumber::Main).unwrap();
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(smgr.sync_intent(h, ForkNumber::Main).unwrap(), SyncIntent::Immediate);
        smgr.at_eoxact();
        assert_eq!(smgr.sync_intent(h, ForkNumber::Main).unwrap(), SyncIntent::None);
    }

    #[test]
    fn test_other_owner_detected() {
        let (_dir, mut smgr) = setup();
        smgr.open(rel(16384)).unwrap();
        let temp = RelFileLocatorBackend::new(rel(16384).locator, BackendOwner::Temp(2));
        assert!(smgr.open_under_other_owner(&temp));
        assert!(!smgr.open_under_other_owner(&rel(16384)));
    }

    #[test]
    fn test_handle_binds_backend() {
        let (dir, mut smgr) = setup();
        let h = smgr.open(rel(16384)).unwrap();
        assert_eq!(smgr.backend_id(h).unwrap(), 0);
        let extra = Arc::new(MdBackend::new(dir.path(), 4, Arc::new(SyncQueue::with_defaults())));
        // Relations are already open; the table is frozen.
        assert!(smgr.registry().install_shim(extra).is_err());
        assert_eq!(smgr.backend_id(h).unwrap(), 0);
    }
}
