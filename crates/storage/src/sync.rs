//! Pending-sync request queue
//!
//! Writers that skip the synchronous fsync of a segment register a
//! [`FileTag`] here instead; the checkpointer later drains the queue and
//! fsyncs each file once, however many times it was dirtied.
//!
//! Cancellation (by `immedsync`, `unlink`, truncation or "forget every
//! request for database X") marks entries canceled rather than removing
//! them. The flag is shared with any batch the checkpointer has already
//! absorbed, so a cancel issued while that batch is being processed is
//! still observed and the checkpointer does not fail on a file that was
//! legitimately removed.
//!
//! Re-registering a tag after the checkpointer absorbed it creates a new
//! entry in the fresh map, so a request reissued during a sync cycle is
//! never lost.

use parking_lot::Mutex;
use relstore_core::{Error, ForkNumber, Oid, RelFileLocator, Result};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::backend::BackendId;

/// Default number of distinct tags the queue holds before writers fall
/// back to fsyncing themselves.
pub const DEFAULT_SYNC_QUEUE_CAPACITY: usize = 65536;

/// Default number of fsync attempts before a failure is fatal.
pub const DEFAULT_SYNC_MAX_ATTEMPTS: u32 = 5;

/// Identity of one file needing fsync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileTag {
    /// Backend whose `sync_file` handles the tag
    pub backend: BackendId,
    /// Relation
    pub locator: RelFileLocator,
    /// Fork
    pub fork: ForkNumber,
    /// Segment number
    pub segno: u32,
}

impl std::fmt::Display for FileTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.locator, self.fork)?;
        if self.segno > 0 {
            write!(f, ".{}", self.segno)?;
        }
        Ok(())
    }
}

/// Which entries a `forget` cancels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMatcher {
    /// One segment
    Exact(FileTag),
    /// Every segment of one fork
    Fork(RelFileLocator, ForkNumber),
    /// Every fork of one relation
    Relation(RelFileLocator),
    /// Every relation of one database
    Database(Oid),
}

impl SyncMatcher {
    fn matches(&self, tag: &FileTag) -> bool {
        match self {
            SyncMatcher::Exact(t) => {
                t.locator == tag.locator && t.fork == tag.fork && t.segno == tag.segno
            }
            SyncMatcher::Fork(locator, fork) => tag.locator == *locator && tag.fork == *fork,
            SyncMatcher::Relation(locator) => tag.locator == *locator,
            SyncMatcher::Database(db) => tag.locator.db_oid == *db,
        }
    }
}

/// Performs the actual fsync of a tagged file.
pub trait SyncFileHandler {
    /// Open the file named by `tag` if needed and fsync it.
    fn sync_file(&self, tag: &FileTag) -> Result<()>;
}

#[derive(Debug)]
struct PendingFsync {
    canceled: Arc<AtomicBool>,
    cycle_ctr: u64,
    failures: u32,
}

impl PendingFsync {
    fn new(cycle_ctr: u64, failures: u32) -> Self {
        PendingFsync {
            canceled: Arc::new(AtomicBool::new(false)),
            cycle_ctr,
            failures,
        }
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

/// Requests drained by [`SyncQueue::absorb_all`].
#[derive(Debug)]
pub struct SyncBatch {
    cycle_ctr: u64,
    entries: Vec<(FileTag, PendingFsync)>,
}

impl SyncBatch {
    /// Number of absorbed requests, canceled ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was absorbed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sync cycle this batch belongs to.
    pub fn cycle(&self) -> u64 {
        self.cycle_ctr
    }

    /// Tags in the batch that are still live.
    pub fn live_tags(&self) -> Vec<FileTag> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.is_canceled())
            .map(|(t, _)| *t)
            .collect()
    }
}

/// Outcome of [`SyncQueue::process`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Files fsynced
    pub synced: usize,
    /// Canceled entries skipped
    pub skipped: usize,
    /// Failures put back on the queue for another attempt
    pub requeued: usize,
}

/// Cumulative queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncQueueStats {
    /// New entries created
    pub registered: u64,
    /// Requests merged into an existing entry
    pub coalesced: u64,
    /// Entries marked canceled
    pub canceled: u64,
    /// Entries handed to the checkpointer
    pub absorbed: u64,
    /// Successful fsyncs performed by `process`
    pub fsyncs: u64,
    /// Failed fsyncs put back on the queue
    pub retries: u64,
    /// Registrations refused because the queue was full
    pub rejected: u64,
    /// Completed absorb cycles
    pub cycles: u64,
}

struct QueueInner {
    pending: FxHashMap<FileTag, PendingFsync>,
    in_flight: FxHashMap<FileTag, Arc<AtomicBool>>,
    cycle_ctr: u64,
    stats: SyncQueueStats,
}

/// Shared pending-sync queue.
pub struct SyncQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    max_attempts: u32,
}

impl SyncQueue {
    /// Create a queue.
    pub fn new(capacity: usize, max_attempts: u32) -> Self {
        SyncQueue {
            inner: Mutex::new(QueueInner {
                pending: FxHashMap::default(),
                in_flight: FxHashMap::default(),
                cycle_ctr: 0,
                stats: SyncQueueStats::default(),
            }),
            capacity: capacity.max(1),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Queue with default limits.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_SYNC_QUEUE_CAPACITY, DEFAULT_SYNC_MAX_ATTEMPTS)
    }

    /// Register a sync request.
    ///
    /// Idempotent per tag per cycle. Returns `false` if the queue is full;
    /// the caller must then fsync the file itself.
    pub fn register(&self, tag: FileTag) -> bool {
        let mut inner = self.inner.lock();
        let cycle = inner.cycle_ctr;
        let QueueInner { pending, stats, .. } = &mut *inner;

        if let Some(entry) = pending.get_mut(&tag) {
            if entry.is_canceled() {
                // The canceled flag may be shared with an absorbed batch;
                // give the new request its own.
                *entry = PendingFsync::new(cycle, 0);
                stats.registered += 1;
            } else {
                stats.coalesced += 1;
            }
            return true;
        }

        if pending.len() >= self.capacity {
            stats.rejected += 1;
            return false;
        }

        pending.insert(tag, PendingFsync::new(cycle, 0));
        stats.registered += 1;
        true
    }

    /// Cancel every pending or in-flight request matching `matcher`.
    pub fn forget(&self, matcher: SyncMatcher) {
        let mut inner = self.inner.lock();
        let mut canceled = 0u64;
        for (tag, entry) in inner.pending.iter() {
            if matcher.matches(tag) && !entry.canceled.swap(true, Ordering::AcqRel) {
                canceled += 1;
            }
        }
        for (tag, flag) in inner.in_flight.iter() {
            if matcher.matches(tag) && !flag.swap(true, Ordering::AcqRel) {
                canceled += 1;
            }
        }
        inner.stats.canceled += canceled;
        if canceled > 0 {
            debug!(target: "relstore::sync", ?matcher, canceled, "forgot sync requests");
        }
    }

    /// Atomically drain the queue.
    pub fn absorb_all(&self) -> SyncBatch {
        let mut inner = self.inner.lock();
        inner.cycle_ctr += 1;
        let cycle = inner.cycle_ctr;
        let drained = std::mem::take(&mut inner.pending);
        let mut entries = Vec::with_capacity(drained.len());
        for (tag, entry) in drained {
            inner.in_flight.insert(tag, Arc::clone(&entry.canceled));
            entries.push((tag, entry));
        }
        inner.stats.absorbed += entries.len() as u64;
        inner.stats.cycles += 1;
        debug!(target: "relstore::sync", cycle, absorbed = entries.len(), "absorbed sync requests");
        SyncBatch {
            cycle_ctr: cycle,
            entries,
        }
    }

    /// Fsync every live entry of `batch` through `handler`.
    ///
    /// A failed fsync is put back on the queue for the next round; once an
    /// entry has failed `max_attempts` times the error is returned and
    /// must be treated as fatal by the caller. The failed entry and every
    /// live entry not yet processed stay on the queue.
    pub fn process(&self, batch: SyncBatch, handler: &dyn SyncFileHandler) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut result = Ok(());

        for (tag, entry) in &batch.entries {
            if result.is_err() {
                if !entry.is_canceled() {
                    self.restore(*tag, entry.failures);
                }
                continue;
            }
            if entry.is_canceled() {
                report.skipped += 1;
                continue;
            }

            match handler.sync_file(tag) {
                Ok(()) => {
                    report.synced += 1;
                    self.inner.lock().stats.fsyncs += 1;
                }
                // The file went away and its request was canceled meanwhile.
                Err(e) if e.is_not_found() && entry.is_canceled() => {
                    report.skipped += 1;
                }
                Err(e) => {
                    let failures = entry.failures + 1;
                    if failures >= self.max_attempts {
                        error!(
                            target: "relstore::sync",
                            %tag,
                            failures,
                            error = %e,
                            "could not fsync file, giving up"
                        );
                        self.restore(*tag, failures);
                        result = Err(e);
                    } else {
                        warn!(
                            target: "relstore::sync",
                            %tag,
                            failures,
                            error = %e,
                            "could not fsync file, will retry"
                        );
                        self.requeue(*tag, failures);
                        report.requeued += 1;
                    }
                }
            }
        }

        let mut inner = self.inner.lock();
        for (tag, entry) in &batch.entries {
            if let Some(flag) = inner.in_flight.get(tag) {
                if Arc::ptr_eq(flag, &entry.canceled) {
                    inner.in_flight.remove(tag);
                }
            }
        }
        drop(inner);

        result.map(|()| report)
    }

    fn requeue(&self, tag: FileTag, failures: u32) {
        self.inner.lock().stats.retries += 1;
        self.restore(tag, failures);
    }

    /// Put an absorbed request back, merging with a newer registration.
    fn restore(&self, tag: FileTag, failures: u32) {
        let mut inner = self.inner.lock();
        let cycle = inner.cycle_ctr;
        let QueueInner { pending, .. } = &mut *inner;
        match pending.get_mut(&tag) {
            Some(entry) if !entry.is_canceled() => {
                entry.failures = entry.failures.max(failures);
            }
            _ => {
                pending.insert(tag, PendingFsync::new(cycle, failures));
            }
        }
    }

    /// Number of live entries waiting to be absorbed.
    pub fn pending_len(&self) -> usize {
        self.inner
            .lock()
            .pending
            .values()
            .filter(|e| !e.is_canceled())
            .count()
    }

    /// Whether a live request for `tag` is waiting.
    pub fn is_pending(&self, tag: &FileTag) -> bool {
        self.inner
            .lock()
            .pending
            .get(tag)
            .map(|e| !e.is_canceled())
            .unwrap_or(false)
    }

    /// Whether any live request matches `matcher`.
    pub fn has_pending(&self, matcher: SyncMatcher) -> bool {
        self.inner
            .lock()
            .pending
            .iter()
            .any(|(tag, e)| matcher.matches(tag) && !e.is_canceled())
    }

    /// Current sync cycle.
    pub fn cycle(&self) -> u64 {
        self.inner.lock().cycle_ctr
    }

    /// Cycle at which a pending `tag` was (re)registered.
    pub fn registered_cycle(&self, tag: &FileTag) -> Option<u64> {
        self.inner.lock().pending.get(tag).map(|e| e.cycle_ctr)
    }

    /// Snapshot of the statistics.
    pub fn stats(&self) -> SyncQueueStats {
        self.inner.lock().stats.clone()
    }

    /// Configured attempt bound.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("pending", &self.pending_len())
            .field("capacity", &self.capacity)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

/// Build the error reported when the fsync of a tag keeps failing.
pub fn sync_failed(tag: &FileTag, source: std::io::Error) -> Error {
    Error::io(relstore_core::IoOp::Fsync, tag.to_string(), source)
}
