//! Cached relation handles.

use relstore_core::{BlockNumber, ForkNumber, RelFileLocatorBackend, FORK_COUNT, INVALID_BLOCK_NUMBER};
use std::sync::Arc;

use crate::backend::{BackendId, BackendState, StorageBackend};

/// Opaque reference to a cache entry.
///
/// A handle stays valid until its entry is removed (close_all, unlink,
/// end of transaction for transient entries). Using it afterwards yields
/// [`relstore_core::Error::StaleHandle`], even if the same relation has
/// been reopened since.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmgrHandle {
    pub(crate) key: RelFileLocatorBackend,
    pub(crate) generation: u64,
}

impl SmgrHandle {
    /// Relation the handle refers to.
    pub fn rel(&self) -> RelFileLocatorBackend {
        self.key
    }

    /// Generation of the cache entry the handle was issued for.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Durability request made for a fork in the current transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncIntent {
    /// Nothing requested
    #[default]
    None,
    /// Fsync deferred to the checkpointer
    Registered,
    /// Fsynced synchronously
    Immediate,
}

/// One entry of the relation cache.
pub struct SmgrRelation {
    pub(crate) rel: RelFileLocatorBackend,
    pub(crate) backend_id: BackendId,
    pub(crate) backend: Arc<dyn StorageBackend>,
    pub(crate) generation: u64,
    pub(crate) cached_nblocks: [BlockNumber; FORK_COUNT],
    pub(crate) sync_intent: [SyncIntent; FORK_COUNT],
    pub(crate) target_block: BlockNumber,
    pub(crate) transient: bool,
    pub(crate) state: BackendState,
}

impl SmgrRelation {
    pub(crate) fn new(
        rel: RelFileLocatorBackend,
        backend_id: BackendId,
        backend: Arc<dyn StorageBackend>,
        generation: u64,
        state: BackendState,
        transient: bool,
    ) -> Self {
        SmgrRelation {
            rel,
            backend_id,
            backend,
            generation,
            cached_nblocks: [INVALID_BLOCK_NUMBER; FORK_COUNT],
            sync_intent: [SyncIntent::None; FORK_COUNT],
            target_block: INVALID_BLOCK_NUMBER,
            transient,
            state,
        }
    }

    pub(crate) fn handle(&self) -> SmgrHandle {
        SmgrHandle {
            key: self.rel,
            generation: self.generation,
        }
    }

    pub(crate) fn cached(&self, fork: ForkNumber) -> Option<BlockNumber> {
        match self.cached_nblocks[fork.index()] {
            INVALID_BLOCK_NUMBER => None,
            n => Some(n),
        }
    }

    pub(crate) fn set_cached(&mut self, fork: ForkNumber, nblocks: BlockNumber) {
        self.cached_nblocks[fork.index()] = nblocks;
    }

    pub(crate) fn invalidate(&mut self, fork: ForkNumber) {
        self.cached_nblocks[fork.index()] = INVALID_BLOCK_NUMBER;
    }

    pub(crate) fn invalidate_all(&mut self) {
        self.cached_nblocks = [INVALID_BLOCK_NUMBER; FORK_COUNT];
    }

    /// Close every fork in the backend.
    pub(crate) fn close_forks(&mut self) {
        for fork in ForkNumber::ALL {
            self.backend.close(&mut self.state, fork);
        }
        self.invalidate_all();
    }
}

impl std::fmt::Debug for SmgrRelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmgrRelation")
            .field("rel", &self.rel)
            .field("backend", &self.backend.name())
            .field("generation", &self.generation)
            .field("cached_nblocks", &self.cached_nblocks)
            .field("transient", &self.transient)
            .finish()
    }
}
