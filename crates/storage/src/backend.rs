//! Storage backend trait definitions.
//!
//! Every relation handle is bound to one backend for its whole lifetime.
//! A backend owns an opaque per-handle state created by [`StorageBackend::open`];
//! the dispatch layer stores it in the handle and passes it back on every
//! call. Wrapper backends (see `tde`) embed the state of the backend they
//! delegate to as the first field of their own state.

use relstore_core::{
    BlockNumber, Error, ForkNumber, Oid, RelFileLocatorBackend, Result, BLOCK_BYTES,
};
use std::any::Any;

use crate::sync::FileTag;

/// Small integer id assigned at registration.
pub type BackendId = u8;

/// Id of the magnetic-disk backend, which always takes slot zero.
pub const MD_BACKEND_ID: BackendId = 0;

/// Opaque per-handle backend state.
pub type BackendState = Box<dyn Any + Send>;

/// Storage backend trait.
///
/// All block-addressed operations take the handle's backend state. The
/// dispatch layer guarantees that the state passed in was produced by the
/// same backend's `open`.
///
/// # Thread Safety
///
/// Backends are shared by every session of a cluster and must be
/// `Send + Sync`; the per-handle state is owned by one session.
pub trait StorageBackend: Send + Sync {
    /// Backend name, used in logs and by the registry.
    fn name(&self) -> &str;

    /// Initialize state for a newly created handle.
    fn open(&self, rel: RelFileLocatorBackend) -> Result<BackendState>;

    /// Release per-fork resources; the handle stays usable.
    fn close(&self, state: &mut BackendState, fork: ForkNumber);

    /// Create the fork's first segment.
    fn create(&self, state: &mut BackendState, fork: ForkNumber, is_redo: bool) -> Result<()>;

    /// Whether the fork's first segment exists.
    fn exists(&self, state: &mut BackendState, fork: ForkNumber) -> Result<bool>;

    /// Remove every segment of the fork.
    fn unlink(&self, rel: RelFileLocatorBackend, fork: ForkNumber, is_redo: bool) -> Result<()>;

    /// Add one block at `blkno`, zero-filling any gap before it.
    fn extend(
        &self,
        state: &mut BackendState,
        fork: ForkNumber,
        blkno: BlockNumber,
        buffer: &[u8],
        skip_fsync: bool,
    ) -> Result<()>;

    /// Add `nblocks` zero blocks starting at `blkno`.
    fn zeroextend(
        &self,
        state: &mut BackendState,
        fork: ForkNumber,
        blkno: BlockNumber,
        nblocks: u32,
        skip_fsync: bool,
    ) -> Result<()>;

    /// Hint that blocks will be read soon. Returns whether they exist.
    fn prefetch(
        &self,
        state: &mut BackendState,
        fork: ForkNumber,
        blkno: BlockNumber,
        nblocks: u32,
    ) -> Result<bool>;

    /// Read contiguous blocks; blocks past EOF read as zeros.
    fn readv(
        &self,
        state: &mut BackendState,
        fork: ForkNumber,
        blkno: BlockNumber,
        buffers: &mut [&mut [u8]],
    ) -> Result<()>;

    /// Write contiguous blocks.
    fn writev(
        &self,
        state: &mut BackendState,
        fork: ForkNumber,
        blkno: BlockNumber,
        buffers: &[&[u8]],
        skip_fsync: bool,
    ) -> Result<()>;

    /// Advisory hint to start writing back dirty data.
    fn writeback(
        &self,
        state: &mut BackendState,
        fork: ForkNumber,
        blkno: BlockNumber,
        nblocks: u32,
    ) -> Result<()>;

    /// Current block count of the fork.
    fn nblocks(&self, state: &mut BackendState, fork: ForkNumber) -> Result<BlockNumber>;

    /// Shrink the fork from `old_nblocks` to `nblocks`.
    fn truncate(
        &self,
        state: &mut BackendState,
        fork: ForkNumber,
        old_nblocks: BlockNumber,
        nblocks: BlockNumber,
    ) -> Result<()>;

    /// Fsync every segment of the fork now.
    fn immedsync(&self, state: &mut BackendState, fork: ForkNumber) -> Result<()>;

    /// Ask the checkpointer to fsync the fork.
    fn registersync(&self, state: &mut BackendState, fork: ForkNumber) -> Result<()>;

    /// Fsync the file named by a pending-sync tag.
    fn sync_file(&self, tag: &FileTag) -> Result<()>;

    /// Release backend-private metadata of a dropped database.
    fn drop_database(&self, _db_oid: Oid) -> Result<()> {
        Ok(())
    }
}

/// Downcast a handle's state to the concrete type of `backend`.
pub fn state_mut<'a, T: 'static>(state: &'a mut BackendState, backend: &str) -> Result<&'a mut T> {
    state.downcast_mut::<T>().ok_or_else(|| {
        Error::InvalidOperation(format!(
            "relation state does not belong to backend \"{}\"",
            backend
        ))
    })
}

/// Reject buffers that are not exactly one block.
pub fn check_block_buffer(len: usize) -> Result<()> {
    if len != BLOCK_BYTES {
        return Err(Error::InvalidOperation(format!(
            "buffer of {} bytes is not one {}-byte block",
            len, BLOCK_BYTES
        )));
    }
    Ok(())
}
