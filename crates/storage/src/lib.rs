//! Storage layer for relstore
//!
//! This crate implements relation storage below the buffer pool:
//! - paths: relation file naming
//! - md: the magnetic-disk backend (segmented files per fork)
//! - sync: the pending-sync request queue drained by the checkpointer
//! - backend / smgr: the `StorageBackend` trait, backend registry, relation
//!   cache and dispatch
//! - tde: the encrypting wrapper backend and its key map

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod md;
pub mod paths;
pub mod smgr;
pub mod sync;
pub mod tde;

pub use backend::{BackendId, BackendState, StorageBackend, MD_BACKEND_ID};
pub use md::{MdBackend, MdSegment, MdState};
pub use smgr::{
    BackendRegistry, BufferInvalidator, NoBufferPool, Smgr, SmgrCounters, SmgrHandle,
    SmgrRelation, SyncIntent,
};
pub use sync::{
    FileTag, SyncBatch, SyncFileHandler, SyncMatcher, SyncQueue, SyncQueueStats, SyncReport,
    DEFAULT_SYNC_MAX_ATTEMPTS, DEFAULT_SYNC_QUEUE_CAPACITY,
};
pub use tde::{
    EncryptionStatus, HmacCtrCipher, InternalKey, KeyMapError, KeyStore, PageCipher,
    PrincipalKey, TdeBackend, TdeState,
};
