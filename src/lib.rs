//! relstore - pluggable storage manager for a transactional relational database
//!
//! relstore sits between the buffer pool and the file system. It names
//! relation files, reads and writes fixed-size blocks through a registry of
//! storage backends, defers fsyncs to checkpoints, unlinks files at
//! transaction end and replays its WAL after a crash.
//!
//! # Quick Start
//!
//! ```ignore
//! use relstore::{Cluster, ForkNumber, RelFileLocator, RelPersistence};
//!
//! let cluster = Cluster::open("/data/cluster")?;
//! let mut session = cluster.session();
//!
//! session.begin()?;
//! let rel = RelFileLocator::new(1663, 5, 16384);
//! let h = session.record_create(rel, RelPersistence::Permanent)?;
//! session.smgr().extend(h, ForkNumber::Main, 0, &page, false)?;
//! session.on_xact_commit()?;
//!
//! cluster.shutdown()?;
//! ```
//!
//! # Architecture
//!
//! - [`storage`]: backends, the magnetic-disk backend, the relation cache,
//!   the pending-sync queue and the encryption shim
//! - [`durability`]: WAL, record formats and the control file
//! - the engine (re-exported at the top level): clusters, sessions,
//!   transaction storage tracking, bulk writes, checkpoints and redo

pub use relstore_core::{
    page, AlignedPage, BackendOwner, BlockNumber, Error, ForkNumber, IoOp, Lsn, Oid, ProcNumber,
    RelFileLocator, RelFileLocatorBackend, RelPersistence, Result, BLOCKS_PER_SEGMENT,
    BLOCK_BYTES, DEFAULT_WAL_SKIP_THRESHOLD_BYTES, FIRST_NORMAL_OBJECT_ID, MAX_PENDING_WRITES,
};
pub use relstore_durability as durability;
pub use relstore_engine::*;
pub use relstore_storage as storage;
