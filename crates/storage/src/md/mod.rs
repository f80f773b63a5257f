//! Magnetic-disk backend
//!
//! Each fork of a relation is a chain of segment files of at most
//! `blocks_per_segment` blocks (see [`crate::paths`] for naming). Segment
//! files are opened lazily and cached in the handle's [`MdState`].
//!
//! Writes that skip the synchronous fsync register the dirtied segment in
//! the shared [`SyncQueue`]; when the queue is full the segment is fsynced
//! on the spot. Session-private relations are never fsynced or registered.

mod segment;

pub use segment::{MdSegment, MdState};

use relstore_core::{
    BlockNumber, Error, ForkNumber, IoOp, Oid, RelFileLocatorBackend, Result, BLOCK_BYTES,
    MAX_BLOCK_NUMBER,
};
use segment::segment_runs;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::{
    check_block_buffer, state_mut, BackendId, BackendState, StorageBackend, MD_BACKEND_ID,
};
use crate::paths;
use crate::sync::{FileTag, SyncMatcher, SyncQueue};

/// How a segment lookup treats a segment that is not there yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    /// Report absence
    ReturnNone,
    /// Zero-fill earlier segments to full size and create the segment
    Create,
}

/// The default storage backend.
pub struct MdBackend {
    data_dir: PathBuf,
    blocks_per_segment: BlockNumber,
    queue: Arc<SyncQueue>,
    tag_backend: BackendId,
    fsyncs: AtomicU64,
}

impl MdBackend {
    /// Backend name.
    pub const NAME: &'static str = "md";

    /// Create the backend over `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>, blocks_per_segment: BlockNumber, queue: Arc<SyncQueue>) -> Self {
        MdBackend {
            data_dir: data_dir.into(),
            blocks_per_segment: blocks_per_segment.max(1),
            queue,
            tag_backend: MD_BACKEND_ID,
            fsyncs: AtomicU64::new(0),
        }
    }

    /// Data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Blocks per segment file.
    pub fn blocks_per_segment(&self) -> BlockNumber {
        self.blocks_per_segment
    }

    /// Shared sync queue.
    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// Fsyncs this backend performed itself (immedsync and full-queue fallback).
    pub fn fsyncs(&self) -> u64 {
        self.fsyncs.load(Ordering::Relaxed)
    }

    /// Path of one segment.
    pub fn segment_path(&self, rel: &RelFileLocatorBackend, fork: ForkNumber, segno: u32) -> PathBuf {
        paths::segment_path(&self.data_dir, rel, fork, segno)
    }

    fn segment_bytes(&self) -> u64 {
        self.blocks_per_segment as u64 * BLOCK_BYTES as u64
    }

    fn open_segment_file(
        &self,
        rel: &RelFileLocatorBackend,
        fork: ForkNumber,
        segno: u32,
        create: bool,
    ) -> Result<MdSegment> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(self.segment_path(rel, fork, segno))
            .map_err(|e| Error::open(paths::describe(rel, fork, segno), e))?;
        Ok(MdSegment::new(file, segno))
    }

    fn segment_nblocks(&self, rel: &RelFileLocatorBackend, fork: ForkNumber, seg: &MdSegment) -> Result<BlockNumber> {
        let describe = || paths::describe(rel, fork, seg.segno);
        let len = seg
            .len_bytes()
            .map_err(|e| Error::io(IoOp::Seek, describe(), e))?;
        if len % BLOCK_BYTES as u64 != 0 {
            return Err(Error::Corruption(format!(
                "file \"{}\" has size {} which is not a multiple of the block size",
                describe(),
                len
            )));
        }
        let blocks = len / BLOCK_BYTES as u64;
        if blocks > self.blocks_per_segment as u64 {
            return Err(Error::Corruption(format!(
                "file \"{}\" holds {} blocks, more than a segment allows",
                describe(),
                blocks
            )));
        }
        Ok(blocks as BlockNumber)
    }

    /// Make sure segment 0 of `fork` is open. Returns false if it does not exist.
    fn open_first(&self, st: &mut MdState, fork: ForkNumber) -> Result<bool> {
        if st.open_segments(fork) > 0 {
            return Ok(true);
        }
        match self.open_segment_file(&st.rel, fork, 0, false) {
            Ok(seg) => {
                st.forks_mut(fork).push(seg);
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn open_first_or_fail(&self, st: &mut MdState, fork: ForkNumber) -> Result<()> {
        if self.open_first(st, fork)? {
            return Ok(());
        }
        Err(Error::NotFound {
            path: paths::describe(&st.rel, fork, 0),
            source: io::Error::from(io::ErrorKind::NotFound),
        })
    }

    /// Open segments up to and including `segno`.
    ///
    /// Returns false (only for [`Lookup::ReturnNone`]) if a segment below or
    /// at `segno` does not exist or a predecessor is not full.
    fn open_through(&self, st: &mut MdState, fork: ForkNumber, segno: u32, lookup: Lookup) -> Result<bool> {
        self.open_first_or_fail(st, fork)?;
        while st.open_segments(fork) <= segno as usize {
            let next = st.open_segments(fork) as u32;
            let last = &st.forks(fork)[next as usize - 1];
            let last_blocks = self.segment_nblocks(&st.rel, fork, last)?;

            if last_blocks < self.blocks_per_segment {
                match lookup {
                    Lookup::ReturnNone => return Ok(false),
                    Lookup::Create => {
                        let from = last_blocks as u64 * BLOCK_BYTES as u64;
                        last.write_zeros(from, self.segment_bytes()).map_err(|e| {
                            Error::block_io(
                                IoOp::Extend,
                                paths::describe(&st.rel, fork, last.segno),
                                (last.segno as u64 * self.blocks_per_segment as u64
                                    + last_blocks as u64) as BlockNumber,
                                e,
                            )
                        })?;
                    }
                }
            }

            match self.open_segment_file(&st.rel, fork, next, lookup == Lookup::Create) {
                Ok(seg) => st.forks_mut(fork).push(seg),
                Err(e) if e.is_not_found() && lookup == Lookup::ReturnNone => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn check_range(&self, st: &MdState, fork: ForkNumber, blkno: BlockNumber, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let last = blkno as u64 + count as u64 - 1;
        if last > MAX_BLOCK_NUMBER as u64 {
            return Err(Error::OutOfRange {
                path: paths::describe(&st.rel, fork, 0),
                block: blkno,
            });
        }
        Ok(())
    }

    fn register_dirty_segment(&self, st: &MdState, fork: ForkNumber, segno: u32, skip_fsync: bool) -> Result<()> {
        if skip_fsync || st.rel.is_temp() {
            return Ok(());
        }
        let tag = FileTag {
            backend: self.tag_backend,
            locator: st.rel.locator,
            fork,
            segno,
        };
        if self.queue.register(tag) {
            return Ok(());
        }

        debug!(target: "relstore::md", %tag, "sync queue full, fsyncing segment directly");
        let seg = &st.forks(fork)[segno as usize];
        seg.sync()
            .map_err(|e| Error::io(IoOp::Fsync, paths::describe(&st.rel, fork, segno), e))?;
        self.fsyncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Create the first segment of a fork.
    pub fn create_fork(&self, st: &mut MdState, fork: ForkNumber, is_redo: bool) -> Result<()> {
        if st.open_segments(fork) > 0 {
            return Ok(());
        }

        let dir = paths::relation_dir(&self.data_dir, &st.rel.locator);
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::io(IoOp::Open, dir.display().to_string(), e))?;

        let path = self.segment_path(&st.rel, fork, 0);
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && is_redo => OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| Error::open(paths::describe(&st.rel, fork, 0), e))?,
            Err(e) => return Err(Error::io(IoOp::Open, paths::describe(&st.rel, fork, 0), e)),
        };
        st.forks_mut(fork).push(MdSegment::new(file, 0));
        debug!(target: "relstore::md", rel = %st.rel, %fork, is_redo, "created fork");
        Ok(())
    }

    /// Whether segment 0 of the fork exists.
    pub fn fork_exists(&self, st: &mut MdState, fork: ForkNumber) -> Result<bool> {
        // Close first so that an unlink since the last open is noticed.
        st.close_fork(fork);
        self.open_first(st, fork)
    }

    /// Remove every segment of a fork.
    pub fn unlink_fork(&self, rel: RelFileLocatorBackend, fork: ForkNumber, is_redo: bool) -> Result<()> {
        if !rel.is_temp() {
            self.queue.forget(SyncMatcher::Fork(rel.locator, fork));
        }

        let first = self.segment_path(&rel, fork, 0);
        match std::fs::remove_file(&first) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if !is_redo {
                    return Err(Error::NotFound {
                        path: paths::describe(&rel, fork, 0),
                        source: e,
                    });
                }
                debug!(target: "relstore::md", %rel, %fork, "fork already removed");
            }
            Err(e) => return Err(Error::io(IoOp::Unlink, paths::describe(&rel, fork, 0), e)),
        }

        let mut segno = 1u32;
        loop {
            let path = self.segment_path(&rel, fork, segno);
            match std::fs::remove_file(&path) {
                Ok(()) => segno += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) => {
                    return Err(Error::io(IoOp::Unlink, paths::describe(&rel, fork, segno), e))
                }
            }
        }
        debug!(target: "relstore::md", %rel, %fork, segments = segno, "unlinked fork");
        Ok(())
    }

    /// Current block count of a fork.
    pub fn fork_nblocks(&self, st: &mut MdState, fork: ForkNumber) -> Result<BlockNumber> {
        self.open_first_or_fail(st, fork)?;
        let bps = self.blocks_per_segment as u64;
        let mut segno = st.open_segments(fork) as u32 - 1;
        loop {
            let seg = &st.forks(fork)[segno as usize];
            let blocks = self.segment_nblocks(&st.rel, fork, seg)? as u64;
            let total = segno as u64 * bps + blocks;
            if blocks < bps {
                return to_block_count(&st.rel, fork, total);
            }
            match self.open_segment_file(&st.rel, fork, segno + 1, false) {
                Ok(next) => {
                    st.forks_mut(fork).push(next);
                    segno += 1;
                }
                Err(e) if e.is_not_found() => return to_block_count(&st.rel, fork, total),
                Err(e) => return Err(e),
            }
        }
    }

    /// Read contiguous blocks. Blocks past EOF are returned as zeros.
    pub fn read_blocks(
        &self,
        st: &mut MdState,
        fork: ForkNumber,
        blkno: BlockNumber,
        buffers: &mut [&mut [u8]],
    ) -> Result<()> {
        for buf in buffers.iter() {
            check_block_buffer(buf.len())?;
        }
        self.check_range(st, fork, blkno, buffers.len())?;

        let mut idx = 0;
        for (segno, within, run) in segment_runs(blkno, buffers.len(), self.blocks_per_segment) {
            let present = self.open_through(st, fork, segno, Lookup::ReturnNone)?;
            for i in 0..run {
                let buf = &mut *buffers[idx + i];
                if !present {
                    buf.fill(0);
                    continue;
                }
                let block = blkno + (idx + i) as BlockNumber;
                let seg = &st.forks(fork)[segno as usize];
                let offset = (within as u64 + i as u64) * BLOCK_BYTES as u64;
                let n = seg.read_block(offset, buf).map_err(|e| {
                    Error::block_io(IoOp::Read, paths::describe(&st.rel, fork, segno), block, e)
                })?;
                if n == 0 {
                    buf.fill(0);
                } else if n < BLOCK_BYTES {
                    return Err(Error::Corruption(format!(
                        "could not read block {} in file \"{}\": read only {} of {} bytes",
                        block,
                        paths::describe(&st.rel, fork, segno),
                        n,
                        BLOCK_BYTES
                    )));
                }
            }
            idx += run;
        }
        Ok(())
    }

    /// Write contiguous blocks, zero-filling any gap before the first one.
    pub fn write_blocks(
        &self,
        st: &mut MdState,
        fork: ForkNumber,
        blkno: BlockNumber,
        buffers: &[&[u8]],
        skip_fsync: bool,
    ) -> Result<()> {
        for buf in buffers {
            check_block_buffer(buf.len())?;
        }
        self.check_range(st, fork, blkno, buffers.len())?;

        let mut idx = 0;
        for (segno, within, run) in segment_runs(blkno, buffers.len(), self.blocks_per_segment) {
            self.open_through(st, fork, segno, Lookup::Create)?;
            let seg = &st.forks(fork)[segno as usize];
            let describe = || paths::describe(&st.rel, fork, segno);

            let start = within as u64 * BLOCK_BYTES as u64;
            let len = seg
                .len_bytes()
                .map_err(|e| Error::io(IoOp::Seek, describe(), e))?;
            if len < start {
                seg.write_zeros(len, start).map_err(|e| {
                    Error::block_io(IoOp::Extend, describe(), blkno + idx as BlockNumber, e)
                })?;
            }

            for i in 0..run {
                let block = blkno + (idx + i) as BlockNumber;
                seg.write_block(start + (i * BLOCK_BYTES) as u64, buffers[idx + i])
                    .map_err(|e| Error::block_io(IoOp::Write, describe(), block, e))?;
            }
            self.register_dirty_segment(st, fork, segno, skip_fsync)?;
            idx += run;
        }
        Ok(())
    }

    /// Add one block at `blkno`; `blkno` must not be below the current EOF.
    pub fn extend_fork(
        &self,
        st: &mut MdState,
        fork: ForkNumber,
        blkno: BlockNumber,
        buffer: &[u8],
        skip_fsync: bool,
    ) -> Result<()> {
        let current = self.fork_nblocks(st, fork)?;
        if blkno < current {
            return Err(Error::InvalidOperation(format!(
                "cannot extend file \"{}\" at block {}: it already has {} blocks",
                paths::describe(&st.rel, fork, 0),
                blkno,
                current
            )));
        }
        self.write_blocks(st, fork, blkno, &[buffer], skip_fsync)
    }

    /// Add `nblocks` zero blocks at `blkno`, zero-filling any gap before it.
    pub fn zeroextend_fork(
        &self,
        st: &mut MdState,
        fork: ForkNumber,
        blkno: BlockNumber,
        nblocks: u32,
        skip_fsync: bool,
    ) -> Result<()> {
        if nblocks == 0 {
            return Ok(());
        }
        self.check_range(st, fork, blkno, nblocks as usize)?;
        let current = self.fork_nblocks(st, fork)?;
        if blkno < current {
            return Err(Error::InvalidOperation(format!(
                "cannot extend file \"{}\" at block {}: it already has {} blocks",
                paths::describe(&st.rel, fork, 0),
                blkno,
                current
            )));
        }

        let end = blkno + nblocks;
        for (segno, within, run) in
            segment_runs(current, (end - current) as usize, self.blocks_per_segment)
        {
            self.open_through(st, fork, segno, Lookup::Create)?;
            let seg = &st.forks(fork)[segno as usize];
            let from = within as u64 * BLOCK_BYTES as u64;
            let to = from + (run * BLOCK_BYTES) as u64;
            seg.write_zeros(from, to).map_err(|e| {
                Error::block_io(
                    IoOp::Extend,
                    paths::describe(&st.rel, fork, segno),
                    segno * self.blocks_per_segment + within,
                    e,
                )
            })?;
            self.register_dirty_segment(st, fork, segno, skip_fsync)?;
        }
        Ok(())
    }

    /// Shrink a fork to `nblocks`.
    ///
    /// Segments wholly past the new end are unlinked; the boundary segment
    /// is cut to the remaining size.
    pub fn truncate_fork(
        &self,
        st: &mut MdState,
        fork: ForkNumber,
        old_nblocks: BlockNumber,
        nblocks: BlockNumber,
    ) -> Result<()> {
        if nblocks > old_nblocks {
            return Err(Error::InvalidOperation(format!(
                "could not truncate file \"{}\" to {} blocks: it's only {} blocks now",
                paths::describe(&st.rel, fork, 0),
                nblocks,
                old_nblocks
            )));
        }
        if nblocks == old_nblocks {
            return Ok(());
        }

        // Opens every segment.
        self.fork_nblocks(st, fork)?;

        let boundary = nblocks / self.blocks_per_segment;
        while st.open_segments(fork) as u32 > boundary + 1 {
            let seg = st.forks_mut(fork).pop();
            let segno = st.open_segments(fork) as u32;
            drop(seg);
            if !st.rel.is_temp() {
                self.queue.forget(SyncMatcher::Exact(FileTag {
                    backend: self.tag_backend,
                    locator: st.rel.locator,
                    fork,
                    segno,
                }));
            }
            let path = self.segment_path(&st.rel, fork, segno);
            std::fs::remove_file(&path).map_err(|e| {
                Error::io(IoOp::Truncate, paths::describe(&st.rel, fork, segno), e)
            })?;
        }

        let len = (nblocks % self.blocks_per_segment) as u64 * BLOCK_BYTES as u64;
        if let Some(seg) = st.forks(fork).get(boundary as usize) {
            seg.truncate(len).map_err(|e| {
                Error::block_io(
                    IoOp::Truncate,
                    paths::describe(&st.rel, fork, boundary),
                    nblocks,
                    e,
                )
            })?;
            self.register_dirty_segment(st, fork, boundary, false)?;
        }
        debug!(target: "relstore::md", rel = %st.rel, %fork, old_nblocks, nblocks, "truncated fork");
        Ok(())
    }

    /// Fsync every segment of a fork and drop its pending sync requests.
    pub fn immedsync_fork(&self, st: &mut MdState, fork: ForkNumber) -> Result<()> {
        self.fork_nblocks(st, fork)?;
        for seg in st.forks(fork) {
            seg.sync()
                .map_err(|e| Error::io(IoOp::Fsync, paths::describe(&st.rel, fork, seg.segno), e))?;
            self.fsyncs.fetch_add(1, Ordering::Relaxed);
        }
        if !st.rel.is_temp() {
            self.queue.forget(SyncMatcher::Fork(st.rel.locator, fork));
        }
        Ok(())
    }

    /// Register every segment of a fork for the next checkpoint.
    pub fn registersync_fork(&self, st: &mut MdState, fork: ForkNumber) -> Result<()> {
        self.fork_nblocks(st, fork)?;
        for segno in 0..st.open_segments(fork) as u32 {
            self.register_dirty_segment(st, fork, segno, false)?;
        }
        Ok(())
    }

    /// Whether the segment holding `blkno` is present.
    pub fn prefetch_blocks(&self, st: &mut MdState, fork: ForkNumber, blkno: BlockNumber) -> Result<bool> {
        if !self.open_first(st, fork)? {
            return Ok(false);
        }
        self.open_through(st, fork, blkno / self.blocks_per_segment, Lookup::ReturnNone)
    }

    /// Fsync the segment a tag names.
    pub fn sync_tag(&self, tag: &FileTag) -> Result<()> {
        let rel = RelFileLocatorBackend::shared(tag.locator);
        let describe = paths::describe(&rel, tag.fork, tag.segno);
        let file = OpenOptions::new()
            .read(true)
            .open(self.segment_path(&rel, tag.fork, tag.segno))
            .map_err(|e| Error::open(describe.clone(), e))?;
        file.sync_all()
            .map_err(|e| Error::io(IoOp::Fsync, describe, e))?;
        Ok(())
    }

    /// Cancel pending syncs of a database and remove its directory in every
    /// tablespace. Open handles on its relations must be closed first.
    pub fn drop_database_dirs(&self, db_oid: Oid) -> Result<usize> {
        self.queue.forget(SyncMatcher::Database(db_oid));

        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::io(IoOp::Read, self.data_dir.display().to_string(), e)),
        };
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(IoOp::Read, self.data_dir.display().to_string(), e))?;
            let Some(spc_oid) = entry.file_name().to_str().and_then(|s| s.parse::<Oid>().ok()) else {
                continue;
            };
            let dir = paths::database_dir(&self.data_dir, spc_oid, db_oid);
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(IoOp::Unlink, dir.display().to_string(), e)),
            }
        }
        debug!(target: "relstore::md", db_oid, tablespaces = removed, "dropped database storage");
        Ok(removed)
    }

    fn state<'a>(&self, state: &'a mut BackendState) -> Result<&'a mut MdState> {
        state_mut::<MdState>(state, Self::NAME)
    }
}

fn to_block_count(rel: &RelFileLocatorBackend, fork: ForkNumber, total: u64) -> Result<BlockNumber> {
    if total > MAX_BLOCK_NUMBER as u64 + 1 {
        warn!(target: "relstore::md", %rel, %fork, total, "fork exceeds addressable size");
        return Err(Error::Corruption(format!(
            "file \"{}\" holds {} blocks, more than addressable",
            paths::describe(rel, fork, 0),
            total
        )));
    }
    Ok(total as BlockNumber)
}

impl StorageBackend for MdBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn open(&self, rel: RelFileLocatorBackend) -> Result<BackendState> {
        Ok(Box::new(MdState::new(rel)))
    }

    fn close(&self, state: &mut BackendState, fork: ForkNumber) {
        if let Some(st) = state.downcast_mut::<MdState>() {
            st.close_fork(fork);
        }
    }

    fn create(&self, state: &mut BackendState, fork: ForkNumber, is_redo: bool) -> Result<()> {
        self.create_fork(self.state(state)?, fork, is_redo)
    }

    fn exists(&self, state: &mut BackendState, fork: ForkNumber) -> Result<bool> {
        self.fork_exists(self.state(state)?, fork)
    }

    fn unlink(&self, rel: RelFileLocatorBackend, fork: ForkNumber, is_redo: bool) -> Result<()> {
        self.unlink_fork(rel, fork, is_redo)
    }

    fn extend(
        &self,
        state: &mut BackendState,
        fork: ForkNumber,
        blkno: BlockNumber,
        buffer: &[u8],
        skip_fsync: bool,
    ) -> Result<()> {
        self.extend_fork(self.state(state)?, fork, blkno, buffer, skip_fsync)
    }

    fn zeroextend(
        &self,
        state: &mut BackendState,
        fork: ForkNumber,
        blkno: BlockNumber,
        nblocks: u32,
        skip_fsync: bool,
    ) -> Result<()> {
        self.zeroextend_fork(self.state(state)?, fork, blkno, nblocks, skip_fsync)
    }

    fn prefetch(
        &self,
        state: &mut BackendState,
        fork: ForkNumber,
        blkno: BlockNumber,
        _nblocks: u32,
    ) -> Result<bool> {
        self.prefetch_blocks(self.state(state)?, fork, blkno)
    }

    fn readv(
        &self,
        state: &mut BackendState,
        fork: ForkNumber,
        blkno: BlockNumber,
        buffers: &mut [&mut [u8]],
    ) -> Result<()> {
        self.read_blocks(self.state(state)?, fork, blkno, buffers)
    }

    fn writev(
        &self,
        state: &mut BackendState,
        fork: ForkNumber,
        blkno: BlockNumber,
        buffers: &[&[u8]],
        skip_fsync: bool,
    ) -> Result<()> {
        self.write_blocks(self.state(state)?, fork, blkno, buffers, skip_fsync)
    }

    fn writeback(
        &self,
        _state: &mut BackendState,
        _fork: ForkNumber,
        _blkno: BlockNumber,
        _nblocks: u32,
    ) -> Result<()> {
        Ok(())
    }

    fn nblocks(&self, state: &mut BackendState, fork: ForkNumber) -> Result<BlockNumber> {
        self.fork_nblocks(self.state(state)?, fork)
    }

    fn truncate(
        &self,
        state: &mut BackendState,
        fork: ForkNumber,
        old_nblocks: BlockNumber,
        nblocks: BlockNumber,
    ) -> Result<()> {
        self.truncate_fork(self.state(state)?, fork, old_nblocks, nblocks)
    }

    fn immedsync(&self, state: &mut BackendState, fork: ForkNumber) -> Result<()> {
        self.immedsync_fork(self.state(state)?, fork)
    }

    fn registersync(&self, state: &mut BackendState, fork: ForkNumber) -> Result<()> {
        self.registersync_fork(self.state(state)?, fork)
    }

    fn sync_file(&self, tag: &FileTag) -> Result<()> {
        self.sync_tag(tag)
    }

    fn drop_database(&self, db_oid: Oid) -> Result<()> {
        self.drop_database_dirs(db_oid).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relstore_core::{BackendOwner, RelFileLocator};
    use tempfile::{tempdir, TempDir};

    const BPS: BlockNumber = 4;

    fn setup() -> (TempDir, MdBackend) {
        let dir = tempdir().unwrap();
        let md = MdBackend::new(dir.path(), BPS, Arc::new(SyncQueue::with_defaults()));
        (dir, md)
    }

    fn rel() -> RelFileLocatorBackend {
        RelFileLocatorBackend::shared(RelFileLocator::new(1663, 5, 16384))
    }

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; BLOCK_BYTES]
    }

    fn read(md: &MdBackend, st: &mut MdState, blkno: BlockNumber, n: usize) -> Vec<Vec<u8>> {
        let mut bufs = vec![vec![0xEEu8; BLOCK_BYTES]; n];
        let mut refs: Vec<&mut [u8]> = bufs.iter_mut().map(|b| b.as_mut_slice()).collect();
        md.read_blocks(st, ForkNumber::Main, blkno, &mut refs).unwrap();
        bufs
    }

    #[test]
    fn test_create_and_exists() {
        let (_dir, md) = setup();
        let mut st = MdState::new(rel());
        assert!(!md.fork_exists(&mut st, ForkNumber::Main).unwrap());
        md.create_fork(&mut st, ForkNumber::Main, false).unwrap();
        assert!(md.fork_exists(&mut st, ForkNumber::Main).unwrap());
        assert!(!md.fork_exists(&mut st, ForkNumber::Fsm).unwrap());
        assert_eq!(md.fork_nblocks(&mut st, ForkNumber::Main).unwrap(), 0);
    }

    #[test]
    fn test_create_existing_fails_outside_redo() {
        let (_dir, md) = setup();
        md.create_fork(&mut MdState::new(rel()), ForkNumber::Main, false).unwrap();
        let err = md
            .create_fork(&mut MdState::new(rel()), ForkNumber::Main, false)
            .unwrap_err();
        assert!(matches!(err, Error::Io { op: IoOp::Open, .. }));
        md.create_fork(&mut MdState::new(rel()), ForkNumber::Main, true).unwrap();
    }

    #[test]
    fn test_redo_create_keeps_contents() {
        let (_dir, md) = setup();
        let mut st = MdState::new(rel());
        md.create_fork(&mut st, ForkNumber::Main, false).unwrap();
        md.extend_fork(&mut st, ForkNumber::Main, 0, &page(1), true).unwrap();

        let mut st2 = MdState::new(rel());
        md.create_fork(&mut st2, ForkNumber::Main, true).unwrap();
        assert_eq!(md.fork_nblocks(&mut st2, ForkNumber::Main).unwrap(), 1);
    }

    #[test]
    fn test_write_across_segments() {
        let (dir, md) = setup();
        let mut st = MdState::new(rel());
        md.create_fork(&mut st, ForkNumber::Main, false).unwrap();
        let pages: Vec<Vec<u8>> = (0..6u8).map(page).collect();
        let refs: Vec<&[u8]> = pages.iter().map(|p| p.as_slice()).collect();
        md.write_blocks(&mut st, ForkNumber::Main, 0, &refs, true).unwrap();

        assert_eq!(md.fork_nblocks(&mut st, ForkNumber::Main).unwrap(), 6);
        assert_eq!(st.open_segments(ForkNumber::Main), 2);
        let seg1 = dir.path().join("1663/5/16384.1");
        assert_eq!(std::fs::metadata(seg1).unwrap().len(), 2 * BLOCK_BYTES as u64);
        assert_eq!(read(&md, &mut st, 0, 6), pages);
    }

    #[test]
    fn test_read_past_eof_is_zero() {
        let (_dir, md) = setup();
        let mut st = MdState::new(rel());
        md.create_fork(&mut st, ForkNumber::Main, false).unwrap();
        md.extend_fork(&mut st, ForkNumber::Main, 0, &page(9), true).unwrap();
        let bufs = read(&md, &mut st, 0, 7);
        assert_eq!(bufs[0], page(9));
        for b in &bufs[1..] {
            assert_eq!(*b, page(0));
        }
    }

    #[test]
    fn test_extend_fills_gap_across_segments() {
        let (dir, md) = setup();
        let mut st = MdState::new(rel());
        md.create_fork(&mut st, ForkNumber::Main, false).unwrap();
        md.extend_fork(&mut st, ForkNumber::Main, 0, &page(1), true).unwrap();
        md.extend_fork(&mut st, ForkNumber::Main, 9, &page(2), true).unwrap();

        assert_eq!(md.fork_nblocks(&mut st, ForkNumber::Main).unwrap(), 10);
        for segno in 0..2 {
            let name = if segno == 0 { "16384".to_string() } else { format!("16384.{}", segno) };
            let len = std::fs::metadata(dir.path().join("1663/5").join(name)).unwrap().len();
            assert_eq!(len, BPS as u64 * BLOCK_BYTES as u64);
        }
        let bufs = read(&md, &mut st, 0, 10);
        assert_eq!(bufs[9], page(2));
        assert!(bufs[1..9].iter().all(|b| *b == page(0)));
    }

    #[test]
    fn test_extend_below_eof_rejected() {
        let (_dir, md) = setup();
        let mut st = MdState::new(rel());
        md.create_fork(&mut st, ForkNumber::Main, false).unwrap();
        md.extend_fork(&mut st, ForkNumber::Main, 0, &page(1), true).unwrap();
        assert!(matches!(
            md.extend_fork(&mut st, ForkNumber::Main, 0, &page(1), true),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_zeroextend() {
        let (_dir, md) = setup();
        let mut st = MdState::new(rel());
        md.create_fork(&mut st, ForkNumber::Main, false).unwrap();
        md.zeroextend_fork(&mut st, ForkNumber::Main, 0, 7, true).unwrap();
        assert_eq!(md.fork_nblocks(&mut st, ForkNumber::Main).unwrap(), 7);
        md.zeroextend_fork(&mut st, ForkNumber::Main, 9, 2, true).unwrap();
        assert_eq!(md.fork_nblocks(&mut st, ForkNumber::Main).unwrap(), 11);
    }

    #[test]
    fn test_truncate_unlinks_tail_segments() {
        let (dir, md) = setup();
        let mut st = MdState::new(rel());
        md.create_fork(&mut st, ForkNumber::Main, false).unwrap();
        md.zeroextend_fork(&mut st, ForkNumber::Main, 0, 10, false).unwrap();
        assert!(dir.path().join("1663/5/16384.2").exists());

        md.truncate_fork(&mut st, ForkNumber::Main, 10, 5).unwrap();
        assert_eq!(md.fork_nblocks(&mut st, ForkNumber::Main).unwrap(), 5);
        assert!(!dir.path().join("1663/5/16384.2").exists());
        let tag = FileTag {
            backend: MD_BACKEND_ID,
            locator: rel().locator,
            fork: ForkNumber::Main,
            segno: 2,
        };
        assert!(!md.queue().is_pending(&tag));

        md.truncate_fork(&mut st, ForkNumber::Main, 5, 0).unwrap();
        assert_eq!(md.fork_nblocks(&mut st, ForkNumber::Main).unwrap(), 0);
        assert_eq!(std::fs::metadata(dir.path().join("1663/5/16384")).unwrap().len(), 0);
        assert!(!dir.path().join("1663/5/16384.1").exists());
    }

    #[test]
    fn test_truncate_beyond_eof_rejected() {
        let (_dir, md) = setup();
        let mut st = MdState::new(rel());
        md.create_fork(&mut st, ForkNumber::Main, false).unwrap();
        assert!(md.truncate_fork(&mut st, ForkNumber::Main, 0, 3).is_err());
    }

    #[test]
    fn test_dirty_segments_registered() {
        let (_dir, md) = setup();
        let mut st = MdState::new(rel());
        md.create_fork(&mut st, ForkNumber::Main, false).unwrap();
        md.zeroextend_fork(&mut st, ForkNumber::Main, 0, 6, false).unwrap();
        assert_eq!(md.queue().pending_len(), 2);

        md.immedsync_fork(&mut st, ForkNumber::Main).unwrap();
        assert_eq!(md.queue().pending_len(), 0);
        assert_eq!(md.fsyncs(), 2);
    }

    #[test]
    fn test_full_queue_falls_back_to_fsync() {
        let dir = tempdir().unwrap();
        let md = MdBackend::new(dir.path(), BPS, Arc::new(SyncQueue::new(1, 5)));
        let mut st = MdState::new(rel());
        md.create_fork(&mut st, ForkNumber::Main, false).unwrap();
        md.zeroextend_fork(&mut st, ForkNumber::Main, 0, 6, false).unwrap();
        assert_eq!(md.queue().pending_len(), 1);
        assert_eq!(md.fsyncs(), 1);
    }

    #[test]
    fn test_temp_relations_never_registered() {
        let (dir, md) = setup();
        let temp = RelFileLocatorBackend::new(rel().locator, BackendOwner::Temp(3));
        let mut st = MdState::new(temp);
        md.create_fork(&mut st, ForkNumber::Main, false).unwrap();
        md.zeroextend_fork(&mut st, ForkNumber::Main, 0, 2, false).unwrap();
        md.registersync_fork(&mut st, ForkNumber::Main).unwrap();
        assert_eq!(md.queue().pending_len(), 0);
        assert!(dir.path().join("1663/5/t3_16384").exists());
    }

    #[test]
    fn test_unlink() {
        let (dir, md) = setup();
        let mut st = MdState::new(rel());
        md.create_fork(&mut st, ForkNumber::Main, false).unwrap();
        md.zeroextend_fork(&mut st, ForkNumber::Main, 0, 9, false).unwrap();
        drop(st);

        md.unlink_fork(rel(), ForkNumber::Main, false).unwrap();
        assert!(!dir.path().join("1663/5/16384").exists());
        assert!(!dir.path().join("1663/5/16384.2").exists());
        assert_eq!(md.queue().pending_len(), 0);

        assert!(md.unlink_fork(rel(), ForkNumber::Main, false).unwrap_err().is_not_found());
        md.unlink_fork(rel(), ForkNumber::Main, true).unwrap();
    }

    #[test]
    fn test_misaligned_file_is_corruption() {
        let (dir, md) = setup();
        let mut st = MdState::new(rel());
        md.create_fork(&mut st, ForkNumber::Main, false).unwrap();
        std::fs::write(dir.path().join("1663/5/16384"), vec![0u8; 100]).unwrap();
        assert!(matches!(
            md.fork_nblocks(&mut st, ForkNumber::Main),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_out_of_range_block() {
        let (_dir, md) = setup();
        let mut st = MdState::new(rel());
        md.create_fork(&mut st, ForkNumber::Main, false).unwrap();
        let p = page(1);
        assert!(matches!(
            md.write_blocks(&mut st, ForkNumber::Main, MAX_BLOCK_NUMBER, &[p.as_slice(), p.as_slice()], true),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_sync_tag() {
        let (_dir, md) = setup();
        let mut st = MdState::new(rel());
        md.create_fork(&mut st, ForkNumber::Main, false).unwrap();
        let tag = FileTag {
            backend: MD_BACKEND_ID,
            locator: rel().locator,
            fork: ForkNumber::Main,
            segno: 0,
        };
        md.sync_tag(&tag).unwrap();
        assert!(md.sync_tag(&FileTag { segno: 3, ..tag }).unwrap_err().is_not_found());
    }

    #[test]
    fn test_drop_database_dirs() {
        let (dir, md) = setup();
        let mut st = MdState::new(rel());
        md.create_fork(&mut st, ForkNumber::Main, false).unwrap();
        md.write_blocks(&mut st, ForkNumber::Main, 0, &[page(1).as_slice()], false)
            .unwrap();
        st.close_fork(ForkNumber::Main);
        assert!(md.queue().pending_len() > 0);

        assert_eq!(md.drop_database_dirs(rel().locator.db_oid).unwrap(), 1);
        assert!(!paths::relation_dir(dir.path(), &rel().locator).exists());
        assert!(!md.queue().has_pending(SyncMatcher::Database(rel().locator.db_oid)));
        assert_eq!(md.drop_database_dirs(rel().locator.db_oid).unwrap(), 0);
    }
}
