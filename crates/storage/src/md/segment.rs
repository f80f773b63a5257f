//! Open segment files and positional block I/O.

use relstore_core::{BlockNumber, ForkNumber, RelFileLocatorBackend, BLOCK_BYTES, FORK_COUNT};
use smallvec::SmallVec;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

/// Blocks written per call when zero-filling.
const ZERO_CHUNK_BLOCKS: usize = 32;

static ZERO_CHUNK: [u8; ZERO_CHUNK_BLOCKS * BLOCK_BYTES] = [0; ZERO_CHUNK_BLOCKS * BLOCK_BYTES];

/// One open segment file.
#[derive(Debug)]
pub struct MdSegment {
    pub(crate) file: File,
    pub(crate) segno: u32,
}

impl MdSegment {
    pub(crate) fn new(file: File, segno: u32) -> Self {
        MdSegment { file, segno }
    }

    /// Segment number.
    pub fn segno(&self) -> u32 {
        self.segno
    }

    /// Current length in bytes.
    pub(crate) fn len_bytes(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Read one block at byte `offset`. Returns the number of bytes read,
    /// which is short only at end of file.
    pub(crate) fn read_block(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    pub(crate) fn write_block(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    /// Write zero blocks over `[from, to)` bytes.
    pub(crate) fn write_zeros(&self, from: u64, to: u64) -> io::Result<()> {
        let mut pos = from;
        while pos < to {
            let n = (to - pos).min(ZERO_CHUNK.len() as u64) as usize;
            self.file.write_all_at(&ZERO_CHUNK[..n], pos)?;
            pos += n as u64;
        }
        Ok(())
    }

    pub(crate) fn truncate(&self, len: u64) -> io::Result<()> {
        self.file.set_len(len)
    }

    pub(crate) fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }
}

/// Per-handle state of the magnetic-disk backend.
///
/// `segments[fork]` holds the open segments of each fork in order; entry
/// `i` is segment number `i`, and it is only present when segment `i - 1`
/// is full.
#[derive(Debug)]
pub struct MdState {
    pub(crate) rel: RelFileLocatorBackend,
    pub(crate) segments: [SmallVec<[MdSegment; 2]>; FORK_COUNT],
}

impl MdState {
    /// Fresh state with nothing open.
    pub fn new(rel: RelFileLocatorBackend) -> Self {
        MdState {
            rel,
            segments: Default::default(),
        }
    }

    /// Relation this state belongs to.
    pub fn rel(&self) -> RelFileLocatorBackend {
        self.rel
    }

    /// Number of open segments of a fork.
    pub fn open_segments(&self, fork: ForkNumber) -> usize {
        self.segments[fork.index()].len()
    }

    pub(crate) fn forks(&self, fork: ForkNumber) -> &SmallVec<[MdSegment; 2]> {
        &self.segments[fork.index()]
    }

    pub(crate) fn forks_mut(&mut self, fork: ForkNumber) -> &mut SmallVec<[MdSegment; 2]> {
        &mut self.segments[fork.index()]
    }

    /// Drop every open file of a fork.
    pub fn close_fork(&mut self, fork: ForkNumber) {
        self.segments[fork.index()].clear();
    }
}

/// Split `[blkno, blkno + count)` into per-segment runs of
/// `(segno, first block offset within segment, run length)`.
pub(crate) fn segment_runs(
    blkno: BlockNumber,
    count: usize,
    blocks_per_segment: BlockNumber,
) -> impl Iterator<Item = (u32, u32, usize)> {
    let mut next = blkno as u64;
    let end = blkno as u64 + count as u64;
    let bps = blocks_per_segment as u64;
    std::iter::from_fn(move || {
        if next >= end {
            return None;
        }
        let segno = (next / bps) as u32;
        let within = (next % bps) as u32;
        let run = (bps - within as u64).min(end - next) as usize;
        next += run as u64;
        Some((segno, within, run))
    })
}
