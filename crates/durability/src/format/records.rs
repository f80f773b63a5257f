//! Typed WAL record bodies.
//!
//! Every record the storage layer writes or replays is one [`LogRecord`]
//! variant. Encoding produces a [`WalRecord`] (resource manager, info byte,
//! payload); decoding rejects unknown operation codes as corruption so that
//! redo never silently skips a record it does not understand.
//!
//! # Payloads (little-endian)
//!
//! ```text
//! SMGR CREATE     locator(12) fork(1)
//! SMGR TRUNCATE   locator(12) blkno(4) flags(4)
//! XLOG NEWPAGES   locator(12) fork(1) count(2) { blkno(4) standard(1) image(BLOCK_BYTES) }*
//! XLOG CHECKPOINT redo(8)
//! XACT COMMIT     count(4) locator(12)*
//! XACT ABORT      count(4) locator(12)*
//! ```

use crate::format::wal_record::{RmgrId, WalRecord};
use byteorder::{LittleEndian, ReadBytesExt};
use relstore_core::{
    BlockNumber, Error, ForkNumber, Lsn, RelFileLocator, Result, BLOCK_BYTES, MAX_PENDING_WRITES,
    REL_FILE_LOCATOR_SIZE,
};
use std::io::{Cursor, Read};

/// SMGR: a relation fork file was created.
pub const XLOG_SMGR_CREATE: u8 = 0x10;
/// SMGR: a relation was truncated.
pub const XLOG_SMGR_TRUNCATE: u8 = 0x20;

/// XLOG: checkpoint completed.
pub const XLOG_CHECKPOINT: u8 = 0x10;
/// XLOG: batch of full page images written outside the buffer pool.
pub const XLOG_NEWPAGES: u8 = 0xB0;

/// XACT: transaction committed.
pub const XLOG_XACT_COMMIT: u8 = 0x00;
/// XACT: transaction aborted.
pub const XLOG_XACT_ABORT: u8 = 0x20;

/// Truncate the main fork.
pub const SMGR_TRUNCATE_MAIN: u32 = 0x0001;
/// Truncate the free-space map.
pub const SMGR_TRUNCATE_FSM: u32 = 0x0002;
/// Truncate the visibility map.
pub const SMGR_TRUNCATE_VM: u32 = 0x0004;
/// Truncate every fork.
pub const SMGR_TRUNCATE_ALL: u32 = SMGR_TRUNCATE_MAIN | SMGR_TRUNCATE_FSM | SMGR_TRUNCATE_VM;

/// Body of `SMGR CREATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XlSmgrCreate {
    /// Relation whose fork was created
    pub locator: RelFileLocator,
    /// The created fork
    pub fork: ForkNumber,
}

/// Body of `SMGR TRUNCATE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XlSmgrTruncate {
    /// Truncated relation
    pub locator: RelFileLocator,
    /// New main-fork length in blocks
    pub blkno: BlockNumber,
    /// `SMGR_TRUNCATE_*` bits
    pub flags: u32,
}

impl XlSmgrTruncate {
    /// Whether the given fork is covered by the flag bits.
    pub fn truncates(&self, fork: ForkNumber) -> bool {
        let bit = match fork {
            ForkNumber::Main => SMGR_TRUNCATE_MAIN,
            ForkNumber::Fsm => SMGR_TRUNCATE_FSM,
            ForkNumber::VisibilityMap => SMGR_TRUNCATE_VM,
            ForkNumber::Init => return false,
        };
        self.flags & bit != 0
    }
}

/// One page image inside a `NEWPAGES` record.
#[derive(Clone, PartialEq, Eq)]
pub struct NewPageImage {
    /// Target block
    pub blkno: BlockNumber,
    /// Whether the page carries the standard header (LSN, checksum)
    pub standard_layout: bool,
    /// `BLOCK_BYTES` bytes
    pub image: Vec<u8>,
}

impl std::fmt::Debug for NewPageImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewPageImage")
            .field("blkno", &self.blkno)
            .field("standard_layout", &self.standard_layout)
            .field("len", &self.image.len())
            .finish()
    }
}

/// Body of `XLOG NEWPAGES`: 1 to `MAX_PENDING_WRITES` page images of one fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XlNewPages {
    /// Relation the pages belong to
    pub locator: RelFileLocator,
    /// Fork the pages belong to
    pub fork: ForkNumber,
    /// Page images in ascending block order
    pub pages: Vec<NewPageImage>,
}

impl XlNewPages {
    /// Whether every page uses the standard layout. A single non-standard
    /// page makes the whole record non-standard.
    pub fn standard_layout(&self) -> bool {
        self.pages.iter().all(|p| p.standard_layout)
    }
}

/// Body of `XLOG CHECKPOINT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XlCheckpoint {
    /// Where replay starts if this is the last checkpoint
    pub redo: Lsn,
}

/// Body of `XACT COMMIT` / `XACT ABORT`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XlXactFinish {
    /// Relations whose storage the transaction end removes
    pub dropped: Vec<RelFileLocator>,
}

/// Every record understood by redo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// `SMGR CREATE`
    SmgrCreate(XlSmgrCreate),
    /// `SMGR TRUNCATE`
    SmgrTruncate(XlSmgrTruncate),
    /// `XLOG NEWPAGES`
    NewPages(XlNewPages),
    /// `XLOG CHECKPOINT`
    Checkpoint(XlCheckpoint),
    /// `XACT COMMIT`
    XactCommit(XlXactFinish),
    /// `XACT ABORT`
    XactAbort(XlXactFinish),
}

fn corrupt(what: &str, e: std::io::Error) -> Error {
    Error::Corruption(format!("malformed {} record: {}", what, e))
}

fn read_locator(cursor: &mut Cursor<&[u8]>) -> std::io::Result<RelFileLocator> {
    let mut bytes = [0u8; REL_FILE_LOCATOR_SIZE];
    cursor.read_exact(&mut bytes)?;
    RelFileLocator::from_bytes(&bytes).ok_or_else(|| std::io::ErrorKind::UnexpectedEof.into())
}

fn read_fork(cursor: &mut Cursor<&[u8]>) -> std::io::Result<ForkNumber> {
    let raw = cursor.read_u8()?;
    ForkNumber::from_u8(raw).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid fork number {}", raw),
        )
    })
}

fn expect_consumed(cursor: &Cursor<&[u8]>, what: &str) -> Result<()> {
    if cursor.position() as usize != cursor.get_ref().len() {
        return Err(Error::Corruption(format!(
            "{} trailing bytes after {} record",
            cursor.get_ref().len() - cursor.position() as usize,
            what
        )));
    }
    Ok(())
}

impl LogRecord {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            LogRecord::SmgrCreate(_) => "SMGR CREATE",
            LogRecord::SmgrTruncate(_) => "SMGR TRUNCATE",
            LogRecord::NewPages(_) => "NEWPAGES",
            LogRecord::Checkpoint(_) => "CHECKPOINT",
            LogRecord::XactCommit(_) => "COMMIT",
            LogRecord::XactAbort(_) => "ABORT",
        }
    }

    /// Encode into a framed-ready WAL record.
    ///
    /// Fails only for a `NEWPAGES` body violating its size contract.
    pub fn encode(&self) -> Result<WalRecord> {
        let mut buf: Vec<u8> = Vec::new();
        let (rmgr, info) = match self {
            LogRecord::SmgrCreate(xl) => {
                buf.extend_from_slice(&xl.locator.to_bytes());
                buf.push(xl.fork as u8);
                (RmgrId::Smgr, XLOG_SMGR_CREATE)
            }
            LogRecord::SmgrTruncate(xl) => {
                buf.extend_from_slice(&xl.locator.to_bytes());
                buf.extend_from_slice(&xl.blkno.to_le_bytes());
                buf.extend_from_slice(&xl.flags.to_le_bytes());
                (RmgrId::Smgr, XLOG_SMGR_TRUNCATE)
            }
            LogRecord::NewPages(xl) => {
                if xl.pages.is_empty() || xl.pages.len() > MAX_PENDING_WRITES {
                    return Err(Error::InvalidOperation(format!(
                        "NEWPAGES record must carry 1..={} pages, got {}",
                        MAX_PENDING_WRITES,
                        xl.pages.len()
                    )));
                }
                buf.reserve(15 + xl.pages.len() * (5 + BLOCK_BYTES));
                buf.extend_from_slice(&xl.locator.to_bytes());
                buf.push(xl.fork as u8);
                buf.extend_from_slice(&(xl.pages.len() as u16).to_le_bytes());
                for page in &xl.pages {
                    if page.image.len() != BLOCK_BYTES {
                        return Err(Error::InvalidOperation(format!(
                            "page image for block {} is {} bytes",
                            page.blkno,
                            page.image.len()
                        )));
                    }
                    buf.extend_from_slice(&page.blkno.to_le_bytes());
                    buf.push(page.standard_layout as u8);
                    buf.extend_from_slice(&page.image);
                }
                (RmgrId::Xlog, XLOG_NEWPAGES)
            }
            LogRecord::Checkpoint(xl) => {
                buf.extend_from_slice(&xl.redo.0.to_le_bytes());
                (RmgrId::Xlog, XLOG_CHECKPOINT)
            }
            LogRecord::XactCommit(xl) | LogRecord::XactAbort(xl) => {
                buf.reserve(4 + xl.dropped.len() * REL_FILE_LOCATOR_SIZE);
                buf.extend_from_slice(&(xl.dropped.len() as u32).to_le_bytes());
                for locator in &xl.dropped {
                    buf.extend_from_slice(&locator.to_bytes());
                }
                let info = if matches!(self, LogRecord::XactCommit(_)) {
                    XLOG_XACT_COMMIT
                } else {
                    XLOG_XACT_ABORT
                };
                (RmgrId::Xact, info)
            }
        };
        Ok(WalRecord::new(rmgr, info, buf))
    }

    /// Decode a WAL record. Unknown operation codes are corruption.
    pub fn decode(record: &WalRecord) -> Result<LogRecord> {
        let mut cursor = Cursor::new(record.payload.as_slice());
        let decoded = match (record.rmgr, record.info) {
            (RmgrId::Smgr, XLOG_SMGR_CREATE) => {
                let locator = read_locator(&mut cursor).map_err(|e| corrupt("CREATE", e))?;
                let fork = read_fork(&mut cursor).map_err(|e| corrupt("CREATE", e))?;
                LogRecord::SmgrCreate(XlSmgrCreate { locator, fork })
            }
            (RmgrId::Smgr, XLOG_SMGR_TRUNCATE) => {
                let body = (|| -> std::io::Result<XlSmgrTruncate> {
                    Ok(XlSmgrTruncate {
                        locator: read_locator(&mut cursor)?,
                        blkno: cursor.read_u32::<LittleEndian>()?,
                        flags: cursor.read_u32::<LittleEndian>()?,
                    })
                })()
                .map_err(|e| corrupt("TRUNCATE", e))?;
                LogRecord::SmgrTruncate(body)
            }
            (RmgrId::Smgr, other) => {
                return Err(Error::Corruption(format!(
                    "unknown smgr op code 0x{:02X}",
                    other
                )))
            }
            (RmgrId::Xlog, XLOG_NEWPAGES) => {
                let body = (|| -> std::io::Result<XlNewPages> {
                    let locator = read_locator(&mut cursor)?;
                    let fork = read_fork(&mut cursor)?;
                    let count = cursor.read_u16::<LittleEndian>()? as usize;
                    if count == 0 || count > MAX_PENDING_WRITES {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("page count {} outside 1..={}", count, MAX_PENDING_WRITES),
                        ));
                    }
                    let mut pages = Vec::with_capacity(count);
                    for _ in 0..count {
                        let blkno = cursor.read_u32::<LittleEndian>()?;
                        let standard_layout = cursor.read_u8()? != 0;
                        let mut image = vec![0u8; BLOCK_BYTES];
                        cursor.read_exact(&mut image)?;
                        pages.push(NewPageImage {
                            blkno,
                            standard_layout,
                            image,
                        });
                    }
                    Ok(XlNewPages {
                        locator,
                        fork,
                        pages,
                    })
                })()
                .map_err(|e| corrupt("NEWPAGES", e))?;
                LogRecord::NewPages(body)
            }
            (RmgrId::Xlog, XLOG_CHECKPOINT) => {
                let redo = cursor
                    .read_u64::<LittleEndian>()
                    .map_err(|e| corrupt("CHECKPOINT", e))?;
                LogRecord::Checkpoint(XlCheckpoint { redo: Lsn(redo) })
            }
            (RmgrId::Xlog, other) => {
                return Err(Error::Corruption(format!(
                    "unknown xlog op code 0x{:02X}",
                    other
                )))
            }
            (RmgrId::Xact, info @ (XLOG_XACT_COMMIT | XLOG_XACT_ABORT)) => {
                let dropped = (|| -> std::io::Result<Vec<RelFileLocator>> {
                    let count = cursor.read_u32::<LittleEndian>()? as usize;
                    let remaining = record.payload.len().saturating_sub(4);
                    if count * REL_FILE_LOCATOR_SIZE > remaining {
                        return Err(std::io::ErrorKind::UnexpectedEof.into());
                    }
                    (0..count).map(|_| read_locator(&mut cursor)).collect()
                })()
                .map_err(|e| corrupt("XACT", e))?;
                let body = XlXactFinish { dropped };
                if info == XLOG_XACT_COMMIT {
                    LogRecord::XactCommit(body)
                } else {
                    LogRecord::XactAbort(body)
                }
            }
            (RmgrId::Xact, other) => {
                return Err(Error::Corruption(format!(
                    "unknown xact op code 0x{:02X}",
                    other
                )))
            }
        };
        expect_consumed(&cursor, decoded.name())?;
        Ok(decoded)
    }
}
