//! Core identifiers for relation storage
//!
//! This module defines the foundational types:
//! - RelFileLocator: (tablespace, database, relation number) triple
//! - BackendOwner: shared vs. process-private (temporary) relations
//! - RelFileLocatorBackend: locator plus owner, the key of every open handle
//! - ForkNumber: the independent block streams of a relation
//! - Lsn: position in the write-ahead log

use serde::{Deserialize, Serialize};
use std::fmt;

/// Object identifier.
pub type Oid = u32;

/// Block number within a fork, origin 0.
pub type BlockNumber = u32;

/// Sentinel for "no block" / "unknown block count".
pub const INVALID_BLOCK_NUMBER: BlockNumber = u32::MAX;

/// Identifier of a session ("backend process") within the cluster.
pub type ProcNumber = u32;

/// Invalid object identifier.
pub const INVALID_OID: Oid = 0;

/// Tablespace holding ordinary databases.
pub const DEFAULT_TABLESPACE_OID: Oid = 1663;

/// Tablespace holding shared catalogs.
pub const GLOBAL_TABLESPACE_OID: Oid = 1664;

/// Physical identity of a relation's storage.
///
/// Two locators are equal iff all three components are equal. The derived
/// `Hash`/`Eq` compare fields, never raw memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelFileLocator {
    /// Tablespace oid
    pub spc_oid: Oid,
    /// Database oid (0 for shared relations)
    pub db_oid: Oid,
    /// Relation file number
    pub rel_number: Oid,
}

/// Encoded size of a locator in WAL records and shared-memory hand-offs.
pub const REL_FILE_LOCATOR_SIZE: usize = 12;

impl RelFileLocator {
    /// Create a locator.
    pub const fn new(spc_oid: Oid, db_oid: Oid, rel_number: Oid) -> Self {
        RelFileLocator {
            spc_oid,
            db_oid,
            rel_number,
        }
    }

    /// The all-zero locator, used as a terminator in serialized lists.
    pub const fn invalid() -> Self {
        RelFileLocator::new(INVALID_OID, INVALID_OID, INVALID_OID)
    }

    /// Whether this is the all-zero terminator.
    pub fn is_invalid(&self) -> bool {
        self.rel_number == INVALID_OID
    }

    /// Whether the relation number falls in the reserved catalog range.
    pub fn is_catalog(&self) -> bool {
        self.rel_number < crate::limits::FIRST_NORMAL_OBJECT_ID
    }

    /// Serialize to 12 little-endian bytes.
    pub fn to_bytes(&self) -> [u8; REL_FILE_LOCATOR_SIZE] {
        let mut bytes = [0u8; REL_FILE_LOCATOR_SIZE];
        bytes[0..4].copy_from_slice(&self.spc_oid.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.db_oid.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.rel_number.to_le_bytes());
        bytes
    }

    /// Deserialize from at least 12 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < REL_FILE_LOCATOR_SIZE {
            return None;
        }
        Some(RelFileLocator {
            spc_oid: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            db_oid: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            rel_number: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
        })
    }
}

impl fmt::Display for RelFileLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.spc_oid, self.db_oid, self.rel_number)
    }
}

/// Who may see a relation's files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BackendOwner {
    /// Visible to every session; WAL-logged and fsynced when permanent.
    Shared,
    /// Private to one session; never WAL-logged, fsynced or registered for sync.
    Temp(ProcNumber),
}

impl BackendOwner {
    /// Whether this is a session-private relation.
    pub fn is_temp(&self) -> bool {
        matches!(self, BackendOwner::Temp(_))
    }
}

/// Locator qualified by its owner; the key of the SMGR relation cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelFileLocatorBackend {
    /// Physical identity
    pub locator: RelFileLocator,
    /// Owner tag
    pub owner: BackendOwner,
}

impl RelFileLocatorBackend {
    /// Create a qualified locator.
    pub const fn new(locator: RelFileLocator, owner: BackendOwner) -> Self {
        RelFileLocatorBackend { locator, owner }
    }

    /// Shorthand for a shared relation.
    pub const fn shared(locator: RelFileLocator) -> Self {
        RelFileLocatorBackend::new(locator, BackendOwner::Shared)
    }

    /// Whether the relation is session-private.
    pub fn is_temp(&self) -> bool {
        self.owner.is_temp()
    }
}

impl fmt::Display for RelFileLocatorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.owner {
            BackendOwner::Shared => write!(f, "{}", self.locator),
            BackendOwner::Temp(proc) => write!(
                f,
                "{}/{}/t{}_{}",
                self.locator.spc_oid, self.locator.db_oid, proc, self.locator.rel_number
            ),
        }
    }
}

/// Independent block streams of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ForkNumber {
    /// Relation data
    Main = 0,
    /// Free-space map
    Fsm = 1,
    /// Visibility map
    VisibilityMap = 2,
    /// Initialization fork of unlogged relations
    Init = 3,
}

/// Number of fork kinds.
pub const FORK_COUNT: usize = 4;

impl ForkNumber {
    /// All forks in numeric order.
    pub const ALL: [ForkNumber; FORK_COUNT] = [
        ForkNumber::Main,
        ForkNumber::Fsm,
        ForkNumber::VisibilityMap,
        ForkNumber::Init,
    ];

    /// Decode a fork number; `None` for the invalid sentinel or unknown values.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ForkNumber::Main),
            1 => Some(ForkNumber::Fsm),
            2 => Some(ForkNumber::VisibilityMap),
            3 => Some(ForkNumber::Init),
            _ => None,
        }
    }

    /// Index into per-fork arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// File name suffix, without the leading underscore. `None` for MAIN.
    pub fn suffix(self) -> Option<&'static str> {
        match self {
            ForkNumber::Main => None,
            ForkNumber::Fsm => Some("fsm"),
            ForkNumber::VisibilityMap => Some("vm"),
            ForkNumber::Init => Some("init"),
        }
    }

    /// Parse a file name suffix (`None` means MAIN).
    pub fn from_suffix(suffix: Option<&str>) -> Option<Self> {
        match suffix {
            None => Some(ForkNumber::Main),
            Some("fsm") => Some(ForkNumber::Fsm),
            Some("vm") => Some(ForkNumber::VisibilityMap),
            Some("init") => Some(ForkNumber::Init),
            Some(_) => None,
        }
    }
}

impl fmt::Display for ForkNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkNumber::Main => write!(f, "main"),
            other => write!(f, "{}", other.suffix().unwrap_or("main")),
        }
    }
}

/// Durability class of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelPersistence {
    /// WAL-logged, survives crashes
    Permanent,
    /// Not WAL-logged, shared between sessions
    Unlogged,
    /// Session-private, never WAL-logged or fsynced
    Temp,
}

impl RelPersistence {
    /// Whether the relation outlives the creating session.
    pub fn is_persistent(&self) -> bool {
        !matches!(self, RelPersistence::Temp)
    }
}

/// Position in the write-ahead log.
///
/// The high 32 bits hold the WAL segment number and the low 32 bits the
/// byte offset inside that segment, so ordering matches log order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The invalid position.
    pub const INVALID: Lsn = Lsn(0);

    /// Build from segment number and offset.
    pub fn from_parts(segment: u32, offset: u32) -> Self {
        Lsn(((segment as u64) << 32) | offset as u64)
    }

    /// Segment number component.
    pub fn segment(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Offset component.
    pub fn offset(&self) -> u32 {
        self.0 as u32
    }

    /// Whether this is a real position.
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_equality_is_componentwise() {
        let a = RelFileLocator::new(1663, 5, 16384);
        let b = RelFileLocator::new(1663, 5, 16384);
        let c = RelFileLocator::new(1663, 6, 16384);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_locator_bytes() {
        let loc = RelFileLocator::new(1663, 5, 16385);
        let bytes = loc.to_bytes();
        assert_eq!(RelFileLocator::from_bytes(&bytes), Some(loc));
        assert_eq!(RelFileLocator::from_bytes(&bytes[..11]), None);
    }

    #[test]
    fn test_locator_display() {
        let loc = RelFileLocator::new(1663, 5, 16385);
        assert_eq!(loc.to_string(), "1663/5/16385");
        let temp = RelFileLocatorBackend::new(loc, BackendOwner::Temp(3));
        assert_eq!(temp.to_string(), "1663/5/t3_16385");
    }

    #[test]
    fn test_catalog_range() {
        assert!(RelFileLocator::new(1663, 5, 1259).is_catalog());
        assert!(!RelFileLocator::new(1663, 5, 16384).is_catalog());
    }

    #[test]
    fn test_fork_suffixes() {
        for fork in ForkNumber::ALL {
            assert_eq!(ForkNumber::from_suffix(fork.suffix()), Some(fork));
            assert_eq!(ForkNumber::from_u8(fork as u8), Some(fork));
        }
        assert_eq!(ForkNumber::from_u8(4), None);
        assert_eq!(ForkNumber::from_u8(0xFF), None);
        assert_eq!(ForkNumber::from_suffix(Some("bogus")), None);
    }

    #[test]
    fn test_lsn_parts_and_order() {
        let a = Lsn::from_parts(1, 100);
        let b = Lsn::from_parts(2, 0);
        assert_eq!(a.segment(), 1);
        assert_eq!(a.offset(), 100);
        assert!(a < b);
        assert_eq!(a.to_string(), "1/64");
        assert!(!Lsn::INVALID.is_valid());
    }
}
