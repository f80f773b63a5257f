//! Relation key map
//!
//! Each database with encrypted relations has a map file
//! `<data>/pg_tde/<db_oid>.map`:
//!
//! ```text
//! header (120 bytes):
//!   magic u32 | db_oid u32 | principal key name [64] | sign_iv [16] | sign_tag [32]
//! entry (108 bytes), repeated:
//!   spc_oid u32 | rel_number u32 | kind u32 | entry_iv [16] | wrapped key+iv [48] | tag [32]
//! ```
//!
//! The header tag is an HMAC of the header fields under the principal key,
//! so opening a map with the wrong principal key fails instead of yielding
//! garbage relation keys. Relation keys are wrapped with a keystream derived
//! from the principal key and the entry IV, then authenticated with a tag.
//!
//! Freed entries are overwritten with an empty entry and their slot reused
//! by the next save.

use byteorder::{ByteOrder, LittleEndian};
use hmac::Mac;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use relstore_core::{Error, IoOp, Oid, RelFileLocator};
use rustc_hash::FxHashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::cipher::keyed_mac;

/// Directory under the data directory holding key maps.
pub const KEY_MAP_DIR: &str = "pg_tde";

const MAP_MAGIC: u32 = 0x0345_4454;
const NAME_LEN: usize = 64;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;
const KEY_LEN: usize = 32;
const WRAPPED_LEN: usize = KEY_LEN + IV_LEN;

const HEADER_SIZE: usize = 4 + 4 + NAME_LEN + IV_LEN + TAG_LEN;
const ENTRY_SIZE: usize = 4 + 4 + 4 + IV_LEN + WRAPPED_LEN + TAG_LEN;

const ENTRY_EMPTY: u32 = 0;
const ENTRY_SMGR: u32 = 1;

/// Key map errors.
#[derive(Debug, thiserror::Error)]
pub enum KeyMapError {
    /// Reading or writing the map failed.
    #[error("could not {op} key map \"{path}\": {source}")]
    Io {
        /// Failed operation
        op: IoOp,
        /// Map file
        path: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// The file is not a key map.
    #[error("key map \"{0}\" has an invalid header")]
    BadHeader(String),

    /// The map was written under a different principal key.
    #[error("principal key \"{name}\" does not match the key map of database {db_oid}")]
    PrincipalKeyMismatch {
        /// Database
        db_oid: Oid,
        /// Principal key name in use
        name: String,
    },

    /// An entry failed authentication.
    #[error("key map \"{path}\" entry at offset {offset} failed verification")]
    CorruptEntry {
        /// Map file
        path: String,
        /// Byte offset of the entry
        offset: u64,
    },

    /// The principal key name does not fit the header.
    #[error("principal key name longer than {} bytes", NAME_LEN)]
    NameTooLong,
}

impl From<KeyMapError> for Error {
    fn from(e: KeyMapError) -> Self {
        match e {
            KeyMapError::Io { op, path, source } => Error::io(op, path, source),
            KeyMapError::PrincipalKeyMismatch { .. } => Error::Conflict(e.to_string()),
            KeyMapError::NameTooLong => Error::Config(e.to_string()),
            other => Error::Corruption(other.to_string()),
        }
    }
}

type KeyMapResult<T> = std::result::Result<T, KeyMapError>;

/// Per-relation data key.
#[derive(Clone, PartialEq, Eq)]
pub struct InternalKey {
    /// Key material
    pub key: [u8; KEY_LEN],
    /// Base IV mixed into every page keystream
    pub base_iv: [u8; IV_LEN],
}

impl InternalKey {
    /// Fresh random key.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut key = InternalKey {
            key: [0; KEY_LEN],
            base_iv: [0; IV_LEN],
        };
        rng.fill_bytes(&mut key.key);
        rng.fill_bytes(&mut key.base_iv);
        key
    }

    fn to_bytes(&self) -> [u8; WRAPPED_LEN] {
        let mut out = [0u8; WRAPPED_LEN];
        out[..KEY_LEN].copy_from_slice(&self.key);
        out[KEY_LEN..].copy_from_slice(&self.base_iv);
        out
    }

    fn from_bytes(bytes: &[u8; WRAPPED_LEN]) -> Self {
        let mut key = InternalKey {
            key: [0; KEY_LEN],
            base_iv: [0; IV_LEN],
        };
        key.key.copy_from_slice(&bytes[..KEY_LEN]);
        key.base_iv.copy_from_slice(&bytes[KEY_LEN..]);
        key
    }
}

impl std::fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("InternalKey(..)")
    }
}

/// Cluster-wide key wrapping every relation key.
#[derive(Clone)]
pub struct PrincipalKey {
    name: String,
    key: [u8; KEY_LEN],
}

impl PrincipalKey {
    /// Principal key with explicit material.
    pub fn new(name: impl Into<String>, key: [u8; KEY_LEN]) -> Result<Self, KeyMapError> {
        let name = name.into();
        if name.len() > NAME_LEN {
            return Err(KeyMapError::NameTooLong);
        }
        Ok(PrincipalKey { name, key })
    }

    /// Principal key with random material.
    pub fn generate(name: impl Into<String>) -> Result<Self, KeyMapError> {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(name, key)
    }

    /// Key name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn header(&self, db_oid: Oid) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], MAP_MAGIC);
        LittleEndian::write_u32(&mut buf[4..8], db_oid);
        buf[8..8 + self.name.len()].copy_from_slice(self.name.as_bytes());
        let iv_at = 8 + NAME_LEN;
        rand::thread_rng().fill_bytes(&mut buf[iv_at..iv_at + IV_LEN]);
        let tag = self.sign(&buf[..iv_at + IV_LEN]);
        buf[iv_at + IV_LEN..].copy_from_slice(&tag);
        buf
    }

    fn verify_header(&self, db_oid: Oid, buf: &[u8]) -> bool {
        let signed = 8 + NAME_LEN + IV_LEN;
        LittleEndian::read_u32(&buf[4..8]) == db_oid
            && self.verify(&buf[..signed], &buf[signed..HEADER_SIZE])
    }

    fn sign(&self, data: &[u8]) -> [u8; TAG_LEN] {
        let mut mac = keyed_mac(&self.key);
        mac.update(data);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&mac.finalize().into_bytes());
        tag
    }

    fn verify(&self, data: &[u8], tag: &[u8]) -> bool {
        let mut mac = keyed_mac(&self.key);
        mac.update(data);
        mac.verify_slice(tag).is_ok()
    }

    fn keystream_xor(&self, iv: &[u8], data: &mut [u8]) {
        for (counter, chunk) in data.chunks_mut(TAG_LEN).enumerate() {
            let mut mac = keyed_mac(&self.key);
            mac.update(b"wrap");
            mac.update(iv);
            mac.update(&(counter as u32).to_le_bytes());
            let stream = mac.finalize().into_bytes();
            for (b, k) in chunk.iter_mut().zip(stream.iter()) {
                *b ^= k;
            }
        }
    }

    fn wrap_entry(&self, locator: &RelFileLocator, key: &InternalKey) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], locator.spc_oid);
        LittleEndian::write_u32(&mut buf[4..8], locator.rel_number);
        LittleEndian::write_u32(&mut buf[8..12], ENTRY_SMGR);
        let (iv_at, wrapped_at, tag_at) = (12, 12 + IV_LEN, 12 + IV_LEN + WRAPPED_LEN);
        rand::thread_rng().fill_bytes(&mut buf[iv_at..wrapped_at]);

        let mut wrapped = key.to_bytes();
        let iv = buf[iv_at..wrapped_at].to_vec();
        self.keystream_xor(&iv, &mut wrapped);
        buf[wrapped_at..tag_at].copy_from_slice(&wrapped);

        let tag = self.sign(&buf[..tag_at]);
        buf[tag_at..].copy_from_slice(&tag);
        buf
    }

    fn unwrap_entry(&self, buf: &[u8]) -> Option<InternalKey> {
        let (iv_at, wrapped_at, tag_at) = (12, 12 + IV_LEN, 12 + IV_LEN + WRAPPED_LEN);
        if !self.verify(&buf[..tag_at], &buf[tag_at..ENTRY_SIZE]) {
            return None;
        }
        let mut wrapped = [0u8; WRAPPED_LEN];
        wrapped.copy_from_slice(&buf[wrapped_at..tag_at]);
        self.keystream_xor(&buf[iv_at..wrapped_at], &mut wrapped);
        Some(InternalKey::from_bytes(&wrapped))
    }
}

impl std::fmt::Debug for PrincipalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrincipalKey")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

struct RawEntry {
    offset: u64,
    spc_oid: Oid,
    rel_number: Oid,
    kind: u32,
    bytes: [u8; ENTRY_SIZE],
}

/// Store of relation keys, one map file per database.
pub struct KeyStore {
    dir: PathBuf,
    principal: RwLock<PrincipalKey>,
    // Serializes map file rewrites.
    write_lock: Mutex<()>,
    cache: Mutex<FxHashMap<RelFileLocator, InternalKey>>,
}

impl KeyStore {
    /// Open the key store of a data directory, creating `pg_tde/` if needed.
    pub fn open(data_dir: &Path, principal: PrincipalKey) -> Result<Self, KeyMapError> {
        let dir = data_dir.join(KEY_MAP_DIR);
        std::fs::create_dir_all(&dir).map_err(|source| KeyMapError::Io {
            op: IoOp::Open,
            path: dir.display().to_string(),
            source,
        })?;
        Ok(KeyStore {
            dir,
            principal: RwLock::new(principal),
            write_lock: Mutex::new(()),
            cache: Mutex::new(FxHashMap::default()),
        })
    }

    /// Map file of a database.
    pub fn map_path(&self, db_oid: Oid) -> PathBuf {
        self.dir.join(format!("{}.map", db_oid))
    }

    /// Name of the principal key in use.
    pub fn principal_name(&self) -> String {
        self.principal.read().name().to_string()
    }

    fn io_err(op: IoOp, path: &Path) -> impl FnOnce(io::Error) -> KeyMapError + '_ {
        move |source| KeyMapError::Io {
            op,
            path: path.display().to_string(),
            source,
        }
    }

    /// Open a map for reading. `None` if it does not exist.
    fn open_read(&self, db_oid: Oid, principal: &PrincipalKey) -> KeyMapResult<Option<File>> {
        let path = self.map_path(db_oid);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_err(IoOp::Open, &path)(e)),
        };
        self.check_header(&file, &path, db_oid, principal)?;
        Ok(Some(file))
    }

    /// Open a map for writing, creating it with a signed header if new.
    fn open_write(&self, db_oid: Oid, principal: &PrincipalKey) -> KeyMapResult<File> {
        let path = self.map_path(db_oid);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(Self::io_err(IoOp::Open, &path))?;
        let len = file
            .metadata()
            .map_err(Self::io_err(IoOp::Seek, &path))?
            .len();
        if len == 0 {
            file.write_all_at(&principal.header(db_oid), 0)
                .map_err(Self::io_err(IoOp::Write, &path))?;
        } else {
            self.check_header(&file, &path, db_oid, principal)?;
        }
        Ok(file)
    }

    fn check_header(&self, file: &File, path: &Path, db_oid: Oid, principal: &PrincipalKey) -> KeyMapResult<()> {
        let mut header = [0u8; HEADER_SIZE];
        file.read_exact_at(&mut header, 0).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                KeyMapError::BadHeader(path.display().to_string())
            } else {
                Self::io_err(IoOp::Read, path)(e)
            }
        })?;
        if LittleEndian::read_u32(&header[0..4]) != MAP_MAGIC {
            return Err(KeyMapError::BadHeader(path.display().to_string()));
        }
        if !principal.verify_header(db_oid, &header) {
            return Err(KeyMapError::PrincipalKeyMismatch {
                db_oid,
                name: principal.name().to_string(),
            });
        }
        Ok(())
    }

    fn read_entries(file: &File, path: &Path) -> KeyMapResult<Vec<RawEntry>> {
        let len = file
            .metadata()
            .map_err(Self::io_err(IoOp::Seek, path))?
            .len();
        let mut entries = Vec::new();
        let mut offset = HEADER_SIZE as u64;
        while offset + ENTRY_SIZE as u64 <= len {
            let mut bytes = [0u8; ENTRY_SIZE];
            file.read_exact_at(&mut bytes, offset)
                .map_err(Self::io_err(IoOp::Read, path))?;
            entries.push(RawEntry {
                offset,
                spc_oid: LittleEndian::read_u32(&bytes[0..4]),
                rel_number: LittleEndian::read_u32(&bytes[4..8]),
                kind: LittleEndian::read_u32(&bytes[8..12]),
                bytes,
            });
            offset += ENTRY_SIZE as u64;
        }
        Ok(entries)
    }

    fn matches(entry: &RawEntry, locator: &RelFileLocator) -> bool {
        entry.kind != ENTRY_EMPTY
            && entry.spc_oid == locator.spc_oid
            && entry.rel_number == locator.rel_number
    }

    /// Generate, store and return a new key for `locator`, replacing any old one.
    pub fn create_key(&self, locator: &RelFileLocator) -> Result<InternalKey, KeyMapError> {
        let key = InternalKey::generate();
        self.free_key(locator)?;
        self.save_key(locator, &key)?;
        Ok(key)
    }

    /// Persist `key` for `locator` in the first free slot of the map.
    pub fn save_key(&self, locator: &RelFileLocator, key: &InternalKey) -> Result<(), KeyMapError> {
        let _guard = self.write_lock.lock();
        let principal = self.principal.read().clone();
        let path = self.map_path(locator.db_oid);
        let file = self.open_write(locator.db_oid, &principal)?;

        let entries = Self::read_entries(&file, &path)?;
        let offset = entries
            .iter()
            .find(|e| e.kind == ENTRY_EMPTY)
            .map(|e| e.offset)
            .unwrap_or(HEADER_SIZE as u64 + (entries.len() * ENTRY_SIZE) as u64);

        file.write_all_at(&principal.wrap_entry(locator, key), offset)
            .map_err(Self::io_err(IoOp::Write, &path))?;
        file.sync_all().map_err(Self::io_err(IoOp::Fsync, &path))?;

        self.cache.lock().insert(*locator, key.clone());
        debug!(target: "relstore::tde", %locator, offset, "saved relation key");
        Ok(())
    }

    /// Key of `locator`, if one is stored.
    pub fn get_key(&self, locator: &RelFileLocator) -> Result<Option<InternalKey>, KeyMapError> {
        if let Some(key) = self.cache.lock().get(locator) {
            return Ok(Some(key.clone()));
        }

        let principal = self.principal.read().clone();
        let path = self.map_path(locator.db_oid);
        let Some(file) = self.open_read(locator.db_oid, &principal)? else {
            return Ok(None);
        };
        for entry in Self::read_entries(&file, &path)? {
            if !Self::matches(&entry, locator) {
                continue;
            }
            let key = principal
                .unwrap_entry(&entry.bytes)
                .ok_or_else(|| KeyMapError::CorruptEntry {
                    path: path.display().to_string(),
                    offset: entry.offset,
                })?;
            self.cache.lock().insert(*locator, key.clone());
            return Ok(Some(key));
        }
        Ok(None)
    }

    /// Whether a key is stored for `locator`.
    pub fn has_key(&self, locator: &RelFileLocator) -> Result<bool, KeyMapError> {
        Ok(self.get_key(locator)?.is_some())
    }

    /// Mark the entry of `locator` empty. Missing entries are ignored.
    pub fn free_key(&self, locator: &RelFileLocator) -> Result<(), KeyMapError> {
        let _guard = self.write_lock.lock();
        self.cache.lock().remove(locator);

        let principal = self.principal.read().clone();
        let path = self.map_path(locator.db_oid);
        if !path.exists() {
            return Ok(());
        }
        let file = self.open_write(locator.db_oid, &principal)?;
        let mut freed = false;
        for entry in Self::read_entries(&file, &path)? {
            if Self::matches(&entry, locator) {
                file.write_all_at(&[0u8; ENTRY_SIZE], entry.offset)
                    .map_err(Self::io_err(IoOp::Write, &path))?;
                freed = true;
            }
        }
        if freed {
            file.sync_all().map_err(Self::io_err(IoOp::Fsync, &path))?;
            debug!(target: "relstore::tde", %locator, "freed relation key");
        }
        Ok(())
    }

    /// Remove a database's key map.
    pub fn delete_database(&self, db_oid: Oid) -> Result<(), KeyMapError> {
        let _guard = self.write_lock.lock();
        self.cache.lock().retain(|locator, _| locator.db_oid != db_oid);
        let path = self.map_path(db_oid);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(target: "relstore::tde", db_oid, "removed key map");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(IoOp::Unlink, &path)(e)),
        }
    }

    /// Re-wrap every stored key under `new_principal`.
    ///
    /// Each map is rewritten to `<db>.map.r` and renamed over the old one.
    pub fn rotate_principal_key(&self, new_principal: PrincipalKey) -> Result<(), KeyMapError> {
        let _guard = self.write_lock.lock();
        let old = self.principal.read().clone();

        let entries = std::fs::read_dir(&self.dir).map_err(Self::io_err(IoOp::Read, &self.dir))?;
        let mut rotated = 0;
        for entry in entries {
            let entry = entry.map_err(Self::io_err(IoOp::Read, &self.dir))?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(db_oid) = name.strip_suffix(".map").and_then(|s| s.parse::<Oid>().ok()) else {
                continue;
            };
            self.rotate_map(db_oid, &old, &new_principal)?;
            rotated += 1;
        }

        *self.principal.write() = new_principal;
        info!(target: "relstore::tde", maps = rotated, "rotated principal key");
        Ok(())
    }

    fn rotate_map(&self, db_oid: Oid, old: &PrincipalKey, new: &PrincipalKey) -> KeyMapResult<()> {
        let path = self.map_path(db_oid);
        let Some(file) = self.open_read(db_oid, old)? else {
            return Ok(());
        };
        let mut out = Vec::from(new.header(db_oid));
        for entry in Self::read_entries(&file, &path)? {
            if entry.kind == ENTRY_EMPTY {
                continue;
            }
            let key = old
                .unwrap_entry(&entry.bytes)
                .ok_or_else(|| KeyMapError::CorruptEntry {
                    path: path.display().to_string(),
                    offset: entry.offset,
                })?;
            let locator = RelFileLocator::new(entry.spc_oid, db_oid, entry.rel_number);
            out.extend_from_slice(&new.wrap_entry(&locator, &key));
        }

        let tmp = self.dir.join(format!("{}.map.r", db_oid));
        let tmp_file = File::create(&tmp).map_err(Self::io_err(IoOp::Open, &tmp))?;
        tmp_file
            .write_all_at(&out, 0)
            .map_err(Self::io_err(IoOp::Write, &tmp))?;
        tmp_file.sync_all().map_err(Self::io_err(IoOp::Fsync, &tmp))?;
        std::fs::rename(&tmp, &path).map_err(Self::io_err(IoOp::Rename, &path))?;
        if let Ok(dir) = File::open(&self.dir) {
            dir.sync_all().map_err(Self::io_err(IoOp::Fsync, &self.dir))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("dir", &self.dir)
            .field("principal", &self.principal_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn principal(fill: u8) -> PrincipalKey {
        PrincipalKey::new("cluster-key", [fill; KEY_LEN]).unwrap()
    }

    fn loc(rel: u32) -> RelFileLocator {
        RelFileLocator::new(1663, 5, rel)
    }

    #[test]
    fn test_save_and_get() {
        let dir = tempdir().unwrap();
        let store = KeyStore::open(dir.path(), principal(1)).unwrap();
        let key = store.create_key(&loc(16384)).unwrap();
        assert_eq!(store.get_key(&loc(16384)).unwrap(), Some(key.clone()));
        assert!(store.get_key(&loc(16385)).unwrap().is_none());

        // A fresh store reads the key back from disk.
        let store = KeyStore::open(dir.path(), principal(1)).unwrap();
        assert_eq!(store.get_key(&loc(16384)).unwrap(), Some(key));
    }

    #[test]
    fn test_wrong_principal_key_detected() {
        let dir = tempdir().unwrap();
        KeyStore::open(dir.path(), principal(1))
            .unwrap()
            .create_key(&loc(16384))
            .unwrap();
        let store = KeyStore::open(dir.path(), principal(2)).unwrap();
        assert!(matches!(
            store.get_key(&loc(16384)),
            Err(KeyMapError::PrincipalKeyMismatch { db_oid: 5, .. })
        ));
    }

    #[test]
    fn test_free_slot_reused() {
        let dir = tempdir().unwrap();
        let store = KeyStore::open(dir.path(), principal(1)).unwrap();
        store.create_key(&loc(1)).unwrap();
        store.create_key(&loc(2)).unwrap();
        let len = std::fs::metadata(store.map_path(5)).unwrap().len();
        assert_eq!(len, (HEADER_SIZE + 2 * ENTRY_SIZE) as u64);

        store.free_key(&loc(1)).unwrap();
        assert!(!store.has_key(&loc(1)).unwrap());
        store.create_key(&loc(3)).unwrap();
        assert_eq!(std::fs::metadata(store.map_path(5)).unwrap().len(), len);
        assert!(store.has_key(&loc(2)).unwrap());
        assert!(store.has_key(&loc(3)).unwrap());
    }

    #[test]
    fn test_create_replaces_existing_key() {
        let dir = tempdir().unwrap();
        let store = KeyStore::open(dir.path(), principal(1)).unwrap();
        let first = store.create_key(&loc(1)).unwrap();
        let second = store.create_key(&loc(1)).unwrap();
        assert_ne!(first, second);
        let reopened = KeyStore::open(dir.path(), principal(1)).unwrap();
        assert_eq!(reopened.get_key(&loc(1)).unwrap(), Some(second));
    }

    #[test]
    fn test_tampered_entry_rejected() {
        let dir = tempdir().unwrap();
        let store = KeyStore::open(dir.path(), principal(1)).unwrap();
        store.create_key(&loc(1)).unwrap();
        let path = store.map_path(5);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE + 20] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let store = KeyStore::open(dir.path(), principal(1)).unwrap();
        assert!(matches!(
            store.get_key(&loc(1)),
            Err(KeyMapError::CorruptEntry { .. })
        ));
    }

    #[test]
    fn test_delete_database() {
        let dir = tempdir().unwrap();
        let store = KeyStore::open(dir.path(), principal(1)).unwrap();
        store.create_key(&loc(1)).unwrap();
        store.delete_database(5).unwrap();
        assert!(!store.map_path(5).exists());
        assert!(store.get_key(&loc(1)).unwrap().is_none());
        store.delete_database(5).unwrap();
    }

    #[test]
    fn test_rotate_principal_key() {
        let dir = tempdir().unwrap();
        let store = KeyStore::open(dir.path(), principal(1)).unwrap();
        let key = store.create_key(&loc(1)).unwrap();
        store.create_key(&loc(2)).unwrap();
        store.free_key(&loc(2)).unwrap();

        store.rotate_principal_key(principal(9)).unwrap();
        let len = std::fs::metadata(store.map_path(5)).unwrap().len();
        assert_eq!(len, (HEADER_SIZE + ENTRY_SIZE) as u64);

        let reopened = KeyStore::open(dir.path(), principal(9)).unwrap();
        assert_eq!(reopened.get_key(&loc(1)).unwrap(), Some(key));
        let stale = KeyStore::open(dir.path(), principal(1)).unwrap();
        assert!(stale.get_key(&loc(1)).is_err());
    }

    #[test]
    fn test_name_too_long() {
        assert!(matches!(
            PrincipalKey::new("x".repeat(65), [0; KEY_LEN]),
            Err(KeyMapError::NameTooLong)
        ));
    }
}
