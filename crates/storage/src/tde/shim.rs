//! Encrypting wrapper around the magnetic-disk backend.

use relstore_core::{
    BlockNumber, Error, ForkNumber, Oid, RelFileLocatorBackend, Result, BLOCK_BYTES,
};
use std::sync::Arc;
use tracing::debug;

use super::cipher::{HmacCtrCipher, PageCipher};
use super::keys::{InternalKey, KeyStore};
use crate::backend::{check_block_buffer, state_mut, BackendState, StorageBackend};
use crate::md::{MdBackend, MdState};
use crate::sync::FileTag;

/// Whether a relation's pages pass through the cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionStatus {
    /// Catalog, session-private, or created without a key
    Unencrypted,
    /// Key loaded into the handle
    KeyAvailable,
    /// Not looked up yet
    KeyNotAvailable,
}

/// Per-handle state of [`TdeBackend`].
pub struct TdeState {
    /// State of the wrapped backend
    pub md: MdState,
    status: EncryptionStatus,
    key: Option<InternalKey>,
}

impl TdeState {
    /// Current encryption status.
    pub fn status(&self) -> EncryptionStatus {
        self.status
    }
}

impl std::fmt::Debug for TdeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TdeState")
            .field("rel", &self.md.rel())
            .field("status", &self.status)
            .finish()
    }
}

/// Transparent data encryption over [`MdBackend`].
///
/// Intercepts create, extend, writev, readv and unlink; every other
/// operation is delegated to the wrapped backend unchanged. All-zero pages
/// are stored as zeros so gap fills stay recognizable.
pub struct TdeBackend {
    md: Arc<MdBackend>,
    keys: Arc<KeyStore>,
    cipher: Box<dyn PageCipher>,
}

fn is_zero_page(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

fn encrypted_candidate(rel: &RelFileLocatorBackend) -> bool {
    !rel.is_temp() && !rel.locator.is_catalog()
}

impl TdeBackend {
    /// Backend name.
    pub const NAME: &'static str = "tde";

    /// Wrap `md` with the default page cipher.
    pub fn new(md: Arc<MdBackend>, keys: Arc<KeyStore>) -> Self {
        Self::with_cipher(md, keys, Box::new(HmacCtrCipher))
    }

    /// Wrap `md` with a custom page cipher.
    pub fn with_cipher(md: Arc<MdBackend>, keys: Arc<KeyStore>, cipher: Box<dyn PageCipher>) -> Self {
        TdeBackend { md, keys, cipher }
    }

    /// Key store backing the shim.
    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    fn state<'a>(&self, state: &'a mut BackendState) -> Result<&'a mut TdeState> {
        state_mut::<TdeState>(state, Self::NAME)
    }

    /// Resolve the key of a handle on first use.
    fn resolve_key<'a>(&self, st: &'a mut TdeState) -> Result<Option<&'a InternalKey>> {
        if st.status == EncryptionStatus::KeyNotAvailable {
            match self.keys.get_key(&st.md.rel().locator)? {
                Some(key) => {
                    st.key = Some(key);
                    st.status = EncryptionStatus::KeyAvailable;
                }
                None => st.status = EncryptionStatus::Unencrypted,
            }
        }
        Ok(match st.status {
            EncryptionStatus::KeyAvailable => st.key.as_ref(),
            _ => None,
        })
    }

    /// Copy `page` into `scratch` and encrypt it, unless it is all zero.
    fn encrypt_into<'p>(
        &self,
        key: &InternalKey,
        blkno: BlockNumber,
        page: &'p [u8],
        scratch: &'p mut Vec<u8>,
    ) -> &'p [u8] {
        if is_zero_page(page) {
            return page;
        }
        scratch.clear();
        scratch.extend_from_slice(page);
        self.cipher.encrypt(key, blkno, scratch);
        scratch
    }
}

impl StorageBackend for TdeBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn open(&self, rel: RelFileLocatorBackend) -> Result<BackendState> {
        let status = if encrypted_candidate(&rel) {
            EncryptionStatus::KeyNotAvailable
        } else {
            EncryptionStatus::Unencrypted
        };
        Ok(Box::new(TdeState {
            md: MdState::new(rel),
            status,
            key: None,
        }))
    }

    fn close(&self, state: &mut BackendState, fork: ForkNumber) {
        if let Some(st) = state.downcast_mut::<TdeState>() {
            st.md.close_fork(fork);
        }
    }

    fn create(&self, state: &mut BackendState, fork: ForkNumber, is_redo: bool) -> Result<()> {
        let st = self.state(state)?;
        let rel = st.md.rel();
        let already_open = st.md.open_segments(fork) > 0;
        self.md.create_fork(&mut st.md, fork, is_redo)?;

        // Only a segment created just now is known to hold no pages
        // encrypted under an earlier key.
        if fork == ForkNumber::Main && !is_redo && !already_open && encrypted_candidate(&rel) {
            let key = self.keys.create_key(&rel.locator)?;
            st.key = Some(key);
            st.status = EncryptionStatus::KeyAvailable;
            debug!(target: "relstore::tde", %rel, "created relation key");
        }
        Ok(())
    }

    fn exists(&self, state: &mut BackendState, fork: ForkNumber) -> Result<bool> {
        self.md.fork_exists(&mut self.state(state)?.md, fork)
    }

    fn unlink(&self, rel: RelFileLocatorBackend, fork: ForkNumber, is_redo: bool) -> Result<()> {
        self.md.unlink_fork(rel, fork, is_redo)?;
        if fork == ForkNumber::Main && encrypted_candidate(&rel) {
            self.keys.free_key(&rel.locator)?;
        }
        Ok(())
    }

    fn extend(
        &self,
        state: &mut BackendState,
        fork: ForkNumber,
        blkno: BlockNumber,
        buffer: &[u8],
        skip_fsync: bool,
    ) -> Result<()> {
        check_block_buffer(buffer.len())?;
        let st = self.state(state)?;
        let Some(key) = self.resolve_key(st)?.cloned() else {
            return self.md.extend_fork(&mut st.md, fork, blkno, buffer, skip_fsync);
        };
        let mut scratch = Vec::with_capacity(BLOCK_BYTES);
        let page = self.encrypt_into(&key, blkno, buffer, &mut scratch);
        self.md.extend_fork(&mut st.md, fork, blkno, page, skip_fsync)
    }

    fn zeroextend(
        &self,
        state: &mut BackendState,
        fork: ForkNumber,
        blkno: BlockNumber,
        nblocks: u32,
        skip_fsync: bool,
    ) -> Result<()> {
        self.md
            .zeroextend_fork(&mut self.state(state)?.md, fork, blkno, nblocks, skip_fsync)
    }

    fn prefetch(
        &self,
        state: &mut BackendState,
        fork: ForkNumber,
        blkno: BlockNumber,
        _nblocks: u32,
    ) -> Result<bool> {
        self.md.prefetch_blocks(&mut self.state(state)?.md, fork, blkno)
    }

    fn readv(
        &self,
        state: &mut BackendState,
        fork: ForkNumber,
        blkno: BlockNumber,
        buffers: &mut [&mut [u8]],
    ) -> Result<()> {
        let st = self.state(state)?;
        self.md.read_blocks(&mut st.md, fork, blkno, buffers)?;
        let Some(key) = self.resolve_key(st)? else {
            return Ok(());
        };
        for (i, page) in buffers.iter_mut().enumerate() {
            if !is_zero_page(page) {
                self.cipher.decrypt(key, blkno + i as BlockNumber, page);
            }
        }
        Ok(())
    }

    fn writev(
        &self,
        state: &mut BackendState,
        fork: ForkNumber,
        blkno: BlockNumber,
        buffers: &[&[u8]],
        skip_fsync: bool,
    ) -> Result<()> {
        for buf in buffers {
            check_block_buffer(buf.len())?;
        }
        let st = self.state(state)?;
        let Some(key) = self.resolve_key(st)?.cloned() else {
            return self.md.write_blocks(&mut st.md, fork, blkno, buffers, skip_fsync);
        };

        let mut encrypted: Vec<Vec<u8>> = Vec::with_capacity(buffers.len());
        for (i, page) in buffers.iter().enumerate() {
            let mut out = page.to_vec();
            if !is_zero_page(page) {
                self.cipher.encrypt(&key, blkno + i as BlockNumber, &mut out);
            }
            encrypted.push(out);
        }
        let pages: Vec<&[u8]> = encrypted.iter().map(Vec::as_slice).collect();
        self.md.write_blocks(&mut st.md, fork, blkno, &pages, skip_fsync)
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
        self.md.fork_nblocks(&mut self.state(state)?.md, fork)
    }

    fn truncate(
        &self,
        state: &mut BackendState,
        fork: ForkNumber,
        old_nblocks: BlockNumber,
        nblocks: BlockNumber,
    ) -> Result<()> {
        self.md
            .truncate_fork(&mut self.state(state)?.md, fork, old_nblocks, nblocks)
    }

    fn immedsync(&self, state: &mut BackendState, fork: ForkNumber) -> Result<()> {
        self.md.immedsync_fork(&mut self.state(state)?.md, fork)
    }

    fn registersync(&self, state: &mut BackendState, fork: ForkNumber) -> Result<()> {
        self.md.registersync_fork(&mut self.state(state)?.md, fork)
    }

    fn sync_file(&self, tag: &FileTag) -> Result<()> {
        self.md.sync_tag(tag)
    }

    fn drop_database(&self, db_oid: Oid) -> Result<()> {
        self.keys.delete_database(db_oid).map_err(Error::from)
    }
}

impl std::fmt::Debug for TdeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TdeBackend")
            .field("cipher", &self.cipher.cipher_id())
            .field("keys", &self.keys)
            .finish()
    }
}
