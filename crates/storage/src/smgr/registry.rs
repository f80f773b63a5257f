//! Backend registry
//!
//! Process-wide table of storage backends. The magnetic-disk backend always
//! occupies slot zero; a single wrapper backend may be installed on top of
//! it before the first relation is opened.

use parking_lot::RwLock;
use relstore_core::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::backend::{BackendId, StorageBackend, MD_BACKEND_ID};
use crate::md::MdBackend;
use crate::sync::{FileTag, SyncFileHandler};

/// Table of registered storage backends.
pub struct BackendRegistry {
    md: Arc<MdBackend>,
    backends: RwLock<Vec<Arc<dyn StorageBackend>>>,
    active: AtomicU8,
    relations_opened: AtomicBool,
    shim_installed: AtomicBool,
}

impl BackendRegistry {
    /// Create a registry with `md` in slot zero as the active backend.
    pub fn new(md: Arc<MdBackend>) -> Self {
        let slot0: Arc<dyn StorageBackend> = md.clone();
        BackendRegistry {
            md,
            backends: RwLock::new(vec![slot0]),
            active: AtomicU8::new(MD_BACKEND_ID),
            relations_opened: AtomicBool::new(false),
            shim_installed: AtomicBool::new(false),
        }
    }

    /// The magnetic-disk backend.
    pub fn md(&self) -> &Arc<MdBackend> {
        &self.md
    }

    /// Append a backend and return its id.
    ///
    /// Registration is a startup-time operation: it fails once any
    /// relation has been opened.
    pub fn register_backend(&self, backend: Arc<dyn StorageBackend>) -> Result<BackendId> {
        if self.relations_opened.load(Ordering::Acquire) {
            return Err(Error::InvalidOperation(format!(
                "cannot register storage backend \"{}\" after relations were opened",
                backend.name()
            )));
        }
        let mut backends = self.backends.write();
        let id = BackendId::try_from(backends.len()).map_err(|_| {
            Error::InvalidOperation("too many storage backends registered".to_string())
        })?;
        info!(target: "relstore::smgr", id, name = backend.name(), "registered storage backend");
        backends.push(backend);
        Ok(id)
    }

    /// Select the backend used for newly opened relations.
    pub fn set_active_backend(&self, id: BackendId) -> Result<()> {
        if (id as usize) >= self.backends.read().len() {
            return Err(Error::InvalidOperation(format!(
                "unknown storage backend id {}",
                id
            )));
        }
        self.active.store(id, Ordering::Release);
        Ok(())
    }

    /// Register a wrapper backend and make it active.
    ///
    /// Only one wrapper may be installed, and only before any relation is
    /// opened; both violations are a [`Error::Conflict`].
    pub fn install_shim(&self, backend: Arc<dyn StorageBackend>) -> Result<BackendId> {
        if self.relations_opened.load(Ordering::Acquire) {
            return Err(Error::Conflict(format!(
                "storage backend \"{}\" must be installed before any relation is opened",
                backend.name()
            )));
        }
        if self.shim_installed.swap(true, Ordering::AcqRel) {
            return Err(Error::Conflict(format!(
                "cannot install storage backend \"{}\": a wrapper backend is already installed",
                backend.name()
            )));
        }
        let id = match self.register_backend(backend) {
            Ok(id) => id,
            Err(e) => {
                self.shim_installed.store(false, Ordering::Release);
                return Err(e);
            }
        };
        self.set_active_backend(id)?;
        Ok(id)
    }

    /// Id of the active backend.
    pub fn active_backend_id(&self) -> BackendId {
        self.active.load(Ordering::Acquire)
    }

    /// The active backend and its id.
    pub fn active(&self) -> Result<(BackendId, Arc<dyn StorageBackend>)> {
        let id = self.active_backend_id();
        Ok((id, self.get(id)?))
    }

    /// Look up a backend by id.
    pub fn get(&self, id: BackendId) -> Result<Arc<dyn StorageBackend>> {
        self.backends
            .read()
            .get(id as usize)
            .cloned()
            .ok_or_else(|| Error::InvalidOperation(format!("unknown storage backend id {}", id)))
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    /// Always false: slot zero is taken at construction.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether a wrapper backend is installed.
    pub fn has_shim(&self) -> bool {
        self.shim_installed.load(Ordering::Acquire)
    }

    /// Record that a relation handle exists; freezes the table.
    pub fn mark_opened(&self) {
        self.relations_opened.store(true, Ordering::Release);
    }

    /// Let every registered backend release metadata of a dropped database.
    pub fn drop_database(&self, db_oid: relstore_core::Oid) -> Result<()> {
        let backends: Vec<_> = self.backends.read().clone();
        for backend in backends {
            backend.drop_database(db_oid)?;
        }
        Ok(())
    }
}

impl SyncFileHandler for BackendRegistry {
    fn sync_file(&self, tag: &FileTag) -> Result<()> {
        self.get(tag.backend)?.sync_file(tag)
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .backends
            .read()
            .iter()
            .map(|b| b.name().to_string())
            .collect();
        f.debug_struct("BackendRegistry")
            .field("backends", &names)
            .field("active", &self.active_backend_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncQueue;
    use tempfile::tempdir;

    fn registry(dir: &std::path::Path) -> BackendRegistry {
        let md = Arc::new(MdBackend::new(dir, 4, Arc::new(SyncQueue::with_defaults())));
        BackendRegistry::new(md)
    }

    #[test]
    fn test_md_takes_slot_zero() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        assert_eq!(reg.active_backend_id(), MD_BACKEND_ID);
        assert_eq!(reg.get(0).unwrap().name(), "md");
        assert!(reg.get(1).is_err());
    }

    #[test]
    fn test_install_shim_once() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        let extra = Arc::new(MdBackend::new(dir.path(), 4, Arc::new(SyncQueue::with_defaults())));
        let id = reg.install_shim(extra.clone()).unwrap();
        assert_eq!(id, 1);
        assert_eq!(reg.active_backend_id(), 1);
        assert!(matches!(reg.install_shim(extra), Err(Error::Conflict(_))));
    }

    #[test]
    fn test_install_after_open_conflicts() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        reg.mark_opened();
        let extra = Arc::new(MdBackend::new(dir.path(), 4, Arc::new(SyncQueue::with_defaults())));
        assert!(matches!(reg.install_shim(extra.clone()), Err(Error::Conflict(_))));
        assert!(!reg.has_shim());
        assert!(reg.register_backend(extra).is_err());
    }

    #[test]
    fn test_set_active_unknown_id() {
        let dir = tempdir().unwrap();
        let reg = registry(dir.path());
        assert!(reg.set_active_backend(3).is_err());
    }
}
