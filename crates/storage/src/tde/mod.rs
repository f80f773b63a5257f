//! Transparent data encryption
//!
//! [`TdeBackend`] wraps the magnetic-disk backend, encrypting user relation
//! pages with a per-relation [`InternalKey`]. Keys live in the
//! [`KeyStore`], wrapped under a cluster [`PrincipalKey`].

mod cipher;
mod keys;
mod shim;

pub use cipher::{HmacCtrCipher, PageCipher};
pub use keys::{InternalKey, KeyMapError, KeyStore, PrincipalKey, KEY_MAP_DIR};
pub use shim::{EncryptionStatus, TdeBackend, TdeState};
