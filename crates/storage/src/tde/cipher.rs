//! Page cipher trait and the default keystream cipher.

use hmac::{Hmac, Mac};
use relstore_core::BlockNumber;
use sha2::Sha256;

use super::keys::InternalKey;

pub(crate) type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 keyed with `key`.
pub(crate) fn keyed_mac(key: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(key).expect("HMAC is able to accept all key sizes")
}

/// Transforms whole pages in place.
///
/// Every page written by the encryption shim passes through `encrypt`, and
/// every non-zero page read passes through `decrypt`. The block number is
/// mixed into the keystream so identical pages at different positions
/// produce different ciphertext.
pub trait PageCipher: Send + Sync {
    /// Encrypt `page` in place.
    fn encrypt(&self, key: &InternalKey, blkno: BlockNumber, page: &mut [u8]);

    /// Decrypt `page` in place.
    fn decrypt(&self, key: &InternalKey, blkno: BlockNumber, page: &mut [u8]);

    /// Unique cipher identifier.
    fn cipher_id(&self) -> &str;
}

/// Counter-mode cipher with an HMAC-SHA256 keystream.
///
/// Keystream block `i` of page `b` is `HMAC(key, base_iv || b || i)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HmacCtrCipher;

impl HmacCtrCipher {
    fn apply(key: &InternalKey, blkno: BlockNumber, page: &mut [u8]) {
        let keyed = keyed_mac(&key.key);
        for (counter, chunk) in page.chunks_mut(32).enumerate() {
            let mut mac = keyed.clone();
            mac.update(&key.base_iv);
            mac.update(&blkno.to_le_bytes());
            mac.update(&(counter as u32).to_le_bytes());
            let stream = mac.finalize().into_bytes();
            for (b, k) in chunk.iter_mut().zip(stream.iter()) {
                *b ^= k;
            }
        }
    }
}

impl PageCipher for HmacCtrCipher {
    fn encrypt(&self, key: &InternalKey, blkno: BlockNumber, page: &mut [u8]) {
        Self::apply(key, blkno, page);
    }

    fn decrypt(&self, key: &InternalKey, blkno: BlockNumber, page: &mut [u8]) {
        Self::apply(key, blkno, page);
    }

    fn cipher_id(&self) -> &str {
        "hmac-sha256-ctr"
    }
}
