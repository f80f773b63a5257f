//! Page layout, checksums and aligned page buffers
//!
//! Standard-layout pages start with a 24-byte header:
//!
//! ```text
//! ┌──────────┬──────────┬────────┬────────┬────────┬──────────┬──────────────┬───────────┐
//! │ lsn (8)  │ csum (2) │ flags  │ lower  │ upper  │ special  │ size|version │ prune (4) │
//! └──────────┴──────────┴────────┴────────┴────────┴──────────┴──────────────┴───────────┘
//! ```
//!
//! A page whose `upper` is zero is "new" (never initialised) and carries
//! no checksum. The checksum is a CRC32 of the page with the checksum field
//! zeroed, mixed with the block number so that a page written to the wrong
//! location fails verification.

use crate::limits::BLOCK_BYTES;
use crate::types::{BlockNumber, Lsn};
use crc32fast::Hasher;
use std::ops::{Deref, DerefMut};

/// Size of the standard page header.
pub const SIZE_OF_PAGE_HEADER: usize = 24;

/// Layout version stamped into `pd_pagesize_version`.
pub const PAGE_LAYOUT_VERSION: u16 = 4;

const LSN_OFFSET: usize = 0;
const CHECKSUM_OFFSET: usize = 8;
const LOWER_OFFSET: usize = 12;
const UPPER_OFFSET: usize = 14;
const SPECIAL_OFFSET: usize = 16;
const SIZE_VERSION_OFFSET: usize = 18;

fn read_u16(page: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([page[offset], page[offset + 1]])
}

fn write_u16(page: &mut [u8], offset: usize, value: u16) {
    page[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

/// Initialise an empty standard-layout page with `special_size` bytes of
/// special space at the end.
pub fn page_init(page: &mut [u8], special_size: usize) {
    debug_assert_eq!(page.len(), BLOCK_BYTES);
    page.fill(0);
    let special = (BLOCK_BYTES - special_size) as u16;
    write_u16(page, LOWER_OFFSET, SIZE_OF_PAGE_HEADER as u16);
    write_u16(page, UPPER_OFFSET, special);
    write_u16(page, SPECIAL_OFFSET, special);
    write_u16(
        page,
        SIZE_VERSION_OFFSET,
        BLOCK_BYTES as u16 | PAGE_LAYOUT_VERSION,
    );
}

/// Whether the page was never initialised.
pub fn page_is_new(page: &[u8]) -> bool {
    read_u16(page, UPPER_OFFSET) == 0
}

/// Whether every byte of the page is zero.
pub fn page_is_all_zero(page: &[u8]) -> bool {
    page.iter().all(|&b| b == 0)
}

/// Whether the header describes a sane standard layout.
pub fn page_has_standard_layout(page: &[u8]) -> bool {
    let lower = read_u16(page, LOWER_OFFSET) as usize;
    let upper = read_u16(page, UPPER_OFFSET) as usize;
    let special = read_u16(page, SPECIAL_OFFSET) as usize;
    lower >= SIZE_OF_PAGE_HEADER && lower <= upper && upper <= special && special <= BLOCK_BYTES
}

/// Read the page LSN.
pub fn page_lsn(page: &[u8]) -> Lsn {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&page[LSN_OFFSET..LSN_OFFSET + 8]);
    Lsn(u64::from_le_bytes(bytes))
}

/// Stamp the page LSN.
pub fn set_page_lsn(page: &mut [u8], lsn: Lsn) {
    page[LSN_OFFSET..LSN_OFFSET + 8].copy_from_slice(&lsn.0.to_le_bytes());
}

/// Stored checksum field.
pub fn page_checksum_field(page: &[u8]) -> u16 {
    read_u16(page, CHECKSUM_OFFSET)
}

/// Compute the checksum of `page` as stored at `blkno`.
pub fn checksum_page(page: &[u8], blkno: BlockNumber) -> u16 {
    let mut hasher = Hasher::new();
    hasher.update(&page[..CHECKSUM_OFFSET]);
    hasher.update(&[0u8, 0u8]);
    hasher.update(&page[CHECKSUM_OFFSET + 2..]);
    let crc = hasher.finalize() ^ blkno;
    // Never zero, so an unset field is distinguishable.
    ((crc % 65535) + 1) as u16
}

/// Stamp the checksum in place. New pages are left untouched.
pub fn set_page_checksum(page: &mut [u8], blkno: BlockNumber) {
    if page_is_new(page) {
        return;
    }
    let checksum = checksum_page(page, blkno);
    write_u16(page, CHECKSUM_OFFSET, checksum);
}

/// Verify a page read from `blkno`.
///
/// New pages are valid only when entirely zero; initialised pages must
/// carry a matching checksum.
pub fn verify_page_checksum(page: &[u8], blkno: BlockNumber) -> bool {
    if page_is_new(page) {
        return page_is_all_zero(page);
    }
    page_checksum_field(page) == checksum_page(page, blkno)
}

/// Page-sized, page-aligned, zero-filled buffer.
#[repr(C, align(4096))]
pub struct AlignedPage([u8; BLOCK_BYTES]);

impl AlignedPage {
    /// Allocate a zeroed page on the heap.
    pub fn zeroed() -> Box<AlignedPage> {
        Box::new(AlignedPage([0u8; BLOCK_BYTES]))
    }
}

impl Deref for AlignedPage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for AlignedPage {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

impl std::fmt::Debug for AlignedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedPage")
            .field("lsn", &page_lsn(&self.0))
            .field("is_new", &page_is_new(&self.0))
            .finish()
    }
}
