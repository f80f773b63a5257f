//! Relation file naming.
//!
//! Fork `f`, segment `s` of relation `r` lives at
//! `<data>/<spc>/<db>/<relnode>[_fork][.segno]`, with `.segno` omitted for
//! segment 0 and the fork suffix omitted for MAIN. Session-private relations
//! prefix the relation number with `t<proc>_`.

use relstore_core::{BackendOwner, ForkNumber, Oid, RelFileLocator, RelFileLocatorBackend};
use std::path::{Path, PathBuf};

/// File name of a segment, without directory.
pub fn segment_file_name(rel: &RelFileLocatorBackend, fork: ForkNumber, segno: u32) -> String {
    let mut name = match rel.owner {
        BackendOwner::Shared => rel.locator.rel_number.to_string(),
        BackendOwner::Temp(proc) => format!("t{}_{}", proc, rel.locator.rel_number),
    };
    if let Some(suffix) = fork.suffix() {
        name.push('_');
        name.push_str(suffix);
    }
    if segno > 0 {
        name.push('.');
        name.push_str(&segno.to_string());
    }
    name
}

/// Directory holding every relation file of one database in one tablespace.
pub fn database_dir(data_dir: &Path, spc_oid: Oid, db_oid: Oid) -> PathBuf {
    data_dir.join(spc_oid.to_string()).join(db_oid.to_string())
}

/// Directory holding a relation's files.
pub fn relation_dir(data_dir: &Path, locator: &RelFileLocator) -> PathBuf {
    database_dir(data_dir, locator.spc_oid, locator.db_oid)
}

/// Full path of a segment file.
pub fn segment_path(
    data_dir: &Path,
    rel: &RelFileLocatorBackend,
    fork: ForkNumber,
    segno: u32,
) -> PathBuf {
    relation_dir(data_dir, &rel.locator).join(segment_file_name(rel, fork, segno))
}

/// Resource descriptor used in error messages: `spc/db/relnode[_fork][.segno]`.
pub fn describe(rel: &RelFileLocatorBackend, fork: ForkNumber, segno: u32) -> String {
    format!(
        "{}/{}/{}",
        rel.locator.spc_oid,
        rel.locator.db_oid,
        segment_file_name(rel, fork, segno)
    )
}

/// Parse a shared relation file name into `(relnode, fork, segno)`.
///
/// Accepted forms: `<oid>`, `<oid>_<fork>`, `<oid>.<segno>`, `<oid>_<fork>.<segno>`.
pub fn parse_relfilename(name: &str) -> Option<(Oid, ForkNumber, u32)> {
    let (stem, segno) = match name.split_once('.') {
        Some((stem, seg)) => (stem, parse_decimal(seg)?),
        None => (name, 0),
    };
    let (rel, fork) = match stem.split_once('_') {
        Some((rel, fork)) => (rel, ForkNumber::from_suffix(Some(fork))?),
        None => (stem, ForkNumber::Main),
    };
    Some((parse_decimal(rel)?, fork, segno))
}

fn parse_decimal(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
