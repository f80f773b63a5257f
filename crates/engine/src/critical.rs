//! Critical sections
//!
//! Between writing a WAL record and applying the change it describes, the
//! in-memory state and the data directory may disagree. Any failure in that
//! window terminates the process so that crash recovery, not the caller,
//! reconciles the two.

use relstore_core::Result;
use tracing::error;

/// Guard marking a critical section.
///
/// Dropping the guard while the thread is panicking aborts the process.
#[derive(Debug)]
pub struct CriticalSection {
    what: &'static str,
}

impl CriticalSection {
    /// Enter a critical section.
    pub fn enter(what: &'static str) -> Self {
        CriticalSection { what }
    }

    /// Run `f` inside a critical section. An error aborts the process.
    pub fn run<T>(what: &'static str, f: impl FnOnce() -> Result<T>) -> T {
        let section = CriticalSection::enter(what);
        match f() {
            Ok(value) => {
                drop(section);
                value
            }
            Err(e) => {
                error!(target: "relstore::xact", section = what, error = %e, code = e.code(), "error in critical section");
                std::process::abort();
            }
        }
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!(target: "relstore::xact", section = self.what, "panic in critical section");
            std::process::abort();
        }
    }
}
