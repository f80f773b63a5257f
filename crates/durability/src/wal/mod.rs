//! Segmented write-ahead log
//!
//! - `config`: WAL configuration (WalConfig, WalConfigError)
//! - `writer`: appends records and hands out LSNs (WalWriter)
//! - `reader`: reads records back for recovery (WalReader)

pub mod config;
pub mod reader;
pub mod writer;

pub use config::{WalConfig, WalConfigError};
pub use reader::{list_segments, LoggedRecord, ReadStopReason, WalReadResult, WalReader};
pub use writer::{WalCounters, WalWriter};
