//! Shared helpers for the integration test suites.
//!
//! Import via `mod common;` from any test file.

#![allow(dead_code)]

use relstore::durability::{LogRecord, WalReader};
use relstore::page::page_init;
use relstore::{AlignedPage, Cluster, Lsn, RelFileLocator, SmgrConfig};
use std::path::Path;
use std::sync::{Arc, Once};
use tempfile::TempDir;

static INIT_TRACING: Once = Once::new();

/// Route engine logs to the test harness when `RUST_LOG` is set.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A cluster in a temporary data directory that can be crashed and reopened.
pub struct TestCluster {
    pub dir: TempDir,
    cluster: Option<Arc<Cluster>>,
    config: SmgrConfig,
}

impl TestCluster {
    /// Fresh cluster with test sizing.
    pub fn new() -> Self {
        Self::with_config(SmgrConfig::for_testing())
    }

    /// Fresh cluster with `config`.
    pub fn with_config(config: SmgrConfig) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("tempdir");
        let cluster = open(dir.path(), &config);
        TestCluster {
            dir,
            cluster: Some(cluster),
            config,
        }
    }

    /// The running cluster.
    pub fn cluster(&self) -> &Arc<Cluster> {
        self.cluster.as_ref().expect("cluster is open")
    }

    /// Stop without a shutdown checkpoint and reopen, running recovery.
    ///
    /// Every session must be dropped first.
    pub fn crash_and_reopen(&mut self) {
        self.crash_damage_reopen(|_| {});
    }

    /// Like [`Self::crash_and_reopen`], with `damage` applied to the data
    /// directory while the cluster is down.
    pub fn crash_damage_reopen(&mut self, damage: impl FnOnce(&Path)) {
        let old = self.cluster.take().expect("cluster is open");
        assert_eq!(
            Arc::strong_count(&old),
            1,
            "drop every session before reopening the cluster"
        );
        drop(old);
        damage(self.dir.path());
        self.cluster = Some(open(self.dir.path(), &self.config));
    }

    /// Clean shutdown and reopen.
    pub fn restart(&mut self) {
        self.cluster().shutdown().expect("shutdown");
        self.crash_and_reopen();
    }

    /// Decoded WAL records from `start` to the current end of the log.
    pub fn wal_since(&self, start: Lsn) -> Vec<LogRecord> {
        let cluster = self.cluster();
        cluster
            .flush_wal(cluster.wal_insert_position())
            .expect("flush");
        WalReader::new(cluster.wal_dir())
            .read_from(start)
            .expect("read wal")
            .records
            .iter()
            .map(|r| LogRecord::decode(&r.record).expect("decode"))
            .collect()
    }
}

fn open(dir: &Path, config: &SmgrConfig) -> Arc<Cluster> {
    Cluster::builder()
        .config(config.clone())
        .open(dir)
        .expect("open cluster")
}

/// Locator of a user relation in database 5.
pub fn loc(rel: u32) -> RelFileLocator {
    RelFileLocator::new(1663, 5, 16384 + rel)
}

/// An initialised page whose body carries `marker`.
pub fn page(marker: u8) -> Box<AlignedPage> {
    let mut page = AlignedPage::zeroed();
    page_init(&mut page[..], 0);
    for b in page[64..].iter_mut() {
        *b = marker;
    }
    page
}
