//! Bulk writes
//!
//! Loads whole relations while bypassing the buffer pool. Pages collect
//! in a small batch; each flush WAL-logs the batch as one NEWPAGES record
//! (when asked), stamps checksums and writes the pages with `skip_fsync`.
//! Durability is settled once, at [`BulkWriter::finish`].

use relstore_core::{
    page::{set_page_checksum, set_page_lsn},
    AlignedPage, BlockNumber, Error, ForkNumber, Lsn, Result, MAX_PENDING_WRITES,
};
use relstore_durability::{LogRecord, NewPageImage, XlNewPages};
use relstore_storage::SmgrHandle;
use tracing::debug;

use crate::session::Session;

struct PendingWrite {
    blkno: BlockNumber,
    page: Box<AlignedPage>,
    standard_layout: bool,
}

/// How a finished bulk write reached (or will reach) disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkSyncOutcome {
    /// Temp relation; never fsynced
    NotNeeded,
    /// Left to the next checkpoint
    Registered,
    /// Fsynced before returning
    Immediate,
}

/// Counters of one bulk write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkWriteStats {
    /// Pages written
    pub pages: u64,
    /// Batches flushed
    pub flushes: u64,
    /// NEWPAGES records logged
    pub wal_records: u64,
    /// Zero pages written to fill gaps
    pub zero_filled: u64,
}

/// Bulk loader for one fork of one relation.
pub struct BulkWriter<'s> {
    session: &'s mut Session,
    h: SmgrHandle,
    fork: ForkNumber,
    use_wal: bool,
    pending: Vec<PendingWrite>,
    relsize: BlockNumber,
    start_redo: Lsn,
    stats: BulkWriteStats,
}

impl Session {
    /// Start a bulk write of `fork`, which must already exist.
    pub fn bulk_start(
        &mut self,
        h: SmgrHandle,
        fork: ForkNumber,
        use_wal: bool,
    ) -> Result<BulkWriter<'_>> {
        let start_redo = self.cluster().redo_pointer();
        let relsize = self.smgr().nblocks(h, fork)?;
        Ok(BulkWriter {
            session: self,
            h,
            fork,
            use_wal,
            pending: Vec::with_capacity(MAX_PENDING_WRITES),
            relsize,
            start_redo,
            stats: BulkWriteStats::default(),
        })
    }
}

impl BulkWriter<'_> {
    /// A zeroed page buffer to fill and pass to [`Self::write`].
    pub fn get_buffer(&self) -> Box<AlignedPage> {
        AlignedPage::zeroed()
    }

    /// Counters so far.
    pub fn stats(&self) -> BulkWriteStats {
        self.stats
    }

    /// Fork size including flushed pages.
    pub fn relsize(&self) -> BlockNumber {
        self.relsize
    }

    /// Queue `page` for block `blkno`. Flushes when the batch is full.
    pub fn write(
        &mut self,
        blkno: BlockNumber,
        page: Box<AlignedPage>,
        standard_layout: bool,
    ) -> Result<()> {
        self.pending.push(PendingWrite {
            blkno,
            page,
            standard_layout,
        });
        if self.pending.len() >= MAX_PENDING_WRITES {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut pending = std::mem::take(&mut self.pending);
        pending.sort_by_key(|p| p.blkno);
        if let Some(w) = pending.windows(2).find(|w| w[0].blkno == w[1].blkno) {
            return Err(Error::InvalidOperation(format!(
                "block {} written twice in one bulk batch",
                w[0].blkno
            )));
        }

        let cluster = std::sync::Arc::clone(self.session.cluster());
        let locator = self.h.rel().locator;
        if self.use_wal {
            let pages = pending
                .iter()
                .map(|p| NewPageImage {
                    blkno: p.blkno,
                    standard_layout: p.standard_layout,
                    image: p.page.to_vec(),
                })
                .collect();
            let (_, end) = cluster.log(&LogRecord::NewPages(XlNewPages {
                locator,
                fork: self.fork,
                pages,
            }))?;
            for p in pending.iter_mut().filter(|p| p.standard_layout) {
                set_page_lsn(&mut p.page[..], end);
            }
            if let Ok(xact) = self.session.xact_mut() {
                xact.mark_wrote_wal();
            }
            self.stats.wal_records += 1;
        }

        let checksums = cluster.config().data_checksums;
        let smgr = self.session.smgr();
        for p in pending.iter_mut() {
            if checksums {
                set_page_checksum(&mut p.page[..], p.blkno);
            }
            if p.blkno >= self.relsize {
                if p.blkno > self.relsize {
                    let gap = p.blkno - self.relsize;
                    smgr.zeroextend(self.h, self.fork, self.relsize, gap, true)?;
                    self.stats.zero_filled += gap as u64;
                }
                smgr.extend(self.h, self.fork, p.blkno, &p.page[..], true)?;
                self.relsize = p.blkno + 1;
            } else {
                smgr.write(self.h, self.fork, p.blkno, &p.page[..], true)?;
            }
        }
        self.stats.pages += pending.len() as u64;
        self.stats.flushes += 1;
        Ok(())
    }

    /// Flush what is left and settle durability.
    ///
    /// A WAL-logged load registers its fsync with the checkpointer unless a
    /// checkpoint started since [`Session::bulk_start`]; that checkpoint
    /// may already have passed the queue, so the fork is fsynced now.
    pub fn finish(mut self) -> Result<BulkSyncOutcome> {
        self.flush()?;
        let rel = self.h.rel();
        let outcome = if rel.is_temp() {
            BulkSyncOutcome::NotNeeded
        } else if !self.use_wal {
            self.session.smgr().registersync(self.h, self.fork)?;
            BulkSyncOutcome::Registered
        } else {
            let cluster = std::sync::Arc::clone(self.session.cluster());
            let _delay = cluster.delay_checkpoint();
            if cluster.redo_pointer() == self.start_redo {
                self.session.smgr().registersync(self.h, self.fork)?;
                BulkSyncOutcome::Registered
            } else {
                self.session.smgr().immedsync(self.h, self.fork)?;
                BulkSyncOutcome::Immediate
            }
        };
        debug!(
            target: "relstore::bulk",
            rel = %rel,
            fork = %self.fork,
            pages = self.stats.pages,
            wal_records = self.stats.wal_records,
            ?outcome,
            "bulk write finished"
        );
        Ok(outcome)
    }
}

impl Drop for BulkWriter<'_> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!(target: "relstore::bulk", discarded = self.pending.len(), "bulk writer dropped with unflushed pages");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Cluster;
    use crate::config::SmgrConfig;
    use relstore_core::{
        page::{page_init, page_lsn, verify_page_checksum},
        RelFileLocator, RelPersistence,
    };
    use relstore_durability::WalReader;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (TempDir, Arc<Cluster>) {
        let dir = tempdir().unwrap();
        let cluster = Cluster::builder()
            .config(SmgrConfig::for_testing())
            .open(dir.path())
            .unwrap();
        (dir, cluster)
    }

    fn loc() -> RelFileLocator {
        RelFileLocator::new(1663, 5, 16384)
    }

    fn filled(bulk: &BulkWriter<'_>, marker: u8) -> Box<AlignedPage> {
        let mut page = bulk.get_buffer();
        page_init(&mut page[..], 0);
        page[100] = marker;
        page
    }

    #[test]
    fn test_bulk_write_in_order() {
        let (_dir, cluster) = setup();
        let mut s = cluster.session();
        s.begin().unwrap();
        let h = s.record_create(loc(), RelPersistence::Permanent).unwrap();

        let mut bulk = s.bulk_start(h, ForkNumber::Main, true).unwrap();
        for blkno in 0..(MAX_PENDING_WRITES as u32 + 5) {
            let page = filled(&bulk, blkno as u8);
            bulk.write(blkno, page, true).unwrap();
        }
        let stats = bulk.stats();
        assert_eq!(stats.flushes, 1);
        assert_eq!(bulk.finish().unwrap(), BulkSyncOutcome::Registered);

        let n = s.smgr().nblocks(h, ForkNumber::Main).unwrap();
        assert_eq!(n, MAX_PENDING_WRITES as u32 + 5);
        let mut page = AlignedPage::zeroed();
        s.smgr().read(h, ForkNumber::Main, 3, &mut page[..]).unwrap();
        assert_eq!(page[100], 3);
        assert!(page_lsn(&page[..]).is_valid());
        assert!(verify_page_checksum(&page[..], 3));
    }

    #[test]
    fn test_bulk_write_out_of_order_fills_gap() {
        let (_dir, cluster) = setup();
        let mut s = cluster.session();
        s.begin().unwrap();
        let h = s.record_create(loc(), RelPersistence::Permanent).unwrap();

        let mut bulk = s.bulk_start(h, ForkNumber::Main, false).unwrap();
        let p5 = filled(&bulk, 5);
        let p2 = filled(&bulk, 2);
        bulk.write(5, p5, true).unwrap();
        bulk.write(2, p2, true).unwrap();
        bulk.finish().unwrap();

        assert_eq!(s.smgr().nblocks(h, ForkNumber::Main).unwrap(), 6);
        let mut page = AlignedPage::zeroed();
        s.smgr().read(h, ForkNumber::Main, 0, &mut page[..]).unwrap();
        assert!(page.iter().all(|&b| b == 0));
        s.smgr().read(h, ForkNumber::Main, 5, &mut page[..]).unwrap();
        assert_eq!(page[100], 5);
    }

    #[test]
    fn test_duplicate_block_in_batch_rejected() {
        let (_dir, cluster) = setup();
        let mut s = cluster.session();
        s.begin().unwrap();
        let h = s.record_create(loc(), RelPersistence::Permanent).unwrap();
        let mut bulk = s.bulk_start(h, ForkNumber::Main, false).unwrap();
        let a = filled(&bulk, 1);
        let b = filled(&bulk, 2);
        bulk.write(0, a, true).unwrap();
        bulk.write(0, b, true).unwrap();
        assert!(matches!(bulk.finish(), Err(Error::InvalidOperation(_))));
    }

    #[test]
    fn test_bulk_write_logs_one_record_per_batch() {
        let (_dir, cluster) = setup();
        let mut s = cluster.session();
        s.begin().unwrap();
        let h = s.record_create(loc(), RelPersistence::Permanent).unwrap();
        let start = cluster.wal_insert_position();

        let mut bulk = s.bulk_start(h, ForkNumber::Main, true).unwrap();
        for blkno in 0..3 {
            let page = filled(&bulk, 1);
            bulk.write(blkno, page, true).unwrap();
        }
        bulk.finish().unwrap();
        cluster.flush_wal(cluster.wal_insert_position()).unwrap();

        let read = WalReader::new(cluster.wal_dir()).read_from(start).unwrap();
        let newpages: Vec<_> = read
            .records
            .iter()
            .filter_map(|r| match LogRecord::decode(&r.record).unwrap() {
                LogRecord::NewPages(x) => Some(x),
                _ => None,
            })
            .collect();
        assert_eq!(newpages.len(), 1);
        assert_eq!(newpages[0].pages.len(), 3);
    }

    #[test]
    fn test_checkpoint_during_load_forces_immediate_sync() {
        let (_dir, cluster) = setup();
        let mut s = cluster.session();
        s.begin().unwrap();
        let h = s.record_create(loc(), RelPersistence::Permanent).unwrap();
        let mut bulk = s.bulk_start(h, ForkNumber::Main, true).unwrap();
        let page = filled(&bulk, 1);
        bulk.write(0, page, true).unwrap();
        cluster.checkpoint().unwrap();
        assert_eq!(bulk.finish().unwrap(), BulkSyncOutcome::Immediate);
    }

    #[test]
    fn test_temp_relation_needs_no_sync() {
        let (_dir, cluster) = setup();
        let mut s = cluster.session();
        s.begin().unwrap();
        let h = s.record_create(loc(), RelPersistence::Temp).unwrap();
        let mut bulk = s.bulk_start(h, ForkNumber::Main, false).unwrap();
        let page = filled(&bulk, 1);
        bulk.write(0, page, true).unwrap();
        assert_eq!(bulk.finish().unwrap(), BulkSyncOutcome::NotNeeded);
    }
}
