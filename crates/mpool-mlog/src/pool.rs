//! In-process object table
//!
//! A [`Pool`] hands out shared mlog handles keyed by object id and wraps
//! the extent provider's allocate/commit/abort/delete lifecycle. MDC
//! lifecycle calls operate on both logs of a pair and undo the completed
//! half when the other fails.

use crate::extent::ExtentProvider;
use crate::mdc::Mdc;
use crate::mlog::{Mlog, OpenFlags};
use crate::raw_io::DirProvider;
use mpool_common::{Config, Error, MlogConfig, ObjectId, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Object ids of the two logs of an MDC
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MdcIds {
    pub log1: ObjectId,
    pub log2: ObjectId,
}

/// Table of live mlog handles over one extent provider
pub struct Pool {
    provider: Arc<dyn ExtentProvider>,
    config: MlogConfig,
    logs: Mutex<HashMap<ObjectId, Arc<Mlog>>>,
}

impl Pool {
    pub fn new(provider: Arc<dyn ExtentProvider>, config: MlogConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            provider,
            config,
            logs: Mutex::new(HashMap::new()),
        })
    }

    /// Pool over a directory of log files
    pub fn with_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let provider = DirProvider::new(&config.pool)?;
        Self::new(Arc::new(provider), config.mlog.clone())
    }

    /// Allocate an uncommitted log of at least `capacity` bytes
    pub fn mlog_alloc(&self, capacity: u64) -> Result<Arc<Mlog>> {
        self.alloc_with_gen(capacity, 1)
    }

    fn alloc_with_gen(&self, capacity: u64, generation: u64) -> Result<Arc<Mlog>> {
        let (id, extent) = self.provider.alloc(capacity, generation)?;
        let log = match Mlog::new(id, extent, self.config.clone(), false) {
            Ok(log) => Arc::new(log),
            Err(e) => {
                if let Err(abort) = self.provider.abort(id) {
                    warn!("Releasing unusable extent {} failed: {}", id, abort);
                }
                return Err(e);
            }
        };
        self.logs.lock().insert(id, Arc::clone(&log));
        debug!("Allocated mlog {} ({} bytes)", id, log.capacity());
        Ok(log)
    }

    /// Make an allocated log durable
    pub fn mlog_commit(&self, id: ObjectId) -> Result<()> {
        let log = self.mlog_find(id)?;
        if log.is_committed() {
            return Err(Error::invalid_argument(format!("mlog {id} is committed")));
        }
        self.provider.commit(id)?;
        log.set_committed();
        Ok(())
    }

    /// Release a log that was never committed
    pub fn mlog_abort(&self, id: ObjectId) -> Result<()> {
        let log = self.mlog_find(id)?;
        if log.is_committed() {
            return Err(Error::invalid_argument(format!("mlog {id} is committed")));
        }
        self.provider.abort(id)?;
        self.logs.lock().remove(&id);
        Ok(())
    }

    /// Release a committed log; it must be closed
    pub fn mlog_delete(&self, id: ObjectId) -> Result<()> {
        let log = self.mlog_find(id)?;
        if !log.is_committed() {
            return Err(Error::invalid_argument(format!(
                "mlog {id} is not committed"
            )));
        }
        if log.is_open() {
            return Err(Error::busy(format!("mlog {id} is open")));
        }
        self.provider.delete(id)?;
        self.logs.lock().remove(&id);
        Ok(())
    }

    /// Handle of a log, loading it from the provider on first use
    pub fn mlog_find(&self, id: ObjectId) -> Result<Arc<Mlog>> {
        let mut logs = self.logs.lock();
        if let Some(log) = logs.get(&id) {
            return Ok(Arc::clone(log));
        }
        let entry = self
            .provider
            .lookup(id)?
            .ok_or_else(|| Error::not_found(format!("mlog {id}")))?;
        let log = Arc::new(Mlog::new(
            id,
            entry.extent,
            self.config.clone(),
            entry.committed,
        )?);
        logs.insert(id, Arc::clone(&log));
        Ok(log)
    }

    /// Allocate both logs of an MDC; the second starts one generation ahead
    pub fn mdc_alloc(&self, capacity: u64) -> Result<MdcIds> {
        let log1 = self.alloc_with_gen(capacity, 1)?;
        let log2 = match self.alloc_with_gen(capacity, 2) {
            Ok(log) => log,
            Err(e) => {
                self.unwind(log1.id(), Self::mlog_abort);
                return Err(e);
            }
        };
        Ok(MdcIds {
            log1: log1.id(),
            log2: log2.id(),
        })
    }

    pub fn mdc_commit(&self, ids: MdcIds) -> Result<()> {
        if let Err(e) = self.mlog_commit(ids.log1) {
            self.unwind(ids.log1, Self::mlog_abort);
            self.unwind(ids.log2, Self::mlog_abort);
            return Err(e);
        }
        if let Err(e) = self.mlog_commit(ids.log2) {
            self.unwind(ids.log1, Self::mlog_delete);
            self.unwind(ids.log2, Self::mlog_abort);
            return Err(e);
        }
        Ok(())
    }

    pub fn mdc_abort(&self, ids: MdcIds) -> Result<()> {
        let first = self.mlog_abort(ids.log1);
        let second = self.mlog_abort(ids.log2);
        first.and(second)
    }

    pub fn mdc_delete(&self, ids: MdcIds) -> Result<()> {
        for id in [ids.log1, ids.log2] {
            if self.mlog_find(id)?.is_open() {
                return Err(Error::busy(format!("mlog {id} is open")));
            }
        }
        let first = self.mlog_delete(ids.log1);
        let second = self.mlog_delete(ids.log2);
        first.and(second)
    }

    pub fn mdc_open(&self, ids: MdcIds, flags: OpenFlags) -> Result<Mdc> {
        let log1 = self.mlog_find(ids.log1)?;
        let log2 = self.mlog_find(ids.log2)?;
        Mdc::open(log1, log2, flags)
    }

    fn unwind(&self, id: ObjectId, undo: fn(&Self, ObjectId) -> Result<()>) {
        if let Err(e) = undo(self, id) {
            warn!("Unwinding mlog {} failed: {}", id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{MemProvider, WriteFault};
    use mpool_common::{PoolConfig, SectorSize};
    use tempfile::tempdir;

    fn mem_pool() -> (Arc<MemProvider>, Pool) {
        let provider = Arc::new(MemProvider::new(SectorSize::S4096));
        let pool = Pool::new(provider.clone(), MlogConfig::default()).unwrap();
        (provider, pool)
    }

    #[test]
    fn test_mlog_lifecycle() {
        let (_, pool) = mem_pool();
        let log = pool.mlog_alloc(64 * 1024).unwrap();
        let id = log.id();
        assert!(log.open(OpenFlags::default()).is_err());

        pool.mlog_commit(id).unwrap();
        assert!(pool.mlog_commit(id).is_err());
        assert!(pool.mlog_abort(id).is_err());

        log.open(OpenFlags::default()).unwrap();
        log.append(b"record", true).unwrap();
        assert!(matches!(pool.mlog_delete(id), Err(Error::Busy(_))));
        log.close().unwrap();

        pool.mlog_delete(id).unwrap();
        assert!(pool.mlog_find(id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_mlog_abort() {
        let (provider, pool) = mem_pool();
        let log = pool.mlog_alloc(4096).unwrap();
        assert!(pool.mlog_delete(log.id()).is_err());
        pool.mlog_abort(log.id()).unwrap();
        assert!(provider.extent(log.id()).is_none());
    }

    #[test]
    fn test_restart_recovers_from_provider() {
        let (provider, pool) = mem_pool();
        let log = pool.mlog_alloc(64 * 1024).unwrap();
        let id = log.id();
        pool.mlog_commit(id).unwrap();
        log.open(OpenFlags::default()).unwrap();
        log.append(b"durable", true).unwrap();
        log.append(b"buffered", false).unwrap();
        drop(pool);
        drop(log);

        let pool = Pool::new(provider, MlogConfig::default()).unwrap();
        let log = pool.mlog_find(id).unwrap();
        assert!(Arc::ptr_eq(&log, &pool.mlog_find(id).unwrap()));
        log.open(OpenFlags::default()).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(log.read_next(&mut buf).unwrap(), Some(7));
        assert_eq!(&buf[..7], b"durable");
        assert_eq!(log.read_next(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_crash_mid_flush_set() {
        let (provider, pool) = mem_pool();
        let log = pool.mlog_alloc(256 * 1024).unwrap();
        let id = log.id();
        pool.mlog_commit(id).unwrap();
        log.open(OpenFlags::default()).unwrap();
        for i in 0..4u8 {
            log.append(&[i; 3000], true).unwrap();
        }

        // Four blocks in this flush set, only the first reaches media
        let media = provider.extent(id).unwrap();
        media.inject_write_fault(WriteFault::Tear { landed: 4096 });
        assert!(log.append(&[9u8; 9000], true).is_err());
        drop(pool);
        drop(log);

        let pool = Pool::new(provider, MlogConfig::default()).unwrap();
        let log = pool.mlog_find(id).unwrap();
        log.open(OpenFlags::default()).unwrap();
        let mut buf = vec![0u8; 16 * 1024];
        for i in 0..4u8 {
            assert_eq!(log.read_next(&mut buf).unwrap(), Some(3000));
            assert!(buf[..3000].iter().all(|&b| b == i));
        }
        assert_eq!(log.read_next(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_mdc_lifecycle() {
        let (provider, pool) = mem_pool();
        let ids = pool.mdc_alloc(128 * 1024).unwrap();
        assert!(pool.mdc_open(ids, OpenFlags::default()).is_err());
        pool.mdc_commit(ids).unwrap();

        let mdc = pool.mdc_open(ids, OpenFlags::default()).unwrap();
        mdc.append(b"state", true).unwrap();
        assert!(matches!(pool.mdc_delete(ids), Err(Error::Busy(_))));
        mdc.close().unwrap();

        pool.mdc_delete(ids).unwrap();
        assert!(provider.extent(ids.log1).is_none());
        assert!(provider.extent(ids.log2).is_none());
    }

    #[test]
    fn test_mdc_abort() {
        let (provider, pool) = mem_pool();
        let ids = pool.mdc_alloc(8192).unwrap();
        pool.mdc_abort(ids).unwrap();
        assert!(provider.extent(ids.log1).is_none());
        assert!(pool.mlog_find(ids.log2).unwrap_err().is_not_found());
    }

    #[test]
    fn test_mdc_commit_unwinds() {
        let (provider, pool) = mem_pool();
        let ids = pool.mdc_alloc(8192).unwrap();
        // Second half vanished behind the pool's back
        provider.abort(ids.log2).unwrap();

        assert!(pool.mdc_commit(ids).is_err());
        assert!(provider.extent(ids.log1).is_none());
    }

    #[test]
    fn test_dir_pool_reopen() {
        let dir = tempdir().unwrap();
        let config = Config {
            pool: PoolConfig {
                data_dir: dir.path().to_path_buf(),
                sector_size: SectorSize::S512,
                direct_io: false,
            },
            mlog: MlogConfig::default(),
        };

        let ids = {
            let pool = Pool::with_config(&config).unwrap();
            let ids = pool.mdc_alloc(64 * 1024).unwrap();
            pool.mdc_commit(ids).unwrap();
            let mdc = pool.mdc_open(ids, OpenFlags::default()).unwrap();
            for i in 0..10u8 {
                mdc.append(&vec![i; 100 + usize::from(i) * 50], i % 3 == 0).unwrap();
            }
            mdc.cstart().unwrap();
            mdc.append(b"compacted", false).unwrap();
            mdc.cend().unwrap();
            mdc.close().unwrap();
            ids
        };

        let pool = Pool::with_config(&config).unwrap();
        let mdc = pool.mdc_open(ids, OpenFlags::default()).unwrap();
        assert_eq!(mdc.active_gen().unwrap(), 2);
        let mut buf = [0u8; 64];
        assert_eq!(mdc.read_next(&mut buf).unwrap(), Some(9));
        assert_eq!(&buf[..9], b"compacted");
        assert_eq!(mdc.read_next(&mut buf).unwrap(), None);
    }
}
