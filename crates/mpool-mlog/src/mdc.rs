//! Metadata containers
//!
//! An MDC is a pair of compacting mlogs. One is active and takes appends;
//! the other is an empty standby. When the active log fills up the caller
//! compacts: [`Mdc::cstart`] switches appends to the standby, the caller
//! re-appends its live state, and [`Mdc::cend`] seals the new log and erases
//! the old one to a higher generation. At open the log with the smaller
//! generation is the active one.

use crate::mlog::{Marker, Mlog, OpenFlags};
use mpool_common::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct MdcInner {
    logs: [Arc<Mlog>; 2],
    active: usize,
    compacting: bool,
    open: bool,
}

impl MdcInner {
    fn active(&self) -> &Mlog {
        &self.logs[self.active]
    }

    fn standby(&self) -> &Mlog {
        &self.logs[1 - self.active]
    }

    /// Pick the active log and bring the pair to a usable state
    fn recover(&mut self, flags: OpenFlags) -> Result<()> {
        let opened = (self.logs[0].open(flags), self.logs[1].open(flags));
        self.active = match opened {
            (Ok(gen0), Ok(gen1)) => {
                if gen0 == gen1 || gen0 == 0 || gen1 == 0 {
                    return Err(Error::malformed(format!(
                        "log pair has generations {gen0} and {gen1}"
                    )));
                }
                usize::from(gen1 < gen0)
            }
            (Err(e0), Err(e1)) => {
                return Err(Error::malformed(format!(
                    "neither log of the pair opens: {e0}; {e1}"
                )));
            }
            (Ok(_), Err(e)) => self.replace_broken(1, e, flags)?,
            (Err(e), Ok(_)) => self.replace_broken(0, e, flags)?,
        };

        let active_gen = self.active().generation();
        if !self.standby().is_empty()? {
            warn!(
                "Erasing leftover standby log {} of MDC",
                self.standby().id()
            );
            self.standby().erase(active_gen + 1)?;
        }
        if self.active().is_empty()? {
            debug!("Initializing MDC log {}", self.active().id());
            self.active().append_marker(Marker::CStart)?;
            self.active().append_marker(Marker::CEnd)?;
        }
        Ok(())
    }

    /// Erase a log whose framing is broken and reopen it as the standby
    fn replace_broken(&self, broken: usize, err: Error, flags: OpenFlags) -> Result<usize> {
        if !err.is_framing() {
            return Err(err);
        }
        let active = 1 - broken;
        let log = &self.logs[broken];
        warn!("MDC log {} does not open ({}), erasing it", log.id(), err);
        log.erase(self.logs[active].generation() + 1)?;
        log.open(flags)?;
        Ok(active)
    }

    /// Close both logs and give up ownership, keeping the first error
    fn shutdown(&mut self) -> Result<()> {
        let mut result = Ok(());
        for log in &self.logs {
            if log.is_open() {
                if let Err(e) = log.close() {
                    warn!("Closing MDC log {} failed: {}", log.id(), e);
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
            log.release();
        }
        self.open = false;
        self.compacting = false;
        result
    }
}

/// A compacting pair of mlogs
///
/// Calls are serialized by the MDC's own lock. Its logs are opened with
/// `skip_ser`, and the flags passed to [`Mdc::open`] are kept for callers
/// only; they change neither the locking nor the log flags.
pub struct Mdc {
    inner: Mutex<MdcInner>,
    flags: OpenFlags,
}

impl Mdc {
    /// Open the pair, taking exclusive ownership of both logs
    pub fn open(log1: Arc<Mlog>, log2: Arc<Mlog>, flags: OpenFlags) -> Result<Self> {
        log1.claim()?;
        if let Err(e) = log2.claim() {
            log1.release();
            return Err(e);
        }

        let mut inner = MdcInner {
            logs: [log1, log2],
            active: 0,
            compacting: false,
            open: true,
        };
        // The MDC lock already serializes every call into the logs
        let log_flags = OpenFlags::default().with_csem().with_skip_ser();
        if let Err(e) = inner.recover(log_flags) {
            let _ = inner.shutdown();
            return Err(e);
        }

        info!(
            "Opened MDC: active log {} generation {}",
            inner.active().id(),
            inner.active().generation()
        );
        Ok(Self {
            inner: Mutex::new(inner),
            flags,
        })
    }

    /// Flags the caller opened the MDC with
    pub const fn flags(&self) -> OpenFlags {
        self.flags
    }

    fn lock(&self) -> Result<MutexGuard<'_, MdcInner>> {
        let inner = self.inner.lock();
        if !inner.open {
            return Err(Error::not_found("MDC is closed"));
        }
        Ok(inner)
    }

    /// Start a compaction: appends go to the standby log from here on
    pub fn cstart(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.compacting {
            return Err(Error::busy("compaction already in progress"));
        }
        if let Err(e) = inner.standby().append_marker(Marker::CStart) {
            warn!("MDC compaction start failed, closing: {}", e);
            let _ = inner.shutdown();
            return Err(e);
        }
        inner.active = 1 - inner.active;
        inner.compacting = true;
        info!("MDC compaction started into log {}", inner.active().id());
        Ok(())
    }

    /// Finish a compaction and erase the previous log
    pub fn cend(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.compacting {
            return Err(Error::invalid_argument("no compaction in progress"));
        }
        let sealed = inner.active().append_marker(Marker::CEnd).and_then(|()| {
            let min_gen = inner.active().generation() + 1;
            inner.standby().erase(min_gen).map(|_| ())
        });
        if let Err(e) = sealed {
            warn!("MDC compaction end failed, closing: {}", e);
            let _ = inner.shutdown();
            return Err(e);
        }
        inner.compacting = false;
        info!(
            "MDC compaction finished: active log {} generation {}",
            inner.active().id(),
            inner.active().generation()
        );
        Ok(())
    }

    /// Append a record to the active log
    pub fn append(&self, data: &[u8], sync: bool) -> Result<()> {
        self.lock()?.active().append(data, sync)
    }

    /// Read the next record of the active log
    pub fn read_next(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        self.lock()?.active().read_next(buf)
    }

    pub fn seek_read_next(&self, skip: usize, buf: &mut [u8]) -> Result<Option<usize>> {
        self.lock()?.active().seek_read_next(skip, buf)
    }

    pub fn rewind(&self) -> Result<()> {
        self.lock()?.active().rewind()
    }

    pub fn sync(&self) -> Result<()> {
        self.lock()?.active().sync()
    }

    /// Bytes used in the active log
    pub fn usage(&self) -> Result<u64> {
        self.lock()?.active().len()
    }

    pub fn active_gen(&self) -> Result<u64> {
        Ok(self.lock()?.active().generation())
    }

    pub fn compacting(&self) -> Result<bool> {
        Ok(self.lock()?.compacting)
    }

    /// Close both logs and release them
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock()?;
        info!("Closing MDC");
        inner.shutdown()
    }
}

impl Drop for Mdc {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.open {
            let _ = inner.shutdown();
        }
    }
}

impl fmt::Debug for Mdc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Mdc")
            .field("logs", &[inner.logs[0].id(), inner.logs[1].id()])
            .field("active", &inner.active)
            .field("compacting", &inner.compacting)
            .field("open", &inner.open)
            .finish()
    }
}
