//! Sector-granular block I/O over an extent
//!
//! The log engine addresses its media in whole log blocks. This adapter
//! enforces sector alignment and bounds, and splits long vectors into
//! batches the extent accepts in one call.

use crate::extent::{Extent, Geometry, WriteFlags};
use mpool_common::{Error, Result};
use std::io::{IoSlice, IoSliceMut};
use std::sync::Arc;

/// Block I/O handle of one log
#[derive(Clone, Debug)]
pub struct LogBlockIo {
    extent: Arc<dyn Extent>,
    geometry: Geometry,
    max_iovecs: usize,
}

impl LogBlockIo {
    pub fn new(extent: Arc<dyn Extent>) -> Self {
        let geometry = extent.geometry();
        let max_iovecs = extent.max_iovecs().max(1);
        Self {
            extent,
            geometry,
            max_iovecs,
        }
    }

    /// Backing extent
    pub fn extent(&self) -> &Arc<dyn Extent> {
        &self.extent
    }

    /// Sector geometry of the backing extent
    pub const fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Read whole sectors starting at byte `offset`
    pub fn read(&self, offset: u64, iov: &mut [IoSliceMut<'_>]) -> Result<()> {
        let lens: Vec<usize> = iov.iter().map(|b| b.len()).collect();
        self.check(offset, &lens)?;

        let mut pos = offset;
        for batch in iov.chunks_mut(self.max_iovecs) {
            let len: usize = batch.iter().map(|b| b.len()).sum();
            self.extent.read_at(pos, batch)?;
            pos += len as u64;
        }
        Ok(())
    }

    /// Write whole sectors starting at byte `offset`
    ///
    /// When the vector is split, `preflush` applies to the first batch and
    /// `fua` to the last, so the durability contract covers the whole write.
    pub fn write(&self, offset: u64, iov: &[IoSlice<'_>], flags: WriteFlags) -> Result<()> {
        let lens: Vec<usize> = iov.iter().map(|b| b.len()).collect();
        self.check(offset, &lens)?;

        let nbatches = iov.len().div_ceil(self.max_iovecs);
        let mut pos = offset;
        for (i, batch) in iov.chunks(self.max_iovecs).enumerate() {
            let batch_flags = WriteFlags {
                preflush: flags.preflush && i == 0,
                fua: flags.fua && i + 1 == nbatches,
            };
            let len: usize = batch.iter().map(|b| b.len()).sum();
            self.extent.write_at(pos, batch, batch_flags)?;
            pos += len as u64;
        }
        Ok(())
    }

    fn check(&self, offset: u64, lens: &[usize]) -> Result<()> {
        let sector = self.geometry.sector_size;
        if offset % sector as u64 != 0 {
            return Err(Error::invalid_argument(format!(
                "offset {offset} not aligned to sector size {sector}"
            )));
        }
        if let Some(len) = lens.iter().find(|&&len| len % sector != 0) {
            return Err(Error::invalid_argument(format!(
                "buffer length {len} not a multiple of sector size {sector}"
            )));
        }
        let total: u64 = lens.iter().map(|&len| len as u64).sum();
        if offset + total > self.geometry.capacity() {
            return Err(Error::invalid_argument(format!(
                "range {offset}+{total} exceeds log capacity {}",
                self.geometry.capacity()
            )));
        }
        Ok(())
    }
}
