//! Page-granular append and read buffers
//!
//! Both buffers hold a run of consecutive log pages. A page is
//! [`LOG_PAGE_SIZE`] bytes and covers `sectors_per_page` log blocks; the
//! first page of a buffer always starts on a page-aligned sector, which
//! [`PageStart`] makes explicit.

use crate::extent::Geometry;
use crate::logblock::LogBlockIo;
use crate::omf::LOGREC_DESC_LEN;
use crate::raw_io::AlignedBuffer;
use mpool_common::{Error, LOG_PAGE_SIZE, Result};
use std::io::{IoSlice, IoSliceMut};

/// Layout of a log in blocks and pages
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogGeometry {
    pub sector_size: usize,
    pub total_sectors: u64,
    pub sectors_per_page: u64,
}

impl LogGeometry {
    /// Derive the log layout, rejecting sector sizes a page cannot hold
    pub fn new(geometry: Geometry) -> Result<Self> {
        let sector_size = geometry.sector_size;
        if sector_size == 0 || sector_size > LOG_PAGE_SIZE || LOG_PAGE_SIZE % sector_size != 0 {
            return Err(Error::invalid_argument(format!(
                "unsupported sector size {sector_size}"
            )));
        }
        if geometry.total_sectors == 0 {
            return Err(Error::invalid_argument("log has no sectors"));
        }
        Ok(Self {
            sector_size,
            total_sectors: geometry.total_sectors,
            sectors_per_page: (LOG_PAGE_SIZE / sector_size) as u64,
        })
    }

    /// Byte offset of a log block
    pub const fn offset(&self, sector: u64) -> u64 {
        sector * self.sector_size as u64
    }

    /// Byte range of `sector` within its page
    const fn in_page(&self, sector: u64) -> std::ops::Range<usize> {
        let start = (sector % self.sectors_per_page) as usize * self.sector_size;
        start..start + self.sector_size
    }
}

/// First sector of a log page
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageStart(u64);

impl PageStart {
    /// Page start at or below `sector`
    pub const fn containing(sector: u64, geo: &LogGeometry) -> Self {
        Self(sector - sector % geo.sectors_per_page)
    }

    pub const fn sector(self) -> u64 {
        self.0
    }
}

/// Take a page from the spare list, or allocate one
fn take_page(spare: &mut Vec<AlignedBuffer>) -> AlignedBuffer {
    spare.pop().map_or_else(
        || AlignedBuffer::new(LOG_PAGE_SIZE),
        |mut page| {
            page.clear();
            page
        },
    )
}

/// Pages of the current flush set, plus the page-aligned blocks before it
///
/// Block `s` lives in page `(s - start) / sectors_per_page`. Pages are
/// allocated zeroed on first touch and recycled when retired.
#[derive(Debug)]
pub struct AppendBuffer {
    geo: LogGeometry,
    max_pages: usize,
    start: PageStart,
    pages: Vec<AlignedBuffer>,
    spare: Vec<AlignedBuffer>,
}

impl AppendBuffer {
    pub fn new(geo: LogGeometry, max_pages: usize) -> Self {
        Self {
            geo,
            max_pages: max_pages.max(1),
            start: PageStart::default(),
            pages: Vec::new(),
            spare: Vec::new(),
        }
    }

    pub const fn start(&self) -> PageStart {
        self.start
    }

    fn page_index(&self, sector: u64) -> usize {
        ((sector - self.start.0) / self.geo.sectors_per_page) as usize
    }

    /// Whether block `sector` can be held without a flush
    pub fn fits(&self, sector: u64) -> bool {
        sector >= self.start.0 && self.page_index(sector) < self.max_pages
    }

    /// Buffered content of a block, `None` if its page was never touched
    pub fn block(&self, sector: u64) -> Option<&[u8]> {
        if sector < self.start.0 {
            return None;
        }
        let range = self.geo.in_page(sector);
        self.pages
            .get(self.page_index(sector))
            .map(|page| &page.as_slice()[range])
    }

    /// Mutable block, allocating zeroed pages up to it
    pub fn block_mut(&mut self, sector: u64) -> &mut [u8] {
        debug_assert!(self.fits(sector), "block {sector} outside append buffer");
        let index = self.page_index(sector);
        while self.pages.len() <= index {
            let page = take_page(&mut self.spare);
            self.pages.push(page);
        }
        let range = self.geo.in_page(sector);
        &mut self.pages[index].as_mut_slice()[range]
    }

    /// Write vector covering blocks `[start, end)`
    pub fn io_slices(&self, end: u64) -> Vec<IoSlice<'_>> {
        let mut left = end.saturating_sub(self.start.0) as usize * self.geo.sector_size;
        let mut iov = Vec::new();
        for page in &self.pages {
            if left == 0 {
                break;
            }
            let n = left.min(LOG_PAGE_SIZE);
            iov.push(IoSlice::new(&page.as_slice()[..n]));
            left -= n;
        }
        iov
    }

    /// Drop pages before the one containing `start`
    pub fn retire(&mut self, start: PageStart) {
        if start <= self.start {
            return;
        }
        let drop = self.page_index(start.0).min(self.pages.len());
        self.spare.extend(self.pages.drain(..drop));
        self.start = start;
    }

    /// Discard everything at and after byte `off` of block `sector`
    pub fn truncate(&mut self, sector: u64, off: usize) {
        if sector < self.start.0 {
            return;
        }
        let index = self.page_index(sector);
        if index >= self.pages.len() {
            return;
        }
        let from = self.geo.in_page(sector).start + off;
        self.pages[index].as_mut_slice()[from..].fill(0);
        self.spare.extend(self.pages.drain(index + 1..));
    }

    /// Empty the buffer and restart it at `start`
    pub fn reset(&mut self, start: PageStart) {
        self.spare.append(&mut self.pages);
        self.start = start;
    }

    /// Load the first page from media, keeping only the bytes before byte
    /// `off` of block `sector`
    ///
    /// A flush rewrites whole pages, so blocks that precede the write
    /// position in the first page must carry their on-media content.
    pub fn populate(&mut self, io: &LogBlockIo, sector: u64, off: usize) -> Result<()> {
        let first = self.start.0;
        let nsectors = self
            .geo
            .sectors_per_page
            .min(self.geo.total_sectors - first) as usize;
        let len = nsectors * self.geo.sector_size;
        self.block_mut(first);
        io.read(
            self.geo.offset(first),
            &mut [IoSliceMut::new(&mut self.pages[0].as_mut_slice()[..len])],
        )?;
        if sector < first + nsectors as u64 {
            self.truncate(sector, off);
        }
        Ok(())
    }
}

/// Read-ahead window over committed blocks
#[derive(Debug)]
pub struct ReadBuffer {
    geo: LogGeometry,
    max_pages: usize,
    start: u64,
    nsectors: u64,
    pages: Vec<AlignedBuffer>,
}

impl ReadBuffer {
    pub fn new(geo: LogGeometry, max_pages: usize) -> Self {
        Self {
            geo,
            max_pages: max_pages.max(1),
            start: 0,
            nsectors: 0,
            pages: Vec::new(),
        }
    }

    pub const fn covers(&self, sector: u64) -> bool {
        sector >= self.start && sector < self.start + self.nsectors
    }

    /// Fill the window from the page containing `sector`, never reading
    /// at or past block `limit`
    pub fn load(&mut self, io: &LogBlockIo, sector: u64, limit: u64) -> Result<()> {
        debug_assert!(sector < limit);
        let start = PageStart::containing(sector, &self.geo).sector();
        let window = self.max_pages as u64 * self.geo.sectors_per_page;
        let nsectors = window.min(limit - start);
        let npages = nsectors.div_ceil(self.geo.sectors_per_page) as usize;

        self.nsectors = 0;
        self.pages.truncate(npages);
        while self.pages.len() < npages {
            self.pages.push(AlignedBuffer::new(LOG_PAGE_SIZE));
        }

        let mut left = nsectors as usize * self.geo.sector_size;
        let mut iov = Vec::with_capacity(npages);
        for page in &mut self.pages {
            let n = left.min(LOG_PAGE_SIZE);
            iov.push(IoSliceMut::new(&mut page.as_mut_slice()[..n]));
            left -= n;
        }
        io.read(self.geo.offset(start), &mut iov)?;

        self.start = start;
        self.nsectors = nsectors;
        Ok(())
    }

    /// Block content if the window covers it
    pub fn block(&self, sector: u64) -> Option<&[u8]> {
        if !self.covers(sector) {
            return None;
        }
        let index = ((sector - self.start) / self.geo.sectors_per_page) as usize;
        let range = self.geo.in_page(sector);
        self.pages.get(index).map(|page| &page.as_slice()[range])
    }

    /// Free the window
    pub fn release(&mut self) {
        self.pages.clear();
        self.nsectors = 0;
    }
}

/// Whether a block with write offset `aoff` can take another chunk
pub const fn block_full(sector_size: usize, aoff: usize) -> bool {
    sector_size - aoff <= LOGREC_DESC_LEN
}
