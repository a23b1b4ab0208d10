//! The mlog engine
//!
//! An mlog is an append-only record log over one extent. Records are split
//! into chunks that never cross a log block; blocks are gathered in an
//! [`AppendBuffer`] and written back as a flush set, one vectored write per
//! set. Every block header links its flush set to the previous one
//! (`pfsetid`) and names its own (`cfsetid`), so the open-time scan can find
//! the logical end of log (LEOL) after a crash: the first block whose
//! header does not continue the chain.
//!
//! A flush set is written from the start of the page holding its first
//! block. With sectors smaller than a page the leading blocks of that page
//! are already on media; they are rewritten with their existing content.

use crate::buffer::{AppendBuffer, LogGeometry, PageStart, ReadBuffer, block_full};
use crate::extent::{Extent, WriteFlags};
use crate::logblock::LogBlockIo;
use crate::omf::{
    LOGBLOCK_HDR_LEN, LOGREC_DESC_LEN, LogBlockHeader, RecordDescriptor, RecordType,
    logblock_is_empty,
};
use mpool_common::{Error, LOG_PAGE_SIZE, MAX_FLUSH_SET_BYTES, MlogConfig, ObjectId, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

const HDR: usize = LOGBLOCK_HDR_LEN;
const DESC: usize = LOGREC_DESC_LEN;

/// Stand-in for blocks the append buffer has not touched yet
static ZERO_BLOCK: [u8; LOG_PAGE_SIZE] = [0; LOG_PAGE_SIZE];

/// Flags fixed at open time
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags {
    /// Compaction semantics: content must be bracketed by CSTART/CEND
    pub csem: bool,
    /// Caller serializes access itself. Recorded only; the log lock is
    /// always taken.
    pub skip_ser: bool,
}

impl OpenFlags {
    #[must_use]
    pub const fn with_csem(mut self) -> Self {
        self.csem = true;
        self
    }

    #[must_use]
    pub const fn with_skip_ser(mut self) -> Self {
        self.skip_ser = true;
        self
    }
}

/// Compaction marker record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Marker {
    CStart,
    CEnd,
}

impl Marker {
    const fn rtype(self) -> RecordType {
        match self {
            Self::CStart => RecordType::CStart,
            Self::CEnd => RecordType::CEnd,
        }
    }
}

/// Snapshot of an open log's engine state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MlogStat {
    pub generation: u64,
    pub len: u64,
    pub dmax: u64,
    /// Block being filled
    pub wsoff: u64,
    /// Write offset inside that block
    pub aoff: usize,
    /// Id the next flush set is written with
    pub cfsetid: u32,
    /// Id the next flush set links back to
    pub pfsetid: u32,
    pub cstart: bool,
    pub cend: bool,
}

/// Write position saved before an append
#[derive(Clone, Copy, Debug)]
struct Cursor {
    wsoff: u64,
    aoff: usize,
    dirty: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ReadPos {
    sector: u64,
    off: usize,
}

impl ReadPos {
    const START: Self = Self {
        sector: 0,
        off: HDR,
    };
}

/// A chunk located by the reader
#[derive(Clone, Copy, Debug)]
struct Chunk {
    desc: RecordDescriptor,
    sector: u64,
    payload: usize,
}

/// Record chain validation for the open-time scan
#[derive(Debug, Default)]
struct ChainCheck {
    midrec: bool,
    cstart: bool,
    cend: bool,
    has_data: bool,
}

impl ChainCheck {
    /// Validate the chunks of one block, returning the offset past the last
    fn scan_block(&mut self, block: &[u8], sector: u64) -> Result<usize> {
        let sector_size = block.len();
        let mut off = HDR;
        while sector_size - off > DESC {
            let desc = RecordDescriptor::unpack(&block[off..])?;
            let first = off == HDR;
            let bad = |what: &str| {
                Error::malformed(format!("log block {sector} offset {off}: {what}"))
            };

            match desc.rtype {
                RecordType::Eolb => {
                    if first || self.midrec {
                        return Err(bad("end of block before any record"));
                    }
                    break;
                }
                RecordType::CStart => {
                    if desc.rlen != 0 || sector != 0 || !first || self.cstart {
                        return Err(bad("misplaced CSTART"));
                    }
                    self.cstart = true;
                }
                RecordType::CEnd => {
                    if desc.rlen != 0 || !self.cstart || self.cend {
                        return Err(bad("misplaced CEND"));
                    }
                    if self.midrec {
                        if !first {
                            return Err(bad("CEND inside a record"));
                        }
                        // torn record before the marker is dropped
                        self.midrec = false;
                    }
                    self.cend = true;
                }
                RecordType::DataFull | RecordType::DataFirst => {
                    if self.midrec && !first {
                        return Err(bad("record starts inside another record"));
                    }
                    let full = desc.rtype == RecordType::DataFull;
                    if (full && desc.tlen != u32::from(desc.rlen))
                        || (!full && desc.tlen <= u32::from(desc.rlen))
                    {
                        return Err(bad("chunk length disagrees with record length"));
                    }
                    self.midrec = !full;
                    self.has_data = true;
                }
                RecordType::DataMid | RecordType::DataLast => {
                    if !self.midrec {
                        return Err(bad("continuation chunk outside a record"));
                    }
                    self.midrec = desc.rtype == RecordType::DataMid;
                }
            }

            let end = off + DESC + desc.rlen as usize;
            if end > sector_size {
                return Err(bad("chunk overruns log block"));
            }
            off = end;
        }
        Ok(off)
    }
}

/// Header of a block during the open scan, `None` if it is not part of this
/// log generation
fn scan_header(
    block: &[u8],
    magic: &[u8; 16],
    generation: u64,
    strict: bool,
) -> Result<Option<LogBlockHeader>> {
    if logblock_is_empty(block) {
        return Ok(None);
    }
    match LogBlockHeader::unpack(block) {
        Ok(h) if &h.magic == magic && h.generation == generation => Ok(Some(h)),
        Ok(_) => Ok(None),
        Err(e) if strict => Err(e),
        Err(_) => Ok(None),
    }
}

/// Engine state of an open log
struct LogState {
    flags: OpenFlags,
    geo: LogGeometry,
    magic: [u8; 16],
    generation: u64,
    /// First block of the current flush set
    fs_start: u64,
    wsoff: u64,
    aoff: usize,
    pfsetid: u32,
    cfsetid: u32,
    /// Buffered blocks not yet on media
    dirty: bool,
    /// A flush failed; the media past the write position may hold blocks of
    /// that attempt
    stale: bool,
    cstart: bool,
    cend: bool,
    abuf: AppendBuffer,
    rbuf: ReadBuffer,
    rd: ReadPos,
}

impl LogState {
    fn empty(
        geo: LogGeometry,
        config: &MlogConfig,
        flags: OpenFlags,
        magic: [u8; 16],
        generation: u64,
    ) -> Self {
        Self {
            flags,
            geo,
            magic,
            generation,
            fs_start: 0,
            wsoff: 0,
            aoff: HDR,
            pfsetid: 0,
            cfsetid: 1,
            dirty: false,
            stale: false,
            cstart: false,
            cend: false,
            abuf: AppendBuffer::new(geo, config.append_pages()),
            rbuf: ReadBuffer::new(geo, config.read_pages()),
            rd: ReadPos::START,
        }
    }

    /// Rebuild the engine state from media
    fn recover(
        io: &LogBlockIo,
        geo: LogGeometry,
        config: &MlogConfig,
        flags: OpenFlags,
    ) -> Result<Self> {
        let extent = io.extent();
        let magic = extent.magic();
        let generation = extent.generation();
        let total = geo.total_sectors;
        let window = (MAX_FLUSH_SET_BYTES / geo.sector_size) as u64;

        let mut scan_buf = ReadBuffer::new(geo, config.read_pages());
        let mut chain = ChainCheck::default();
        let mut limit = total;
        let mut leol = None;
        let mut fsetidmax = 0u32;
        let mut stale_max = 0u32;
        let mut last_valid = None;

        let mut sector = 0;
        while sector < limit {
            if !scan_buf.covers(sector) {
                scan_buf.load(io, sector, limit)?;
            }
            let block = scan_buf
                .block(sector)
                .ok_or_else(|| Error::io(format!("log block {sector} not loaded")))?;
            let header = scan_header(block, &magic, generation, leol.is_none())?;

            if leol.is_none() {
                match header {
                    Some(h) if h.pfsetid == fsetidmax => {
                        let aoff = chain.scan_block(block, sector)?;
                        fsetidmax = fsetidmax.max(h.cfsetid);
                        last_valid = Some((sector, aoff, h.pfsetid));
                    }
                    _ => {
                        // the block at LEOL may itself be a stale set
                        if let Some(h) = header {
                            stale_max = stale_max.max(h.cfsetid);
                        }
                        leol = Some(sector);
                        limit = total.min(sector + window);
                    }
                }
            } else if let Some(h) = header {
                stale_max = stale_max.max(h.cfsetid);
            }
            sector += 1;
        }
        let leol = leol.unwrap_or(total);

        if flags.csem && chain.has_data && !chain.cstart {
            return Err(Error::malformed("compacting log holds data before CSTART"));
        }
        if chain.cstart && !chain.cend {
            return Err(Error::IncompleteCompaction(format!(
                "CSTART without CEND, log ends at block {leol}"
            )));
        }
        if stale_max > 0 {
            warn!(
                "Discarded stale flush sets past block {} (cfsetid up to {})",
                leol, stale_max
            );
        }

        let mut state = Self::empty(geo, config, flags, magic, generation);
        state.cstart = chain.cstart;
        state.cend = chain.cend;
        state.cfsetid = fsetidmax.max(stale_max).wrapping_add(1);
        match last_valid {
            Some((s, aoff, pfsetid))
                if s + 1 == leol && !chain.midrec && !block_full(geo.sector_size, aoff) =>
            {
                state.wsoff = s;
                state.aoff = aoff;
                state.pfsetid = pfsetid;
            }
            _ => {
                state.wsoff = leol;
                state.aoff = HDR;
                state.pfsetid = fsetidmax;
            }
        }
        state.fs_start = state.wsoff;

        let start = PageStart::containing(state.wsoff, &geo);
        state.abuf.reset(start);
        if state.wsoff < total && (start.sector() < state.wsoff || state.aoff > HDR) {
            state.abuf.populate(io, state.wsoff, state.aoff)?;
        }

        debug!(
            "Scanned log: leol {} wsoff {} aoff {} pfsetid {} cfsetid {}",
            leol, state.wsoff, state.aoff, state.pfsetid, state.cfsetid
        );
        Ok(state)
    }

    const fn cursor(&self) -> Cursor {
        Cursor {
            wsoff: self.wsoff,
            aoff: self.aoff,
            dirty: self.dirty,
        }
    }

    fn rollback(&mut self, cursor: Cursor) {
        self.wsoff = cursor.wsoff;
        self.aoff = cursor.aoff;
        self.dirty = cursor.dirty || self.stale;
        self.abuf.truncate(cursor.wsoff, cursor.aoff);
    }

    const fn is_empty(&self) -> bool {
        self.wsoff == 0 && self.aoff == HDR
    }

    const fn len(&self) -> u64 {
        if self.wsoff >= self.geo.total_sectors {
            return self.geo.offset(self.geo.total_sectors);
        }
        self.geo.offset(self.wsoff) + self.aoff as u64
    }

    /// Payload bytes that can still be appended
    const fn dmax(&self) -> u64 {
        let total = self.geo.total_sectors;
        if self.wsoff >= total {
            return 0;
        }
        let sector_size = self.geo.sector_size;
        let avail = sector_size - self.aoff;
        let current = if avail > DESC { avail - DESC } else { 0 };
        current as u64 + (total - self.wsoff - 1) * (sector_size - HDR - DESC) as u64
    }

    fn stat(&self) -> MlogStat {
        MlogStat {
            generation: self.generation,
            len: self.len(),
            dmax: self.dmax(),
            wsoff: self.wsoff,
            aoff: self.aoff,
            cfsetid: self.cfsetid,
            pfsetid: self.pfsetid,
            cstart: self.cstart,
            cend: self.cend,
        }
    }

    /// Write back the current flush set
    fn flush(&mut self, io: &LogBlockIo) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let total = self.geo.total_sectors;
        let end = if self.aoff > HDR || self.stale {
            self.wsoff + 1
        } else {
            self.wsoff
        }
        .min(total);

        for sector in self.fs_start..end {
            let block = self.abuf.block_mut(sector);
            if sector == self.wsoff && self.aoff == HDR {
                // goes out zeroed, over whatever a failed flush left there;
                // the failed attempt's header is still in the buffer
                block.fill(0);
                continue;
            }
            let pfsetid = if sector == self.fs_start {
                self.pfsetid
            } else {
                self.cfsetid
            };
            LogBlockHeader::new(self.magic, pfsetid, self.cfsetid, self.generation)
                .pack_into(block);
        }

        let start = self.abuf.start().sector();
        let written = {
            let iov = self.abuf.io_slices(end);
            io.write(self.geo.offset(start), &iov, WriteFlags::FUA)
        };
        if let Err(e) = written {
            // blocks of this attempt may have landed; the retry must not
            // share their set id
            self.cfsetid = self.cfsetid.wrapping_add(1);
            self.stale = true;
            return Err(e);
        }
        debug!(
            "Flushed set {} blocks {}..{} (written from {})",
            self.cfsetid, self.fs_start, end, start
        );

        let old_start = self.fs_start;
        if self.wsoff < total && block_full(self.geo.sector_size, self.aoff) {
            self.wsoff += 1;
            self.aoff = HDR;
        }
        if self.wsoff != old_start {
            self.pfsetid = self.cfsetid;
        }
        self.fs_start = self.wsoff;
        self.cfsetid = self.cfsetid.wrapping_add(1);
        self.abuf
            .retire(PageStart::containing(self.fs_start, &self.geo));
        self.dirty = false;
        self.stale = false;
        Ok(())
    }

    /// Move to the next block, flushing when the append buffer is exhausted
    fn advance_block(&mut self, io: &LogBlockIo, rollback: &mut Cursor) -> Result<()> {
        let next = self.wsoff + 1;
        if self.abuf.fits(next) {
            self.wsoff = next;
            self.aoff = HDR;
            return Ok(());
        }
        self.flush(io)?;
        *rollback = self.cursor();
        Ok(())
    }

    fn append(
        &mut self,
        io: &LogBlockIo,
        data: &[u8],
        marker: Option<Marker>,
        sync: bool,
    ) -> Result<()> {
        let tlen = u32::try_from(data.len())
            .map_err(|_| Error::invalid_argument(format!("record of {} bytes", data.len())))?;
        let dmax = self.dmax();
        if dmax == 0 || u64::from(tlen) > dmax {
            if let Err(e) = self.flush(io) {
                warn!("Flush before reporting a full log failed: {}", e);
            }
            return Err(Error::LogFull {
                requested: u64::from(tlen),
                available: dmax,
            });
        }

        let mut rollback = self.cursor();
        let mut result = self.write_chunks(io, data, tlen, marker, &mut rollback);
        if result.is_ok() && (sync || marker.is_some()) {
            result = self.flush(io);
        }
        if result.is_err() {
            self.rollback(rollback);
        }
        result
    }

    fn write_chunks(
        &mut self,
        io: &LogBlockIo,
        data: &[u8],
        tlen: u32,
        marker: Option<Marker>,
        rollback: &mut Cursor,
    ) -> Result<()> {
        let mut pos = 0;
        loop {
            if block_full(self.geo.sector_size, self.aoff) {
                self.advance_block(io, rollback)?;
            }
            let avail = self.geo.sector_size - self.aoff - DESC;
            let n = avail.min(data.len() - pos).min(usize::from(u16::MAX));
            let last = pos + n == data.len();
            let rtype = match (marker, pos == 0, last) {
                (Some(m), _, _) => m.rtype(),
                (None, true, true) => RecordType::DataFull,
                (None, true, false) => RecordType::DataFirst,
                (None, false, false) => RecordType::DataMid,
                (None, false, true) => RecordType::DataLast,
            };

            let aoff = self.aoff;
            let block = self.abuf.block_mut(self.wsoff);
            #[allow(clippy::cast_possible_truncation)]
            RecordDescriptor::new(tlen, n as u16, rtype).pack_into(&mut block[aoff..]);
            block[aoff + DESC..aoff + DESC + n].copy_from_slice(&data[pos..pos + n]);
            self.aoff += DESC + n;
            self.dirty = true;
            pos += n;

            if last {
                return Ok(());
            }
        }
    }

    /// Content of a block as the reader sees it
    fn block_at(&mut self, io: &LogBlockIo, sector: u64) -> Result<&[u8]> {
        let buffered = self.abuf.start().sector();
        if sector >= buffered {
            return Ok(self
                .abuf
                .block(sector)
                .unwrap_or(&ZERO_BLOCK[..self.geo.sector_size]));
        }
        if !self.rbuf.covers(sector) {
            self.rbuf.load(io, sector, buffered)?;
        }
        self.rbuf
            .block(sector)
            .ok_or_else(|| Error::io(format!("log block {sector} not loaded")))
    }

    /// Next chunk at the read cursor; the cursor moves past it
    fn next_chunk(&mut self, io: &LogBlockIo) -> Result<Option<Chunk>> {
        loop {
            let ReadPos { sector, off } = self.rd;
            if sector >= self.geo.total_sectors || sector > self.wsoff {
                return Ok(None);
            }
            let limit = if sector == self.wsoff {
                if off >= self.aoff {
                    return Ok(None);
                }
                self.aoff
            } else {
                self.geo.sector_size
            };
            if off + DESC > limit {
                self.rd = ReadPos {
                    sector: sector + 1,
                    off: HDR,
                };
                continue;
            }

            let block = self.block_at(io, sector)?;
            let desc = RecordDescriptor::unpack(&block[off..])?;
            if desc.rtype == RecordType::Eolb {
                self.rd = ReadPos {
                    sector: sector + 1,
                    off: HDR,
                };
                continue;
            }
            let payload = off + DESC;
            let end = payload + desc.rlen as usize;
            if end > limit {
                return Err(Error::malformed(format!(
                    "log block {sector} offset {off}: chunk overruns log block"
                )));
            }
            self.rd.off = end;
            return Ok(Some(Chunk {
                desc,
                sector,
                payload,
            }));
        }
    }

    /// Read (or with `out == None` skip) the next data record
    ///
    /// The cursor is left untouched on error.
    fn read_record(&mut self, io: &LogBlockIo, out: Option<&mut [u8]>) -> Result<Option<usize>> {
        let saved = self.rd;
        let mut out = out;
        let result = self.assemble_record(io, &mut out);
        if result.is_err() {
            self.rd = saved;
        }
        result
    }

    fn assemble_record(
        &mut self,
        io: &LogBlockIo,
        out: &mut Option<&mut [u8]>,
    ) -> Result<Option<usize>> {
        // (record length, bytes gathered) of the record being assembled
        let mut partial: Option<(usize, usize)> = None;
        // The record being assembled fits the caller's buffer
        let mut fits = true;

        while let Some(chunk) = self.next_chunk(io)? {
            let tlen = chunk.desc.tlen as usize;
            let rlen = chunk.desc.rlen as usize;
            let copied = match chunk.desc.rtype {
                RecordType::Eolb | RecordType::CStart | RecordType::CEnd => continue,
                // a new record supersedes a torn one
                RecordType::DataFull | RecordType::DataFirst => {
                    fits = out.as_deref().is_none_or(|buf| buf.len() >= tlen);
                    0
                }
                RecordType::DataMid | RecordType::DataLast => match partial {
                    Some((len, copied)) if len == tlen => copied,
                    _ => {
                        return Err(Error::malformed(format!(
                            "log block {}: continuation chunk outside a record",
                            chunk.sector
                        )));
                    }
                },
            };
            if copied + rlen > tlen {
                return Err(Error::malformed(format!(
                    "log block {}: chunks exceed record length {tlen}",
                    chunk.sector
                )));
            }

            if fits {
                if let Some(buf) = out.as_deref_mut() {
                    let block = self.block_at(io, chunk.sector)?;
                    buf[copied..copied + rlen]
                        .copy_from_slice(&block[chunk.payload..chunk.payload + rlen]);
                }
            }
            let copied = copied + rlen;

            match chunk.desc.rtype {
                RecordType::DataFull | RecordType::DataLast => {
                    if copied != tlen {
                        return Err(Error::malformed(format!(
                            "log block {}: record of {tlen} bytes ends after {copied}",
                            chunk.sector
                        )));
                    }
                    if !fits {
                        return Err(Error::BufferTooSmall { required: tlen });
                    }
                    return Ok(Some(tlen));
                }
                _ => partial = Some((tlen, copied)),
            }
        }
        Ok(None)
    }

    fn seek_read_next(
        &mut self,
        io: &LogBlockIo,
        skip: usize,
        buf: &mut [u8],
    ) -> Result<Option<usize>> {
        let saved = self.rd;
        let mut skipped = 0;
        while skipped < skip {
            match self.read_record(io, None) {
                Ok(Some(n)) => skipped += n,
                Ok(None) => return Ok(None),
                Err(e) => {
                    self.rd = saved;
                    return Err(e);
                }
            }
        }
        if skipped != skip {
            self.rd = saved;
            return Err(Error::invalid_argument(format!(
                "skip of {skip} bytes ends inside a record ({skipped} bytes skipped)"
            )));
        }
        let result = self.read_record(io, Some(buf));
        if result.is_err() {
            self.rd = saved;
        }
        result
    }

    fn rewind(&mut self) {
        self.rd = ReadPos::START;
        self.rbuf.release();
    }
}

/// An append-only, crash-recoverable record log
///
/// Every operation takes the log's internal lock, including on logs opened
/// with [`OpenFlags::skip_ser`]. The flag is validated on reopen and
/// reported back, but it does not remove the lock.
pub struct Mlog {
    id: ObjectId,
    io: LogBlockIo,
    geo: LogGeometry,
    config: MlogConfig,
    committed: AtomicBool,
    claimed: AtomicBool,
    state: Mutex<Option<LogState>>,
}

impl Mlog {
    /// Wrap an extent; the log starts closed
    pub fn new(
        id: ObjectId,
        extent: Arc<dyn Extent>,
        config: MlogConfig,
        committed: bool,
    ) -> Result<Self> {
        config.validate()?;
        let io = LogBlockIo::new(extent);
        let geo = LogGeometry::new(io.geometry())?;
        if geo.sector_size <= HDR + DESC {
            return Err(Error::invalid_argument(format!(
                "sector size {} cannot hold a record",
                geo.sector_size
            )));
        }
        Ok(Self {
            id,
            io,
            geo,
            config,
            committed: AtomicBool::new(committed),
            claimed: AtomicBool::new(false),
            state: Mutex::new(None),
        })
    }

    pub const fn id(&self) -> ObjectId {
        self.id
    }

    /// Capacity in bytes
    pub const fn capacity(&self) -> u64 {
        self.geo.offset(self.geo.total_sectors)
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    pub(crate) fn set_committed(&self) {
        self.committed.store(true, Ordering::Release);
    }

    /// Take exclusive ownership for an MDC
    pub(crate) fn claim(&self) -> Result<()> {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::busy(format!("mlog {} is claimed", self.id)))
    }

    pub(crate) fn release(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        self.io.extent().generation()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut LogState, &LogBlockIo) -> Result<T>) -> Result<T> {
        let mut guard = self.state.lock();
        let state = guard
            .as_mut()
            .ok_or_else(|| Error::not_found(format!("mlog {} is not open", self.id)))?;
        f(state, &self.io)
    }

    /// Open the log, recovering its state from media; returns the generation
    ///
    /// Opening an open log with the same flags is a no-op.
    pub fn open(&self, flags: OpenFlags) -> Result<u64> {
        if !self.is_committed() {
            return Err(Error::invalid_argument(format!(
                "mlog {} is not committed",
                self.id
            )));
        }
        let mut guard = self.state.lock();
        if let Some(state) = guard.as_ref() {
            if state.flags != flags {
                return Err(Error::invalid_argument(format!(
                    "mlog {} already open with {:?}",
                    self.id, state.flags
                )));
            }
            return Ok(state.generation);
        }

        let state = LogState::recover(&self.io, self.geo, &self.config, flags)?;
        let generation = state.generation;
        info!(
            "Opened mlog {} generation {} ({} bytes used)",
            self.id,
            generation,
            state.len()
        );
        *guard = Some(state);
        Ok(generation)
    }

    /// Flush and drop the engine state
    pub fn close(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = guard
            .as_mut()
            .ok_or_else(|| Error::not_found(format!("mlog {} is not open", self.id)))?;
        state.flush(&self.io)?;
        *guard = None;
        debug!("Closed mlog {}", self.id);
        Ok(())
    }

    /// Append one record; with `sync` it is durable on return
    pub fn append(&self, data: &[u8], sync: bool) -> Result<()> {
        self.with_state(|state, io| {
            if state.flags.csem && !state.cstart {
                return Err(Error::invalid_argument(
                    "compacting log needs CSTART before data",
                ));
            }
            state.append(io, data, None, sync)
        })
    }

    /// Append a compaction marker; markers are always durable on return
    pub fn append_marker(&self, marker: Marker) -> Result<()> {
        self.with_state(|state, io| {
            match marker {
                Marker::CStart if state.cstart || !state.is_empty() => {
                    return Err(Error::invalid_argument(
                        "CSTART must be the first record of the log",
                    ));
                }
                Marker::CEnd if !state.cstart || state.cend => {
                    return Err(Error::invalid_argument("CEND without an open CSTART"));
                }
                _ => {}
            }
            state.append(io, &[], Some(marker), true)?;
            match marker {
                Marker::CStart => state.cstart = true,
                Marker::CEnd => state.cend = true,
            }
            Ok(())
        })
    }

    /// Read the next record into `buf`
    ///
    /// Returns `Ok(None)` at end of log and the record length otherwise.
    /// [`Error::BufferTooSmall`] reports the length needed; the cursor
    /// does not move, so the read can be retried with a larger buffer.
    pub fn read_next(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        self.with_state(|state, io| state.read_record(io, Some(buf)))
    }

    /// Skip records totalling `skip` bytes, then read the next one
    pub fn seek_read_next(&self, skip: usize, buf: &mut [u8]) -> Result<Option<usize>> {
        self.with_state(|state, io| state.seek_read_next(io, skip, buf))
    }

    /// Move the read cursor back to the first record
    pub fn rewind(&self) -> Result<()> {
        self.with_state(|state, _| {
            state.rewind();
            Ok(())
        })
    }

    /// Write back buffered records
    pub fn flush(&self) -> Result<()> {
        self.with_state(LogState::flush)
    }

    /// Make every appended record durable
    pub fn sync(&self) -> Result<()> {
        self.flush()
    }

    /// Discard all records and move to a generation above both the current
    /// one and `min_gen`; returns the new generation
    pub fn erase(&self, min_gen: u64) -> Result<u64> {
        if !self.is_committed() {
            return Err(Error::invalid_argument(format!(
                "mlog {} is not committed",
                self.id
            )));
        }
        let mut guard = self.state.lock();
        let extent = self.io.extent();
        let generation = extent.generation().max(min_gen) + 1;
        extent.erase(generation)?;
        if let Some(state) = guard.as_mut() {
            *state = LogState::empty(self.geo, &self.config, state.flags, state.magic, generation);
        }
        info!("Erased mlog {} to generation {}", self.id, generation);
        Ok(generation)
    }

    /// Bytes used, framing included
    pub fn len(&self) -> Result<u64> {
        self.with_state(|state, _| Ok(state.len()))
    }

    /// Payload bytes that can still be appended
    pub fn dmax(&self) -> Result<u64> {
        self.with_state(|state, _| Ok(state.dmax()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.with_state(|state, _| Ok(state.is_empty()))
    }

    pub fn stat(&self) -> Result<MlogStat> {
        self.with_state(|state, _| Ok(state.stat()))
    }
}

impl fmt::Debug for Mlog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mlog")
            .field("id", &self.id)
            .field("geometry", &self.geo)
            .field("committed", &self.is_committed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{Geometry, MemExtent, WriteFault};
    use rand::Rng;

    fn mem_extent(sector_size: usize, total_sectors: u64) -> Arc<MemExtent> {
        Arc::new(MemExtent::new(
            Geometry {
                sector_size,
                total_sectors,
            },
            1,
        ))
    }

    fn log_over(extent: &Arc<MemExtent>, config: MlogConfig) -> Mlog {
        let extent: Arc<dyn Extent> = Arc::clone(extent) as Arc<dyn Extent>;
        Mlog::new(ObjectId::new(), extent, config, true).unwrap()
    }

    fn open_log(extent: &Arc<MemExtent>) -> Mlog {
        let log = log_over(extent, MlogConfig::default());
        log.open(OpenFlags::default()).unwrap();
        log
    }

    fn payload(len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        rand::thread_rng().fill(&mut buf[..]);
        buf
    }

    /// A well-formed 512-byte log block holding the given chunks
    fn forge_block(
        extent: &MemExtent,
        pfsetid: u32,
        cfsetid: u32,
        chunks: &[(RecordType, u32, &[u8])],
    ) -> Vec<u8> {
        let mut block = vec![0u8; 512];
        LogBlockHeader::new(extent.magic(), pfsetid, cfsetid, extent.generation())
            .pack_into(&mut block);
        let mut off = HDR;
        for &(rtype, tlen, data) in chunks {
            let rlen = u16::try_from(data.len()).unwrap();
            RecordDescriptor::new(tlen, rlen, rtype).pack_into(&mut block[off..]);
            block[off + DESC..off + DESC + data.len()].copy_from_slice(data);
            off += DESC + data.len();
        }
        block
    }

    fn read_all(log: &Mlog) -> Vec<Vec<u8>> {
        log.rewind().unwrap();
        let mut out = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        while let Some(n) = log.read_next(&mut buf).unwrap() {
            out.push(buf[..n].to_vec());
        }
        out
    }

    #[test]
    fn test_append_read_roundtrip() {
        let extent = mem_extent(512, 256);
        let log = open_log(&extent);
        assert!(log.is_empty().unwrap());

        let records: Vec<Vec<u8>> = [0, 1, 100, 455, 456, 457, 1000, 5000, 3]
            .iter()
            .map(|&n| payload(n))
            .collect();
        for rec in &records {
            log.append(rec, false).unwrap();
        }
        assert!(!log.is_empty().unwrap());
        assert_eq!(read_all(&log), records);

        // Unsynced records become durable on close
        log.close().unwrap();
        log.open(OpenFlags::default()).unwrap();
        assert_eq!(read_all(&log), records);
    }

    #[test]
    fn test_reader_follows_appends() {
        let extent = mem_extent(4096, 16);
        let log = open_log(&extent);
        let mut buf = vec![0u8; 8192];

        assert_eq!(log.read_next(&mut buf).unwrap(), None);
        log.append(b"one", false).unwrap();
        assert_eq!(log.read_next(&mut buf).unwrap(), Some(3));
        assert_eq!(log.read_next(&mut buf).unwrap(), None);

        let big = payload(6000);
        log.append(&big, true).unwrap();
        assert_eq!(log.read_next(&mut buf).unwrap(), Some(6000));
        assert_eq!(&buf[..6000], big.as_slice());
        assert_eq!(log.read_next(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_dmax_is_exact() {
        let extent = mem_extent(512, 16);
        let log = open_log(&extent);
        let per_block = (512 - HDR - DESC) as u64;
        assert_eq!(log.dmax().unwrap(), 16 * per_block);

        let too_big = payload(16 * per_block as usize + 1);
        let err = log.append(&too_big, false).unwrap_err();
        assert!(matches!(
            err,
            Error::LogFull {
                requested,
                available
            } if requested == 16 * per_block + 1 && available == 16 * per_block
        ));
        assert!(log.is_empty().unwrap());

        let exact = payload(16 * per_block as usize);
        log.append(&exact, true).unwrap();
        assert_eq!(log.dmax().unwrap(), 0);
        assert!(log.append(&[], false).unwrap_err().is_log_full());
        assert_eq!(read_all(&log), vec![exact]);
    }

    #[test]
    fn test_fill_until_full() {
        let extent = mem_extent(512, 64);
        let log = open_log(&extent);
        let mut written = Vec::new();
        loop {
            let rec = payload(300);
            match log.append(&rec, false) {
                Ok(()) => written.push(rec),
                Err(e) => {
                    assert!(e.is_log_full(), "unexpected error {e}");
                    break;
                }
            }
        }
        assert!(log.dmax().unwrap() < 300);
        log.close().unwrap();
        log.open(OpenFlags::default()).unwrap();
        assert_eq!(read_all(&log), written);
    }

    #[test]
    fn test_buffer_too_small_keeps_cursor() {
        let extent = mem_extent(4096, 16);
        let log = open_log(&extent);
        let rec = payload(2000);
        log.append(b"x", false).unwrap();
        log.append(&rec, false).unwrap();

        let mut small = [0u8; 16];
        assert_eq!(log.read_next(&mut small).unwrap(), Some(1));
        let err = log.read_next(&mut small).unwrap_err();
        assert_eq!(err.required_len(), Some(2000));

        let mut buf = vec![0u8; err.required_len().unwrap()];
        assert_eq!(log.read_next(&mut buf).unwrap(), Some(2000));
        assert_eq!(buf, rec);
    }

    #[test]
    fn test_seek_read_next() {
        let extent = mem_extent(512, 64);
        let log = open_log(&extent);
        for rec in [&b"aaaa"[..], b"bb", b"cccccc", b"d"] {
            log.append(rec, false).unwrap();
        }
        let mut buf = [0u8; 32];

        assert_eq!(log.seek_read_next(6, &mut buf).unwrap(), Some(6));
        assert_eq!(&buf[..6], b"cccccc");

        log.rewind().unwrap();
        let err = log.seek_read_next(5, &mut buf).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        // Cursor restored
        assert_eq!(log.read_next(&mut buf).unwrap(), Some(4));

        log.rewind().unwrap();
        assert_eq!(log.seek_read_next(13, &mut buf).unwrap(), None);
    }

    #[test]
    fn test_erase() {
        let extent = mem_extent(512, 32);
        let log = open_log(&extent);
        log.append(b"before", true).unwrap();

        let generation = log.erase(10).unwrap();
        assert_eq!(generation, 11);
        assert!(log.is_empty().unwrap());
        assert_eq!(read_all(&log), Vec::<Vec<u8>>::new());

        log.append(b"after", true).unwrap();
        log.close().unwrap();
        assert_eq!(log.open(OpenFlags::default()).unwrap(), 11);
        assert_eq!(read_all(&log), vec![b"after".to_vec()]);

        log.close().unwrap();
        assert_eq!(log.erase(0).unwrap(), 12);
        assert_eq!(log.open(OpenFlags::default()).unwrap(), 12);
        assert!(log.is_empty().unwrap());
    }

    #[test]
    fn test_state_checks() {
        let extent = mem_extent(512, 32);
        let log = log_over(&extent, MlogConfig::default());
        let mut buf = [0u8; 8];
        assert!(log.append(b"x", false).unwrap_err().is_not_found());
        assert!(log.read_next(&mut buf).unwrap_err().is_not_found());
        assert!(log.close().unwrap_err().is_not_found());

        log.open(OpenFlags::default()).unwrap();
        assert!(matches!(
            log.open(OpenFlags::default().with_csem()),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(log.open(OpenFlags::default()).unwrap(), 1);

        let extent: Arc<dyn Extent> = mem_extent(512, 32);
        let uncommitted = Mlog::new(ObjectId::new(), extent, MlogConfig::default(), false).unwrap();
        assert!(matches!(
            uncommitted.open(OpenFlags::default()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_compaction_markers() {
        let extent = mem_extent(512, 32);
        let log = log_over(&extent, MlogConfig::default());
        let flags = OpenFlags::default().with_csem();
        log.open(flags).unwrap();

        assert!(matches!(
            log.append(b"data", false),
            Err(Error::InvalidArgument(_))
        ));
        assert!(log.append_marker(Marker::CEnd).is_err());
        log.append_marker(Marker::CStart).unwrap();
        assert!(log.append_marker(Marker::CStart).is_err());
        log.append(b"state", false).unwrap();

        // Crash before CEND
        drop(log);
        let log = log_over(&extent, MlogConfig::default());
        assert!(matches!(log.open(flags), Err(Error::IncompleteCompaction(_))));
        assert!(!log.is_open());

        // Not an error without compaction semantics either
        assert!(matches!(
            log.open(OpenFlags::default()),
            Err(Error::IncompleteCompaction(_))
        ));

        log.erase(0).unwrap();
        log.open(flags).unwrap();
        log.append_marker(Marker::CStart).unwrap();
        log.append(b"state", false).unwrap();
        log.append_marker(Marker::CEnd).unwrap();
        log.append(b"update", false).unwrap();
        assert!(log.append_marker(Marker::CEnd).is_err());
        log.close().unwrap();

        log.open(flags).unwrap();
        let stat = log.stat().unwrap();
        assert!(stat.cstart && stat.cend);
        assert_eq!(read_all(&log), vec![b"state".to_vec(), b"update".to_vec()]);
    }

    #[test]
    fn test_data_before_cstart_is_malformed() {
        let extent = mem_extent(512, 32);
        let log = open_log(&extent);
        log.append(b"plain", true).unwrap();
        log.close().unwrap();
        assert!(matches!(
            log.open(OpenFlags::default().with_csem()),
            Err(Error::MalformedData(_))
        ));
    }

    #[test]
    fn test_small_sectors_reopen_each_append() {
        let extent = mem_extent(512, 128);
        let mut expected = Vec::new();
        for i in 0..20 {
            let log = open_log(&extent);
            assert_eq!(read_all(&log), expected);
            let rec = payload(60 + i * 37);
            log.append(&rec, true).unwrap();
            expected.push(rec);
            log.close().unwrap();
        }
        let log = open_log(&extent);
        assert_eq!(read_all(&log), expected);
    }

    #[test]
    fn test_flush_set_overflow_mid_record() {
        let extent = mem_extent(512, 256);
        let config = MlogConfig {
            append_buffer_bytes: LOG_PAGE_SIZE,
            read_buffer_bytes: LOG_PAGE_SIZE,
        };
        let log = log_over(&extent, config.clone());
        log.open(OpenFlags::default()).unwrap();

        let records = vec![payload(10_000), payload(50), payload(7000)];
        for rec in &records {
            log.append(rec, false).unwrap();
        }
        assert!(extent.write_count() >= 2);
        assert_eq!(read_all(&log), records);
        log.close().unwrap();

        let log = log_over(&extent, config);
        log.open(OpenFlags::default()).unwrap();
        assert_eq!(read_all(&log), records);
    }

    #[test]
    fn test_failed_flush_rolls_back() {
        let extent = mem_extent(512, 64);
        let log = open_log(&extent);
        log.append(b"kept", true).unwrap();

        extent.set_fail_writes(true);
        assert!(log.append(&payload(900), true).is_err());
        extent.set_fail_writes(false);
        assert_eq!(read_all(&log), vec![b"kept".to_vec()]);

        log.append(b"next", true).unwrap();
        log.close().unwrap();
        let log = open_log(&extent);
        assert_eq!(read_all(&log), vec![b"kept".to_vec(), b"next".to_vec()]);
    }

    #[test]
    fn test_torn_flush_set_recovery() {
        let extent = mem_extent(512, 64);
        let log = open_log(&extent);
        let first = payload(300);
        log.append(&first, true).unwrap();

        // Second record spans three blocks; only the first two land
        extent.inject_write_fault(WriteFault::Tear { landed: 2 * 512 });
        assert!(log.append(&payload(900), true).is_err());
        drop(log);

        let log = open_log(&extent);
        assert_eq!(read_all(&log), vec![first.clone()]);

        let third = payload(200);
        log.append(&third, true).unwrap();
        drop(log);
        let log = open_log(&extent);
        assert_eq!(read_all(&log), vec![first, third]);
    }

    #[test]
    fn test_torn_write_then_close() {
        let extent = mem_extent(512, 64);
        let log = open_log(&extent);
        log.append(b"kept", true).unwrap();

        // Four blocks, the first two land
        extent.inject_write_fault(WriteFault::Tear { landed: 2 * 512 });
        assert!(log.append(&payload(1400), true).is_err());
        log.close().unwrap();

        let log = open_log(&extent);
        assert_eq!(read_all(&log), vec![b"kept".to_vec()]);
    }

    #[test]
    fn test_failed_append_does_not_resurrect() {
        let extent = mem_extent(512, 64);
        let log = open_log(&extent);
        let first = payload(512 - HDR - DESC);
        log.append(&first, true).unwrap();
        assert_eq!(log.stat().unwrap().wsoff, 1);

        // The whole record lands but the write still fails
        extent.inject_write_fault(WriteFault::Tear { landed: 1000 });
        assert!(log.append(b"lost", true).is_err());
        assert_eq!(read_all(&log), vec![first.clone()]);
        log.close().unwrap();

        let log = open_log(&extent);
        assert_eq!(read_all(&log), vec![first]);
    }

    #[test]
    fn test_blocks_past_leol_are_ignored() {
        let extent = mem_extent(512, 64);
        let log = open_log(&extent);
        let records = vec![payload(400), payload(400), payload(100)];
        for rec in &records {
            log.append(rec, true).unwrap();
        }
        let stat = log.stat().unwrap();
        let leol = if stat.aoff > HDR { stat.wsoff + 1 } else { stat.wsoff };
        let fsetidmax = stat.cfsetid - 1;
        drop(log);

        // Well-formed blocks: one breaking the chain at LEOL, one after it
        // that would continue the chain
        let forge = |pfsetid: u32, cfsetid: u32| {
            let chunks = [(RecordType::DataFull, 4, &b"evil"[..])];
            forge_block(&extent, pfsetid, cfsetid, &chunks)
        };
        extent.poke(leol as usize * 512, &forge(fsetidmax + 7, fsetidmax + 8));
        extent.poke((leol as usize + 1) * 512, &forge(fsetidmax, fsetidmax + 1));

        let log = open_log(&extent);
        assert_eq!(read_all(&log), records);
        let stat = log.stat().unwrap();
        assert_eq!(stat.wsoff, leol - 1);
        assert!(stat.cfsetid > fsetidmax + 8);

        let last = payload(50);
        log.append(&last, true).unwrap();
        drop(log);
        let log = open_log(&extent);
        let mut expected = records;
        expected.push(last);
        assert_eq!(read_all(&log), expected);
    }

    #[test]
    fn test_bad_version_is_malformed() {
        let extent = mem_extent(512, 16);
        let log = open_log(&extent);
        log.append(b"abc", true).unwrap();
        drop(log);
        extent.poke(0, &[9, 0]);
        let log = log_over(&extent, MlogConfig::default());
        assert!(matches!(
            log.open(OpenFlags::default()),
            Err(Error::MalformedData(_))
        ));
    }

    #[test]
    fn test_failed_flush_at_block_boundary_reopens() {
        let extent = mem_extent(512, 64);
        let log = open_log(&extent);
        let first = payload(512 - HDR - DESC);
        log.append(&first, true).unwrap();
        assert_eq!(log.stat().unwrap().wsoff, 1);

        // Nothing reaches the media
        extent.set_fail_writes(true);
        assert!(log.append(b"lost", true).is_err());
        extent.set_fail_writes(false);
        log.close().unwrap();

        let log = open_log(&extent);
        assert_eq!(read_all(&log), vec![first.clone()]);
        log.append(b"next", true).unwrap();
        log.close().unwrap();

        let log = open_log(&extent);
        assert_eq!(read_all(&log), vec![first, b"next".to_vec()]);
    }

    #[test]
    fn test_retry_after_torn_flush_skips_its_blocks() {
        let extent = mem_extent(512, 64);
        let log = open_log(&extent);
        let first = payload(300);
        log.append(&first, true).unwrap();

        // Blocks 0 and 1 of a three-block set land
        extent.inject_write_fault(WriteFault::Tear { landed: 2 * 512 });
        assert!(log.append(&payload(900), true).is_err());

        // The retry only rewrites block 0; block 1 of the torn set must not
        // continue its chain
        log.append(b"short", true).unwrap();
        log.close().unwrap();

        let log = open_log(&extent);
        assert_eq!(read_all(&log), vec![first, b"short".to_vec()]);
    }

    #[test]
    fn test_leol_block_set_id_is_not_reused() {
        let extent = mem_extent(512, 64);
        let log = open_log(&extent);
        let first = payload(100);
        log.append(&first, true).unwrap();
        let fsetidmax = log.stat().unwrap().cfsetid - 1;
        drop(log);

        // Block 1 starts a set that never linked to block 0
        let stale = fsetidmax + 1;
        extent.poke(
            512,
            &forge_block(&extent, stale, stale, &[(RecordType::DataFull, 4, &b"evil"[..])]),
        );

        let log = open_log(&extent);
        assert_eq!(read_all(&log), vec![first.clone()]);
        assert!(log.stat().unwrap().cfsetid > stale);

        // Resuming in block 0 leaves block 1 on media
        log.append(b"x", true).unwrap();
        assert_eq!(log.stat().unwrap().wsoff, 0);
        drop(log);

        let log = open_log(&extent);
        assert_eq!(read_all(&log), vec![first, b"x".to_vec()]);
    }

    #[test]
    fn test_torn_record_does_not_need_a_larger_buffer() {
        let extent = mem_extent(512, 16);
        let torn = payload(512 - HDR - DESC);
        extent.poke(
            0,
            &forge_block(&extent, 0, 1, &[(RecordType::DataFirst, 2000, torn.as_slice())]),
        );
        extent.poke(
            512,
            &forge_block(&extent, 1, 1, &[(RecordType::DataFull, 4, &b"tiny"[..])]),
        );

        let log = open_log(&extent);
        let mut small = [0u8; 16];
        assert_eq!(log.read_next(&mut small).unwrap(), Some(4));
        assert_eq!(&small[..4], b"tiny");
        assert_eq!(log.read_next(&mut small).unwrap(), None);
    }

    #[test]
    fn test_skip_ser_is_part_of_the_open_state() {
        let extent = mem_extent(512, 16);
        let log = log_over(&extent, MlogConfig::default());
        let flags = OpenFlags::default().with_skip_ser();
        log.open(flags).unwrap();
        assert!(matches!(
            log.open(OpenFlags::default()),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(log.open(flags).unwrap(), 1);

        // The lock is still taken, so shared use stays consistent
        let log = Arc::new(log);
        let writers: Vec<_> = (0..4u8)
            .map(|i| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for _ in 0..8 {
                        log.append(&[i; 20], false).unwrap();
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(read_all(&log).len(), 32);
    }
}
