//! Backing extents and the providers that allocate them
//!
//! An extent is an already-allocated span of uniformly sized sectors. The log
//! engine only reads and writes it at byte offsets; allocation, commit and
//! erasure of the capacity belong to an [`ExtentProvider`].
//!
//! [`MemExtent`] keeps the media in memory and can inject write faults, which
//! is how crash behaviour is exercised in tests.

use mpool_common::{Error, ObjectId, Result, SectorSize};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io::{IoSlice, IoSliceMut};
use std::sync::Arc;

/// Vector count handed to the OS in one call when the platform does not say
pub const DEFAULT_MAX_IOVECS: usize = 1024;

/// Sector geometry of an extent
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Sector size in bytes
    pub sector_size: usize,
    /// Number of sectors
    pub total_sectors: u64,
}

impl Geometry {
    /// Geometry covering at least `capacity` bytes
    #[must_use]
    pub fn for_capacity(sector_size: SectorSize, capacity: u64) -> Self {
        let sector_size = sector_size.bytes();
        Self {
            sector_size,
            total_sectors: capacity.div_ceil(sector_size as u64),
        }
    }

    /// Total capacity in bytes
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.total_sectors * self.sector_size as u64
    }
}

/// Durability flags for a write
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteFlags {
    /// Flush the device cache before the write
    pub preflush: bool,
    /// Force unit access: the write is durable when it returns
    pub fua: bool,
}

impl WriteFlags {
    pub const NONE: Self = Self {
        preflush: false,
        fua: false,
    };

    pub const FUA: Self = Self {
        preflush: false,
        fua: true,
    };
}

/// Sector-addressed storage backing one log
pub trait Extent: Send + Sync + fmt::Debug {
    /// Sector size and count
    fn geometry(&self) -> Geometry;

    /// Stable identity tag, stamped into every log block header
    fn magic(&self) -> [u8; 16];

    /// Current generation of the log stored here
    fn generation(&self) -> u64;

    /// Largest number of vectors accepted by one read or write call
    fn max_iovecs(&self) -> usize {
        DEFAULT_MAX_IOVECS
    }

    /// Fill every buffer in `iov`, in order, starting at byte `offset`
    fn read_at(&self, offset: u64, iov: &mut [IoSliceMut<'_>]) -> Result<()>;

    /// Write every buffer in `iov`, in order, starting at byte `offset`.
    /// Either all bytes reach the media or an error is returned.
    fn write_at(&self, offset: u64, iov: &[IoSlice<'_>], flags: WriteFlags) -> Result<()>;

    /// Discard all content and durably record `generation`
    fn erase(&self, generation: u64) -> Result<()>;
}

/// An extent known to a provider, with its commit state
#[derive(Clone, Debug)]
pub struct ExtentEntry {
    pub extent: Arc<dyn Extent>,
    pub committed: bool,
}

/// Allocator of extents
pub trait ExtentProvider: Send + Sync {
    /// Allocate an uncommitted extent of at least `capacity` bytes whose log
    /// starts at `generation`
    fn alloc(&self, capacity: u64, generation: u64) -> Result<(ObjectId, Arc<dyn Extent>)>;

    /// Make an allocated extent durable
    fn commit(&self, id: ObjectId) -> Result<()>;

    /// Release an uncommitted extent
    fn abort(&self, id: ObjectId) -> Result<()>;

    /// Release a committed extent
    fn delete(&self, id: ObjectId) -> Result<()>;

    /// Find an extent by id
    fn lookup(&self, id: ObjectId) -> Result<Option<ExtentEntry>>;
}

/// Fault injected into the next write of a [`MemExtent`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteFault {
    /// The write fails and nothing reaches the media
    Fail,
    /// Only the first `landed` bytes reach the media, then the write fails
    Tear { landed: usize },
}

struct MemState {
    data: Vec<u8>,
    generation: u64,
    next_fault: Option<WriteFault>,
    fail_all: bool,
    writes: u64,
}

/// In-memory extent
pub struct MemExtent {
    geometry: Geometry,
    magic: [u8; 16],
    state: Mutex<MemState>,
}

impl MemExtent {
    /// Create a zeroed extent
    #[must_use]
    pub fn new(geometry: Geometry, generation: u64) -> Self {
        let magic = *ObjectId::new().as_bytes();
        Self {
            geometry,
            magic,
            state: Mutex::new(MemState {
                data: vec![0u8; geometry.capacity() as usize],
                generation,
                next_fault: None,
                fail_all: false,
                writes: 0,
            }),
        }
    }

    /// Inject a fault into the next write
    pub fn inject_write_fault(&self, fault: WriteFault) {
        self.state.lock().next_fault = Some(fault);
    }

    /// Fail every write until cleared
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_all = fail;
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    /// Copy of the raw media
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }

    /// Overwrite raw media bytes, bypassing the log engine
    pub fn poke(&self, offset: usize, bytes: &[u8]) {
        let mut state = self.state.lock();
        state.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.geometry.capacity() {
            return Err(Error::invalid_argument(format!(
                "range {offset}+{len} exceeds extent capacity {}",
                self.geometry.capacity()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for MemExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemExtent")
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}

impl Extent for MemExtent {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn magic(&self) -> [u8; 16] {
        self.magic
    }

    fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    fn read_at(&self, offset: u64, iov: &mut [IoSliceMut<'_>]) -> Result<()> {
        let len = iov.iter().map(|b| b.len()).sum();
        self.check_range(offset, len)?;

        let state = self.state.lock();
        let mut pos = offset as usize;
        for buf in iov.iter_mut() {
            let n = buf.len();
            buf.copy_from_slice(&state.data[pos..pos + n]);
            pos += n;
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, iov: &[IoSlice<'_>], _flags: WriteFlags) -> Result<()> {
        let len = iov.iter().map(|b| b.len()).sum();
        self.check_range(offset, len)?;

        let mut state = self.state.lock();
        if state.fail_all {
            return Err(Error::io("injected write failure"));
        }
        let budget = match state.next_fault.take() {
            None => usize::MAX,
            Some(WriteFault::Fail) => return Err(Error::io("injected write failure")),
            Some(WriteFault::Tear { landed }) => landed,
        };

        let mut pos = offset as usize;
        let mut left = budget;
        for buf in iov {
            let n = buf.len().min(left);
            state.data[pos..pos + n].copy_from_slice(&buf[..n]);
            pos += n;
            left -= n;
            if left == 0 {
                break;
            }
        }
        if budget < len {
            return Err(Error::io(format!("injected torn write after {budget} bytes")));
        }
        state.writes += 1;
        Ok(())
    }

    fn erase(&self, generation: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.data.fill(0);
        state.generation = generation;
        Ok(())
    }
}

/// In-memory extent provider
pub struct MemProvider {
    sector_size: SectorSize,
    extents: Mutex<HashMap<ObjectId, (Arc<MemExtent>, bool)>>,
}

impl MemProvider {
    #[must_use]
    pub fn new(sector_size: SectorSize) -> Self {
        Self {
            sector_size,
            extents: Mutex::new(HashMap::new()),
        }
    }

    /// Concrete extent for fault injection and media inspection
    pub fn extent(&self, id: ObjectId) -> Option<Arc<MemExtent>> {
        self.extents.lock().get(&id).map(|(e, _)| Arc::clone(e))
    }
}

impl ExtentProvider for MemProvider {
    fn alloc(&self, capacity: u64, generation: u64) -> Result<(ObjectId, Arc<dyn Extent>)> {
        if capacity == 0 {
            return Err(Error::invalid_argument("zero capacity"));
        }
        let id = ObjectId::new();
        let extent = Arc::new(MemExtent::new(
            Geometry::for_capacity(self.sector_size, capacity),
            generation,
        ));
        self.extents
            .lock()
            .insert(id, (Arc::clone(&extent), false));
        Ok((id, extent as Arc<dyn Extent>))
    }

    fn commit(&self, id: ObjectId) -> Result<()> {
        let mut extents = self.extents.lock();
        let entry = extents
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("extent {id}")))?;
        entry.1 = true;
        Ok(())
    }

    fn abort(&self, id: ObjectId) -> Result<()> {
        let mut extents = self.extents.lock();
        match extents.get(&id) {
            None => Err(Error::not_found(format!("extent {id}"))),
            Some((_, true)) => Err(Error::invalid_argument(format!(
                "extent {id} is committed"
            ))),
            Some(_) => {
                extents.remove(&id);
                Ok(())
            }
        }
    }

    fn delete(&self, id: ObjectId) -> Result<()> {
        let mut extents = self.extents.lock();
        match extents.get(&id) {
            None => Err(Error::not_found(format!("extent {id}"))),
            Some((_, false)) => Err(Error::invalid_argument(format!(
                "extent {id} is not committed"
            ))),
            Some(_) => {
                extents.remove(&id);
                Ok(())
            }
        }
    }

    fn lookup(&self, id: ObjectId) -> Result<Option<ExtentEntry>> {
        Ok(self.extents.lock().get(&id).map(|(e, committed)| {
            let extent: Arc<dyn Extent> = Arc::clone(e) as Arc<dyn Extent>;
            ExtentEntry {
                extent,
                committed: *committed,
            }
        }))
    }
}
