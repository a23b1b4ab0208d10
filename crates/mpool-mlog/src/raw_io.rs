//! File-backed extents
//!
//! Each log lives in its own file, optionally opened for direct access:
//! - Linux: `O_DIRECT` flag
//! - elsewhere: buffered I/O
//!
//! Log pages are [`AlignedBuffer`]s, so direct I/O always sees page-aligned
//! memory. Per-log metadata (generation, geometry, identity tag, commit
//! state) lives in a JSON sidecar next to the data file.

use crate::extent::{Extent, ExtentEntry, ExtentProvider, Geometry, WriteFlags};
use mpool_common::{Error, LOG_PAGE_SIZE, ObjectId, PoolConfig, Result, SectorSize};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Memory alignment of log page buffers
pub const ALIGNMENT: usize = LOG_PAGE_SIZE;

/// Data file suffix
const DATA_SUFFIX: &str = "mlog";

/// Metadata sidecar suffix
const META_SUFFIX: &str = "meta";

/// Raw file handle with positional vectored I/O
pub struct RawFile {
    file: File,
    path: String,
}

impl RawFile {
    /// Open an existing file
    pub fn open(path: impl AsRef<Path>, direct_io: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let file = Self::options(direct_io)
            .open(&path)
            .map_err(|e| Error::io(format!("failed to open {path_str}: {e}")))?;

        Ok(Self {
            file,
            path: path_str,
        })
    }

    /// Create (or truncate) a file of `size` zero bytes
    pub fn create(path: impl AsRef<Path>, size: u64, direct_io: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let file = Self::options(direct_io)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::io(format!("failed to create {path_str}: {e}")))?;

        file.set_len(size)
            .map_err(|e| Error::io(format!("failed to set size for {path_str}: {e}")))?;

        Ok(Self {
            file,
            path: path_str,
        })
    }

    fn options(direct_io: bool) -> OpenOptions {
        let mut options = OpenOptions::new();
        options.read(true).write(true);

        #[cfg(target_os = "linux")]
        if direct_io {
            // O_DIRECT bypasses page cache on Linux
            options.custom_flags(libc::O_DIRECT);
        }
        #[cfg(not(target_os = "linux"))]
        let _ = direct_io;

        options
    }

    /// Get the file path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Fill all buffers starting at `offset`
    ///
    /// A short transfer is completed buffer by buffer; hitting end of file
    /// is an error.
    pub fn read_vectored_at(&self, offset: u64, iov: &mut [IoSliceMut<'_>]) -> io::Result<()> {
        let total: usize = iov.iter().map(|b| b.len()).sum();
        let done = nix::sys::uio::preadv(&self.file, iov, to_off(offset)?)?;
        if done == total {
            return Ok(());
        }

        let mut skip = done;
        let mut pos = offset;
        for buf in iov.iter_mut() {
            let len = buf.len();
            if skip < len {
                self.file.read_exact_at(&mut buf[skip..], pos + skip as u64)?;
            }
            skip = skip.saturating_sub(len);
            pos += len as u64;
        }
        Ok(())
    }

    /// Write all buffers starting at `offset`
    ///
    /// A short transfer is completed buffer by buffer, so callers never
    /// observe a partial write without an error.
    pub fn write_vectored_at(&self, offset: u64, iov: &[IoSlice<'_>]) -> io::Result<()> {
        let total: usize = iov.iter().map(|b| b.len()).sum();
        let done = nix::sys::uio::pwritev(&self.file, iov, to_off(offset)?)?;
        if done == total {
            return Ok(());
        }

        let mut skip = done;
        let mut pos = offset;
        for buf in iov {
            let len = buf.len();
            if skip < len {
                self.file.write_all_at(&buf[skip..], pos + skip as u64)?;
            }
            skip = skip.saturating_sub(len);
            pos += len as u64;
        }
        Ok(())
    }

    /// Sync data only (not metadata) to disk
    pub fn sync_data(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::io(format!("sync_data failed on {}: {e}", self.path)))
    }

    /// Drop all content, leaving `size` zero bytes
    pub fn zero(&self, size: u64) -> Result<()> {
        self.file
            .set_len(0)
            .and_then(|()| self.file.set_len(size))
            .and_then(|()| self.file.sync_all())
            .map_err(|e| Error::io(format!("zeroing {} failed: {e}", self.path)))
    }
}

fn to_off(offset: u64) -> io::Result<libc::off_t> {
    libc::off_t::try_from(offset)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflows off_t"))
}

/// Aligned buffer for direct I/O operations
///
/// On Linux with `O_DIRECT`, the buffer must be aligned to the device's
/// logical block size. Log pages are allocated with [`ALIGNMENT`], which
/// covers both 512-byte and 4 KiB sectors.
pub struct AlignedBuffer {
    data: Vec<u8>,
    alignment: usize,
}

impl AlignedBuffer {
    /// Create a zeroed buffer of the given size
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self::with_alignment(size, ALIGNMENT)
    }

    /// Create a zeroed buffer with custom alignment
    #[must_use]
    #[allow(unsafe_code)]
    pub fn with_alignment(size: usize, alignment: usize) -> Self {
        use std::alloc::{Layout, alloc_zeroed, handle_alloc_error};

        let aligned_size = size.div_ceil(alignment).max(1) * alignment;
        let Ok(layout) = Layout::from_size_align(aligned_size, alignment) else {
            panic!("invalid layout for aligned buffer: {aligned_size}/{alignment}");
        };

        // SAFETY: layout has non-zero size; the Vec never reallocates and is
        // freed with the same layout in Drop.
        let data = unsafe {
            let ptr = alloc_zeroed(layout);
            if ptr.is_null() {
                handle_alloc_error(layout);
            }
            Vec::from_raw_parts(ptr, aligned_size, aligned_size)
        };

        Self { data, alignment }
    }

    /// Get the buffer as a slice
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Get the buffer as a mutable slice
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Get the buffer size
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if buffer is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Zero the whole buffer
    pub fn clear(&mut self) {
        self.data.fill(0);
    }
}

impl Drop for AlignedBuffer {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        use std::alloc::{Layout, dealloc};

        let capacity = self.data.capacity();
        if capacity == 0 {
            return;
        }
        let ptr = self.data.as_mut_ptr();
        std::mem::forget(std::mem::take(&mut self.data));
        if let Ok(layout) = Layout::from_size_align(capacity, self.alignment) {
            // SAFETY: ptr was allocated in with_alignment with this layout.
            unsafe { dealloc(ptr, layout) };
        }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.data.len())
            .field("alignment", &self.alignment)
            .finish()
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Metadata sidecar of a file extent
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct ExtentMeta {
    generation: u64,
    sector_size: SectorSize,
    total_sectors: u64,
    magic: Uuid,
    committed: bool,
}

impl ExtentMeta {
    fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read(path)
            .map_err(|e| Error::io(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_slice(&text)
            .map_err(|e| Error::malformed(format!("bad extent metadata {}: {e}", path.display())))
    }

    /// Write via a temporary file and rename, so the sidecar is never torn
    fn store(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("meta.tmp");
        let text = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::io(format!("failed to encode extent metadata: {e}")))?;
        let write = || -> io::Result<()> {
            std::fs::write(&tmp, &text)?;
            File::open(&tmp)?.sync_all()?;
            std::fs::rename(&tmp, path)
        };
        write().map_err(|e| Error::io(format!("failed to write {}: {e}", path.display())))
    }
}

/// Extent stored in a regular file
pub struct FileExtent {
    file: RawFile,
    meta_path: PathBuf,
    geometry: Geometry,
    magic: [u8; 16],
    meta: Mutex<ExtentMeta>,
}

impl FileExtent {
    fn create(
        data_path: &Path,
        meta_path: PathBuf,
        sector_size: SectorSize,
        capacity: u64,
        generation: u64,
        direct_io: bool,
    ) -> Result<Self> {
        let geometry = Geometry::for_capacity(sector_size, capacity);
        let file = RawFile::create(data_path, geometry.capacity(), direct_io)?;
        let meta = ExtentMeta {
            generation,
            sector_size,
            total_sectors: geometry.total_sectors,
            magic: Uuid::new_v4(),
            committed: false,
        };
        meta.store(&meta_path)?;

        Ok(Self {
            file,
            meta_path,
            geometry,
            magic: *meta.magic.as_bytes(),
            meta: Mutex::new(meta),
        })
    }

    fn open(data_path: &Path, meta_path: PathBuf, direct_io: bool) -> Result<Self> {
        let meta = ExtentMeta::load(&meta_path)?;
        let file = RawFile::open(data_path, direct_io)?;
        let geometry = Geometry {
            sector_size: meta.sector_size.bytes(),
            total_sectors: meta.total_sectors,
        };

        Ok(Self {
            file,
            meta_path,
            geometry,
            magic: *meta.magic.as_bytes(),
            meta: Mutex::new(meta),
        })
    }

    fn committed(&self) -> bool {
        self.meta.lock().committed
    }

    fn set_committed(&self) -> Result<()> {
        let mut meta = self.meta.lock();
        let mut next = meta.clone();
        next.committed = true;
        next.store(&self.meta_path)?;
        *meta = next;
        Ok(())
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.geometry.capacity() {
            return Err(Error::invalid_argument(format!(
                "range {offset}+{len} exceeds {} capacity {}",
                self.file.path(),
                self.geometry.capacity()
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for FileExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileExtent")
            .field("path", &self.file.path())
            .field("geometry", &self.geometry)
            .finish_non_exhaustive()
    }
}

impl Extent for FileExtent {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn magic(&self) -> [u8; 16] {
        self.magic
    }

    fn generation(&self) -> u64 {
        self.meta.lock().generation
    }

    fn read_at(&self, offset: u64, iov: &mut [IoSliceMut<'_>]) -> Result<()> {
        self.check_range(offset, iov.iter().map(|b| b.len()).sum())?;
        self.file
            .read_vectored_at(offset, iov)
            .map_err(|e| Error::io(format!("read failed on {}: {e}", self.file.path())))
    }

    fn write_at(&self, offset: u64, iov: &[IoSlice<'_>], flags: WriteFlags) -> Result<()> {
        self.check_range(offset, iov.iter().map(|b| b.len()).sum())?;
        if flags.preflush {
            self.file.sync_data()?;
        }
        self.file
            .write_vectored_at(offset, iov)
            .map_err(|e| Error::io(format!("write failed on {}: {e}", self.file.path())))?;
        if flags.fua {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn erase(&self, generation: u64) -> Result<()> {
        let mut meta = self.meta.lock();
        self.file.zero(self.geometry.capacity())?;
        let mut next = meta.clone();
        next.generation = generation;
        next.store(&self.meta_path)?;
        *meta = next;
        Ok(())
    }
}

/// Extent provider keeping one file per log in a directory
pub struct DirProvider {
    dir: PathBuf,
    sector_size: SectorSize,
    direct_io: bool,
    extents: Mutex<HashMap<ObjectId, Arc<FileExtent>>>,
}

impl DirProvider {
    /// Open (creating if needed) the provider directory
    pub fn new(config: &PoolConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            Error::io(format!(
                "failed to create {}: {e}",
                config.data_dir.display()
            ))
        })?;
        info!("Opened extent directory {:?}", config.data_dir);

        Ok(Self {
            dir: config.data_dir.clone(),
            sector_size: config.sector_size,
            direct_io: config.direct_io,
            extents: Mutex::new(HashMap::new()),
        })
    }

    fn data_path(&self, id: ObjectId) -> PathBuf {
        self.dir.join(format!("{id}.{DATA_SUFFIX}"))
    }

    fn meta_path(&self, id: ObjectId) -> PathBuf {
        self.dir.join(format!("{id}.{META_SUFFIX}"))
    }

    fn get(&self, id: ObjectId) -> Result<Option<Arc<FileExtent>>> {
        let mut extents = self.extents.lock();
        if let Some(extent) = extents.get(&id) {
            return Ok(Some(Arc::clone(extent)));
        }
        let meta_path = self.meta_path(id);
        if !meta_path.exists() {
            return Ok(None);
        }
        let extent = Arc::new(FileExtent::open(
            &self.data_path(id),
            meta_path,
            self.direct_io,
        )?);
        extents.insert(id, Arc::clone(&extent));
        Ok(Some(extent))
    }

    fn remove(&self, id: ObjectId, want_committed: bool) -> Result<()> {
        let extent = self
            .get(id)?
            .ok_or_else(|| Error::not_found(format!("extent {id}")))?;
        if extent.committed() != want_committed {
            return Err(Error::invalid_argument(format!(
                "extent {id} commit state is {}",
                extent.committed()
            )));
        }
        self.extents.lock().remove(&id);
        for path in [self.meta_path(id), self.data_path(id)] {
            std::fs::remove_file(&path)
                .map_err(|e| Error::io(format!("failed to remove {}: {e}", path.display())))?;
        }
        debug!("Removed extent {}", id);
        Ok(())
    }
}

impl ExtentProvider for DirProvider {
    fn alloc(&self, capacity: u64, generation: u64) -> Result<(ObjectId, Arc<dyn Extent>)> {
        if capacity == 0 {
            return Err(Error::invalid_argument("zero capacity"));
        }
        let id = ObjectId::new();
        let extent = Arc::new(FileExtent::create(
            &self.data_path(id),
            self.meta_path(id),
            self.sector_size,
            capacity,
            generation,
            self.direct_io,
        )?);
        self.extents.lock().insert(id, Arc::clone(&extent));
        debug!("Allocated extent {} ({} bytes)", id, extent.geometry.capacity());
        Ok((id, extent as Arc<dyn Extent>))
    }

    fn commit(&self, id: ObjectId) -> Result<()> {
        self.get(id)?
            .ok_or_else(|| Error::not_found(format!("extent {id}")))?
            .set_committed()
    }

    fn abort(&self, id: ObjectId) -> Result<()> {
        self.remove(id, false)
    }

    fn delete(&self, id: ObjectId) -> Result<()> {
        self.remove(id, true)
    }

    fn lookup(&self, id: ObjectId) -> Result<Option<ExtentEntry>> {
        Ok(self.get(id)?.map(|extent| {
            let committed = extent.committed();
            ExtentEntry {
                extent: extent as Arc<dyn Extent>,
                committed,
            }
        }))
    }
}
