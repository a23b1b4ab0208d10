//! mpool Log Engine - Crash-recoverable logs over raw block media
//!
//! This crate implements:
//! - mlogs: append-only record logs with open-time crash recovery
//! - MDCs: pairs of mlogs compacted by the caller
//! - Extent providers (in-memory with fault injection, file-per-log)
//! - The in-process object table

pub mod buffer;
pub mod extent;
pub mod logblock;
pub mod mdc;
pub mod mlog;
pub mod omf;
pub mod pool;
pub mod raw_io;

// Re-exports
pub use extent::{
    Extent, ExtentEntry, ExtentProvider, Geometry, MemExtent, MemProvider, WriteFault, WriteFlags,
};
pub use mdc::Mdc;
pub use mlog::{Marker, Mlog, MlogStat, OpenFlags};
pub use omf::{LOGBLOCK_HDR_LEN, LOGREC_DESC_LEN, LogBlockHeader, RecordDescriptor, RecordType};
pub use pool::{MdcIds, Pool};
pub use raw_io::{AlignedBuffer, DirProvider, FileExtent, RawFile};
