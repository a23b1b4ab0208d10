//! On-media format of log blocks
//!
//! Every log block is one sector. It starts with a fixed header followed by
//! a chain of record descriptors, each immediately followed by its payload:
//!
//! ```text
//! +---------+-------+-----+---------+---------+-----+
//! | version | magic | pad | pfsetid | cfsetid | gen |   log block header
//! | 2B      | 16B   | 6B  | 4B      | 4B      | 8B  |
//! +---------+-------+-----+---------+---------+-----+
//! +------+------+-------+-----+---------+
//! | tlen | rlen | rtype | pad | payload |             record descriptor + chunk
//! | 4B   | 2B   | 1B    | 1B  | rlen    |
//! +------+------+-------+-----+---------+
//! ```
//!
//! All integers are little-endian. A descriptor of all zeroes reads as
//! [`RecordType::Eolb`], so the unwritten tail of a block terminates it.

use bytes::{Buf, BufMut};
use mpool_common::{Error, Result};

/// Current (and only) log block format version
pub const LOGBLOCK_VERSION: u16 = 1;

/// Packed length of a log block header
pub const LOGBLOCK_HDR_LEN: usize = 40;

/// Packed length of a record descriptor
pub const LOGREC_DESC_LEN: usize = 8;

/// Header pad bytes between magic and pfsetid
const HDR_PAD_LEN: usize = 6;

/// Record type of a log record chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// End of log block
    Eolb = 0,
    /// Complete record in one chunk
    DataFull = 1,
    /// First chunk of a multi-chunk record
    DataFirst = 2,
    /// Middle chunk of a multi-chunk record
    DataMid = 3,
    /// Last chunk of a multi-chunk record
    DataLast = 4,
    /// Compaction start marker
    CStart = 5,
    /// Compaction end marker
    CEnd = 6,
}

impl RecordType {
    /// Whether this chunk carries caller data
    #[must_use]
    pub const fn is_data(self) -> bool {
        matches!(
            self,
            Self::DataFull | Self::DataFirst | Self::DataMid | Self::DataLast
        )
    }

    /// Whether this chunk is a compaction marker
    #[must_use]
    pub const fn is_marker(self) -> bool {
        matches!(self, Self::CStart | Self::CEnd)
    }
}

impl TryFrom<u8> for RecordType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Eolb),
            1 => Ok(Self::DataFull),
            2 => Ok(Self::DataFirst),
            3 => Ok(Self::DataMid),
            4 => Ok(Self::DataLast),
            5 => Ok(Self::CStart),
            6 => Ok(Self::CEnd),
            other => Err(Error::malformed(format!("invalid record type {other}"))),
        }
    }
}

/// Log block header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogBlockHeader {
    pub version: u16,
    /// Identity tag of the backing extent
    pub magic: [u8; 16],
    /// Flush set id this block's flush set links back to
    pub pfsetid: u32,
    /// Flush set id that wrote this block
    pub cfsetid: u32,
    /// Log generation
    pub generation: u64,
}

impl LogBlockHeader {
    /// Create a header for the current format version
    #[must_use]
    pub const fn new(magic: [u8; 16], pfsetid: u32, cfsetid: u32, generation: u64) -> Self {
        Self {
            version: LOGBLOCK_VERSION,
            magic,
            pfsetid,
            cfsetid,
            generation,
        }
    }

    /// Pack into the first [`LOGBLOCK_HDR_LEN`] bytes of `dst`
    ///
    /// # Panics
    ///
    /// Panics if `dst` is shorter than a header.
    pub fn pack_into(&self, dst: &mut [u8]) {
        let mut buf = &mut dst[..LOGBLOCK_HDR_LEN];
        buf.put_u16_le(self.version);
        buf.put_slice(&self.magic);
        buf.put_bytes(0, HDR_PAD_LEN);
        buf.put_u32_le(self.pfsetid);
        buf.put_u32_le(self.cfsetid);
        buf.put_u64_le(self.generation);
    }

    /// Pack into a fresh array
    #[must_use]
    pub fn pack(&self) -> [u8; LOGBLOCK_HDR_LEN] {
        let mut out = [0u8; LOGBLOCK_HDR_LEN];
        self.pack_into(&mut out);
        out
    }

    /// Unpack a header, rejecting unknown versions
    pub fn unpack(src: &[u8]) -> Result<Self> {
        if src.len() < LOGBLOCK_HDR_LEN {
            return Err(Error::malformed(format!(
                "log block header truncated: {} bytes",
                src.len()
            )));
        }
        let mut buf = &src[..LOGBLOCK_HDR_LEN];
        let version = buf.get_u16_le();
        if version != LOGBLOCK_VERSION {
            return Err(Error::malformed(format!(
                "unsupported log block version {version}"
            )));
        }
        let mut magic = [0u8; 16];
        buf.copy_to_slice(&mut magic);
        buf.advance(HDR_PAD_LEN);
        let pfsetid = buf.get_u32_le();
        let cfsetid = buf.get_u32_le();
        let generation = buf.get_u64_le();

        Ok(Self {
            version,
            magic,
            pfsetid,
            cfsetid,
            generation,
        })
    }
}

/// Record descriptor preceding each chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordDescriptor {
    /// Logical record length (sum of all chunks)
    pub tlen: u32,
    /// Length of this chunk
    pub rlen: u16,
    pub rtype: RecordType,
}

impl RecordDescriptor {
    #[must_use]
    pub const fn new(tlen: u32, rlen: u16, rtype: RecordType) -> Self {
        Self { tlen, rlen, rtype }
    }

    /// Pack into the first [`LOGREC_DESC_LEN`] bytes of `dst`
    ///
    /// # Panics
    ///
    /// Panics if `dst` is shorter than a descriptor.
    pub fn pack_into(&self, dst: &mut [u8]) {
        let mut buf = &mut dst[..LOGREC_DESC_LEN];
        buf.put_u32_le(self.tlen);
        buf.put_u16_le(self.rlen);
        buf.put_u8(self.rtype as u8);
        buf.put_u8(0);
    }

    /// Unpack a descriptor, rejecting unknown record types
    pub fn unpack(src: &[u8]) -> Result<Self> {
        if src.len() < LOGREC_DESC_LEN {
            return Err(Error::malformed(format!(
                "record descriptor truncated: {} bytes",
                src.len()
            )));
        }
        let mut buf = &src[..LOGREC_DESC_LEN];
        let tlen = buf.get_u32_le();
        let rlen = buf.get_u16_le();
        let rtype = RecordType::try_from(buf.get_u8())?;

        Ok(Self { tlen, rlen, rtype })
    }
}

/// Whether a log block was never written (or was discarded)
#[must_use]
pub fn logblock_is_empty(block: &[u8]) -> bool {
    block[..LOGBLOCK_HDR_LEN.min(block.len())]
        .iter()
        .all(|&b| b == 0)
}

/// Sniff whether `block` starts with a log block header carrying `magic`
#[must_use]
pub fn logblock_has_header(block: &[u8], magic: &[u8; 16]) -> bool {
    LogBlockHeader::unpack(block).is_ok_and(|h| &h.magic == magic)
}
