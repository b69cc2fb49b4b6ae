#![forbid(unsafe_code)]
//! Identifier newtypes, validated geometry, and on-disk codec helpers
//! shared by every LSS crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of bytes of the hidden per-block prefix (the block sequence id).
pub const BLOCK_PREFIX_BYTES: usize = 8;

/// Stable logical block identifier assigned by the caller.
///
/// Dense small integers; `BlockId::NULL` never names a real block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl BlockId {
    pub const NULL: Self = Self(u64::MAX);

    #[must_use]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }
}

/// Monotonic counter stamped into every data block and metablock.
///
/// Used at recovery to pick the freshest metablock and reject torn
/// blocks. Zero is the "never written" value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSequenceId(pub u64);

impl BlockSequenceId {
    pub const NULL: Self = Self(0);

    /// The next sequence id after this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

/// Monotonic per-block timestamp, preserved across rewrites unless the
/// caller supplies a new value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Recency(pub u64);

impl Recency {
    pub const DISTANT_PAST: Self = Self(0);
}

const LIVE_FLAG: u64 = 1 << 63;
const UNUSED_REPR: u64 = u64::MAX;

/// Byte offset of a block in the file, or the "unused" sentinel.
///
/// Bit 63 is the liveness flag; the all-ones pattern means the slot is
/// absent or deleted. Real offsets are block-aligned and below 2^63.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlaggedOffset(u64);

impl FlaggedOffset {
    pub const UNUSED: Self = Self(UNUSED_REPR);

    /// Wrap a live byte offset.
    ///
    /// # Panics
    /// If `offset` has bit 63 set (offsets that large cannot occur in a
    /// single file).
    #[must_use]
    pub fn live(offset: u64) -> Self {
        assert!(offset & LIVE_FLAG == 0, "offset {offset:#x} overflows the live flag");
        Self(offset | LIVE_FLAG)
    }

    #[must_use]
    pub fn has_value(self) -> bool {
        self.0 != UNUSED_REPR && self.0 & LIVE_FLAG != 0
    }

    /// The byte offset, if this slot is live.
    #[must_use]
    pub fn value(self) -> Option<u64> {
        if self.has_value() {
            Some(self.0 & !LIVE_FLAG)
        } else {
            None
        }
    }

    /// Raw on-disk representation.
    #[must_use]
    pub fn to_repr(self) -> u64 {
        self.0
    }

    /// Rebuild from the on-disk representation.
    ///
    /// Anything that is neither the sentinel nor a flagged offset decodes
    /// to `UNUSED`; torn journal records are caught by their CRC first.
    #[must_use]
    pub fn from_repr(repr: u64) -> Self {
        if repr == UNUSED_REPR || repr & LIVE_FLAG != 0 {
            Self(repr)
        } else {
            Self::UNUSED
        }
    }
}

/// Validated block size (power of two in 1024..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(1024..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be a power of two in 1024..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Whole-block size as a usize.
    #[must_use]
    pub fn bytes(self) -> usize {
        self.0 as usize
    }

    /// Caller-visible payload size (block minus the hidden prefix).
    #[must_use]
    pub fn payload_bytes(self) -> usize {
        self.bytes() - BLOCK_PREFIX_BYTES
    }

    /// Whether `offset` falls on a block boundary.
    #[must_use]
    pub fn is_aligned(self, offset: u64) -> bool {
        offset % u64::from(self.0) == 0
    }
}

/// Validated extent size (a nonzero multiple of the block size).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExtentSize(u64);

impl ExtentSize {
    pub fn new(value: u64, block_size: BlockSize) -> Result<Self, ParseError> {
        if value == 0 || value % u64::from(block_size.get()) != 0 {
            return Err(ParseError::InvalidField {
                field: "extent_size",
                reason: "must be a nonzero multiple of the block size",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Immutable geometry written into the static header at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticConfig {
    pub block_size: BlockSize,
    pub extent_size: ExtentSize,
}

impl StaticConfig {
    pub fn new(block_size: u32, extent_size: u64) -> Result<Self, ParseError> {
        let block_size = BlockSize::new(block_size)?;
        let extent_size = ExtentSize::new(extent_size, block_size)?;
        Ok(Self {
            block_size,
            extent_size,
        })
    }

    /// Number of blocks per extent.
    #[must_use]
    pub fn blocks_per_extent(self) -> u64 {
        self.extent_size.get() / u64::from(self.block_size.get())
    }

    /// Byte offset of the extent containing `offset`.
    #[must_use]
    pub fn extent_of(self, offset: u64) -> u64 {
        offset - offset % self.extent_size.get()
    }

    /// Slot index of a block offset within its extent.
    #[must_use]
    pub fn slot_of(self, offset: u64) -> usize {
        usize::try_from(offset % self.extent_size.get() / u64::from(self.block_size.get()))
            .unwrap_or(usize::MAX)
    }
}

/// Tunables that may differ per run of the same file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DynamicConfig {
    /// Garbage fraction across full data extents above which GC starts.
    pub gc_high_ratio: f64,
    /// Garbage fraction below which a running GC pass stops.
    pub gc_low_ratio: f64,
    /// Live-entry fraction in the LBA extents below which the index is
    /// compacted into a fresh superblock.
    pub lba_gc_threshold: f64,
    /// Whether read-ahead sinks are offered buffers.
    pub read_ahead: bool,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            gc_high_ratio: 0.65,
            gc_low_ratio: 0.50,
            lba_gc_threshold: 0.50,
            read_ahead: false,
        }
    }
}

impl DynamicConfig {
    pub fn validate(self) -> Result<Self, ParseError> {
        if !(0.0..=1.0).contains(&self.gc_high_ratio)
            || !(0.0..=1.0).contains(&self.gc_low_ratio)
            || self.gc_low_ratio > self.gc_high_ratio
        {
            return Err(ParseError::InvalidField {
                field: "gc_ratio",
                reason: "must satisfy 0 <= low <= high <= 1",
            });
        }
        if !(0.0..=1.0).contains(&self.lba_gc_threshold) {
            return Err(ParseError::InvalidField {
                field: "lba_gc_threshold",
                reason: "must be in 0..=1",
            });
        }
        Ok(self)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}
