//! Caller-facing block buffers.

use lss_file::AlignedVec;
use lss_types::{BLOCK_PREFIX_BYTES, BlockSize};

/// An aligned, block-sized buffer whose public slice is the payload
/// after the hidden sequence-id prefix.
///
/// This is the allocation the layer above hands to `block_write` and
/// `block_read`; the prefix bytes belong to the serializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerBuf {
    block: AlignedVec,
}

impl SerBuf {
    /// Allocate a zeroed buffer for one block.
    #[must_use]
    pub fn alloc(block_size: BlockSize) -> Self {
        Self {
            block: AlignedVec::new(block_size.bytes()),
        }
    }

    /// Allocate a buffer holding a copy of `payload`.
    ///
    /// # Panics
    /// If `payload` is not exactly the block payload size.
    #[must_use]
    pub fn from_payload(block_size: BlockSize, payload: &[u8]) -> Self {
        let mut buf = Self::alloc(block_size);
        buf.payload_mut().copy_from_slice(payload);
        buf
    }

    /// Copy an existing buffer, prefix included.
    #[must_use]
    pub fn clone_buf(&self) -> Self {
        self.clone()
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.block.as_slice()[BLOCK_PREFIX_BYTES..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.block.as_mut_slice()[BLOCK_PREFIX_BYTES..]
    }

    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.block.len() - BLOCK_PREFIX_BYTES
    }
}
