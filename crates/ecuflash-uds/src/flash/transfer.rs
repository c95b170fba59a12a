//! Chunking of one memory block into TransferData requests

use crate::firmware::MemoryBlock;
use crate::transport::MAX_TRANSFER_UNIT;
use crate::uds::UdsError;

/// Bytes of every TransferData request taken by the SID and the counter
pub const TRANSFER_OVERHEAD: usize = 2;

/// TransferData block sequence counter
///
/// Starts at 1 and wraps from 255 back to 1; 0 is never produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSequenceCounter(u8);

impl BlockSequenceCounter {
    pub const FIRST: u8 = 1;

    pub fn new() -> Self {
        Self(Self::FIRST)
    }

    /// Value the next request will carry
    pub fn value(self) -> u8 {
        self.0
    }

    /// Return the current value and move to the next one
    pub fn advance(&mut self) -> u8 {
        let current = self.0;
        self.0 = match current {
            u8::MAX => Self::FIRST,
            n => n + 1,
        };
        current
    }
}

impl Default for BlockSequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for BlockSequenceCounter {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        Some(self.advance())
    }
}

/// Download state for one block: what is left to send and the counter
#[derive(Debug)]
pub struct TransferSession<'a> {
    block: &'a MemoryBlock,
    max_block_length: u16,
    counter: BlockSequenceCounter,
    offset: usize,
}

impl<'a> TransferSession<'a> {
    /// `max_block_length` is the value negotiated by RequestDownload; it
    /// includes the TransferData overhead.
    pub fn new(block: &'a MemoryBlock, max_block_length: u16) -> Result<Self, UdsError> {
        if usize::from(max_block_length) <= TRANSFER_OVERHEAD {
            return Err(UdsError::InvalidResponse(format!(
                "maxNumberOfBlockLength {} leaves no room for data",
                max_block_length
            )));
        }
        Ok(Self {
            block,
            max_block_length,
            counter: BlockSequenceCounter::new(),
            offset: 0,
        })
    }

    pub fn block(&self) -> &'a MemoryBlock {
        self.block
    }

    pub fn max_block_length(&self) -> u16 {
        self.max_block_length
    }

    /// Length of each full TransferData request: the negotiated length,
    /// capped at what the connection can carry in one payload
    pub fn request_length(&self) -> usize {
        usize::from(self.max_block_length).min(MAX_TRANSFER_UNIT)
    }

    /// Payload bytes carried by each full TransferData request
    pub fn chunk_size(&self) -> usize {
        self.request_length() - TRANSFER_OVERHEAD
    }

    /// Number of TransferData requests the whole block needs
    pub fn chunk_count(&self) -> usize {
        self.block.payload.len().div_ceil(self.chunk_size())
    }

    pub fn transferred(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.block.payload.len() - self.offset
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Next `(sequence counter, payload)` pair, or `None` when done
    pub fn next_chunk(&mut self) -> Option<(u8, &'a [u8])> {
        if self.is_complete() {
            return None;
        }
        let end = (self.offset + self.chunk_size()).min(self.block.payload.len());
        let chunk = &self.block.payload[self.offset..end];
        self.offset = end;
        Some((self.counter.advance(), chunk))
    }
}
