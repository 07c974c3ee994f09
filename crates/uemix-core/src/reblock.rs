//! Re-blocking of pulled samples
//!
//! Producers may answer each request with a different number of samples. A
//! [`Reblocker`] regroups a source's samples into fixed-size blocks so every
//! combiner input of a tick has the same length. A block size of zero passes
//! blocks through untouched.
//!
//! ```rust
//! use uemix_core::reblock::Reblocker;
//! use uemix_core::types::{constant_block, Sample};
//!
//! let mut reblocker = Reblocker::new(4);
//! let blocks = reblocker.push(&constant_block(Sample::new(1.0, 0.0), 10));
//! assert_eq!(blocks.len(), 2);
//! assert_eq!(reblocker.buffered(), 2);
//! ```

use crate::types::{Sample, SampleBlock};
use std::collections::VecDeque;

/// Regroup a stream into blocks of exactly `block_size` samples.
#[derive(Debug, Clone)]
pub struct Reblocker {
    block_size: usize,
    buffer: SampleBlock,
    ready: VecDeque<SampleBlock>,
}

impl Reblocker {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            buffer: Vec::with_capacity(block_size),
            ready: VecDeque::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn is_passthrough(&self) -> bool {
        self.block_size == 0
    }

    /// Append samples and return every block completed by them.
    ///
    /// Leftover samples stay buffered for the next call.
    pub fn push(&mut self, input: &[Sample]) -> Vec<SampleBlock> {
        if self.is_passthrough() {
            return vec![input.to_vec()];
        }

        let mut output = Vec::new();
        for &s in input {
            self.buffer.push(s);
            if self.buffer.len() == self.block_size {
                output.push(std::mem::replace(
                    &mut self.buffer,
                    Vec::with_capacity(self.block_size),
                ));
            }
        }
        output
    }

    /// Feed a pulled block and queue the completed blocks for [`next_block`].
    ///
    /// [`next_block`]: Reblocker::next_block
    pub fn feed(&mut self, block: SampleBlock) {
        if self.is_passthrough() {
            self.ready.push_back(block);
        } else {
            let completed = self.push(&block);
            self.ready.extend(completed);
        }
    }

    /// Take the oldest completed block.
    pub fn next_block(&mut self) -> Option<SampleBlock> {
        self.ready.pop_front()
    }

    /// Samples waiting to complete a block.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.ready.clear();
    }
}
