//! Fixed-size request frame accumulation.
//!
//! Runs inside the audio callback. `push` is allocation-free as long as spent
//! frame buffers are recycled back; the pool only grows when the control side
//! falls behind.

use std::mem;

use crate::codec;
use crate::frame::{RequestFrame, BLOCK_SIZE};

/// Spare frame buffers kept ready for swapping in.
const SPARE_FRAMES: usize = 4;

/// Buffers callback blocks into outbound request frames.
///
/// A frame is completed exactly every `block_count` pushes. Partial frames
/// are never emitted; [`configure`](Self::configure) and [`reset`](Self::reset)
/// discard them.
///
/// # Example
///
/// ```
/// use voice_stream::{FrameAccumulator, BLOCK_SIZE};
///
/// let mut accumulator = FrameAccumulator::new(8);
/// let block = [0.25f32; BLOCK_SIZE];
///
/// for _ in 0..7 {
///     assert!(accumulator.push(&block).is_none());
/// }
/// let frame = accumulator.push(&block).unwrap();
/// assert_eq!(frame.len(), 1024);
/// assert_eq!(frame.to_le_bytes().len(), 2048);
/// ```
#[derive(Debug)]
pub struct FrameAccumulator {
    buffer: Vec<i16>,
    cursor: usize,
    block_count: usize,
    spare: Vec<Vec<i16>>,
    pool_misses: u64,
}

impl FrameAccumulator {
    /// Creates an accumulator producing frames of `block_count` blocks.
    ///
    /// A block count of zero is treated as one.
    pub fn new(block_count: usize) -> Self {
        let mut accumulator = Self {
            buffer: Vec::new(),
            cursor: 0,
            block_count: 0,
            spare: Vec::with_capacity(SPARE_FRAMES),
            pool_misses: 0,
        };
        accumulator.configure(block_count);
        accumulator
    }

    /// Reallocates for a new block count, discarding any partial frame.
    pub fn configure(&mut self, block_count: usize) {
        let block_count = block_count.max(1);
        let frame_len = block_count * BLOCK_SIZE;

        self.block_count = block_count;
        self.buffer = vec![0; frame_len];
        self.cursor = 0;
        self.spare.clear();
        for _ in 0..SPARE_FRAMES {
            self.spare.push(vec![0; frame_len]);
        }
    }

    /// Encodes one block; returns the frame if this block completed it.
    pub fn push(&mut self, block: &[f32; BLOCK_SIZE]) -> Option<RequestFrame> {
        let end = self.cursor + BLOCK_SIZE;
        codec::encode_into(block, &mut self.buffer[self.cursor..end]);
        self.cursor = end;

        if self.cursor < self.buffer.len() {
            return None;
        }

        let next = match self.spare.pop() {
            Some(buf) => buf,
            None => {
                self.pool_misses += 1;
                vec![0; self.frame_len()]
            }
        };
        self.cursor = 0;
        Some(RequestFrame::from_samples(mem::replace(
            &mut self.buffer,
            next,
        )))
    }

    /// Returns a spent frame buffer to the pool.
    ///
    /// Buffers from a previous configuration, or beyond the pool size, are
    /// dropped.
    pub fn recycle(&mut self, buf: Vec<i16>) -> bool {
        if buf.len() != self.frame_len() || self.spare.len() >= SPARE_FRAMES {
            return false;
        }
        self.spare.push(buf);
        true
    }

    /// Discards the partial frame without reallocating.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Blocks per frame.
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Samples per frame.
    pub fn frame_len(&self) -> usize {
        self.block_count * BLOCK_SIZE
    }

    /// Blocks accumulated toward the current frame.
    pub fn pending_blocks(&self) -> usize {
        self.cursor / BLOCK_SIZE
    }

    /// Number of frames that needed a fresh allocation.
    pub fn pool_misses(&self) -> u64 {
        self.pool_misses
    }
}
