//! Buffers between the audio device callbacks and the network threads
//!
//! `SampleRing` is a lock-free SPSC queue of i16 samples feeding a playback
//! callback. `ChunkAssembler` turns the variable-size blocks a capture
//! callback produces into the fixed-size chunks the socket expects.

use bytes::{Buf, Bytes, BytesMut};
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Lock-free ring of interleaved i16 samples
pub struct SampleRing {
    queue: ArrayQueue<i16>,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl SampleRing {
    /// Create a new ring holding up to `capacity` samples
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Push a sample
    /// Returns false if the ring is full (overflow)
    pub fn push(&self, sample: i16) -> bool {
        match self.queue.push(sample) {
            Ok(()) => true,
            Err(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop a sample
    /// Returns None if the ring is empty (underrun)
    pub fn pop(&self) -> Option<i16> {
        match self.queue.pop() {
            Some(sample) => Some(sample),
            None => {
                self.underrun_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Pop without counting underrun
    pub fn try_pop(&self) -> Option<i16> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Free slots
    pub fn available(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }

    /// Drop everything queued
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    /// Fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.len() as f32 / self.capacity() as f32
    }
}

/// Thread-safe handle to a sample ring
pub type SharedSampleRing = Arc<SampleRing>;

pub fn create_shared_ring(capacity: usize) -> SharedSampleRing {
    Arc::new(SampleRing::new(capacity))
}

/// Accumulates capture blocks and hands out fixed-size chunks
#[derive(Default)]
pub struct ChunkAssembler {
    pending: BytesMut,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, block: Bytes) {
        self.pending.extend_from_slice(&block);
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Copy exactly `out.len()` bytes out if enough are buffered
    pub fn take_into(&mut self, out: &mut [u8]) -> bool {
        if self.pending.len() < out.len() {
            return false;
        }
        self.pending.copy_to_slice(out);
        true
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_basic() {
        let ring = SampleRing::new(4);

        assert!(ring.push(1));
        assert!(ring.push(-2));
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.available(), 2);

        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(-2));
        assert_eq!(ring.pop(), None);
        assert_eq!(ring.underrun_count(), 1);
    }

    #[test]
    fn test_ring_overflow() {
        let ring = SampleRing::new(2);
        assert!(ring.push(1));
        assert!(ring.push(2));
        assert!(!ring.push(3));
        assert_eq!(ring.overflow_count(), 1);
        ring.clear();
        assert!(ring.is_empty());
    }

    #[test]
    fn test_assembler_yields_fixed_chunks_in_order() {
        let mut asm = ChunkAssembler::new();
        asm.push(Bytes::from_static(&[1, 2, 3]));
        let mut out = [0u8; 4];
        assert!(!asm.take_into(&mut out));

        asm.push(Bytes::from_static(&[4, 5, 6, 7, 8, 9]));
        assert!(asm.take_into(&mut out));
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(asm.take_into(&mut out));
        assert_eq!(out, [5, 6, 7, 8]);
        assert_eq!(asm.buffered(), 1);
    }
}
