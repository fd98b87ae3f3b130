//! Lock-free single-producer/single-consumer byte ring.
//!
//! The sink owns one of these: the audio thread writes decoded bytes, the
//! sink worker drains them toward the target. Capacity is a power of two so
//! positions wrap with a mask instead of a division.
//!
//! Memory-ordering contract: the producer publishes data with a release
//! store of the write position after the byte copy; the consumer observes it
//! with an acquire load before reading the bytes (and vice versa for the
//! read position when space is reclaimed). Positions grow monotonically and
//! are reduced modulo capacity only at access time.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

pub struct RingBuffer {
    storage: Box<[UnsafeCell<u8>]>,
    mask: usize,
    /// Write position. Mutated only by the producer.
    head: CachePadded<AtomicUsize>,
    /// Read position. Mutated only by the consumer.
    tail: CachePadded<AtomicUsize>,
    /// Producer's last observed read position (avoids an acquire load per write).
    cached_tail: CachePadded<AtomicUsize>,
    /// Consumer's last observed write position.
    cached_head: CachePadded<AtomicUsize>,
}

// Safety: the storage is only touched through the SPSC protocol above —
// the producer writes bytes in [head, head+n) before releasing head, the
// consumer reads bytes in [tail, tail+n) after acquiring head. With one
// producer and one consumer the accessed ranges never overlap.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create a ring with the given capacity, rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let storage = (0..capacity)
            .map(|_| UnsafeCell::new(0u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            storage,
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            cached_tail: CachePadded::new(AtomicUsize::new(0)),
            cached_head: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Bytes currently readable.
    pub fn available(&self) -> usize {
        self.head
            .load(Ordering::Acquire)
            .wrapping_sub(self.tail.load(Ordering::Acquire))
    }

    /// Bytes currently writable.
    pub fn free_space(&self) -> usize {
        self.capacity() - self.available()
    }

    /// Write as many bytes as fit; returns the count actually written.
    ///
    /// Must only be called from the single producer thread.
    pub fn write(&self, data: &[u8]) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let mut tail = self.cached_tail.load(Ordering::Relaxed);
        if self.capacity() - head.wrapping_sub(tail) < data.len() {
            tail = self.tail.load(Ordering::Acquire);
            self.cached_tail.store(tail, Ordering::Relaxed);
        }

        let free = self.capacity() - head.wrapping_sub(tail);
        let n = data.len().min(free);
        if n == 0 {
            return 0;
        }

        let start = head & self.mask;
        let first = n.min(self.capacity() - start);
        // Safety: [head, head+n) is unreachable by the consumer until the
        // release store below.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.slot(start), first);
            if n > first {
                std::ptr::copy_nonoverlapping(data.as_ptr().add(first), self.slot(0), n - first);
            }
        }

        self.head.store(head.wrapping_add(n), Ordering::Release);
        n
    }

    /// Read up to `out.len()` bytes; returns the count actually read.
    ///
    /// Must only be called from the single consumer thread.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let mut head = self.cached_head.load(Ordering::Relaxed);
        if head.wrapping_sub(tail) < out.len() {
            head = self.head.load(Ordering::Acquire);
            self.cached_head.store(head, Ordering::Relaxed);
        }

        let n = out.len().min(head.wrapping_sub(tail));
        if n == 0 {
            return 0;
        }

        let start = tail & self.mask;
        let first = n.min(self.capacity() - start);
        // Safety: [tail, tail+n) was published by the producer's release
        // store of head, which the acquire load above observed.
        unsafe {
            std::ptr::copy_nonoverlapping(self.slot(start), out.as_mut_ptr(), first);
            if n > first {
                std::ptr::copy_nonoverlapping(self.slot(0), out.as_mut_ptr().add(first), n - first);
            }
        }

        self.tail.store(tail.wrapping_add(n), Ordering::Release);
        n
    }

    /// Drop all pending bytes. Consumer-side operation; the sink calls this
    /// while the worker is quiescent.
    pub fn clear(&self) {
        let head = self.head.load(Ordering::Acquire);
        self.tail.store(head, Ordering::Release);
    }

    fn slot(&self, index: usize) -> *mut u8 {
        self.storage[index].get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        assert_eq!(RingBuffer::new(1000).capacity(), 1024);
        assert_eq!(RingBuffer::new(4096).capacity(), 4096);
    }

    #[test]
    fn write_then_read_round_trips() {
        let ring = RingBuffer::new(16);
        assert_eq!(ring.write(&[1, 2, 3, 4]), 4);
        assert_eq!(ring.available(), 4);
        assert_eq!(ring.free_space(), 12);

        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn partial_write_when_full() {
        let ring = RingBuffer::new(8);
        assert_eq!(ring.write(&[0; 6]), 6);
        assert_eq!(ring.write(&[1; 6]), 2);
        assert_eq!(ring.available(), 8);
        assert_eq!(ring.write(&[2; 1]), 0);
    }

    #[test]
    fn wrap_around_preserves_order() {
        let ring = RingBuffer::new(8);
        let mut out = [0u8; 8];

        assert_eq!(ring.write(&[1, 2, 3, 4, 5, 6]), 6);
        assert_eq!(ring.read(&mut out[..4]), 4);
        // Head is now at 6; this write wraps.
        assert_eq!(ring.write(&[7, 8, 9, 10]), 4);
        let n = ring.read(&mut out);
        assert_eq!(&out[..n], &[5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn free_plus_available_is_capacity() {
        let ring = RingBuffer::new(32);
        ring.write(&[0; 13]);
        assert_eq!(ring.free_space() + ring.available(), ring.capacity());
        let mut out = [0u8; 5];
        ring.read(&mut out);
        assert_eq!(ring.free_space() + ring.available(), ring.capacity());
    }

    #[test]
    fn clear_drops_pending_bytes() {
        let ring = RingBuffer::new(16);
        ring.write(&[9; 10]);
        ring.clear();
        assert_eq!(ring.available(), 0);
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out), 0);
    }

    #[test]
    fn threaded_producer_consumer_sees_exact_sequence() {
        let ring = Arc::new(RingBuffer::new(64));
        let total: usize = 10_000;

        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                let mut sent = 0usize;
                while sent < total {
                    let chunk: Vec<u8> = (sent..(sent + 7).min(total))
                        .map(|i| (i % 251) as u8)
                        .collect();
                    let n = ring.write(&chunk);
                    sent += n;
                    if n == 0 {
                        std::thread::yield_now();
                    }
                }
            })
        };

        let mut received = Vec::with_capacity(total);
        let mut buf = [0u8; 17];
        while received.len() < total {
            let n = ring.read(&mut buf);
            if n == 0 {
                std::thread::yield_now();
                continue;
            }
            received.extend_from_slice(&buf[..n]);
        }
        producer.join().unwrap();

        for (i, b) in received.iter().enumerate() {
            assert_eq!(*b, (i % 251) as u8);
        }
    }
}
