//! Lock-free byte ring buffer
//!
//! This implements a single-producer single-consumer (SPSC) byte queue used
//! to hand raw PCM between the real-time capture callback, the network
//! stream, and the file sink. Neither side ever blocks or allocates.
//!
//! The buffer is split into a [`Producer`] and a [`Consumer`] handle. Each
//! handle is `Send` but not `Clone`, so there is exactly one of each and the
//! SPSC contract holds by construction.
//!
//! Cursors advance monotonically; the slot for a cursor is `cursor % capacity`.
//! A transfer touches at most two contiguous runs of the arena: from the
//! cursor's slot to the end, then from the start.
//! The producer publishes its cursor with `Release` after copying bytes in and
//! the consumer reads it with `Acquire` before copying bytes out (and vice
//! versa for the read cursor), so every byte written is visible to the reader
//! before the cursor that covers it.

use crossbeam::utils::CachePadded;
use std::ops::Range;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

struct Shared {
    arena: Box<[AtomicU8]>,
    /// Total bytes ever consumed.
    read: CachePadded<AtomicUsize>,
    /// Total bytes ever produced.
    write: CachePadded<AtomicUsize>,
}

impl Shared {
    /// Split `len` bytes starting at slot `start` into the run before the
    /// wrap point and the run after it.
    fn runs(&self, start: usize, len: usize) -> (Range<usize>, Range<usize>) {
        let head = len.min(self.capacity() - start);
        (start..start + head, 0..len - head)
    }

    fn capacity(&self) -> usize {
        self.arena.len()
    }

    fn available_to_read(&self) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    fn available_to_write(&self) -> usize {
        self.capacity() - self.available_to_read()
    }
}

/// Fixed-capacity byte ring buffer.
///
/// Only a constructor lives here; all access goes through the handles
/// returned by [`RingBuffer::new`].
pub struct RingBuffer;

impl RingBuffer {
    /// Allocate a buffer of `capacity` bytes and split it into its two ends.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(capacity: usize) -> (Producer, Consumer) {
        assert!(capacity > 0, "Ring buffer capacity must be non-zero");

        let arena: Box<[AtomicU8]> = (0..capacity).map(|_| AtomicU8::new(0)).collect();
        let shared = Arc::new(Shared {
            arena,
            read: CachePadded::new(AtomicUsize::new(0)),
            write: CachePadded::new(AtomicUsize::new(0)),
        });

        (
            Producer {
                shared: shared.clone(),
            },
            Consumer { shared },
        )
    }
}

/// Writing end of a [`RingBuffer`]
pub struct Producer {
    shared: Arc<Shared>,
}

impl Producer {
    /// Copy as much of `bytes` as fits and return how many were accepted.
    ///
    /// Accepts zero bytes when the buffer is full; what to do with the
    /// remainder is the caller's decision.
    pub fn produce(&mut self, bytes: &[u8]) -> usize {
        let shared = &*self.shared;
        let capacity = shared.capacity();

        // Only this handle moves the write cursor.
        let write = shared.write.load(Ordering::Relaxed);
        let read = shared.read.load(Ordering::Acquire);
        let free = capacity - write.wrapping_sub(read);

        let count = bytes.len().min(free);
        if count == 0 {
            return 0;
        }

        let (head, tail) = shared.runs(write % capacity, count);
        let (first, second) = bytes[..count].split_at(head.len());
        for (slot, &byte) in shared.arena[head].iter().zip(first) {
            slot.store(byte, Ordering::Relaxed);
        }
        for (slot, &byte) in shared.arena[tail].iter().zip(second) {
            slot.store(byte, Ordering::Relaxed);
        }

        shared.write.store(write.wrapping_add(count), Ordering::Release);
        count
    }

    pub fn available_to_read(&self) -> usize {
        self.shared.available_to_read()
    }

    pub fn available_to_write(&self) -> usize {
        self.shared.available_to_write()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.available_to_write() == 0
    }
}

/// Reading end of a [`RingBuffer`]
pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    /// Move up to `dst.len()` bytes out of the buffer, returning the count.
    pub fn consume_into(&mut self, dst: &mut [u8]) -> usize {
        let shared = &*self.shared;
        let capacity = shared.capacity();

        // Only this handle moves the read cursor.
        let read = shared.read.load(Ordering::Relaxed);
        let write = shared.write.load(Ordering::Acquire);
        let pending = write.wrapping_sub(read);

        let count = dst.len().min(pending);
        if count == 0 {
            return 0;
        }

        let (head, tail) = shared.runs(read % capacity, count);
        let (first, second) = dst[..count].split_at_mut(head.len());
        for (out, slot) in first.iter_mut().zip(&shared.arena[head]) {
            *out = slot.load(Ordering::Relaxed);
        }
        for (out, slot) in second.iter_mut().zip(&shared.arena[tail]) {
            *out = slot.load(Ordering::Relaxed);
        }

        shared.read.store(read.wrapping_add(count), Ordering::Release);
        count
    }

    /// Take up to `max_bytes` bytes. Returns an empty vector if none are pending.
    pub fn consume(&mut self, max_bytes: usize) -> Vec<u8> {
        let mut out = vec![0u8; max_bytes.min(self.available_to_read())];
        let count = self.consume_into(&mut out);
        out.truncate(count);
        out
    }

    pub fn available_to_read(&self) -> usize {
        self.shared.available_to_read()
    }

    pub fn available_to_write(&self) -> usize {
        self.shared.available_to_write()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.available_to_read() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    #[test]
    fn test_ring_buffer_basic() {
        let (mut tx, mut rx) = RingBuffer::new(8);

        assert_eq!(tx.produce(&[1, 2, 3]), 3);
        assert_eq!(rx.available_to_read(), 3);
        assert_eq!(tx.available_to_write(), 5);

        assert_eq!(rx.consume(2), vec![1, 2]);
        assert_eq!(rx.consume(10), vec![3]);
        assert!(rx.is_empty());
        assert!(rx.consume(4).is_empty());
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let (mut tx, mut rx) = RingBuffer::new(256);
        let first: Vec<u8> = (0..100).collect();
        let second: Vec<u8> = (100..=255).chain(0..44).collect();
        assert_eq!(second.len(), 200);

        assert_eq!(tx.produce(&first), 100);
        assert_eq!(rx.consume(50), first[..50].to_vec());

        assert_eq!(tx.produce(&second), 200);
        assert_eq!(tx.available_to_write(), 6);
        assert_eq!(rx.available_to_read(), 250);

        let mut expected = first[50..].to_vec();
        expected.extend_from_slice(&second);
        assert_eq!(rx.consume(256), expected);
    }

    #[test]
    fn test_transfers_ending_on_the_wrap_point() {
        let (mut tx, mut rx) = RingBuffer::new(8);
        assert_eq!(tx.produce(&[1, 2, 3, 4, 5]), 5);
        assert_eq!(rx.consume(5), vec![1, 2, 3, 4, 5]);

        // Fills slots 5..8 exactly, then continues from slot 0.
        assert_eq!(tx.produce(&[6, 7, 8]), 3);
        assert_eq!(tx.produce(&[9, 10, 11, 12, 13, 14, 15, 16]), 5);
        assert!(tx.is_full());

        let mut dst = [0u8; 3];
        assert_eq!(rx.consume_into(&mut dst), 3);
        assert_eq!(dst, [6, 7, 8]);
        assert_eq!(rx.consume(8), vec![9, 10, 11, 12, 13]);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_full_buffer_accepts_nothing() {
        let (mut tx, mut rx) = RingBuffer::new(4);

        assert_eq!(tx.produce(&[9, 8, 7, 6, 5]), 4);
        assert!(tx.is_full());
        assert_eq!(tx.produce(&[1, 1, 1]), 0);

        assert_eq!(rx.consume(4), vec![9, 8, 7, 6]);
    }

    #[test]
    fn test_partial_acceptance() {
        let (mut tx, mut rx) = RingBuffer::new(6);
        assert_eq!(tx.produce(&[0; 4]), 4);
        assert_eq!(tx.produce(&[1, 2, 3, 4]), 2);
        assert_eq!(rx.consume(6), vec![0, 0, 0, 0, 1, 2]);
    }

    #[test]
    #[should_panic]
    fn test_zero_capacity_panics() {
        let _ = RingBuffer::new(0);
    }

    #[test]
    fn test_cross_thread_fifo() {
        const TOTAL: usize = 200_000;
        let (mut tx, mut rx) = RingBuffer::new(97);

        let producer = thread::spawn(move || {
            let mut next = 0usize;
            while next < TOTAL {
                let end = (next + 13).min(TOTAL);
                let chunk: Vec<u8> = (next..end).map(|i| (i % 251) as u8).collect();
                let accepted = tx.produce(&chunk);
                next += accepted;
                if accepted == 0 {
                    thread::yield_now();
                }
            }
        });

        let mut received = 0usize;
        let mut scratch = [0u8; 31];
        while received < TOTAL {
            let n = rx.consume_into(&mut scratch);
            for &byte in &scratch[..n] {
                assert_eq!(byte, (received % 251) as u8);
                received += 1;
            }
            if n == 0 {
                thread::yield_now();
            }
        }

        producer.join().unwrap();
        assert!(rx.is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Produce(Vec<u8>),
        Consume(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            prop::collection::vec(any::<u8>(), 0..40).prop_map(Op::Produce),
            (0usize..40).prop_map(Op::Consume),
        ]
    }

    proptest! {
        #[test]
        fn prop_fifo_within_capacity(
            chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..16), 0..16),
            read_size in 1usize..32,
        ) {
            let (mut tx, mut rx) = RingBuffer::new(256);
            let mut produced = Vec::new();
            for chunk in &chunks {
                prop_assert_eq!(tx.produce(chunk), chunk.len());
                produced.extend_from_slice(chunk);
            }

            let mut consumed = Vec::new();
            loop {
                let part = rx.consume(read_size);
                if part.is_empty() {
                    break;
                }
                consumed.extend(part);
            }
            prop_assert_eq!(consumed, produced);
        }

        #[test]
        fn prop_capacity_bound(ops in prop::collection::vec(op(), 0..64), capacity in 1usize..64) {
            let (mut tx, mut rx) = RingBuffer::new(capacity);
            let mut model = std::collections::VecDeque::new();

            for op in ops {
                match op {
                    Op::Produce(bytes) => {
                        let room = tx.available_to_write();
                        let accepted = tx.produce(&bytes);
                        prop_assert_eq!(accepted, bytes.len().min(room));
                        model.extend(bytes[..accepted].iter().copied());
                    }
                    Op::Consume(max) => {
                        let pending = rx.available_to_read();
                        let out = rx.consume(max);
                        prop_assert_eq!(out.len(), max.min(pending));
                        let expected: Vec<u8> = model.drain(..out.len()).collect();
                        prop_assert_eq!(out, expected);
                    }
                }
                prop_assert_eq!(tx.available_to_read() + tx.available_to_write(), capacity);
                prop_assert_eq!(rx.available_to_read(), model.len());
            }
        }
    }
}
