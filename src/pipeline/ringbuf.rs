//! Bounded frame queues between the pipeline stages.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// Fixed-capacity FIFO with an atomic fill counter.
///
/// The counter is raised only after an element is stored and lowered only
/// after one is taken, so it never exceeds the capacity nor goes negative,
/// and a consumer seeing it non-zero always finds an element.
pub struct FrameRing<T> {
    producer: Mutex<HeapProd<T>>,
    consumer: Mutex<HeapCons<T>>,
    capacity: usize,
    filled: CachePadded<AtomicUsize>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    written: AtomicUsize,
    read: AtomicUsize,
}

impl<T> FrameRing<T> {
    pub fn new(capacity: usize) -> Self {
        let (producer, consumer) = HeapRb::<T>::new(capacity).split();
        Self {
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
            capacity,
            filled: CachePadded::new(AtomicUsize::new(0)),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: hand the element back if the ring is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.producer.lock().try_push(item)?;
        self.filled.fetch_add(1, Ordering::AcqRel);
        self.stats.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Consumer: oldest element, if any.
    pub fn pop(&self) -> Option<T> {
        if self.filled.load(Ordering::Acquire) == 0 {
            return None;
        }
        let item = self.consumer.lock().try_pop()?;
        self.filled.fetch_sub(1, Ordering::AcqRel);
        self.stats.read.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Drop everything queued. Returns how many elements were removed.
    pub fn drain(&self) -> usize {
        let mut n = 0;
        while self.pop().is_some() {
            n += 1;
        }
        n
    }

    pub fn len(&self) -> usize {
        self.filled.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `(written, read)` totals.
    pub fn stats(&self) -> (usize, usize) {
        (
            self.stats.written.load(Ordering::Relaxed),
            self.stats.read.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn full_ring_rejects() {
        let ring = FrameRing::new(3);
        for i in 0..3 {
            ring.push(i).unwrap();
        }
        assert!(ring.is_full());
        assert_eq!(ring.push(9), Err(9));
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn fifo_with_interleaving() {
        let ring = FrameRing::new(3);
        let mut expected = 0;
        let mut next = 0;
        for step in 0..50 {
            if step % 3 != 2 {
                if ring.push(next).is_ok() {
                    next += 1;
                }
            } else if let Some(v) = ring.pop() {
                assert_eq!(v, expected);
                expected += 1;
            }
            assert!(ring.len() <= 3);
        }
        while let Some(v) = ring.pop() {
            assert_eq!(v, expected);
            expected += 1;
        }
        assert_eq!(expected, next);
        assert!(ring.is_empty());
    }

    #[test]
    fn counter_stays_in_bounds_across_threads() {
        let ring = Arc::new(FrameRing::new(3));
        let producer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                let mut i = 0u32;
                while i < 2000 {
                    match ring.push(i) {
                        Ok(()) => i += 1,
                        Err(_) => std::thread::yield_now(),
                    }
                    assert!(ring.len() <= 3);
                }
            })
        };
        let mut expected = 0u32;
        while expected < 2000 {
            if let Some(v) = ring.pop() {
                assert_eq!(v, expected);
                expected += 1;
            }
            assert!(ring.len() <= 3);
        }
        producer.join().unwrap();
        assert_eq!(ring.stats(), (2000, 2000));
        assert_eq!(ring.drain(), 0);
    }
}
