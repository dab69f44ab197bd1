//! Size-classed recycling pool for message payload buffers.
//!
//! Inbound messages borrow their buffer from this pool; a handler that calls
//! [`crate::Message::close`] returns the buffer here for reuse, while a
//! message that is simply dropped lets its buffer fall back to the
//! allocator.

use std::sync::{Mutex, PoisonError};

use bytes::BytesMut;

/// Smallest pooled capacity; requests below this share a class.
const MIN_CLASS: usize = 128;

/// Largest pooled capacity (1 MiB); larger buffers are never retained.
const MAX_CLASS: usize = 1 << 20;

/// Buffers retained per size class before excess ones are dropped.
const CLASS_DEPTH: usize = 64;

/// A pool of `BytesMut` buffers bucketed by power-of-two capacity.
pub(crate) struct BufferPool {
    classes: Vec<Mutex<Vec<BytesMut>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        let count = class_index(MAX_CLASS) + 1;
        Self {
            classes: (0..count).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Fetches an empty buffer with capacity of at least `size`.
    pub fn acquire(&self, size: usize) -> BytesMut {
        if size > MAX_CLASS {
            return BytesMut::with_capacity(size);
        }

        let idx = class_index(size);
        let mut class = self.classes[idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match class.pop() {
            Some(buf) => buf,
            None => BytesMut::with_capacity(class_capacity(idx)),
        }
    }

    /// Returns a buffer for reuse. Oversized or undersized buffers and full
    /// classes are silently dropped to the allocator.
    pub fn release(&self, mut buf: BytesMut) {
        let capacity = buf.capacity();
        if !(MIN_CLASS..=MAX_CLASS).contains(&capacity) {
            return;
        }

        // Bucket by the class the capacity fully covers.
        let idx = class_index(capacity);
        if class_capacity(idx) > capacity {
            return;
        }

        buf.clear();
        let mut class = self.classes[idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if class.len() < CLASS_DEPTH {
            class.push(buf);
        }
    }
}

fn class_capacity(idx: usize) -> usize {
    MIN_CLASS << idx
}

fn class_index(size: usize) -> usize {
    let clamped = size.clamp(MIN_CLASS, MAX_CLASS);
    (clamped.next_power_of_two() / MIN_CLASS).trailing_zeros() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_capacity() {
        let pool = BufferPool::new();
        assert!(pool.acquire(0).capacity() >= MIN_CLASS);
        assert!(pool.acquire(129).capacity() >= 129);
        assert!(pool.acquire(65_000).capacity() >= 65_000);
        assert!(pool.acquire(MAX_CLASS + 1).capacity() > MAX_CLASS);
    }

    #[test]
    fn test_release_then_reuse() {
        let pool = BufferPool::new();
        let mut buf = pool.acquire(256);
        buf.extend_from_slice(&[1, 2, 3]);
        let ptr = buf.as_ptr();
        pool.release(buf);

        let reused = pool.acquire(256);
        assert_eq!(reused.len(), 0, "recycled buffers come back empty");
        assert_eq!(reused.as_ptr(), ptr);
    }

    #[test]
    fn test_class_index_boundaries() {
        assert_eq!(class_index(0), 0);
        assert_eq!(class_index(128), 0);
        assert_eq!(class_index(129), 1);
        assert_eq!(class_index(256), 1);
        assert_eq!(class_index(257), 2);
    }

    #[test]
    fn test_release_caps_depth() {
        let pool = BufferPool::new();
        for _ in 0..(CLASS_DEPTH + 8) {
            pool.release(BytesMut::with_capacity(MIN_CLASS));
        }
        let class = pool.classes[0].lock().unwrap();
        assert_eq!(class.len(), CLASS_DEPTH);
    }
}
