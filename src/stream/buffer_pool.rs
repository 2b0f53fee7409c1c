//! Reusable buffer pool for the relay hot path.
//!
//! Relay pumps churn through read buffers at a high rate; pooling them
//! keeps allocation pressure flat under many concurrent sessions.

#![allow(dead_code)]

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;

/// Relay pump buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Default maximum number of pooled buffers.
pub const DEFAULT_MAX_BUFFERS: usize = 1024;

/// Thread-safe pool of reusable buffers.
pub struct BufferPool {
    buffers: ArrayQueue<BytesMut>,
    buffer_size: usize,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_BUFFER_SIZE, DEFAULT_MAX_BUFFERS)
    }

    pub fn with_config(buffer_size: usize, max_buffers: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(max_buffers),
            buffer_size,
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Get a zeroed buffer of `buffer_size` bytes, reusing a pooled one
    /// when available.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let mut buffer = match self.buffers.pop() {
            Some(buffer) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.buffer_size)
            }
        };
        buffer.clear();
        buffer.resize(self.buffer_size, 0);
        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    fn return_buffer(&self, mut buffer: BytesMut) {
        buffer.clear();
        if buffer.capacity() >= self.buffer_size {
            // If the queue is full the buffer is simply dropped.
            let _ = self.buffers.push(buffer);
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn stats(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer borrowed from the pool; returns itself on drop.
pub struct PooledBuffer {
    buffer: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buffer.as_ref().expect("buffer taken")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buffer.as_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.return_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_sized_buffer() {
        let pool = Arc::new(BufferPool::with_config(1024, 4));
        let buf = pool.get();
        assert_eq!(buf.len(), 1024);
    }

    #[test]
    fn dropped_buffers_are_reused() {
        let pool = Arc::new(BufferPool::with_config(512, 4));
        drop(pool.get());
        drop(pool.get());
        let (hits, misses) = pool.stats();
        assert_eq!(misses, 1);
        assert_eq!(hits, 1);
    }
}
