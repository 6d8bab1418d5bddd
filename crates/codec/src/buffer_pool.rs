//! Fixed-count slab of equal-size byte buffers.
//!
//! Mirrors `BufferPool` from the original: one contiguous allocation sliced
//! into `count` equal cells, tracked with an occupancy bitset behind a
//! single mutex. `reuse` on a handle not owned by this pool is an internal
//! invariant violation and panics, matching the original's `abort()`.

use std::sync::Mutex;

const MAX_CELLS: usize = 64;

struct Inner {
    cells: Vec<Box<[u8]>>,
    used: u64,
}

/// A pool of `count` buffers of `cell_size` bytes each, `count <= 64`.
pub struct BufferPool {
    inner: Mutex<Inner>,
    cell_size: usize,
    count: usize,
}

/// A handle borrowed from a [`BufferPool`]. Carries its originating slot
/// index so `reuse` is O(1) rather than a linear pointer scan.
pub struct PooledBuffer {
    slot: usize,
    data: Box<[u8]>,
}

impl PooledBuffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl BufferPool {
    /// Creates a pool of `count` buffers, each `cell_size` bytes.
    ///
    /// # Panics
    /// Panics if `count` exceeds 64, matching the original's `assert`.
    pub fn new(cell_size: usize, count: usize) -> Self {
        assert!(count <= MAX_CELLS, "buffer pool count must be <= 64");
        let cells = (0..count)
            .map(|_| vec![0u8; cell_size].into_boxed_slice())
            .collect();
        Self {
            inner: Mutex::new(Inner { cells, used: 0 }),
            cell_size,
            count,
        }
    }

    pub fn single_buffer_size(&self) -> usize {
        self.cell_size
    }

    pub fn buffer_count(&self) -> usize {
        self.count
    }

    /// Returns the first free cell, or `None` if the pool is exhausted.
    pub fn get(&self) -> Option<PooledBuffer> {
        let mut inner = self.inner.lock().unwrap();
        for i in 0..self.count {
            if inner.used & (1 << i) == 0 {
                inner.used |= 1 << i;
                let data = std::mem::replace(&mut inner.cells[i], Box::new([]));
                return Some(PooledBuffer { slot: i, data });
            }
        }
        None
    }

    /// Returns a buffer to the pool. The buffer must have come from this
    /// pool; this is checked by slot index rather than pointer identity
    /// since Rust buffers move, but the contract is the same: reusing a
    /// foreign handle is an internal bug.
    pub fn reuse(&self, buf: PooledBuffer) {
        let mut inner = self.inner.lock().unwrap();
        assert!(buf.slot < self.count, "pointer passed isn't a valid buffer from this pool");
        inner.cells[buf.slot] = buf.data;
        inner.used &= !(1 << buf.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausts_and_recovers() {
        let pool = BufferPool::new(16, 2);
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert!(pool.get().is_none());
        pool.reuse(a);
        assert!(pool.get().is_some());
        pool.reuse(b);
    }

    #[test]
    #[should_panic]
    fn panics_above_max_cells() {
        BufferPool::new(16, 65);
    }
}
