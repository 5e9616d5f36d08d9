// src/data_loader/memory.rs
//
//! Buffer provider for the packers.
//!
//! The packer allocates one output buffer per stream per minibatch; the
//! reader gives them back once the data has been copied into the caller's
//! matrices, so steady-state training does not allocate.

use crate::data_loader::pool::ConcPool;

/// Supplies and reclaims raw buffers used by the packers.
pub trait MemoryProvider: Send + Sync {
    /// A zero-filled buffer of `element_size * num_elements` bytes.
    fn alloc(&self, element_size: usize, num_elements: usize) -> Vec<u8>;

    /// Return a buffer obtained from [`alloc`](Self::alloc).
    fn free(&self, buffer: Vec<u8>);
}

/// Heap-backed provider that recycles freed buffers.
#[derive(Debug)]
pub struct HeapMemoryProvider {
    free_list: ConcPool<Vec<u8>>,
    max_pooled: usize,
}

impl Default for HeapMemoryProvider {
    fn default() -> Self {
        Self::new(crate::constants::DEFAULT_MAX_POOLED_BUFFERS)
    }
}

impl HeapMemoryProvider {
    /// Keep at most `max_pooled` idle buffers; extra frees are dropped.
    pub fn new(max_pooled: usize) -> Self {
        Self { free_list: ConcPool::new(), max_pooled }
    }

    /// Idle buffers waiting for reuse.
    pub fn pooled(&self) -> usize {
        self.free_list.idle()
    }
}

impl MemoryProvider for HeapMemoryProvider {
    fn alloc(&self, element_size: usize, num_elements: usize) -> Vec<u8> {
        let len = element_size * num_elements;
        match self.free_list.pop() {
            Some(mut buf) => {
                buf.clear();
                buf.resize(len, 0);
                buf
            }
            None => vec![0; len],
        }
    }

    fn free(&self, buffer: Vec<u8>) {
        if self.free_list.idle() < self.max_pooled {
            self.free_list.push(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_buffers_are_zeroed() {
        let provider = HeapMemoryProvider::new(4);
        let mut buf = provider.alloc(4, 8);
        assert_eq!(buf.len(), 32);
        buf.iter_mut().for_each(|b| *b = 0xff);
        provider.free(buf);
        assert_eq!(provider.pooled(), 1);

        let again = provider.alloc(4, 4);
        assert_eq!(again.len(), 16);
        assert!(again.iter().all(|&b| b == 0));
        assert_eq!(provider.pooled(), 0);
    }

    #[test]
    fn pool_is_bounded() {
        let provider = HeapMemoryProvider::new(1);
        provider.free(vec![0; 4]);
        provider.free(vec![0; 4]);
        assert_eq!(provider.pooled(), 1);
    }
}
