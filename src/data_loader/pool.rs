// src/data_loader/pool.rs
//
//! Lock-free object pool used for archive handles, scratch buffers and
//! packer output buffers.
//!
//! Items are created lazily: `pop_or_create` only builds a new item when
//! the pool is empty, so the number of live items tracks the peak
//! concurrency observed rather than a fixed capacity.

use crossbeam::queue::SegQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct ConcPool<T> {
    items: SegQueue<T>,
    created: AtomicUsize,
}

impl<T> Default for ConcPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConcPool<T> {
    pub fn new() -> Self {
        Self { items: SegQueue::new(), created: AtomicUsize::new(0) }
    }

    pub fn push(&self, item: T) {
        self.items.push(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.items.pop()
    }

    /// Pop an idle item or build a fresh one with `create`.
    pub fn pop_or_create<E>(&self, create: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        match self.items.pop() {
            Some(item) => Ok(item),
            None => {
                let item = create()?;
                self.created.fetch_add(1, Ordering::Relaxed);
                Ok(item)
            }
        }
    }

    /// Like [`pop_or_create`](Self::pop_or_create), but hands back a guard
    /// that returns the item to the pool when dropped.
    pub fn checkout<E>(&self, create: impl FnOnce() -> Result<T, E>) -> Result<Pooled<'_, T>, E> {
        let item = self.pop_or_create(create)?;
        Ok(Pooled { pool: self, item: Some(item) })
    }

    /// Items currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.items.len()
    }

    /// Items ever created through this pool.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

/// Exclusive loan of a pooled item; pushed back on drop.
pub struct Pooled<'a, T> {
    pool: &'a ConcPool<T>,
    item: Option<T>,
}

impl<T> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pooled item taken")
    }
}

impl<T> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pooled item taken")
    }
}

impl<T> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn reuses_before_creating() {
        let pool: ConcPool<Vec<u8>> = ConcPool::new();
        {
            let mut a = pool.checkout(|| Ok::<_, ()>(Vec::new())).unwrap();
            a.push(1);
        }
        assert_eq!(pool.created(), 1);
        assert_eq!(pool.idle(), 1);

        let b = pool.checkout(|| Ok::<_, ()>(Vec::new())).unwrap();
        assert_eq!(*b, vec![1]);
        assert_eq!(pool.created(), 1);
    }

    #[test]
    fn created_tracks_peak_concurrency() {
        let pool: Arc<ConcPool<u32>> = Arc::new(ConcPool::new());
        let barrier = Arc::new(std::sync::Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let _item = pool.checkout(|| Ok::<_, ()>(0)).unwrap();
                    barrier.wait();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.created(), 4);
        assert_eq!(pool.idle(), 4);
    }

    #[test]
    fn failed_create_is_not_counted() {
        let pool: ConcPool<u8> = ConcPool::new();
        assert!(pool.pop_or_create(|| Err::<u8, _>("nope")).is_err());
        assert_eq!(pool.created(), 0);
    }
}
