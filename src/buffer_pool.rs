//! Fixed-size pools of recyclable objects.
//!
//! Objects are allocated up front and parked on a lock-free free list. A
//! [`PoolBox`] hands out exclusive access to one of them and recycles it
//! back onto the list when dropped.

use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

/// Resets an object to its pristine state before it is reused.
pub trait Recycle {
    fn recycle(&mut self);
}

#[derive(Debug)]
struct RawPool<T> {
    free_list: ArrayQueue<Box<T>>,
}

#[derive(Debug)]
pub struct Pool<T> {
    inner: Arc<RawPool<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Recycle + Default> Pool<T> {
    pub fn new(nslot: usize) -> Self {
        let free_list = ArrayQueue::new(nslot.max(1));
        for _ in 0..nslot {
            // cannot overflow, the queue was sized for nslot entries
            let _ = free_list.push(Box::default());
        }
        Pool {
            inner: Arc::new(RawPool { free_list }),
        }
    }
}

impl<T: Recycle> Pool<T> {
    /// Takes an object off the free list, or `None` if the pool is drained.
    pub fn alloc(&self) -> Option<PoolBox<T>> {
        let item = self.inner.free_list.pop()?;
        Some(PoolBox {
            item: ManuallyDrop::new(item),
            pool: self.inner.clone(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.free_list.capacity()
    }

    pub fn available(&self) -> usize {
        self.inner.free_list.len()
    }
}

/// Exclusive handle on a pooled object.
pub struct PoolBox<T: Recycle> {
    item: ManuallyDrop<Box<T>>,
    pool: Arc<RawPool<T>>,
}

impl<T: Recycle> Deref for PoolBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.item
    }
}

impl<T: Recycle> DerefMut for PoolBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.item
    }
}

impl<T: Recycle> Drop for PoolBox<T> {
    fn drop(&mut self) {
        // SAFETY: `item` is never touched again after this point.
        let mut item = unsafe { ManuallyDrop::take(&mut self.item) };
        item.recycle();
        // a full free list only happens if the pool was torn down under us
        let _ = self.pool.free_list.push(item);
    }
}

impl<T: Recycle + fmt::Debug> fmt::Debug for PoolBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self.item, f)
    }
}
