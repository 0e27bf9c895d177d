//! Pool module: bounded object pools with scoped checkout.

use log::warn;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};

/// A bounded pool of reusable objects shared across threads.
///
/// Checked-out objects return to the pool when their guard drops, including on early error
/// returns. Objects returned to a full pool are dropped.
pub struct ObjectPool<T> {
    free: Mutex<Vec<T>>,
    capacity: usize,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T> ObjectPool<T> {
    pub fn new(capacity: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self { free: Mutex::new(Vec::new()), capacity, factory: Box::new(factory) }
    }

    pub fn checkout(&self) -> Pooled<'_, T> {
        let item = self.free.lock().pop().unwrap_or_else(|| (self.factory)());
        Pooled { pool: self, item: Some(item) }
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn give_back(&self, item: T) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(item);
        } else {
            warn!("object pool full at {} items, dropping returned object", self.capacity);
        }
    }
}

impl<T> std::fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool").field("available", &self.available()).field("capacity", &self.capacity).finish()
    }
}

pub struct Pooled<'a, T> {
    pool: &'a ObjectPool<T>,
    item: Option<T>,
}

impl<T> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `drop` takes the item out.
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.give_back(item);
        }
    }
}
