//! Fixed-capacity object pool
//!
//! An arena of `Vec<Option<T>>` slots plus a stack of free slot indices.
//! The pool is sized exactly once with [`ObjectPool::reserve`]; afterwards
//! acquiring never allocates and returns `None` when every slot is in use.
//! A [`Pooled`] handle owns its value and puts it back into its slot on drop.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;

/// Errors raised by [`ObjectPool`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("Pool already reserved with {capacity} slots")]
    AlreadyReserved { capacity: usize },
}

struct Slots<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
    reserved: bool,
}

/// Pre-sized pool handing out exclusively owned values
pub struct ObjectPool<T> {
    slots: Arc<Mutex<Slots<T>>>,
}

impl<T> ObjectPool<T> {
    /// Create an empty pool; call [`reserve`](Self::reserve) before use
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
                reserved: false,
            })),
        }
    }

    /// Fill the pool with `count` values produced by `init`.
    ///
    /// A pool can only be reserved once.
    pub fn reserve(&self, count: usize, mut init: impl FnMut() -> T) -> Result<(), PoolError> {
        let mut slots = self.slots.lock();
        if slots.reserved {
            return Err(PoolError::AlreadyReserved {
                capacity: slots.slots.len(),
            });
        }
        slots.slots.reserve_exact(count);
        slots.free.reserve_exact(count);
        for index in 0..count {
            slots.slots.push(Some(init()));
            // Pop order hands out low indices first
            slots.free.push(count - 1 - index);
        }
        slots.reserved = true;
        Ok(())
    }

    /// Take a value out of the pool, `None` when exhausted
    pub fn acquire(&self) -> Option<Pooled<T>> {
        let mut slots = self.slots.lock();
        let index = slots.free.pop()?;
        let value = slots.slots[index].take();
        debug_assert!(value.is_some(), "free index {index} points to an empty slot");
        value.map(|value| Pooled {
            value: Some(value),
            index,
            home: Arc::downgrade(&self.slots),
        })
    }

    /// Number of values currently available
    pub fn available(&self) -> usize {
        self.slots.lock().free.len()
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.slots.lock().slots.len()
    }
}

impl<T> Default for ObjectPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive handle to a pooled value
pub struct Pooled<T> {
    value: Option<T>,
    index: usize,
    home: Weak<Mutex<Slots<T>>>,
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.value {
            Some(value) => value,
            None => unreachable!("pooled value is only taken on drop"),
        }
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.value {
            Some(value) => value,
            None => unreachable!("pooled value is only taken on drop"),
        }
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        let Some(value) = self.value.take() else {
            return;
        };
        // The pool may already be gone during shutdown
        if let Some(home) = self.home.upgrade() {
            let mut slots = home.lock();
            slots.slots[self.index] = Some(value);
            slots.free.push(self.index);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("index", &self.index)
            .field("value", &self.value)
            .finish()
    }
}
