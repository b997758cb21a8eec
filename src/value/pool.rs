//! Recycling pools for frequently churned allocations.
//!
//! The VM owns its pools; nothing here is ambient or thread-local. A pool
//! counts hits (recycled) and misses (fresh allocations) so tests and hosts
//! can verify acquire/release balance. Releasing more objects than were ever
//! acquired is a structural bug and panics.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Reset an object to its pristine state before it is handed out again.
pub trait Recycle: Default {
    fn recycle(&mut self);
}

impl Recycle for Vec<crate::value::heap::Value> {
    fn recycle(&mut self) {
        self.clear();
    }
}

#[derive(Debug)]
pub(crate) struct PoolInner<T> {
    idle: Vec<T>,
    hits: u64,
    misses: u64,
    released: u64,
}

impl<T> Default for PoolInner<T> {
    fn default() -> Self {
        PoolInner {
            idle: Vec::new(),
            hits: 0,
            misses: 0,
            released: 0,
        }
    }
}

impl<T> PoolInner<T> {
    pub(crate) fn put_back(&mut self, obj: T) {
        self.released += 1;
        self.idle.push(obj);
        assert!(
            self.idle.len() as u64 <= self.misses,
            "pool release without matching acquire"
        );
    }
}

/// A shared-handle pool. Handles are cheap to clone; weak handles let a
/// pooled object find its way home from a `Drop` impl.
#[derive(Debug)]
pub struct Pool<T> {
    inner: Rc<RefCell<PoolInner<T>>>,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Pool {
            inner: Rc::new(RefCell::new(PoolInner::default())),
        }
    }
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Recycle> Pool<T> {
    pub fn new() -> Self {
        Pool::default()
    }

    pub fn acquire(&self) -> T {
        let mut inner = self.inner.borrow_mut();
        if let Some(obj) = inner.idle.pop() {
            inner.hits += 1;
            obj
        } else {
            inner.misses += 1;
            T::default()
        }
    }

    pub fn release(&self, mut obj: T) {
        obj.recycle();
        self.inner.borrow_mut().put_back(obj);
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<PoolInner<T>>> {
        Rc::downgrade(&self.inner)
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.borrow();
        PoolStats {
            hits: inner.hits,
            misses: inner.misses,
            released: inner.released,
            idle: inner.idle.len(),
        }
    }
}

/// Snapshot of a pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Acquisitions served from the idle list.
    pub hits: u64,
    /// Acquisitions that had to allocate.
    pub misses: u64,
    /// Total objects handed back.
    pub released: u64,
    /// Objects currently idle in the pool.
    pub idle: usize,
}

impl PoolStats {
    /// Objects acquired and not yet released.
    pub fn outstanding(&self) -> u64 {
        self.hits + self.misses - self.released
    }
}
