// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Fixed-capacity object pools.
//!
//! Every object is allocated when the pool is created and recycled through its slot for the
//! lifetime of the pool, so the decode hot path and the hardware callbacks never touch the heap.
//! An object leaves the pool as a [`Pooled`] handle and goes back either through
//! [`Pool::release`] or when the handle is dropped.

use std::fmt::Debug;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("all {0} pool objects are in use")]
    Exhausted(usize),
}

struct Slots<T> {
    objects: Vec<Option<T>>,
    free: Vec<usize>,
}

struct PoolInner<T> {
    slots: Mutex<Slots<T>>,
    outstanding: AtomicUsize,
    capacity: usize,
    reset: Box<dyn Fn(&mut T) + Send + Sync + 'static>,
}

impl<T> PoolInner<T> {
    fn put_back(&self, slot: usize, mut object: T) {
        // Run the reset hook outside of the lock: it may release hardware resources.
        (self.reset)(&mut object);

        let mut slots = self.slots.lock().unwrap();
        assert!(slots.objects[slot].is_none(), "pool slot {slot} returned twice");
        slots.objects[slot] = Some(object);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        slots.free.push(slot);
    }
}

/// An object borrowed from a [`Pool`].
///
/// The object returns to its slot when this handle is dropped, provided the pool still exists.
pub struct Pooled<T> {
    object: Option<T>,
    slot: usize,
    pool: Weak<PoolInner<T>>,
}

impl<T> Pooled<T> {
    /// Index of the slot this object was taken from.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // `unwrap` will never fail as `object` is `Some` until the handle is dropped.
        self.object.as_ref().unwrap()
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.object.as_mut().unwrap()
    }
}

impl<T: Debug> Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pooled").field("slot", &self.slot).field("object", &self.object).finish()
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            match self.pool.upgrade() {
                Some(pool) => pool.put_back(self.slot, object),
                None => log::debug!("dropping object of a destroyed pool (slot {})", self.slot),
            }
        }
    }
}

/// A fixed-capacity pool of pre-allocated objects.
///
/// Cloning a `Pool` gives another handle to the same set of objects.
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Send + 'static> Pool<T> {
    /// Create a pool of `capacity` objects built by `alloc_cb`.
    pub fn new(capacity: usize, alloc_cb: impl FnMut() -> T) -> Self {
        Self::with_reset(capacity, alloc_cb, |_| ())
    }

    /// Create a pool whose objects are passed to `reset` every time they come back.
    pub fn with_reset(
        capacity: usize,
        mut alloc_cb: impl FnMut() -> T,
        reset: impl Fn(&mut T) + Send + Sync + 'static,
    ) -> Self {
        let objects = (0..capacity).map(|_| Some(alloc_cb())).collect();
        // Hand out low slots first.
        let free = (0..capacity).rev().collect();

        Self {
            inner: Arc::new(PoolInner {
                slots: Mutex::new(Slots { objects, free }),
                outstanding: AtomicUsize::new(0),
                capacity,
                reset: Box::new(reset),
            }),
        }
    }

    /// Take an object from the pool.
    ///
    /// Fails with [`PoolError::Exhausted`] when every object is already in use; callers are
    /// expected to back off and retry.
    pub fn acquire(&self) -> Result<Pooled<T>, PoolError> {
        let mut slots = self.inner.slots.lock().unwrap();
        let slot = slots.free.pop().ok_or(PoolError::Exhausted(self.inner.capacity))?;
        let object = slots.objects[slot].take();
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        drop(slots);

        Ok(Pooled { object, slot, pool: Arc::downgrade(&self.inner) })
    }

    /// Return `object` to the pool.
    ///
    /// # Panics
    ///
    /// Releasing an object that this pool did not issue is a programming error and panics.
    pub fn release(&self, object: Pooled<T>) {
        assert!(
            Weak::ptr_eq(&object.pool, &Arc::downgrade(&self.inner)),
            "object released into a pool that did not issue it"
        );
        drop(object);
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of objects currently handed out.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.outstanding()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn acquire_until_exhausted() {
        let pool = Pool::new(2, Vec::<u8>::new);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.slot(), b.slot());
        assert_eq!(pool.acquire().unwrap_err(), PoolError::Exhausted(2));
        assert_eq!(pool.outstanding(), 2);

        pool.release(a);
        assert_eq!(pool.available(), 1);
        let c = pool.acquire().unwrap();
        drop((b, c));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn objects_are_recycled_not_reallocated() {
        let allocations = AtomicUsize::new(0);
        let pool = Pool::new(1, || {
            allocations.fetch_add(1, Ordering::SeqCst);
            Vec::<u8>::with_capacity(64)
        });

        for i in 0..10 {
            let mut obj = pool.acquire().unwrap();
            obj.push(i);
            assert_eq!(obj.capacity(), 64);
        }
        assert_eq!(allocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_runs_on_return() {
        let pool = Pool::with_reset(1, Vec::<u8>::new, |v| v.clear());
        let mut obj = pool.acquire().unwrap();
        obj.extend_from_slice(&[1, 2, 3]);
        drop(obj);
        assert!(pool.acquire().unwrap().is_empty());
    }

    #[test]
    #[should_panic(expected = "did not issue it")]
    fn release_into_foreign_pool_panics() {
        let a = Pool::new(1, || 0u32);
        let b = Pool::new(1, || 0u32);
        let obj = a.acquire().unwrap();
        b.release(obj);
    }

    #[test]
    fn outstanding_never_exceeds_capacity() {
        const CAPACITY: usize = 4;
        let pool = Pool::new(CAPACITY, || 0u64);
        let peak = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    let mut acquired = 0;
                    while acquired < 200 {
                        match pool.acquire() {
                            Ok(mut obj) => {
                                *obj += 1;
                                peak.fetch_max(pool.outstanding(), Ordering::SeqCst);
                                acquired += 1;
                            }
                            Err(PoolError::Exhausted(_)) => thread::yield_now(),
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn objects_outliving_the_pool_are_dropped() {
        let pool = Pool::new(1, || String::from("frame"));
        let obj = pool.acquire().unwrap();
        drop(pool);
        assert_eq!(obj.as_str(), "frame");
        drop(obj);
    }
}
