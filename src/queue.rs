// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded, closeable producer/consumer queue.
//!
//! A [`TransferQueue`] carries packets from the demuxer to the decode thread and frames from the
//! decoder to the presenter. It is the backpressure mechanism between those stages: producers
//! block while it is full, and consumers can either block or poll.
//!
//! The queue goes through three states and never goes back:
//!
//! * `Open`: `put` and `get` both work.
//! * `Closing`: `put` fails with [`QueueError::WouldBlock`] so producers can notice the shutdown,
//!   while consumers keep draining the pending items. Once the queue is empty `get` fails with
//!   [`QueueError::Closed`].
//! * `Closed`: every operation fails with [`QueueError::Closed`].

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("the operation would block")]
    WouldBlock,
    #[error("the queue has been closed")]
    Closed,
}

/// A failed [`TransferQueue::put`]. The rejected item is handed back so the producer can release
/// it.
#[derive(Error, Debug)]
#[error("could not queue item: {error}")]
pub struct PutError<T: Debug> {
    pub error: QueueError,
    pub item: T,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueState {
    Open,
    Closing,
    Closed,
}

struct Inner<T> {
    items: VecDeque<T>,
    state: QueueState,
}

pub struct TransferQueue<T> {
    inner: Mutex<Inner<T>>,
    /// Signaled when an item is added or the state changes.
    readable: Condvar,
    /// Signaled when an item is removed or the state changes.
    writable: Condvar,
    capacity: usize,
}

impl<T: Debug> TransferQueue<T> {
    /// Create an open queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "a transfer queue needs room for at least one item");
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                state: QueueState::Open,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<Inner<T>> {
        self.inner.lock().unwrap()
    }

    /// Append `item`, blocking while the queue is full.
    pub fn put(&self, item: T) -> Result<(), PutError<T>> {
        let mut inner = self.lock();
        loop {
            let state = inner.state;
            match state {
                QueueState::Closing => return Err(PutError { error: QueueError::WouldBlock, item }),
                QueueState::Closed => return Err(PutError { error: QueueError::Closed, item }),
                QueueState::Open if inner.items.len() < self.capacity => break,
                QueueState::Open => inner = self.writable.wait(inner).unwrap(),
            }
        }

        inner.items.push_back(item);
        drop(inner);
        self.readable.notify_one();
        Ok(())
    }

    /// Wait until the head of the queue is available, or return the reason it cannot be.
    fn wait_head<'a>(
        &'a self,
        mut inner: MutexGuard<'a, Inner<T>>,
        blocking: bool,
    ) -> Result<MutexGuard<'a, Inner<T>>, QueueError> {
        loop {
            let state = inner.state;
            match state {
                QueueState::Closed => return Err(QueueError::Closed),
                _ if !inner.items.is_empty() => return Ok(inner),
                QueueState::Closing => return Err(QueueError::Closed),
                QueueState::Open if !blocking => return Err(QueueError::WouldBlock),
                QueueState::Open => inner = self.readable.wait(inner).unwrap(),
            }
        }
    }

    fn take_head(&self, mut inner: MutexGuard<Inner<T>>) -> T {
        // `wait_head` guarantees the queue is not empty.
        let item = inner.items.pop_front().unwrap();
        let now_empty = inner.items.is_empty();
        drop(inner);
        if now_empty {
            // `drain_then_close` waits for the queue to empty.
            self.writable.notify_all();
        } else {
            self.writable.notify_one();
        }
        item
    }

    /// Remove the head of the queue, waiting until one is available.
    pub fn get(&self) -> Result<T, QueueError> {
        let inner = self.wait_head(self.lock(), true)?;
        Ok(self.take_head(inner))
    }

    /// Remove the head of the queue if there is one.
    pub fn try_get(&self) -> Result<T, QueueError> {
        let inner = self.wait_head(self.lock(), false)?;
        Ok(self.take_head(inner))
    }

    /// Run `f` on the head of the queue without removing it.
    ///
    /// With `blocking` false, fails immediately with [`QueueError::WouldBlock`] if the queue is
    /// empty. With `blocking` true, waits until an item arrives or the queue closes.
    pub fn peek<R>(&self, blocking: bool, f: impl FnOnce(&T) -> R) -> Result<R, QueueError> {
        let inner = self.wait_head(self.lock(), blocking)?;
        // `wait_head` guarantees the queue is not empty.
        Ok(f(inner.items.front().unwrap()))
    }

    /// Stop accepting new items. Pending items can still be retrieved.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.state == QueueState::Open {
            inner.state = QueueState::Closing;
        }
        drop(inner);
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// Close the queue, wait for the consumers to take every pending item, then reject every
    /// further operation.
    pub fn drain_then_close(&self) {
        self.close();
        let mut inner = self.lock();
        while inner.state == QueueState::Closing && !inner.items.is_empty() {
            inner = self.writable.wait(inner).unwrap();
        }
        inner.state = QueueState::Closed;
        drop(inner);
        self.readable.notify_all();
    }

    /// Remove and return every pending item without closing the queue.
    ///
    /// Used when the pending items have become stale, e.g. on a seek.
    pub fn discard_pending(&self) -> Vec<T> {
        let mut inner = self.lock();
        let items = inner.items.drain(..).collect();
        drop(inner);
        self.writable.notify_all();
        items
    }

    /// Close the queue immediately and return the items nobody retrieved.
    pub fn shutdown(&self) -> Vec<T> {
        let mut inner = self.lock();
        inner.state = QueueState::Closed;
        let items = inner.items.drain(..).collect();
        drop(inner);
        self.readable.notify_all();
        self.writable.notify_all();
        items
    }

    pub fn state(&self) -> QueueState {
        self.lock().state
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
