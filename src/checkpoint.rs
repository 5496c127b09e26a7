// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Rendezvous point between a worker thread and its controller.
//!
//! The worker calls [`Checkpoint::arrive_and_wait`] between units of work. When the controller
//! has requested a pause with [`Checkpoint::halt`], the worker parks there until
//! [`Checkpoint::resume`] is called, and [`Checkpoint::wait_halted`] lets the controller confirm
//! that the worker is parked. A disabled checkpoint (worker not started yet or already gone)
//! counts as quiescent.

use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;
use std::time::Instant;

#[derive(Debug, Default)]
struct State {
    enabled: bool,
    halt_requested: bool,
    halted: bool,
}

#[derive(Debug, Default)]
pub struct Checkpoint {
    state: Mutex<State>,
    cond: Condvar,
}

impl Checkpoint {
    pub fn new() -> Self {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<State> {
        self.state.lock().unwrap()
    }

    /// Called by the worker once it starts reaching the checkpoint regularly.
    pub fn enable(&self) {
        self.lock().enabled = true;
        self.cond.notify_all();
    }

    /// Called by the worker before it stops reaching the checkpoint.
    pub fn disable(&self) {
        let mut state = self.lock();
        state.enabled = false;
        state.halted = false;
        drop(state);
        self.cond.notify_all();
    }

    /// Called by the worker at a safe point. Blocks while a pause is requested.
    pub fn arrive_and_wait(&self) {
        let mut state = self.lock();
        if !state.halt_requested {
            return;
        }

        state.halted = true;
        self.cond.notify_all();
        while state.halt_requested && state.enabled {
            state = self.cond.wait(state).unwrap();
        }
        state.halted = false;
    }

    /// Ask the worker to park at its next checkpoint.
    pub fn halt(&self) {
        self.lock().halt_requested = true;
        self.cond.notify_all();
    }

    /// Wait until the worker is parked or the checkpoint is disabled.
    ///
    /// Returns `false` if `timeout` expired first.
    pub fn wait_halted(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        while state.enabled && !state.halted {
            state = match deadline {
                None => self.cond.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.cond.wait_timeout(state, deadline - now).unwrap().0
                }
            };
        }
        true
    }

    /// Request a pause and wait for the worker to reach it.
    pub fn pause(&self, timeout: Option<Duration>) -> bool {
        self.halt();
        self.wait_halted(timeout)
    }

    /// Let a parked worker continue.
    pub fn resume(&self) {
        self.lock().halt_requested = false;
        self.cond.notify_all();
    }

    /// Whether a pause is in effect, whether or not the worker reached it yet.
    pub fn is_halt_requested(&self) -> bool {
        self.lock().halt_requested
    }

    pub fn is_halted(&self) -> bool {
        let state = self.lock();
        !state.enabled || state.halted
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn spawn_worker(
        checkpoint: Arc<Checkpoint>,
        units: Arc<AtomicUsize>,
        stop: Arc<AtomicBool>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            checkpoint.enable();
            while !stop.load(Ordering::SeqCst) {
                checkpoint.arrive_and_wait();
                units.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
            }
            checkpoint.disable();
        })
    }

    #[test]
    fn paused_worker_makes_no_progress() {
        let checkpoint = Arc::new(Checkpoint::new());
        let units = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = spawn_worker(checkpoint.clone(), units.clone(), stop.clone());

        while units.load(Ordering::SeqCst) < 5 {
            thread::yield_now();
        }

        assert!(checkpoint.pause(Some(Duration::from_secs(5))));
        let parked_at = units.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(units.load(Ordering::SeqCst), parked_at);

        checkpoint.resume();
        while units.load(Ordering::SeqCst) == parked_at {
            thread::yield_now();
        }

        stop.store(true, Ordering::SeqCst);
        worker.join().unwrap();
    }

    #[test]
    fn disabled_checkpoint_counts_as_halted() {
        let checkpoint = Checkpoint::new();
        assert!(checkpoint.pause(Some(Duration::from_millis(1))));
        assert!(checkpoint.is_halted());

        checkpoint.enable();
        checkpoint.halt();
        assert!(!checkpoint.wait_halted(Some(Duration::from_millis(10))));
    }

    #[test]
    fn disable_releases_pause_waiters() {
        let checkpoint = Arc::new(Checkpoint::new());
        checkpoint.enable();
        checkpoint.halt();

        let waiter = {
            let checkpoint = checkpoint.clone();
            thread::spawn(move || checkpoint.wait_halted(None))
        };
        thread::sleep(Duration::from_millis(20));
        checkpoint.disable();
        assert!(waiter.join().unwrap());
    }
}
