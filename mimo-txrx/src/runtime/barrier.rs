//! Startup barrier between the controller and its workers.
//!
//! Workers pin themselves, arrive, and park until the controller has brought
//! the link up. The gate is a state, not a notification: a worker that
//! arrives after the release still passes, and an abort is seen by workers
//! that have not arrived yet.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Closed,
    Open,
    Aborted,
}

#[derive(Debug)]
struct State {
    gate: Gate,
    arrived: usize,
}

#[derive(Debug)]
pub struct StartBarrier {
    parties: usize,
    state: Mutex<State>,
    cond: Condvar,
}

impl StartBarrier {
    /// Barrier for `parties` workers.
    #[must_use]
    pub fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(State { gate: Gate::Closed, arrived: 0 }),
            cond: Condvar::new(),
        }
    }

    /// Arrives and blocks until the gate opens or is aborted.
    ///
    /// Returns `true` if the worker should run, `false` if startup failed.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        state.arrived += 1;
        self.cond.notify_all();
        while state.gate == Gate::Closed {
            self.cond.wait(&mut state);
        }
        state.gate == Gate::Open
    }

    /// Blocks until every party has arrived or the barrier was aborted.
    pub fn wait_arrivals(&self) {
        let mut state = self.state.lock();
        while state.arrived < self.parties && state.gate != Gate::Aborted {
            self.cond.wait(&mut state);
        }
    }

    /// Opens the gate. Only the first release or abort takes effect.
    pub fn release(&self) {
        self.settle(Gate::Open);
    }

    /// Aborts startup: every waiter, present or future, gets `false`.
    pub fn abort(&self) {
        self.settle(Gate::Aborted);
    }

    #[must_use]
    pub fn arrived(&self) -> usize {
        self.state.lock().arrived
    }

    fn settle(&self, gate: Gate) {
        let mut state = self.state.lock();
        if state.gate == Gate::Closed {
            state.gate = gate;
        }
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn release_before_wait_is_not_lost() {
        let barrier = StartBarrier::new(1);
        barrier.release();
        assert!(barrier.wait());
    }

    #[test]
    fn abort_wins_over_later_release() {
        let barrier = StartBarrier::new(1);
        barrier.abort();
        barrier.release();
        assert!(!barrier.wait());
    }

    #[test]
    fn waiters_released_together() {
        let barrier = Arc::new(StartBarrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || barrier.wait())
            })
            .collect();

        barrier.wait_arrivals();
        assert_eq!(barrier.arrived(), 4);
        barrier.release();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }

    #[test]
    fn abort_unblocks_arrival_wait() {
        let barrier = Arc::new(StartBarrier::new(3));
        let waiter = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.wait())
        };
        barrier.abort();
        barrier.wait_arrivals();
        assert!(!waiter.join().unwrap());
    }
}
