//! Synchronous wait on a single asynchronous driver completion

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Completion flag plus condition variable.
///
/// The flag is armed before the request is issued, so a completion that
/// arrives before the caller starts waiting is not lost.
#[derive(Default)]
pub(crate) struct PendingOp {
    done: Mutex<Option<bool>>,
    cond: Condvar,
}

impl PendingOp {
    /// Mark an operation in flight; fails while another one is outstanding
    pub(crate) fn try_arm(&self) -> bool {
        let mut done = self.done.lock();
        if done.is_some() {
            return false;
        }
        *done = Some(false);
        true
    }

    /// Drop an armed operation without waiting
    pub(crate) fn disarm(&self) {
        *self.done.lock() = None;
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        matches!(*self.done.lock(), Some(false))
    }

    /// Signal completion; returns `false` when nothing was waiting
    pub(crate) fn complete(&self) -> bool {
        let mut done = self.done.lock();
        match *done {
            Some(false) => {
                *done = Some(true);
                self.cond.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Block until completion or timeout; disarms in both cases
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while *done == Some(false) {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                break;
            }
        }
        let completed = *done == Some(true);
        *done = None;
        completed
    }
}
