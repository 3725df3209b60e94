//! Process-wide running flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation shared by every worker.
///
/// Starts set. Any thread may clear it: a worker on a fatal error, the
/// controller on shutdown, or a signal handler. Workers check it once per
/// loop iteration and exit as soon as it reads false. It is never set again.
#[derive(Debug, Clone)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clears the flag. Returns `true` if this call was the one that cleared it.
    pub fn stop(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let flag = RunFlag::new();
        let other = flag.clone();
        assert!(other.is_running());
        assert!(flag.stop());
        assert!(!other.is_running());
        assert!(!other.stop());
    }
}
