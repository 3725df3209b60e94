//! Per-frame arrival timestamps.
//!
//! Each worker owns one [`FrameClock`] and stamps the arrival of the first
//! packet of every new frame it sees. Compute reads the stamps to measure
//! per-frame latency. Entries live in a ring indexed by `frame % len`, so
//! only the most recent `len` frames are kept.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use minstant::Instant;

const UNSET: u64 = u64::MAX;

pub struct FrameClock {
    anchor: Instant,
    frames: Box<[AtomicU64]>,
    nanos: Box<[AtomicU64]>,
}

impl FrameClock {
    /// Clock keeping `len` frames, measuring from `anchor`.
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero.
    #[must_use]
    pub fn new(anchor: Instant, len: usize) -> Self {
        assert!(len > 0, "frame clock needs at least one entry");
        Self {
            anchor,
            frames: (0..len).map(|_| AtomicU64::new(UNSET)).collect(),
            nanos: (0..len).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[must_use]
    pub const fn anchor(&self) -> Instant {
        self.anchor
    }

    /// Stamps `frame` with `now` unless it already has a stamp.
    /// Returns `true` if this call stamped it.
    ///
    /// Must only be called by the owning worker.
    pub fn record(&self, frame: u32, now: Instant) -> bool {
        let index = frame as usize % self.frames.len();
        if self.frames[index].load(Ordering::Relaxed) == u64::from(frame) {
            return false;
        }
        let elapsed = now.checked_duration_since(self.anchor).unwrap_or_default();
        // invalidate first so a reader never pairs the old frame with the new time
        self.frames[index].store(UNSET, Ordering::Release);
        self.nanos[index].store(elapsed.as_nanos() as u64, Ordering::Release);
        self.frames[index].store(u64::from(frame), Ordering::Release);
        true
    }

    /// Arrival of the first packet of `frame`, relative to the anchor.
    /// `None` if the frame was never seen or has been overwritten.
    #[must_use]
    pub fn frame_start(&self, frame: u32) -> Option<Duration> {
        let index = frame as usize % self.frames.len();
        let expected = u64::from(frame);
        if self.frames[index].load(Ordering::Acquire) != expected {
            return None;
        }
        let nanos = self.nanos[index].load(Ordering::Acquire);
        (self.frames[index].load(Ordering::Acquire) == expected)
            .then(|| Duration::from_nanos(nanos))
    }
}

impl std::fmt::Debug for FrameClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameClock").field("len", &self.frames.len()).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // minstant converts through TSC cycles, so durations round-trip approximately.
    fn near(actual: Option<Duration>, expected: Duration) -> bool {
        actual.is_some_and(|a| a.abs_diff(expected) < Duration::from_micros(1))
    }

    #[test]
    fn first_packet_wins() {
        let anchor = Instant::now();
        let clock = FrameClock::new(anchor, 4);
        assert!(clock.record(7, anchor + Duration::from_micros(10)));
        assert!(!clock.record(7, anchor + Duration::from_micros(99)));
        assert!(near(clock.frame_start(7), Duration::from_micros(10)));
        assert_eq!(clock.frame_start(6), None);
    }

    #[test]
    fn old_frames_are_overwritten() {
        let anchor = Instant::now();
        let clock = FrameClock::new(anchor, 4);
        clock.record(1, anchor + Duration::from_micros(1));
        clock.record(5, anchor + Duration::from_micros(5));
        assert_eq!(clock.frame_start(1), None);
        assert!(near(clock.frame_start(5), Duration::from_micros(5)));
    }
}
