//! First-emission times shared by the sender workers.
//!
//! Pacing is enforced where packets leave, not where the master hands them
//! out: a worker holds a unit of frame `f` until some packet of frame
//! `f - 1` has been transmitted and `frame_delay` has passed since then.
//! Workers of the same frame may race to record it; the earliest time wins.
//!
//! Entries live in a ring indexed by `frame % len`. The master never hands
//! out frame `f + len` before every packet of frame `f` completed, so at most
//! one frame writes an entry at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use minstant::Instant;

const UNSET: u64 = u64::MAX;
/// A writer is replacing the entry.
const CLAIMED: u64 = u64::MAX - 1;

/// What is known about the first emission of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Emission {
    /// The entry was never written.
    Unset,
    /// Not emitted yet, or being recorded right now.
    Pending,
    /// Emitted this long after the anchor.
    At(Duration),
    /// The entry already belongs to a later frame.
    Superseded,
}

pub(crate) struct EmissionGate {
    anchor: Instant,
    delay: Duration,
    frames: Box<[AtomicU64]>,
    nanos: Box<[AtomicU64]>,
}

impl EmissionGate {
    pub(crate) fn new(anchor: Instant, delay: Duration, len: usize) -> Self {
        Self {
            anchor,
            delay,
            frames: (0..len.max(1)).map(|_| AtomicU64::new(UNSET)).collect(),
            nanos: (0..len.max(1)).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub(crate) const fn anchor(&self) -> Instant {
        self.anchor
    }

    fn since_anchor(&self, now: Instant) -> Duration {
        now.checked_duration_since(self.anchor).unwrap_or_default()
    }

    /// Records that a packet of `frame` left the link at `now`.
    pub(crate) fn record(&self, frame: u32, now: Instant) {
        let index = frame as usize % self.frames.len();
        let nanos = self.since_anchor(now).as_nanos() as u64;
        loop {
            let marker = self.frames[index].load(Ordering::Acquire);
            if marker == u64::from(frame) {
                self.nanos[index].fetch_min(nanos, Ordering::AcqRel);
                return;
            }
            if marker == CLAIMED {
                std::hint::spin_loop();
                continue;
            }
            if marker != UNSET && is_after(marker, frame) {
                return;
            }
            if self.frames[index]
                .compare_exchange(marker, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.nanos[index].store(nanos, Ordering::Release);
                self.frames[index].store(u64::from(frame), Ordering::Release);
                return;
            }
        }
    }

    /// First emission of `frame`.
    pub(crate) fn first_emission(&self, frame: u32) -> Emission {
        let index = frame as usize % self.frames.len();
        let expected = u64::from(frame);
        match self.frames[index].load(Ordering::Acquire) {
            UNSET => Emission::Unset,
            CLAIMED => Emission::Pending,
            marker if marker == expected => {
                let nanos = self.nanos[index].load(Ordering::Acquire);
                if self.frames[index].load(Ordering::Acquire) == expected {
                    Emission::At(Duration::from_nanos(nanos))
                } else {
                    Emission::Pending
                }
            }
            marker if is_after(marker, frame) => Emission::Superseded,
            _ => Emission::Pending,
        }
    }

    /// Whether a packet of `frame` may be transmitted at `now`.
    ///
    /// Frame 0 opens the run. Every later frame waits for the first
    /// emission of its predecessor plus the delay. A predecessor entry taken
    /// over by a later frame means the gate was passed long ago.
    pub(crate) fn is_open(&self, frame: u32, now: Instant) -> bool {
        if self.delay.is_zero() {
            return true;
        }
        match self.first_emission(frame.wrapping_sub(1)) {
            Emission::Unset => frame == 0,
            Emission::Pending => false,
            Emission::At(previous) => self.since_anchor(now) >= previous + self.delay,
            Emission::Superseded => true,
        }
    }
}

impl std::fmt::Debug for EmissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmissionGate")
            .field("delay", &self.delay)
            .field("len", &self.frames.len())
            .finish_non_exhaustive()
    }
}

/// `marker` names a frame after `frame`, allowing for wrap-around.
const fn is_after(marker: u64, frame: u32) -> bool {
    let ahead = (marker as u32).wrapping_sub(frame);
    ahead != 0 && ahead < 1 << 31
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_millis(5);

    // minstant converts through TSC cycles, so durations round-trip approximately.
    fn near(actual: Emission, expected: Duration) -> bool {
        matches!(actual, Emission::At(a) if a.abs_diff(expected) < Duration::from_micros(1))
    }

    #[test]
    fn first_frame_opens_the_run() {
        let anchor = Instant::now();
        let gate = EmissionGate::new(anchor, DELAY, 4);
        assert!(gate.is_open(0, anchor));
        assert!(!gate.is_open(1, anchor + DELAY * 10));
    }

    #[test]
    fn next_frame_waits_for_the_delay() {
        let anchor = Instant::now();
        let gate = EmissionGate::new(anchor, DELAY, 4);
        let sent = anchor + Duration::from_millis(4);
        gate.record(0, sent);

        assert!(!gate.is_open(1, sent + DELAY - Duration::from_micros(10)));
        assert!(gate.is_open(1, sent + DELAY + Duration::from_micros(10)));
        assert!(!gate.is_open(2, sent + DELAY * 10));
    }

    #[test]
    fn earliest_emission_wins() {
        let anchor = Instant::now();
        let gate = EmissionGate::new(anchor, DELAY, 4);
        gate.record(3, anchor + Duration::from_micros(900));
        gate.record(3, anchor + Duration::from_micros(300));
        gate.record(3, anchor + Duration::from_micros(700));
        assert!(near(gate.first_emission(3), Duration::from_micros(300)));
    }

    #[test]
    fn later_frame_supersedes_the_entry() {
        let anchor = Instant::now();
        let gate = EmissionGate::new(anchor, DELAY, 4);
        gate.record(1, anchor);
        gate.record(5, anchor + Duration::from_micros(5));
        assert_eq!(gate.first_emission(1), Emission::Superseded);
        assert!(gate.is_open(2, anchor));

        // a straggler of the old frame does not take the entry back
        gate.record(1, anchor + Duration::from_micros(9));
        assert!(near(gate.first_emission(5), Duration::from_micros(5)));
    }

    #[test]
    fn frame_zero_after_wrap_is_paced() {
        let anchor = Instant::now();
        let gate = EmissionGate::new(anchor, DELAY, 40);
        gate.record(u32::MAX, anchor);
        assert!(!gate.is_open(0, anchor + Duration::from_millis(1)));
        assert!(gate.is_open(0, anchor + DELAY * 2));
    }

    #[test]
    fn zero_delay_never_waits() {
        let anchor = Instant::now();
        let gate = EmissionGate::new(anchor, Duration::ZERO, 4);
        assert!(gate.is_open(7, anchor));
    }
}
