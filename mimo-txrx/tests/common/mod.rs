//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Once;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use mimo_txrx::link::{FrameTime, LinkError, Transceiver, TxFlags, TxRequest};
use mimo_txrx::packet::{Packet, PacketHeader};
use minstant::Instant;
use parking_lot::Mutex;

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        mimo_txrx::init_tracing();
    });
}

/// One transmit the link accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sent {
    pub radio: usize,
    pub channel: usize,
    pub header: PacketHeader,
    pub flags: TxFlags,
    pub time: FrameTime,
    pub at: Instant,
}

/// In-memory radio front end.
///
/// Each radio produces symbols in order, `symbols_per_frame` to a frame,
/// with every payload byte set to the radio index. With a frame limit set a
/// radio goes quiet once it has produced that many frames.
pub struct FrameLink {
    symbols: usize,
    frames: Option<u64>,
    produced: Vec<AtomicU64>,
    fail_start: bool,
    /// The first transmit on each radio takes this long.
    first_send_stall: Option<Duration>,
    stalled: Vec<AtomicBool>,
    pub started: AtomicBool,
    pub stopped: AtomicBool,
    pub sent: Mutex<Vec<Sent>>,
}

impl FrameLink {
    pub fn new(radios: usize, symbols: usize, frames: Option<u64>) -> Self {
        Self {
            symbols,
            frames,
            produced: (0..radios).map(|_| AtomicU64::new(0)).collect(),
            fail_start: false,
            first_send_stall: None,
            stalled: (0..radios).map(|_| AtomicBool::new(false)).collect(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// A link that never receives anything.
    pub fn silent(radios: usize, symbols: usize) -> Self {
        Self::new(radios, symbols, Some(0))
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Makes the first transmit on every radio block for `stall`.
    pub fn stalling_first_send(mut self, stall: Duration) -> Self {
        self.first_send_stall = Some(stall);
        self
    }

    pub fn produced(&self, radio: usize) -> u64 {
        self.produced[radio].load(Ordering::Acquire)
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }
}

impl Transceiver for FrameLink {
    fn start(&self) -> Result<(), LinkError> {
        if self.fail_start {
            return Err(LinkError::Start { code: -1 });
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn receive(&self, radio: usize, slots: &mut [u8]) -> Result<Option<FrameTime>, LinkError> {
        let counter = &self.produced[radio];
        let n = counter.load(Ordering::Acquire);
        if self.frames.is_some_and(|frames| n >= frames * self.symbols as u64) {
            return Ok(None);
        }
        slots.fill(radio as u8);
        counter.store(n + 1, Ordering::Release);
        let symbols = self.symbols as u64;
        Ok(Some(FrameTime::new((n / symbols) as u32, (n % symbols) as u16)))
    }

    fn transmit(&self, request: TxRequest<'_>) -> Result<(), LinkError> {
        let header = Packet::parse(request.packet)?.header();
        if let Some(stall) = self.first_send_stall
            && !self.stalled[request.radio].swap(true, Ordering::AcqRel)
        {
            std::thread::sleep(stall);
        }
        self.sent.lock().push(Sent {
            radio: request.radio,
            channel: request.channel,
            header,
            flags: request.flags,
            time: request.time,
            at: Instant::now(),
        });
        Ok(())
    }
}

/// Earliest transmit of every frame, in frame order.
pub fn first_emissions(sent: &[Sent]) -> Vec<(i32, Instant)> {
    let mut firsts = std::collections::BTreeMap::new();
    for s in sent {
        firsts
            .entry(s.header.frame_id)
            .and_modify(|at: &mut Instant| *at = (*at).min(s.at))
            .or_insert(s.at);
    }
    firsts.into_iter().collect()
}

/// Polls `done` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
    done()
}
