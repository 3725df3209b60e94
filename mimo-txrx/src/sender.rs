//! Traffic generator: plays the radio side against a base station.
//!
//! A master thread walks frames, symbols and antennas in order and hands each
//! unit to the worker that owns the antenna. Workers stamp the header and
//! transmit. Packets are encoded once at startup into a ring of
//! [`SENDER_FRAME_WINDOW`] frames; sending a unit only moves slot ownership.
//!
//! ```text
//!  master ──fill slot──> ring <──take slot── worker t ──transmit──> link
//!     │                                         ^  │
//!     └──TransmitRequest (lane t)───────────────┘  └──TransmitDone──> master
//! ```
//!
//! # Pacing
//!
//! No packet of frame `f + 1` leaves before `first(f) + frame_delay`, where
//! `first(f)` is when the first packet of frame `f` actually went out on
//! the link. Workers check this right before each transmit, so a slow link
//! or a stalled worker pushes later frames back instead of letting them
//! bunch up. The generator can fall behind the
//! configured rate but never exceed it. The master also waits `frame_delay`
//! between hand-offs so it does not run far ahead of the link.
//!
//! # Report
//!
//! A run can be unbounded, so the report keeps running totals and only the
//! last [`SENDER_FRAME_WINDOW`] frames in detail.

mod emission;

use std::collections::VecDeque;
use std::f32::consts::TAU;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;

use crate::config::{ConfigError, SenderConfig, TxRxConfig};
use crate::error::TxRxError;
use crate::event::{Event, EventType};
use crate::link::{FrameTime, Transceiver, TxFlags, TxRequest};
use crate::packet::{PacketHeader, PacketMut};
use crate::queue::{self, EventQueue, LaneReceiver, ProducerToken, Timeout};
use crate::ring::{SlotError, SlotRing};
use crate::runtime::barrier::StartBarrier;
use crate::runtime::shutdown::RunFlag;
use crate::runtime::topology::{self, CpuTopology};
use crate::tag::{GenTag, Tag, TagLayout};
use crate::trace::{debug, error, info};

use emission::{Emission, EmissionGate};

/// Frames of pre-encoded packets kept in the sender ring.
pub const SENDER_FRAME_WINDOW: usize = 40;

/// How long the master spins on a full lane before rechecking the running flag.
const ENQUEUE_SLICE: Duration = Duration::from_millis(1);

/// Timing of one completed frame, relative to the start of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpan {
    pub frame: u32,
    /// When the first packet of the frame left the link.
    pub first_sent: Duration,
    /// When the master saw the last completion of the frame.
    pub completed: Duration,
}

/// What a sender run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderReport {
    /// Frames whose every packet the link accepted.
    pub frames: u64,
    /// Packets the link accepted.
    pub packets: u64,
    /// Shortest gap between the first emissions of consecutive frames.
    pub min_frame_gap: Option<Duration>,
    /// Longest gap between the first emissions of consecutive frames.
    pub max_frame_gap: Option<Duration>,
    /// The last completed frames, at most [`SENDER_FRAME_WINDOW`], oldest first.
    pub recent: VecDeque<FrameSpan>,
}

impl SenderReport {
    fn note_gap(&mut self, gap: Duration) {
        self.min_frame_gap = Some(self.min_frame_gap.map_or(gap, |min| min.min(gap)));
        self.max_frame_gap = Some(self.max_frame_gap.map_or(gap, |max| max.max(gap)));
    }

    fn push_recent(&mut self, span: FrameSpan) {
        if self.recent.len() == SENDER_FRAME_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(span);
    }
}

/// Unit geometry shared by the master and its workers.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    symbols: usize,
    antennas: usize,
    channels: usize,
    threads: usize,
}

impl Geometry {
    const fn packets_per_frame(&self) -> usize {
        self.symbols * self.antennas
    }

    const fn slot(&self, frame: u32, symbol: usize, antenna: usize) -> usize {
        ((frame as usize % SENDER_FRAME_WINDOW) * self.symbols + symbol) * self.antennas + antenna
    }

    const fn owner(&self, antenna: usize) -> usize {
        topology::owner_of(self.antennas, self.threads, antenna)
    }
}

pub struct Sender {
    config: TxRxConfig,
    settings: SenderConfig,
    link: Arc<dyn Transceiver>,
    ring: Arc<SlotRing>,
    layout: TagLayout,
    geometry: Geometry,
    running: RunFlag,
}

impl Sender {
    /// Builds the sender ring and encodes every packet into it.
    ///
    /// # Errors
    ///
    /// Fails if the config is invalid, there are more sender threads than
    /// antennas, or the I/Q file cannot be used.
    pub fn new(
        config: TxRxConfig,
        settings: SenderConfig,
        link: Arc<dyn Transceiver>,
    ) -> Result<Self, TxRxError> {
        config.validate()?;
        let geometry = Geometry {
            symbols: config.symbols_per_frame,
            antennas: config.antenna_count(),
            channels: config.channel_count,
            threads: settings.threads,
        };
        if settings.threads == 0 {
            return Err(ConfigError::Zero { field: "threads" }.into());
        }
        if settings.threads > geometry.antennas {
            return Err(ConfigError::TooManyThreads {
                threads: settings.threads,
                radios: geometry.antennas,
            }
            .into());
        }

        let rows = geometry.packets_per_frame();
        let samples = config.samples_per_symbol;
        let payloads = match &settings.iq_file {
            Some(path) => load_iq(path, rows, samples)?,
            None => tone(rows, samples),
        };

        let mut ring = SlotRing::new(SENDER_FRAME_WINDOW * rows, config.packet_length());
        for offset in 0..ring.capacity() {
            let row = offset % rows;
            let mut packet = PacketMut::over(ring.slot_mut(offset))?;
            packet.write_samples(payloads[row * samples..(row + 1) * samples].iter().copied());
        }
        info!(
            slots = ring.capacity(),
            packet_length = config.packet_length(),
            source = if settings.iq_file.is_some() { "file" } else { "tone" },
            "sender ring encoded"
        );

        Ok(Self {
            layout: config.tag_layout()?,
            config,
            settings,
            link,
            ring: Arc::new(ring),
            geometry,
            running: RunFlag::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &TxRxConfig {
        &self.config
    }

    /// Running flag; clearing it ends the run after the current unit.
    #[must_use]
    pub fn running(&self) -> RunFlag {
        self.running.clone()
    }

    /// Spawns the workers, starts the link and runs the master loop on the
    /// calling thread until `max_frames` are sent or the flag clears.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error of the master or any worker.
    pub fn run(self) -> Result<SenderReport, TxRxError> {
        let threads = self.settings.threads;
        if let Some(offset) = self.settings.core_offset {
            CpuTopology::detect().check_plan(offset, threads + 1);
        }

        let capacity = self.ring.capacity();
        let (mut completions, message_tokens) = EventQueue::with_producers(threads, capacity);
        let (tasks, task_receivers) = queue::lanes(threads, capacity);
        let barrier = Arc::new(StartBarrier::new(threads));
        let delay = Duration::from_micros(self.settings.frame_delay_us);
        let gate = Arc::new(EmissionGate::new(Instant::now(), delay, SENDER_FRAME_WINDOW));

        let mut handles = Vec::with_capacity(threads);
        for (tid, (messages, lane)) in message_tokens.into_iter().zip(task_receivers).enumerate() {
            let worker = SenderWorker {
                tid,
                link: Arc::clone(&self.link),
                ring: Arc::clone(&self.ring),
                tasks: lane,
                messages,
                gate: Arc::clone(&gate),
                layout: self.layout,
                geometry: self.geometry,
                running: self.running.clone(),
            };
            let start = Arc::clone(&barrier);
            let core_offset = self.settings.core_offset.map(|c| c + 1);
            let name = format!("sender-{tid}");
            let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
                topology::pin_worker(core_offset, tid);
                if !start.wait() {
                    return Ok(());
                }
                worker.run()
            });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    barrier.abort();
                    self.running.stop();
                    let _ = join(handles);
                    return Err(TxRxError::Spawn { thread: name, source });
                }
            }
        }

        topology::pin_worker(self.settings.core_offset, 0);
        barrier.wait_arrivals();
        if let Err(e) = self.link.start() {
            error!(error = %e, "link failed to start");
            barrier.abort();
            self.running.stop();
            let _ = join(handles);
            return Err(TxRxError::LinkStart(e));
        }
        barrier.release();

        let mut master = Master {
            sender: &self,
            tasks,
            completions: &mut completions,
            gate: &gate,
            report: SenderReport::default(),
            pending: vec![0; SENDER_FRAME_WINDOW],
            firsts: vec![None; SENDER_FRAME_WINDOW],
        };
        let outcome = master.run();
        let report = master.report;

        self.running.stop();
        let worker_error = join(handles);
        self.link.stop();

        outcome?;
        if let Some(e) = worker_error {
            return Err(e);
        }
        info!(frames = report.frames, packets = report.packets, "sender finished");
        Ok(report)
    }
}

struct Master<'a> {
    sender: &'a Sender,
    tasks: Vec<ProducerToken>,
    completions: &'a mut EventQueue,
    gate: &'a EmissionGate,
    report: SenderReport,
    /// Outstanding completions per frame in the window.
    pending: Vec<usize>,
    /// First emission of each completed frame in the window.
    firsts: Vec<Option<(u32, Duration)>>,
}

impl Master<'_> {
    fn run(&mut self) -> Result<(), TxRxError> {
        let delay = Duration::from_micros(self.sender.settings.frame_delay_us);
        let max_frames = self.sender.settings.max_frames;
        let sender = self.sender;
        let geometry = sender.geometry;
        let running = &sender.running;

        let mut frame: u32 = 0;
        let mut next_start = Instant::now();
        while running.is_running() && max_frames.is_none_or(|max| frame < max) {
            // the window slot must be clear of the frame sent one window ago
            let window = frame as usize % SENDER_FRAME_WINDOW;
            while self.pending[window] > 0 {
                if !running.is_running() {
                    return Ok(());
                }
                self.drain()?;
            }
            while Instant::now() < next_start {
                self.drain()?;
                std::hint::spin_loop();
            }
            next_start = Instant::now() + delay;
            self.pending[window] = geometry.packets_per_frame();

            for symbol in 0..geometry.symbols {
                for antenna in 0..geometry.antennas {
                    if !self.send_unit(frame, symbol, antenna)? {
                        return Ok(());
                    }
                }
            }
            if frame % 100 == 0 {
                debug!(frame, "frame handed off");
            }
            frame = frame.wrapping_add(1);
        }

        // let the workers finish what was handed to them
        while running.is_running() && self.outstanding() > 0 {
            self.drain()?;
            std::hint::spin_loop();
        }
        Ok(())
    }

    /// Fills the unit's slot and queues it to the owning worker. Returns
    /// `false` if the run stopped while waiting for room.
    fn send_unit(&mut self, frame: u32, symbol: usize, antenna: usize) -> Result<bool, TxRxError> {
        let sender = self.sender;
        let offset = sender.geometry.slot(frame, symbol, antenna);
        loop {
            match sender.ring.try_fill(offset, 1) {
                Ok(fill) => {
                    fill.commit();
                    break;
                }
                Err(SlotError::Status { .. }) => {
                    // still in flight from the previous pass over the window
                    if !sender.running.is_running() {
                        return Ok(false);
                    }
                    self.drain()?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        let tag = GenTag::new(frame, symbol, antenna).encode(&sender.layout)?;
        let owner = sender.geometry.owner(antenna);
        let mut event = Event::new(EventType::TransmitRequest, tag);
        while let Err(returned) =
            self.tasks[owner].enqueue_blocking(event, Timeout::Duration(ENQUEUE_SLICE))
        {
            if !sender.running.is_running() {
                return Ok(false);
            }
            event = returned;
            self.drain()?;
        }
        Ok(true)
    }

    fn drain(&mut self) -> Result<(), TxRxError> {
        while let Some(event) = self.completions.try_dequeue() {
            if event.event_type != EventType::TransmitDone {
                return Err(TxRxError::UnexpectedEvent {
                    thread: 0,
                    event_type: event.event_type,
                    tag: event.tag,
                });
            }
            self.complete(event.tag);
        }
        Ok(())
    }

    fn complete(&mut self, tag: Tag) {
        let unit = GenTag::decode(tag, &self.sender.layout);
        self.report.packets += 1;
        let window = unit.frame as usize % SENDER_FRAME_WINDOW;
        if self.pending[window] == 0 {
            return;
        }
        self.pending[window] -= 1;
        if self.pending[window] == 0 {
            self.finish_frame(unit.frame);
        }
    }

    fn finish_frame(&mut self, frame: u32) {
        let completed =
            Instant::now().checked_duration_since(self.gate.anchor()).unwrap_or_default();
        let first_sent = match self.gate.first_emission(frame) {
            Emission::At(at) => at,
            _ => completed,
        };

        // frames can complete out of order; pair with whichever neighbour is done
        let previous = frame.wrapping_sub(1);
        if let Some((f, at)) = self.firsts[previous as usize % SENDER_FRAME_WINDOW]
            && f == previous
        {
            self.report.note_gap(first_sent.saturating_sub(at));
        }
        let next = frame.wrapping_add(1);
        if let Some((f, at)) = self.firsts[next as usize % SENDER_FRAME_WINDOW]
            && f == next
        {
            self.report.note_gap(at.saturating_sub(first_sent));
        }
        self.firsts[frame as usize % SENDER_FRAME_WINDOW] = Some((frame, first_sent));

        self.report.frames += 1;
        self.report.push_recent(FrameSpan { frame, first_sent, completed });
    }

    fn outstanding(&self) -> usize {
        self.pending.iter().sum()
    }
}

struct SenderWorker {
    tid: usize,
    link: Arc<dyn Transceiver>,
    ring: Arc<SlotRing>,
    tasks: LaneReceiver,
    messages: ProducerToken,
    gate: Arc<EmissionGate>,
    layout: TagLayout,
    geometry: Geometry,
    running: RunFlag,
}

impl SenderWorker {
    fn run(self) -> Result<(), TxRxError> {
        debug!(thread = self.tid, "sender worker running");
        while self.running.is_running() {
            if let Err(e) = self.send_one() {
                error!(thread = self.tid, error = %e, "sender worker failed");
                self.running.stop();
                return Err(e);
            }
        }
        Ok(())
    }

    fn send_one(&self) -> Result<bool, TxRxError> {
        let tid = self.tid;
        let Some(event) = self.tasks.try_dequeue() else {
            return Ok(false);
        };
        if event.event_type != EventType::TransmitRequest {
            return Err(TxRxError::UnexpectedEvent {
                thread: tid,
                event_type: event.event_type,
                tag: event.tag,
            });
        }

        let unit = GenTag::decode(event.tag, &self.layout);
        if !self.wait_turn(unit.frame) {
            return Ok(false);
        }
        let offset = self.geometry.slot(unit.frame, unit.symbol, unit.id);
        let mut take = self
            .ring
            .try_take(offset)
            .map_err(|source| TxRxError::TransmitSlot { thread: tid, offset, source })?;
        take.packet_mut()?.set_header(PacketHeader::new(
            unit.frame as i32,
            unit.symbol as i32,
            0,
            unit.id as i32,
        ));

        let channels = self.geometry.channels;
        let request = TxRequest {
            radio: unit.id / channels,
            channel: unit.id % channels,
            packet: take.bytes(),
            flags: TxFlags::for_symbol(unit.symbol, self.geometry.symbols),
            time: FrameTime::new(unit.frame, unit.symbol as u16),
        };
        self.link
            .transmit(request)
            .map_err(|source| TxRxError::Link { thread: tid, source })?;
        self.gate.record(unit.frame, Instant::now());
        take.release();

        self.messages
            .enqueue(Event::new(EventType::TransmitDone, event.tag))
            .map_err(|_| TxRxError::QueueFull { thread: tid, queue: "completion" })?;
        Ok(true)
    }

    /// Spins until a packet of `frame` may go out. `false` if the run
    /// stopped first.
    fn wait_turn(&self, frame: u32) -> bool {
        while !self.gate.is_open(frame, Instant::now()) {
            if !self.running.is_running() {
                return false;
            }
            std::hint::spin_loop();
        }
        true
    }
}

fn join(handles: Vec<JoinHandle<Result<(), TxRxError>>>) -> Option<TxRxError> {
    let mut first = None;
    for handle in handles {
        let name = handle.thread().name().unwrap_or("sender").to_owned();
        let result = handle.join().unwrap_or(Err(TxRxError::WorkerPanicked { thread: name }));
        if let Err(e) = result
            && first.is_none()
        {
            first = Some(e);
        }
    }
    first
}

/// Reads `rows × samples` complex f32 samples (I then Q, little-endian)
/// and scales them to int16.
fn load_iq(path: &Path, rows: usize, samples: usize) -> Result<Vec<(i16, i16)>, TxRxError> {
    let bad = |reason: String| TxRxError::IqData { path: path.to_path_buf(), reason };
    let bytes = std::fs::read(path).map_err(|e| bad(e.to_string()))?;
    let needed = rows * samples * 2 * size_of::<f32>();
    if bytes.len() < needed {
        return Err(bad(format!("{} bytes, need {needed}", bytes.len())));
    }
    let scale = |chunk: &[u8]| {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        (value * 32768.0).clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
    };
    Ok(bytes[..needed]
        .chunks_exact(2 * size_of::<f32>())
        .map(|pair| (scale(&pair[..4]), scale(&pair[4..])))
        .collect())
}

/// Half-scale complex tone per row; the frequency steps with the row so
/// every symbol and antenna is distinguishable.
fn tone(rows: usize, samples: usize) -> Vec<(i16, i16)> {
    let amplitude = f32::from(i16::MAX) / 2.0;
    (0..rows)
        .flat_map(|row| {
            (0..samples).map(move |k| {
                let phase = TAU * ((row % samples.max(1)) + 1) as f32 * k as f32 / samples as f32;
                ((amplitude * phase.cos()) as i16, (amplitude * phase.sin()) as i16)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_cycle_over_the_window() {
        let geometry = Geometry { symbols: 4, antennas: 8, channels: 1, threads: 2 };
        assert_eq!(geometry.slot(0, 0, 0), 0);
        assert_eq!(geometry.slot(0, 1, 3), 11);
        assert_eq!(geometry.slot(40, 1, 3), 11);
        assert_eq!(geometry.slot(39, 3, 7), 40 * 32 - 1);
        assert_eq!(geometry.owner(3), 0);
        assert_eq!(geometry.owner(4), 1);
    }

    #[test]
    fn report_keeps_the_last_window_and_gap_extremes() {
        let mut report = SenderReport::default();
        for frame in 0..100u32 {
            let at = Duration::from_millis(u64::from(frame));
            report.push_recent(FrameSpan { frame, first_sent: at, completed: at });
        }
        report.note_gap(Duration::from_micros(900));
        report.note_gap(Duration::from_micros(1200));
        report.note_gap(Duration::from_micros(1000));

        assert_eq!(report.recent.len(), SENDER_FRAME_WINDOW);
        assert_eq!(report.recent.front().map(|span| span.frame), Some(60));
        assert_eq!(report.recent.back().map(|span| span.frame), Some(99));
        assert_eq!(report.min_frame_gap, Some(Duration::from_micros(900)));
        assert_eq!(report.max_frame_gap, Some(Duration::from_micros(1200)));
    }

    #[test]
    fn tone_is_half_scale() {
        let samples = tone(2, 16);
        assert_eq!(samples.len(), 32);
        assert_eq!(samples[0], (i16::MAX / 2, 0));
        assert!(samples.iter().all(|&(i, q)| i.unsigned_abs() <= 16384 && q.unsigned_abs() <= 16384));
    }

    #[test]
    fn iq_file_scaled_and_length_checked() {
        let dir = std::env::temp_dir().join(format!("mimo-iq-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("iq.bin");
        let values = [0.5f32, -0.25, 2.0, -2.0];
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        std::fs::write(&path, bytes).unwrap();

        assert_eq!(load_iq(&path, 1, 2).unwrap(), vec![(16384, -8192), (i16::MAX, i16::MIN)]);
        assert!(matches!(load_iq(&path, 2, 2), Err(TxRxError::IqData { .. })));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn more_threads_than_antennas_rejected() {
        struct Null;
        impl Transceiver for Null {
            fn start(&self) -> Result<(), crate::link::LinkError> {
                Ok(())
            }
            fn stop(&self) {}
            fn receive(
                &self,
                _: usize,
                _: &mut [u8],
            ) -> Result<Option<FrameTime>, crate::link::LinkError> {
                Ok(None)
            }
            fn transmit(&self, _: TxRequest<'_>) -> Result<(), crate::link::LinkError> {
                Ok(())
            }
        }
        let config = TxRxConfig { radio_count: 2, worker_threads: 1, ..TxRxConfig::default() };
        let settings = SenderConfig { threads: 3, core_offset: None, ..SenderConfig::default() };
        assert!(matches!(
            Sender::new(config, settings, Arc::new(Null)),
            Err(TxRxError::Config(_))
        ));
    }
}
