//! Controller: builds the rings and queues, spawns the workers, and hands
//! the compute side its end of every queue.
//!
//! # Startup
//!
//! ```text
//! controller                          worker t
//!     │  spawn ─────────────────────────>│ pin to core_offset + t
//!     │                                  │ barrier.wait()  (parks)
//!     │  barrier.wait_arrivals()         │
//!     │  link.start()                    │
//!     │  barrier.release() ─────────────>│ run loop
//! ```
//!
//! If the link fails to start the barrier is aborted instead: workers return
//! without touching the link and `start` returns the error.
//!
//! # Shutdown
//!
//! Any fatal worker error clears the shared running flag, which stops every
//! worker. [`PacketTxRx::shutdown`] clears the flag too, joins all workers,
//! stops the link and returns the first error a worker reported.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use minstant::Instant;

use crate::config::{LinkKind, TxRxConfig};
use crate::error::TxRxError;
use crate::event::{Event, EventType};
use crate::link::Transceiver;
use crate::queue::{self, EventQueue, ProducerToken};
use crate::ring::{SlotRing, TakeGuard};
use crate::tag::{GenTag, RxTag, Tag, TagError, TagField, TagLayout, bits_for};
use crate::trace::{debug, error, info};

use super::barrier::StartBarrier;
use super::clock::FrameClock;
use super::shutdown::RunFlag;
use super::topology::{self, CpuTopology};
use super::worker::{TxRxWorker, WorkerIo};

type WorkerHandle = JoinHandle<Result<(), TxRxError>>;

/// The compute side's view of a run.
pub struct ComputeQueues {
    /// Received packets and transmit completions from every worker.
    pub messages: EventQueue,
    /// Transmit requests, one lane per worker.
    pub tasks: Vec<ProducerToken>,
    /// Receive ring of each worker, indexed by `RxTag::thread`.
    pub rx_rings: Vec<Arc<SlotRing>>,
    /// Transmit ring shared by all workers.
    pub tx_ring: Arc<SlotRing>,
    /// Per-worker first-packet times.
    pub clocks: Vec<Arc<FrameClock>>,
    pub layout: TagLayout,
    link: LinkKind,
    radio_count: usize,
    channel_count: usize,
    tx_symbols: usize,
    tx_ids: usize,
}

impl ComputeQueues {
    /// Takes the receive slot an `RxTag` points at.
    ///
    /// # Errors
    ///
    /// Fails if the tag names an unknown worker or the slot is not `Full`.
    pub fn take_rx(&self, tag: Tag) -> Result<TakeGuard<'_>, TxRxError> {
        let rx = RxTag::decode(tag, &self.layout);
        let ring = self.rx_rings.get(rx.thread).ok_or(TagError::OutOfRange {
            field: TagField::Thread,
            value: rx.thread as u64,
            limit: self.rx_rings.len() as u64,
            bits: self.layout.rx_bits(),
        })?;
        Ok(ring.try_take(rx.offset)?)
    }

    /// Transmit ring slot of unit `(frame, data_symbol, id)`.
    ///
    /// # Errors
    ///
    /// Fails if `data_symbol` or `id` is past the run's transmit geometry.
    pub fn tx_slot(&self, frame: u32, data_symbol: usize, id: usize) -> Result<usize, TagError> {
        Ok(self.canonical(frame, data_symbol, id)? % self.tx_ring.capacity())
    }

    /// Request tag for unit `(frame, data_symbol, id)` in this run's link
    /// encoding.
    ///
    /// # Errors
    ///
    /// Fails if `data_symbol` or `id` is past the run's transmit geometry,
    /// or a field does not fit the tag layout.
    pub fn tx_tag(&self, frame: u32, data_symbol: usize, id: usize) -> Result<Tag, TagError> {
        match self.link {
            LinkKind::Radio => Ok(Tag::from_offset(self.canonical(frame, data_symbol, id)?)),
            LinkKind::Secondary => {
                self.check_unit(data_symbol, id)?;
                GenTag::new(frame, data_symbol, id).encode(&self.layout)
            }
        }
    }

    /// Worker whose radio block serves transmit id `id`.
    ///
    /// # Errors
    ///
    /// Fails if `id` is not an antenna (radio link) or user (secondary link)
    /// of this run.
    pub fn tx_owner(&self, id: usize) -> Result<usize, TagError> {
        check(TagField::Id, id, self.tx_ids)?;
        let radio = match self.link {
            LinkKind::Radio => id / self.channel_count,
            LinkKind::Secondary => id % self.radio_count,
        };
        Ok(topology::owner_of(self.radio_count, self.tasks.len(), radio))
    }

    /// Queues a transmit of unit `(frame, data_symbol, id)` to its owner.
    /// The payload must already be committed at [`tx_slot`](Self::tx_slot).
    ///
    /// # Errors
    ///
    /// Fails if the unit is out of range, the tag cannot be encoded, or the
    /// owner's lane is full.
    pub fn request_transmit(
        &self,
        frame: u32,
        data_symbol: usize,
        id: usize,
    ) -> Result<(), TxRxError> {
        let tag = self.tx_tag(frame, data_symbol, id)?;
        let owner = self.tx_owner(id)?;
        self.tasks[owner]
            .enqueue(Event::new(EventType::TransmitRequest, tag))
            .map_err(|_| TxRxError::QueueFull { thread: owner, queue: "task" })
    }

    fn check_unit(&self, data_symbol: usize, id: usize) -> Result<(), TagError> {
        check(TagField::Symbol, data_symbol, self.tx_symbols)?;
        check(TagField::Id, id, self.tx_ids)
    }

    /// Offset of the unit in an unbounded transmit buffer. Out-of-range
    /// fields would alias a neighbouring unit, so they are rejected.
    fn canonical(&self, frame: u32, data_symbol: usize, id: usize) -> Result<usize, TagError> {
        self.check_unit(data_symbol, id)?;
        Ok((frame as usize * self.tx_symbols + data_symbol) * self.tx_ids + id)
    }
}

fn check(field: TagField, value: usize, limit: usize) -> Result<(), TagError> {
    if value < limit {
        return Ok(());
    }
    Err(TagError::OutOfRange {
        field,
        value: value as u64,
        limit: limit as u64,
        bits: bits_for(limit as u64),
    })
}

/// Handle to running workers.
///
/// Dropping the handle signals shutdown but does not wait for the workers.
/// Use [`PacketTxRx::shutdown`] to join them and collect errors.
pub struct PacketTxRx {
    running: RunFlag,
    link: Arc<dyn Transceiver>,
    handles: Vec<WorkerHandle>,
}

impl PacketTxRx {
    /// Spawns the workers, starts the link and releases the workers.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid, a thread cannot be spawned,
    /// or the link fails to start. No worker is left running on error.
    pub fn start(
        config: &TxRxConfig,
        link: Arc<dyn Transceiver>,
    ) -> Result<(Self, ComputeQueues), TxRxError> {
        config.validate()?;
        let threads = config.worker_threads;
        info!(
            threads,
            radios = config.radio_count,
            channels = config.channel_count,
            link = ?config.link,
            rx_slots = config.rx_ring_slots(),
            tx_slots = config.tx_ring_slots(),
            "txrx starting"
        );
        if let Some(offset) = config.core_offset {
            CpuTopology::detect().check_plan(offset, threads);
        }

        let packet_length = config.packet_length();
        let anchor = Instant::now();
        let rx_rings: Vec<_> = (0..threads)
            .map(|_| Arc::new(SlotRing::new(config.rx_ring_slots(), packet_length)))
            .collect();
        let tx_ring = Arc::new(SlotRing::new(config.tx_ring_slots().max(1), packet_length));
        let clocks: Vec<_> = (0..threads)
            .map(|_| Arc::new(FrameClock::new(anchor, config.buffer_frame_count)))
            .collect();

        let capacity = config.queue_capacity();
        let (messages, message_tokens) = EventQueue::with_producers(threads, capacity);
        let (task_tokens, task_receivers) = queue::lanes(threads, capacity);

        let running = RunFlag::new();
        let barrier = Arc::new(StartBarrier::new(threads));
        let mut handles = Vec::with_capacity(threads);

        for (tid, (messages, tasks)) in message_tokens.into_iter().zip(task_receivers).enumerate() {
            let io = WorkerIo {
                link: Arc::clone(&link),
                rx_ring: Arc::clone(&rx_rings[tid]),
                tx_ring: Arc::clone(&tx_ring),
                messages,
                tasks,
                clock: Arc::clone(&clocks[tid]),
            };
            let worker = match TxRxWorker::new(tid, config, io, running.clone()) {
                Ok(worker) => worker,
                Err(e) => {
                    abort_startup(&barrier, &running, handles);
                    return Err(e);
                }
            };

            debug!(thread = tid, "spawning worker");
            let name = format!("txrx-{tid}");
            let core_offset = config.core_offset;
            let gate = Arc::clone(&barrier);
            let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
                topology::pin_worker(core_offset, tid);
                if !gate.wait() {
                    debug!(thread = tid, "startup aborted");
                    return Ok(());
                }
                worker.run()
            });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    error!(thread = %name, error = %source, "failed to spawn worker");
                    abort_startup(&barrier, &running, handles);
                    return Err(TxRxError::Spawn { thread: name, source });
                }
            }
        }

        barrier.wait_arrivals();
        if let Err(e) = link.start() {
            error!(error = %e, "link failed to start");
            abort_startup(&barrier, &running, handles);
            return Err(TxRxError::LinkStart(e));
        }
        barrier.release();
        info!("txrx started");

        let queues = ComputeQueues {
            messages,
            tasks: task_tokens,
            rx_rings,
            tx_ring,
            clocks,
            layout: config.tag_layout()?,
            link: config.link,
            radio_count: config.radio_count,
            channel_count: config.channel_count,
            tx_symbols: config.tx_symbols_per_frame(),
            tx_ids: config.tx_id_count(),
        };
        Ok((Self { running, link, handles }, queues))
    }

    /// Shared running flag, for signal handlers and the compute loop.
    #[must_use]
    pub fn running(&self) -> RunFlag {
        self.running.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.is_running()
    }

    /// Stops and joins every worker, then stops the link.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error a worker reported, or
    /// [`TxRxError::WorkerPanicked`] if a worker panicked.
    pub fn shutdown(mut self) -> Result<(), TxRxError> {
        info!("txrx shutdown initiated");
        self.running.stop();

        let first = join_all(std::mem::take(&mut self.handles));
        self.link.stop();

        info!("txrx shutdown complete");
        first.map_or(Ok(()), Err)
    }
}

impl Drop for PacketTxRx {
    fn drop(&mut self) {
        self.running.stop();
    }
}

/// Joins workers in spawn order and returns the first error.
fn join_all(handles: Vec<WorkerHandle>) -> Option<TxRxError> {
    let mut first = None;
    for handle in handles {
        let name = handle.thread().name().unwrap_or("txrx").to_owned();
        debug!(thread = %name, "waiting for worker to exit");
        let result = match handle.join() {
            Ok(result) => result,
            Err(_) => Err(TxRxError::WorkerPanicked { thread: name }),
        };
        if let Err(e) = result
            && first.is_none()
        {
            first = Some(e);
        }
    }
    first
}

fn abort_startup(barrier: &StartBarrier, running: &RunFlag, handles: Vec<WorkerHandle>) {
    barrier.abort();
    running.stop();
    let _ = join_all(handles);
}
