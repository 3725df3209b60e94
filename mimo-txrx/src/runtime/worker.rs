//! TX/RX worker loop.
//!
//! Each worker owns a contiguous block of radios, one receive ring and one
//! lane of each queue. One iteration of the loop does exactly one thing:
//!
//! 1. If compute queued a transmit request for this worker, send it.
//! 2. Otherwise try one receive on the next radio of the block.
//!
//! Transmit always wins, so a busy receive path never delays the downlink.
//! The radio cursor moves only after a successful receive; a radio with
//! nothing ready is polled again on the next iteration.
//!
//! # Receive slots
//!
//! Packets land directly in the ring at the write cursor, `channel_count`
//! slots per receive. The slots are claimed before the link is asked for
//! data. If the slot at the cursor is still held by compute the worker does
//! not overwrite it: the run stops with [`TxRxError::BufferFull`].
//!
//! The worker writes each slot's header from the frame time and antenna,
//! except on links that deliver whole packets (UDP): there the header the
//! far end sent is kept as received.
//!
//! # Transmit addressing
//!
//! A request names a logical unit `(frame, data symbol, id)`:
//! - radio link: a plain offset `L`, with `id = L % ids`,
//!   `symbol = (L / ids) % tx_symbols`, `frame = L / (ids · tx_symbols)`.
//! - secondary link: a `GenTag` carrying the three fields directly.
//!
//! Both map to the transmit ring slot
//! `((frame · tx_symbols + symbol) · ids + id) % tx_ring_slots`.

use std::ops::Range;
use std::sync::Arc;

use minstant::Instant;

use crate::config::{LinkKind, TxRxConfig};
use crate::error::TxRxError;
use crate::event::{Event, EventType};
use crate::link::{FrameTime, Transceiver, TxFlags, TxRequest};
use crate::packet::{PacketHeader, PacketMut};
use crate::queue::{LaneReceiver, ProducerToken};
use crate::ring::{SlotError, SlotRing};
use crate::tag::{GenTag, RxTag, Tag, TagError, TagField, TagLayout, bits_for};
use crate::trace::{debug, error, trace};

use super::clock::FrameClock;
use super::shutdown::RunFlag;

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    Transmitted,
    Received,
    Idle,
}

/// Shared resources handed to a worker at construction.
pub struct WorkerIo {
    pub link: Arc<dyn Transceiver>,
    pub rx_ring: Arc<SlotRing>,
    pub tx_ring: Arc<SlotRing>,
    /// This worker's lane into the message queue.
    pub messages: ProducerToken,
    /// This worker's lane of the task queue.
    pub tasks: LaneReceiver,
    pub clock: Arc<FrameClock>,
}

/// A transmit unit decoded from a request tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TxUnit {
    frame: u32,
    data_symbol: usize,
    id: usize,
}

pub struct TxRxWorker {
    tid: usize,
    io: WorkerIo,
    running: RunFlag,
    layout: TagLayout,
    link_kind: LinkKind,
    radios: Range<usize>,
    radio_count: usize,
    channels: usize,
    tx_symbols: Vec<usize>,
    tx_ids: usize,
    tx_frame_delta: u32,
    /// Received slots already hold the sender's header.
    link_headers: bool,
    next_radio: usize,
    write_cursor: usize,
}

impl TxRxWorker {
    /// # Errors
    ///
    /// Returns an error if the config's tag layout is invalid.
    pub fn new(
        tid: usize,
        config: &TxRxConfig,
        io: WorkerIo,
        running: RunFlag,
    ) -> Result<Self, TxRxError> {
        let radios = config.radio_range(tid);
        let link_headers = io.link.delivers_headers();
        Ok(Self {
            tid,
            io,
            running,
            layout: config.tag_layout()?,
            link_kind: config.link,
            next_radio: radios.start,
            radios,
            radio_count: config.radio_count,
            channels: config.channel_count,
            tx_symbols: config.tx_symbols.clone(),
            tx_ids: config.tx_id_count(),
            tx_frame_delta: config.tx_frame_delta,
            link_headers,
            write_cursor: 0,
        })
    }

    #[must_use]
    pub const fn tid(&self) -> usize {
        self.tid
    }

    #[must_use]
    pub fn radios(&self) -> Range<usize> {
        self.radios.clone()
    }

    /// Runs until the running flag clears or a fatal error occurs. A fatal
    /// error clears the flag for every other worker before it is returned.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that stopped the worker.
    pub fn run(mut self) -> Result<(), TxRxError> {
        debug!(thread = self.tid, radios = ?self.radios, "worker running");
        while self.running.is_running() {
            if let Err(e) = self.poll_once() {
                error!(thread = self.tid, error = %e, "worker failed, stopping all workers");
                self.running.stop();
                return Err(e);
            }
        }
        debug!(thread = self.tid, "worker stopped");
        Ok(())
    }

    /// One loop iteration: a pending transmit if there is one, otherwise a
    /// receive attempt.
    ///
    /// # Errors
    ///
    /// Every error is fatal to the run.
    pub fn poll_once(&mut self) -> Result<Poll, TxRxError> {
        if self.dequeue_send()? {
            return Ok(Poll::Transmitted);
        }
        if self.recv_enqueue()? {
            return Ok(Poll::Received);
        }
        Ok(Poll::Idle)
    }

    /// Sends at most one queued transmit request. Returns whether one was sent.
    ///
    /// # Errors
    ///
    /// Fails on a non-transmit event, an unfilled transmit slot, a link
    /// failure, or a full message queue.
    pub fn dequeue_send(&mut self) -> Result<bool, TxRxError> {
        let Some(event) = self.io.tasks.try_dequeue() else {
            return Ok(false);
        };
        if event.event_type != EventType::TransmitRequest {
            return Err(TxRxError::UnexpectedEvent {
                thread: self.tid,
                event_type: event.event_type,
                tag: event.tag,
            });
        }
        self.transmit(event.tag)?;
        Ok(true)
    }

    /// Receives at most one symbol from the current radio. Returns whether
    /// one was received.
    ///
    /// # Errors
    ///
    /// Fails if the slot at the write cursor is still held, or on a link
    /// failure, or on a full message queue.
    pub fn recv_enqueue(&mut self) -> Result<bool, TxRxError> {
        let radio = self.next_radio;
        let offset = self.write_cursor;
        let tid = self.tid;

        let mut fill = match self.io.rx_ring.try_fill(offset, self.channels) {
            Ok(fill) => fill,
            Err(SlotError::Status { .. }) => {
                return Err(TxRxError::BufferFull { thread: tid, offset });
            }
            Err(e) => return Err(e.into()),
        };

        let Some(time) = self
            .io
            .link
            .receive(radio, fill.bytes_mut())
            .map_err(|source| TxRxError::Link { thread: tid, source })?
        else {
            return Ok(false);
        };

        if self.link_headers {
            // the datagram's own header is passed through; it must still parse
            for slot in fill.slots_mut() {
                PacketMut::over(slot)?;
            }
        } else {
            for (channel, slot) in fill.slots_mut().enumerate() {
                let antenna = radio * self.channels + channel;
                let header = PacketHeader::new(
                    time.frame_id as i32,
                    i32::from(time.symbol_id),
                    0,
                    antenna as i32,
                );
                PacketMut::write(slot, header)?;
            }
        }
        fill.commit();

        if self.io.clock.record(time.frame_id, Instant::now()) {
            trace!(thread = tid, frame = time.frame_id, "first packet of frame");
        }

        let event_type = self.link_kind.rx_event();
        for channel in 0..self.channels {
            let tag = RxTag::new(tid, offset + channel).encode(&self.layout)?;
            self.notify(Event::new(event_type, tag))?;
        }

        self.write_cursor = (offset + self.channels) % self.io.rx_ring.capacity();
        self.next_radio = if radio + 1 == self.radios.end { self.radios.start } else { radio + 1 };
        Ok(true)
    }

    fn decode(&self, tag: Tag) -> Result<TxUnit, TxRxError> {
        let symbols = self.tx_symbols.len();
        let ids = self.tx_ids;
        match self.link_kind {
            LinkKind::Radio => {
                let offset = tag.offset();
                Ok(TxUnit {
                    frame: (offset / (ids * symbols)) as u32,
                    data_symbol: (offset / ids) % symbols,
                    id: offset % ids,
                })
            }
            LinkKind::Secondary => {
                let decoded = GenTag::decode(tag, &self.layout);
                let out_of_range = |field, value: usize, limit: usize| TagError::OutOfRange {
                    field,
                    value: value as u64,
                    limit: limit as u64,
                    bits: bits_for(limit as u64),
                };
                if decoded.symbol >= symbols {
                    return Err(out_of_range(TagField::Symbol, decoded.symbol, symbols).into());
                }
                if decoded.id >= ids {
                    return Err(out_of_range(TagField::Id, decoded.id, ids).into());
                }
                Ok(TxUnit { frame: decoded.frame, data_symbol: decoded.symbol, id: decoded.id })
            }
        }
    }

    fn transmit(&mut self, tag: Tag) -> Result<(), TxRxError> {
        let tid = self.tid;
        if self.tx_symbols.is_empty() || self.tx_ids == 0 {
            return Err(TxRxError::TransmitDisabled { thread: tid });
        }
        let unit = self.decode(tag)?;
        let symbols = self.tx_symbols.len();
        let canonical = (unit.frame as usize * symbols + unit.data_symbol) * self.tx_ids + unit.id;
        let offset = canonical % self.io.tx_ring.capacity();

        let mut take = self
            .io
            .tx_ring
            .try_take(offset)
            .map_err(|source| TxRxError::TransmitSlot { thread: tid, offset, source })?;

        let frame_symbol = self.tx_symbols[unit.data_symbol];
        let (radio, channel, header_symbol) = match self.link_kind {
            LinkKind::Radio => (unit.id / self.channels, unit.id % self.channels, frame_symbol),
            LinkKind::Secondary => (unit.id % self.radio_count, 0, unit.data_symbol),
        };
        take.packet_mut()?.set_header(PacketHeader::new(
            unit.frame as i32,
            header_symbol as i32,
            0,
            unit.id as i32,
        ));

        let time = FrameTime::new(unit.frame.wrapping_add(self.tx_frame_delta), frame_symbol as u16);
        let flags = TxFlags::for_symbol(unit.data_symbol, symbols);
        trace!(thread = tid, radio, frame = unit.frame, symbol = frame_symbol, offset, "transmit");
        self.io
            .link
            .transmit(TxRequest { radio, channel, packet: take.bytes(), flags, time })
            .map_err(|source| TxRxError::Link { thread: tid, source })?;
        take.release();

        self.notify(Event::new(self.link_kind.tx_done_event(), tag))
    }

    fn notify(&self, event: Event) -> Result<(), TxRxError> {
        self.io
            .messages
            .enqueue(event)
            .map_err(|_| TxRxError::QueueFull { thread: self.tid, queue: "message" })
    }
}
