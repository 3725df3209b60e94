//! Top-level error for the TX/RX runtime and the sender.
//!
//! Every variant is fatal: the thread that hits it logs it, clears the
//! running flag and returns it, and the controller hands the first one back
//! from `shutdown`. A receive that would block is not an error at all.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::event::EventType;
use crate::link::LinkError;
use crate::packet::PacketError;
use crate::ring::SlotError;
use crate::tag::{Tag, TagError};

#[derive(Debug, Error)]
pub enum TxRxError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The next receive slot still holds a packet compute has not released.
    #[error("worker {thread}: receive buffer full at offset {offset}")]
    BufferFull { thread: usize, offset: usize },

    #[error("worker {thread}: link failed: {source}")]
    Link {
        thread: usize,
        #[source]
        source: LinkError,
    },

    #[error("link start failed: {0}")]
    LinkStart(#[source] LinkError),

    #[error("worker {thread}: unexpected {event_type} event (tag {tag})")]
    UnexpectedEvent { thread: usize, event_type: EventType, tag: Tag },

    #[error("worker {thread}: {queue} queue full")]
    QueueFull { thread: usize, queue: &'static str },

    /// Compute asked for a transmit whose slot was never filled.
    #[error("worker {thread}: transmit slot {offset} not ready: {source}")]
    TransmitSlot {
        thread: usize,
        offset: usize,
        #[source]
        source: SlotError,
    },

    #[error("worker {thread}: transmit requested but no transmit symbols are configured")]
    TransmitDisabled { thread: usize },

    #[error(transparent)]
    Tag(#[from] TagError),

    #[error(transparent)]
    Slot(#[from] SlotError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("failed to spawn {thread}: {source}")]
    Spawn {
        thread: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{thread} panicked")]
    WorkerPanicked { thread: String },

    #[error("bad I/Q data in {}: {reason}", path.display())]
    IqData { path: PathBuf, reason: String },
}
