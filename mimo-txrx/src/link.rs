//! Transceiver abstraction shared by the workers and the sender.
//!
//! A [`Transceiver`] moves one symbol at a time between a radio and ring
//! slots. Two backends exist:
//! - [`RadioLink`]: a hardware driver reporting integer status codes.
//! - [`SocketLink`]: one UDP socket per simulated radio.
//!
//! The backend is chosen once at construction and handed to the workers as
//! `Arc<dyn Transceiver>`. Every method takes `&self`: workers call into the
//! link concurrently, each on its own radios.

pub mod radio;
pub mod socket;

use std::fmt;
use std::io;

use thiserror::Error;

use crate::net::Endpoint;
use crate::packet::PacketError;

pub use radio::{RadioDevice, RadioLink};
pub use socket::SocketLink;

/// Air time of a symbol.
///
/// Packed for hardware as frame id in bits 32..64 and symbol id in bits
/// 16..32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameTime {
    pub frame_id: u32,
    pub symbol_id: u16,
}

impl FrameTime {
    #[must_use]
    pub const fn new(frame_id: u32, symbol_id: u16) -> Self {
        Self { frame_id, symbol_id }
    }

    #[must_use]
    pub const fn to_hw(self) -> u64 {
        ((self.frame_id as u64) << 32) | ((self.symbol_id as u64) << 16)
    }

    #[must_use]
    pub const fn from_hw(raw: u64) -> Self {
        Self {
            frame_id: (raw >> 32) as u32,
            symbol_id: ((raw >> 16) & 0xffff) as u16,
        }
    }
}

impl fmt::Display for FrameTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.frame_id, self.symbol_id)
    }
}

/// Burst flags attached to a transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TxFlags {
    /// Timed symbol inside a burst.
    InFrame = 1,
    /// Last transmit symbol of the frame; closes the burst.
    EndBurst = 2,
}

impl TxFlags {
    /// Flag for the `index`-th of `count` transmit symbols in a frame.
    #[must_use]
    pub const fn for_symbol(index: usize, count: usize) -> Self {
        if index + 1 == count { Self::EndBurst } else { Self::InFrame }
    }

    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self as i32
    }
}

/// One symbol to put on the air.
#[derive(Debug, Clone, Copy)]
pub struct TxRequest<'a> {
    pub radio: usize,
    /// Channel of `radio` the payload belongs to.
    pub channel: usize,
    /// Whole packet, header included.
    pub packet: &'a [u8],
    pub flags: TxFlags,
    pub time: FrameTime,
}

/// Link failures. Every variant is fatal to the worker that sees it.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("radio {radio} reported status {code}")]
    Device { radio: usize, code: i32 },
    #[error("radio start failed with status {code}")]
    Start { code: i32 },
    #[error("radio {radio}: {source}")]
    Io {
        radio: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("radio {radio}: received {len} bytes, expected {expected}")]
    ShortDatagram { radio: usize, len: usize, expected: usize },
    #[error("radio {radio}: sent {sent} bytes, expected {expected}")]
    ShortSend { radio: usize, sent: usize, expected: usize },
    #[error("radio {radio} out of range, link has {count}")]
    RadioOutOfRange { radio: usize, count: usize },
    #[error("channel {channel} out of range, radio has {count}")]
    ChannelOutOfRange { channel: usize, count: usize },
    #[error("{channels} channels per radio not supported by this link")]
    ChannelCount { channels: usize },
    #[error("slot buffer of {len} bytes does not hold {channels} packets of {packet_length}")]
    SlotSize { len: usize, channels: usize, packet_length: usize },
    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// A bidirectional sample link to a set of radios.
pub trait Transceiver: Send + Sync {
    /// Brings the link up. Called once, after every worker is ready.
    ///
    /// # Errors
    ///
    /// Returns an error if the radios could not be started.
    fn start(&self) -> Result<(), LinkError>;

    /// Takes the link down. Called once, after every worker has exited.
    fn stop(&self);

    /// Receives one symbol from `radio` into `slots`: `channel_count`
    /// consecutive packet-length slots, one per channel. Payloads are
    /// written in place; headers are left to the caller unless
    /// [`delivers_headers`](Self::delivers_headers) is set.
    ///
    /// Returns `Ok(None)` when nothing is ready yet.
    ///
    /// # Errors
    ///
    /// Every error is fatal.
    fn receive(&self, radio: usize, slots: &mut [u8]) -> Result<Option<FrameTime>, LinkError>;

    /// Whether `receive` fills whole packets, header included, as the far
    /// end sent them. The worker then keeps the received header.
    fn delivers_headers(&self) -> bool {
        false
    }

    /// Transmits one symbol.
    ///
    /// # Errors
    ///
    /// Every error is fatal.
    fn transmit(&self, request: TxRequest<'_>) -> Result<(), LinkError>;
}
