//! Packet TX/RX for a massive-MIMO base station.
//!
//! Worker threads move fixed-size I/Q packets between a [`link::Transceiver`]
//! (radio hardware or UDP) and per-worker [`ring::SlotRing`]s, and trade
//! [`event::Event`]s with the compute side over lock-free [`queue`] lanes.
//! [`runtime::PacketTxRx`] owns the workers; [`sender::Sender`] plays the
//! radio side for testing.

pub mod config;
pub mod error;
pub mod event;
pub mod link;
pub mod net;
pub mod packet;
pub mod queue;
pub mod ring;
pub mod runtime;
pub mod sender;
pub mod tag;

mod trace;

pub use trace::init_tracing;
