//! Run configuration for the TX/RX workers and the sender.
//!
//! Loaded once from JSON and read-only for the rest of the run. Every field
//! has a default, so a config file only needs the values it changes.

use std::net::{IpAddr, Ipv4Addr};
use std::ops::Range;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::event::EventType;
use crate::link::radio::MAX_CHANNELS;
use crate::net::Endpoint;
use crate::packet;
use crate::runtime::topology;
use crate::tag::{TagError, TagLayout};

/// Which link the workers serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    /// Fronthaul to the radios. Transmit requests carry a logical offset.
    #[default]
    Radio,
    /// The MAC-side link. Transmit requests carry a `GenTag` per UE.
    Secondary,
}

impl LinkKind {
    /// Event announcing a received packet on this link.
    #[must_use]
    pub const fn rx_event(self) -> EventType {
        match self {
            Self::Radio => EventType::PacketReceived,
            Self::Secondary => EventType::PacketFromSecondaryLink,
        }
    }

    /// Event announcing a finished transmit on this link.
    #[must_use]
    pub const fn tx_done_event(self) -> EventType {
        match self {
            Self::Radio => EventType::TransmitDone,
            Self::Secondary => EventType::TransmitToSecondaryLink,
        }
    }
}

/// UDP addressing for the socket link. Radio `r` uses `base_port + r` on
/// both ends.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub local_addr: IpAddr,
    pub local_base_port: u16,
    pub remote_addr: IpAddr,
    pub remote_base_port: u16,
    /// Kernel receive buffer per socket. `None` keeps the system default.
    pub recv_buffer_size: Option<usize>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            local_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            local_base_port: 8000,
            remote_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            remote_base_port: 9000,
            recv_buffer_size: None,
        }
    }
}

impl SocketConfig {
    /// The peer's view of this config: local and remote swapped. The sender
    /// binds where the base station sends and sends where it listens.
    #[must_use]
    pub fn mirrored(&self) -> Self {
        Self {
            local_addr: self.remote_addr,
            local_base_port: self.remote_base_port,
            remote_addr: self.local_addr,
            remote_base_port: self.local_base_port,
            recv_buffer_size: self.recv_buffer_size,
        }
    }

    /// Local endpoint of radio `radio`. Base port 0 asks for an ephemeral port.
    #[must_use]
    pub fn local_endpoint(&self, radio: usize) -> Endpoint {
        Endpoint::radio(self.local_addr, self.local_base_port, radio)
    }

    /// Remote endpoint of radio `radio`.
    #[must_use]
    pub fn remote_endpoint(&self, radio: usize) -> Endpoint {
        Endpoint::radio(self.remote_addr, self.remote_base_port, radio)
    }
}

/// Configuration shared by the base-station workers and the sender.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TxRxConfig {
    /// Radios (or simulated radio sockets).
    pub radio_count: usize,
    /// Channels per radio. Antenna id is `radio * channel_count + channel`.
    pub channel_count: usize,
    pub ue_count: usize,
    pub symbols_per_frame: usize,
    /// Symbol ids inside a frame that carry transmit data, ascending.
    pub tx_symbols: Vec<usize>,
    /// Complex int16 samples per packet.
    pub samples_per_symbol: usize,
    /// Frames of receive buffering per worker.
    pub buffer_frame_count: usize,
    /// Frames of transmit buffering.
    pub tx_buffer_frame_count: usize,
    pub worker_threads: usize,
    /// First core to pin workers to. `None` leaves threads unpinned.
    pub core_offset: Option<usize>,
    /// Frames between a request's frame id and its air time.
    pub tx_frame_delta: u32,
    pub link: LinkKind,
    /// Events per queue lane. 0 sizes lanes to hold every ring slot.
    pub queue_capacity: usize,
    pub socket: SocketConfig,
}

impl Default for TxRxConfig {
    fn default() -> Self {
        Self {
            radio_count: 8,
            channel_count: 1,
            ue_count: 4,
            symbols_per_frame: 4,
            tx_symbols: Vec::new(),
            samples_per_symbol: 256,
            buffer_frame_count: 40,
            tx_buffer_frame_count: 40,
            worker_threads: 4,
            core_offset: None,
            tx_frame_delta: 2,
            link: LinkKind::Radio,
            queue_capacity: 0,
            socket: SocketConfig::default(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{field} must be greater than 0")]
    Zero { field: &'static str },
    #[error("{threads} worker threads for {radios} radios, each worker needs at least one radio")]
    TooManyThreads { threads: usize, radios: usize },
    #[error("{channels} channels per radio, at most {max} supported")]
    TooManyChannels { channels: usize, max: usize },
    #[error("transmit symbol {symbol} outside frame of {symbols_per_frame} symbols")]
    TxSymbolOutOfRange { symbol: usize, symbols_per_frame: usize },
    #[error("transmit symbols must be strictly ascending")]
    TxSymbolsUnordered,
    #[error("base port {base} with {count} radios overflows the port range")]
    PortRange { base: u16, count: usize },
    #[error(transparent)]
    Tag(#[from] TagError),
}

impl TxRxConfig {
    /// Loads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON for
    /// this schema, or fails [`validate`](Self::validate).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_json_str(&text)
    }

    /// Parses and validates a JSON config.
    ///
    /// # Errors
    ///
    /// Same as [`from_json_file`](Self::from_json_file), minus the read.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every invariant the workers rely on.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("radio_count", self.radio_count),
            ("channel_count", self.channel_count),
            ("symbols_per_frame", self.symbols_per_frame),
            ("samples_per_symbol", self.samples_per_symbol),
            ("buffer_frame_count", self.buffer_frame_count),
            ("tx_buffer_frame_count", self.tx_buffer_frame_count),
            ("worker_threads", self.worker_threads),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.link == LinkKind::Secondary && self.ue_count == 0 {
            return Err(ConfigError::Zero { field: "ue_count" });
        }
        if self.worker_threads > self.radio_count {
            return Err(ConfigError::TooManyThreads {
                threads: self.worker_threads,
                radios: self.radio_count,
            });
        }
        if self.channel_count > MAX_CHANNELS {
            return Err(ConfigError::TooManyChannels {
                channels: self.channel_count,
                max: MAX_CHANNELS,
            });
        }
        if let Some(&symbol) = self.tx_symbols.iter().find(|&&s| s >= self.symbols_per_frame) {
            return Err(ConfigError::TxSymbolOutOfRange {
                symbol,
                symbols_per_frame: self.symbols_per_frame,
            });
        }
        if self.tx_symbols.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::TxSymbolsUnordered);
        }
        for base in [self.socket.local_base_port, self.socket.remote_base_port] {
            if base != 0 && usize::from(base) + self.radio_count - 1 > usize::from(u16::MAX) {
                return Err(ConfigError::PortRange { base, count: self.radio_count });
            }
        }
        self.tag_layout()?;
        Ok(())
    }

    /// Total antennas across all radios.
    #[must_use]
    pub const fn antenna_count(&self) -> usize {
        self.radio_count * self.channel_count
    }

    #[must_use]
    pub const fn packet_length(&self) -> usize {
        packet::packet_length(self.samples_per_symbol)
    }

    /// Slots in each worker's receive ring.
    #[must_use]
    pub const fn rx_ring_slots(&self) -> usize {
        self.buffer_frame_count * self.symbols_per_frame * self.antenna_count()
    }

    /// Number of transmit ids per symbol: antennas on the radio link, UEs on
    /// the secondary link.
    #[must_use]
    pub const fn tx_id_count(&self) -> usize {
        match self.link {
            LinkKind::Radio => self.antenna_count(),
            LinkKind::Secondary => self.ue_count,
        }
    }

    #[must_use]
    pub fn tx_symbols_per_frame(&self) -> usize {
        self.tx_symbols.len()
    }

    /// Slots in the shared transmit ring.
    #[must_use]
    pub fn tx_ring_slots(&self) -> usize {
        self.tx_buffer_frame_count * self.tx_symbols_per_frame() * self.tx_id_count()
    }

    /// Events per queue lane.
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        if self.queue_capacity > 0 {
            self.queue_capacity
        } else {
            (self.rx_ring_slots() + self.tx_ring_slots()).max(1)
        }
    }

    /// Tag layout for this run.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::LayoutTooWide`] if the counts need more than 64 bits.
    pub fn tag_layout(&self) -> Result<TagLayout, TagError> {
        TagLayout::new(
            self.worker_threads,
            self.rx_ring_slots(),
            self.symbols_per_frame,
            self.antenna_count().max(self.ue_count),
        )
    }

    /// Radios served by worker `tid`.
    #[must_use]
    pub fn radio_range(&self, tid: usize) -> Range<usize> {
        topology::partition(self.radio_count, self.worker_threads, tid)
    }
}

/// Sender (traffic generator) settings. The frame layout comes from the
/// [`TxRxConfig`] it runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderConfig {
    /// Transmit worker threads.
    pub threads: usize,
    /// Core of the master thread; workers follow at `core_offset + 1 + tid`.
    pub core_offset: Option<usize>,
    /// Minimum time between the starts of consecutive frames.
    pub frame_delay_us: u64,
    /// Stop after this many frames. `None` runs until shut down.
    pub max_frames: Option<u32>,
    /// Raw little-endian f32 I/Q samples. A synthetic tone is sent otherwise.
    pub iq_file: Option<PathBuf>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            core_offset: Some(22),
            frame_delay_us: 5000,
            max_frames: None,
            iq_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = TxRxConfig::default();
        config.validate().unwrap();
        assert_eq!(config.antenna_count(), 8);
        assert_eq!(config.rx_ring_slots(), 40 * 4 * 8);
        assert_eq!(config.packet_length(), 16 + 4 * 256);
        assert_eq!(config.tx_ring_slots(), 0);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = TxRxConfig::from_json_str(
            r#"{ "radio_count": 4, "channel_count": 2, "tx_symbols": [2, 3],
                 "link": "secondary", "socket": { "remote_base_port": 7000 } }"#,
        )
        .unwrap();
        assert_eq!(config.antenna_count(), 8);
        assert_eq!(config.link, LinkKind::Secondary);
        assert_eq!(config.tx_id_count(), 4);
        assert_eq!(config.tx_ring_slots(), 40 * 2 * 4);
        assert_eq!(config.socket.remote_base_port, 7000);
        assert_eq!(config.socket.local_base_port, 8000);
        assert_eq!(config.worker_threads, 4);
    }

    #[test]
    fn rejects_zero_counts() {
        let config = TxRxConfig { symbols_per_frame: 0, ..TxRxConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Zero { field: "symbols_per_frame" })));
    }

    #[test]
    fn rejects_more_threads_than_radios() {
        let config = TxRxConfig { worker_threads: 9, ..TxRxConfig::default() };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooManyThreads { threads: 9, radios: 8 })
        ));
    }

    #[test]
    fn rejects_bad_tx_symbols() {
        let out_of_range = TxRxConfig { tx_symbols: vec![1, 4], ..TxRxConfig::default() };
        assert!(matches!(
            out_of_range.validate(),
            Err(ConfigError::TxSymbolOutOfRange { symbol: 4, .. })
        ));
        let unordered = TxRxConfig { tx_symbols: vec![3, 2], ..TxRxConfig::default() };
        assert!(matches!(unordered.validate(), Err(ConfigError::TxSymbolsUnordered)));
    }

    #[test]
    fn rejects_port_overflow() {
        let mut config = TxRxConfig::default();
        config.socket.remote_base_port = u16::MAX - 2;
        assert!(matches!(config.validate(), Err(ConfigError::PortRange { count: 8, .. })));
    }

    #[test]
    fn rejects_unknown_link() {
        assert!(matches!(
            TxRxConfig::from_json_str(r#"{ "link": "fiber" }"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn mirrored_swaps_ends() {
        let socket = SocketConfig::default();
        let peer = socket.mirrored();
        assert_eq!(peer.local_base_port, 9000);
        assert_eq!(peer.remote_base_port, 8000);
        assert_eq!(peer.mirrored(), socket);
        assert_eq!(socket.remote_endpoint(3).port(), 9003);
    }

    #[test]
    fn radio_ranges_cover_all_radios() {
        let config = TxRxConfig { radio_count: 8, worker_threads: 3, ..TxRxConfig::default() };
        let ranges: Vec<_> = (0..3).map(|tid| config.radio_range(tid)).collect();
        assert_eq!(ranges, vec![0..2, 2..5, 5..8]);
    }

    #[test]
    fn link_events() {
        assert_eq!(LinkKind::Radio.rx_event(), EventType::PacketReceived);
        assert_eq!(LinkKind::Secondary.tx_done_event(), EventType::TransmitToSecondaryLink);
    }
}
