//! UDP backend: one non-blocking socket per simulated radio.
//!
//! Radio `r` binds `local_addr:local_base_port + r` and sends to
//! `remote_addr:remote_base_port + r`. Every datagram is exactly one packet;
//! the frame time of a received symbol comes from the packet's own header.
//!
//! A send the kernel refuses with would-block (full socket send buffer) is
//! retried in place up to [`SEND_ATTEMPTS`] times. Only then is it fatal.

use std::io::{self, ErrorKind};

use crate::config::TxRxConfig;
use crate::net::{Endpoint, UdpSocket};
use crate::packet::Packet;
use crate::trace::{debug, warn};

use super::{FrameTime, LinkError, Transceiver, TxRequest};

/// Tries of one send while the kernel reports would-block.
pub const SEND_ATTEMPTS: usize = 1024;

/// [`Transceiver`] over UDP sockets.
pub struct SocketLink {
    sockets: Vec<UdpSocket>,
    remotes: Vec<Endpoint>,
    packet_length: usize,
}

impl SocketLink {
    /// Binds one socket per radio from the config's socket section.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::ChannelCount`] unless `channel_count` is 1, or
    /// [`LinkError::Bind`] if a socket cannot be bound.
    pub fn new(config: &TxRxConfig) -> Result<Self, LinkError> {
        let socket = &config.socket;
        let locals: Vec<_> = (0..config.radio_count).map(|r| socket.local_endpoint(r)).collect();
        let remotes = (0..config.radio_count).map(|r| socket.remote_endpoint(r)).collect();
        let link = Self::with_endpoints(&locals, remotes, config)?;

        if let Some(size) = socket.recv_buffer_size {
            for (radio, s) in link.sockets.iter().enumerate() {
                if let Err(_e) = s.set_recv_buffer(size) {
                    warn!(radio, size, error = %_e, "failed to set receive buffer size");
                }
            }
        }
        Ok(link)
    }

    /// Binds `locals[r]` for each radio and sends radio `r` to `remotes[r]`.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_endpoints(
        locals: &[Endpoint],
        remotes: Vec<Endpoint>,
        config: &TxRxConfig,
    ) -> Result<Self, LinkError> {
        if config.channel_count != 1 {
            return Err(LinkError::ChannelCount { channels: config.channel_count });
        }
        let sockets = locals
            .iter()
            .map(|&endpoint| {
                UdpSocket::bind(endpoint).map_err(|source| LinkError::Bind { endpoint, source })
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(radios = sockets.len(), "socket link bound");

        Ok(Self { sockets, remotes, packet_length: config.packet_length() })
    }

    /// Addresses actually bound, in radio order. Differs from the configured
    /// ones when a base port of 0 asked for ephemeral ports.
    ///
    /// # Errors
    ///
    /// Returns an error if a socket's address cannot be read.
    pub fn local_endpoints(&self) -> Result<Vec<Endpoint>, LinkError> {
        self.sockets
            .iter()
            .enumerate()
            .map(|(radio, s)| s.local_endpoint().map_err(|source| LinkError::Io { radio, source }))
            .collect()
    }

    fn socket(&self, radio: usize) -> Result<&UdpSocket, LinkError> {
        self.sockets
            .get(radio)
            .ok_or(LinkError::RadioOutOfRange { radio, count: self.sockets.len() })
    }
}

impl Transceiver for SocketLink {
    fn start(&self) -> Result<(), LinkError> {
        Ok(())
    }

    fn stop(&self) {}

    fn receive(&self, radio: usize, slots: &mut [u8]) -> Result<Option<FrameTime>, LinkError> {
        let socket = self.socket(radio)?;
        if slots.len() != self.packet_length {
            return Err(LinkError::SlotSize {
                len: slots.len(),
                channels: 1,
                packet_length: self.packet_length,
            });
        }

        match socket.recv_datagram(slots) {
            Ok(None) => Ok(None),
            Ok(Some(len)) if len != self.packet_length => {
                Err(LinkError::ShortDatagram { radio, len, expected: self.packet_length })
            }
            Ok(Some(_)) => {
                let header = Packet::parse(slots)?.header();
                Ok(Some(FrameTime::new(header.frame_id as u32, header.symbol_id as u16)))
            }
            Err(source) => Err(LinkError::Io { radio, source }),
        }
    }

    fn delivers_headers(&self) -> bool {
        true
    }

    fn transmit(&self, request: TxRequest<'_>) -> Result<(), LinkError> {
        let radio = request.radio;
        let socket = self.socket(radio)?;
        let dest = *self
            .remotes
            .get(radio)
            .ok_or(LinkError::RadioOutOfRange { radio, count: self.remotes.len() })?;
        match send_retrying(|| socket.send_datagram(request.packet, dest)) {
            Ok(sent) if sent == request.packet.len() => Ok(()),
            Ok(sent) => Err(LinkError::ShortSend { radio, sent, expected: request.packet.len() }),
            Err(source) => Err(LinkError::Io { radio, source }),
        }
    }
}

/// Calls `send` until it is not refused with would-block, at most
/// [`SEND_ATTEMPTS`] times. The last refusal is returned as is.
fn send_retrying(mut send: impl FnMut() -> io::Result<usize>) -> io::Result<usize> {
    let mut attempt = 1;
    loop {
        match send() {
            Err(e) if e.kind() == ErrorKind::WouldBlock && attempt < SEND_ATTEMPTS => {
                attempt += 1;
                std::hint::spin_loop();
            }
            result => return result,
        }
    }
}
