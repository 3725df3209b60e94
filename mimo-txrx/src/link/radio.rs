//! Hardware radio backend.
//!
//! Wraps a vendor driver behind [`RadioDevice`], which speaks raw status
//! codes. [`RadioLink`] turns those codes into the three receive outcomes
//! the workers act on: data, nothing yet, or fatal.

use crate::config::TxRxConfig;
use crate::packet::{PACKET_HEADER_LEN, Packet};

use super::{FrameTime, LinkError, Transceiver, TxRequest};

/// Channels a single radio can carry.
pub const MAX_CHANNELS: usize = 2;

/// Status a driver returns when a read timed out without data.
pub const RX_TIMEOUT: i32 = -1;

/// A radio driver.
///
/// Status codes: a positive value is a sample count, `0` or [`RX_TIMEOUT`]
/// on read means no data, any other negative value is an error.
pub trait RadioDevice: Send + Sync {
    /// Starts streaming on every radio.
    fn activate(&self) -> i32;

    fn deactivate(&self);

    /// Reads one symbol per channel into `buffers`. Returns the status and
    /// the hardware timestamp of the symbol.
    fn read(&self, radio: usize, buffers: &mut [&mut [u8]]) -> (i32, u64);

    /// Writes one symbol per channel from `buffers` at hardware time `time`.
    fn write(&self, radio: usize, buffers: &[&[u8]], flags: i32, time: u64) -> i32;
}

/// [`Transceiver`] over a [`RadioDevice`].
pub struct RadioLink<D> {
    device: D,
    radio_count: usize,
    channel_count: usize,
    packet_length: usize,
    /// Payload sent on the channels a request does not address.
    silence: Box<[u8]>,
}

impl<D: RadioDevice> RadioLink<D> {
    /// # Errors
    ///
    /// Returns [`LinkError::ChannelCount`] if the config asks for more than
    /// [`MAX_CHANNELS`] channels per radio.
    pub fn new(device: D, config: &TxRxConfig) -> Result<Self, LinkError> {
        if config.channel_count == 0 || config.channel_count > MAX_CHANNELS {
            return Err(LinkError::ChannelCount { channels: config.channel_count });
        }
        let packet_length = config.packet_length();
        Ok(Self {
            device,
            radio_count: config.radio_count,
            channel_count: config.channel_count,
            packet_length,
            silence: vec![0u8; packet_length - PACKET_HEADER_LEN].into_boxed_slice(),
        })
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    fn check_radio(&self, radio: usize) -> Result<(), LinkError> {
        if radio >= self.radio_count {
            return Err(LinkError::RadioOutOfRange { radio, count: self.radio_count });
        }
        Ok(())
    }
}

impl<D: RadioDevice> Transceiver for RadioLink<D> {
    fn start(&self) -> Result<(), LinkError> {
        match self.device.activate() {
            code if code < 0 => Err(LinkError::Start { code }),
            _ => Ok(()),
        }
    }

    fn stop(&self) {
        self.device.deactivate();
    }

    fn receive(&self, radio: usize, slots: &mut [u8]) -> Result<Option<FrameTime>, LinkError> {
        self.check_radio(radio)?;
        let channels = self.channel_count;
        if slots.len() != channels * self.packet_length {
            return Err(LinkError::SlotSize {
                len: slots.len(),
                channels,
                packet_length: self.packet_length,
            });
        }

        let mut buffers: [&mut [u8]; MAX_CHANNELS] = [&mut [], &mut []];
        for (buffer, slot) in buffers.iter_mut().zip(slots.chunks_exact_mut(self.packet_length)) {
            *buffer = &mut slot[PACKET_HEADER_LEN..];
        }

        match self.device.read(radio, &mut buffers[..channels]) {
            (code, time) if code > 0 => Ok(Some(FrameTime::from_hw(time))),
            (0 | RX_TIMEOUT, _) => Ok(None),
            (code, _) => Err(LinkError::Device { radio, code }),
        }
    }

    fn transmit(&self, request: TxRequest<'_>) -> Result<(), LinkError> {
        self.check_radio(request.radio)?;
        if request.channel >= self.channel_count {
            return Err(LinkError::ChannelOutOfRange {
                channel: request.channel,
                count: self.channel_count,
            });
        }
        let payload = Packet::parse(request.packet)?.payload();

        let mut buffers: [&[u8]; MAX_CHANNELS] = [&self.silence[..], &self.silence[..]];
        buffers[request.channel] = payload;

        let code = self.device.write(
            request.radio,
            &buffers[..self.channel_count],
            request.flags.as_raw(),
            request.time.to_hw(),
        );
        if code < 0 {
            return Err(LinkError::Device { radio: request.radio, code });
        }
        Ok(())
    }
}
