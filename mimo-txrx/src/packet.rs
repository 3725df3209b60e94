//! Fixed-layout radio sample packet.
//!
//! # Wire Format
//!
//! ```text
//! ┌────────────┬─────────────┬───────────┬──────────────┬──────────────────────────┐
//! │ frame (4)  │ symbol (4)  │ cell (4)  │ antenna (4)  │ samples: (I i16, Q i16)* │
//! └────────────┴─────────────┴───────────┴──────────────┴──────────────────────────┘
//! ```
//!
//! All integers are little-endian. The total length is fixed for a run
//! (`packet_length`) and must match exactly on both ends of a link.
//!
//! Packets are never copied out of their ring slot: [`PacketMut::write`]
//! stamps a header over slot bytes in place and [`Packet::parse`] reads one
//! back, both borrowing the slot.

use thiserror::Error;

/// Header size in bytes.
pub const PACKET_HEADER_LEN: usize = 16;

/// One complex sample: int16 I followed by int16 Q.
pub const BYTES_PER_SAMPLE: usize = 4;

/// Packet length for `samples_per_symbol` complex samples.
#[must_use]
pub const fn packet_length(samples_per_symbol: usize) -> usize {
    PACKET_HEADER_LEN + samples_per_symbol * BYTES_PER_SAMPLE
}

/// Addressing header of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketHeader {
    pub frame_id: i32,
    pub symbol_id: i32,
    pub cell_id: i32,
    pub antenna_id: i32,
}

impl PacketHeader {
    #[must_use]
    pub const fn new(frame_id: i32, symbol_id: i32, cell_id: i32, antenna_id: i32) -> Self {
        Self { frame_id, symbol_id, cell_id, antenna_id }
    }

    /// Writes the header into the first [`PACKET_HEADER_LEN`] bytes of `buf`.
    fn encode_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.frame_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.symbol_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.cell_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.antenna_id.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        let word = |i: usize| i32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Self {
            frame_id: word(0),
            symbol_id: word(4),
            cell_id: word(8),
            antenna_id: word(12),
        }
    }
}

/// Packet view errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    /// The buffer cannot hold a header.
    #[error("packet buffer is {len} bytes, header alone needs 16")]
    TooShort { len: usize },
    /// The payload is not a whole number of samples.
    #[error("packet payload of {len} bytes is not a whole number of samples")]
    RaggedPayload { len: usize },
}

fn check_len(len: usize) -> Result<(), PacketError> {
    if len < PACKET_HEADER_LEN {
        return Err(PacketError::TooShort { len });
    }
    if (len - PACKET_HEADER_LEN) % BYTES_PER_SAMPLE != 0 {
        return Err(PacketError::RaggedPayload { len: len - PACKET_HEADER_LEN });
    }
    Ok(())
}

/// Read-only view of a packet held in a slot.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    bytes: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Validates `bytes` as a packet.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is shorter than a header or the payload
    /// is not made of whole samples.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, PacketError> {
        check_len(bytes.len())?;
        Ok(Self { bytes })
    }

    #[must_use]
    pub fn header(&self) -> PacketHeader {
        PacketHeader::decode_from(self.bytes)
    }

    #[must_use]
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[PACKET_HEADER_LEN..]
    }

    /// Iterates the payload as `(I, Q)` pairs.
    pub fn samples(&self) -> impl Iterator<Item = (i16, i16)> + 'a {
        self.payload().chunks_exact(BYTES_PER_SAMPLE).map(|s| {
            (i16::from_le_bytes([s[0], s[1]]), i16::from_le_bytes([s[2], s[3]]))
        })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// Mutable view of a packet held in a slot.
#[derive(Debug)]
pub struct PacketMut<'a> {
    bytes: &'a mut [u8],
}

impl<'a> PacketMut<'a> {
    /// Stamps `header` over the slot and returns a view of the new packet.
    /// The payload bytes are left as they are.
    ///
    /// # Errors
    ///
    /// Same as [`Packet::parse`].
    pub fn write(bytes: &'a mut [u8], header: PacketHeader) -> Result<Self, PacketError> {
        let mut packet = Self::over(bytes)?;
        packet.set_header(header);
        Ok(packet)
    }

    /// Views the slot as a packet without touching its contents.
    ///
    /// # Errors
    ///
    /// Same as [`Packet::parse`].
    pub fn over(bytes: &'a mut [u8]) -> Result<Self, PacketError> {
        check_len(bytes.len())?;
        Ok(Self { bytes })
    }

    pub fn set_header(&mut self, header: PacketHeader) {
        header.encode_into(self.bytes);
    }

    #[must_use]
    pub fn header(&self) -> PacketHeader {
        PacketHeader::decode_from(self.bytes)
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[PACKET_HEADER_LEN..]
    }

    /// Writes `(I, Q)` pairs from the start of the payload. Extra samples
    /// beyond the payload are ignored; returns how many were written.
    pub fn write_samples<I>(&mut self, samples: I) -> usize
    where
        I: IntoIterator<Item = (i16, i16)>,
    {
        let mut written = 0;
        for (slot, (i, q)) in self.payload_mut().chunks_exact_mut(BYTES_PER_SAMPLE).zip(samples) {
            slot[0..2].copy_from_slice(&i.to_le_bytes());
            slot[2..4].copy_from_slice(&q.to_le_bytes());
            written += 1;
        }
        written
    }

    #[must_use]
    pub fn as_packet(&self) -> Packet<'_> {
        Packet { bytes: self.bytes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_formula() {
        assert_eq!(packet_length(0), 16);
        assert_eq!(packet_length(64), 16 + 256);
    }

    #[test]
    fn header_layout_is_little_endian() {
        let mut slot = [0u8; 24];
        PacketMut::write(&mut slot, PacketHeader::new(1, 2, 3, -1)).unwrap();
        assert_eq!(&slot[0..4], &[1, 0, 0, 0]);
        assert_eq!(&slot[4..8], &[2, 0, 0, 0]);
        assert_eq!(&slot[8..12], &[3, 0, 0, 0]);
        assert_eq!(&slot[12..16], &[0xff; 4]);
    }

    #[test]
    fn write_keeps_payload() {
        let mut slot = [0xabu8; 24];
        let packet = PacketMut::write(&mut slot, PacketHeader::new(7, 3, 0, 5)).unwrap();
        assert_eq!(packet.header(), PacketHeader::new(7, 3, 0, 5));
        assert!(packet.as_packet().payload().iter().all(|&b| b == 0xab));
    }

    #[test]
    fn samples_round_trip_through_slot() {
        let mut slot = vec![0u8; packet_length(3)];
        let mut packet = PacketMut::over(&mut slot).unwrap();
        assert_eq!(packet.write_samples([(1, -1), (i16::MAX, i16::MIN), (0, 42), (9, 9)]), 3);

        let view = Packet::parse(&slot).unwrap();
        let samples: Vec<_> = view.samples().collect();
        assert_eq!(samples, vec![(1, -1), (i16::MAX, i16::MIN), (0, 42)]);
    }

    #[test]
    fn short_and_ragged_buffers_rejected() {
        assert_eq!(Packet::parse(&[0u8; 15]).unwrap_err(), PacketError::TooShort { len: 15 });
        assert_eq!(
            Packet::parse(&[0u8; 18]).unwrap_err(),
            PacketError::RaggedPayload { len: 2 }
        );
    }
}
