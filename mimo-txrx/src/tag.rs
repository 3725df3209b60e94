//! Packed event tags.
//!
//! A [`Tag`] is a single `u64` carried inside an [`Event`](crate::event::Event)
//! so the hot path never allocates. Two field shapes exist:
//!
//! ```text
//! RxTag:   [ thread | offset ]                     (low bits on the right)
//! GenTag:  [ frame(32) | symbol | id ]
//! ```
//!
//! Field widths come from a [`TagLayout`] derived from the run configuration.
//! Every field also carries an exclusive upper limit; encoding a value at or
//! above its limit fails instead of truncating into a neighbouring field.
//! Radio-link transmit requests use a third form, a plain logical offset,
//! built with [`Tag::from_offset`].

use std::fmt;

use thiserror::Error;

/// Width of the frame field in a [`GenTag`]. Frame ids are 32-bit on the wire.
pub const FRAME_BITS: u32 = 32;

/// Opaque packed tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tag(u64);

impl Tag {
    /// Wraps a raw tag value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Tag carrying a logical transmit offset.
    #[must_use]
    pub const fn from_offset(offset: usize) -> Self {
        Self(offset as u64)
    }

    /// Raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Interprets the tag as a logical transmit offset.
    #[must_use]
    pub const fn offset(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Field of a tag, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagField {
    Thread,
    Offset,
    Frame,
    Symbol,
    Id,
}

impl fmt::Display for TagField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Thread => "thread",
            Self::Offset => "offset",
            Self::Frame => "frame",
            Self::Symbol => "symbol",
            Self::Id => "antenna/ue id",
        };
        f.write_str(name)
    }
}

/// Tag encoding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TagError {
    /// A field value is at or above the configured limit.
    #[error("{field} value {value} exceeds limit {limit} ({bits}-bit field)")]
    OutOfRange {
        field: TagField,
        value: u64,
        limit: u64,
        bits: u32,
    },
    /// The configured limits need more than 64 bits for one tag shape.
    #[error("{shape} tag needs {bits} bits, only 64 are available")]
    LayoutTooWide { shape: &'static str, bits: u32 },
}

/// One bit field: position, width, and exclusive value limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    name: TagField,
    shift: u32,
    bits: u32,
    limit: u64,
}

impl Field {
    const fn mask(&self) -> u64 {
        if self.bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.bits) - 1
        }
    }

    fn pack(&self, value: u64) -> Result<u64, TagError> {
        if value >= self.limit {
            return Err(TagError::OutOfRange {
                field: self.name,
                value,
                limit: self.limit,
                bits: self.bits,
            });
        }
        Ok(value << self.shift)
    }

    const fn unpack(&self, raw: u64) -> u64 {
        (raw >> self.shift) & self.mask()
    }
}

/// Number of bits needed to hold every value in `0..limit`.
pub(crate) const fn bits_for(limit: u64) -> u32 {
    if limit <= 1 {
        0
    } else {
        u64::BITS - (limit - 1).leading_zeros()
    }
}

/// Bit layout for both tag shapes, fixed for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagLayout {
    thread: Field,
    offset: Field,
    frame: Field,
    symbol: Field,
    id: Field,
}

impl TagLayout {
    /// Builds a layout for `threads` workers with `slots` ring slots each,
    /// `symbols` symbols per frame and `ids` antennas or UEs.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::LayoutTooWide`] if either tag shape would need more
    /// than 64 bits.
    pub fn new(threads: usize, slots: usize, symbols: usize, ids: usize) -> Result<Self, TagError> {
        let (threads, slots, symbols, ids) = (threads as u64, slots as u64, symbols as u64, ids as u64);

        let offset_bits = bits_for(slots);
        let thread_bits = bits_for(threads);
        let rx_bits = offset_bits + thread_bits;
        if rx_bits > 64 {
            return Err(TagError::LayoutTooWide { shape: "rx", bits: rx_bits });
        }

        let id_bits = bits_for(ids);
        let symbol_bits = bits_for(symbols);
        let gen_bits = id_bits + symbol_bits + FRAME_BITS;
        if gen_bits > 64 {
            return Err(TagError::LayoutTooWide { shape: "generic", bits: gen_bits });
        }

        Ok(Self {
            offset: Field { name: TagField::Offset, shift: 0, bits: offset_bits, limit: slots },
            thread: Field {
                name: TagField::Thread,
                shift: offset_bits,
                bits: thread_bits,
                limit: threads,
            },
            id: Field { name: TagField::Id, shift: 0, bits: id_bits, limit: ids },
            symbol: Field {
                name: TagField::Symbol,
                shift: id_bits,
                bits: symbol_bits,
                limit: symbols,
            },
            frame: Field {
                name: TagField::Frame,
                shift: id_bits + symbol_bits,
                bits: FRAME_BITS,
                limit: 1u64 << FRAME_BITS,
            },
        })
    }

    /// Total bits used by an [`RxTag`].
    #[must_use]
    pub const fn rx_bits(&self) -> u32 {
        self.thread.bits + self.offset.bits
    }

    /// Total bits used by a [`GenTag`].
    #[must_use]
    pub const fn gen_bits(&self) -> u32 {
        self.frame.bits + self.symbol.bits + self.id.bits
    }
}

/// Identifies one filled slot: the worker that owns the ring and the slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RxTag {
    pub thread: usize,
    pub offset: usize,
}

impl RxTag {
    #[must_use]
    pub const fn new(thread: usize, offset: usize) -> Self {
        Self { thread, offset }
    }

    /// Packs the tag.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::OutOfRange`] if a field exceeds its limit.
    pub fn encode(self, layout: &TagLayout) -> Result<Tag, TagError> {
        let raw = layout.thread.pack(self.thread as u64)? | layout.offset.pack(self.offset as u64)?;
        Ok(Tag(raw))
    }

    #[must_use]
    pub fn decode(tag: Tag, layout: &TagLayout) -> Self {
        Self {
            thread: layout.thread.unpack(tag.0) as usize,
            offset: layout.offset.unpack(tag.0) as usize,
        }
    }
}

/// Identifies one logical unit of work: a frame, a symbol within it, and an
/// antenna or UE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenTag {
    pub frame: u32,
    pub symbol: usize,
    pub id: usize,
}

impl GenTag {
    #[must_use]
    pub const fn new(frame: u32, symbol: usize, id: usize) -> Self {
        Self { frame, symbol, id }
    }

    /// Packs the tag.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::OutOfRange`] if the symbol or id exceeds its limit.
    pub fn encode(self, layout: &TagLayout) -> Result<Tag, TagError> {
        let raw = layout.frame.pack(u64::from(self.frame))?
            | layout.symbol.pack(self.symbol as u64)?
            | layout.id.pack(self.id as u64)?;
        Ok(Tag(raw))
    }

    #[must_use]
    pub fn decode(tag: Tag, layout: &TagLayout) -> Self {
        Self {
            frame: layout.frame.unpack(tag.0) as u32,
            symbol: layout.symbol.unpack(tag.0) as usize,
            id: layout.id.unpack(tag.0) as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn bits_for_limits() {
        assert_eq!(bits_for(0), 0);
        assert_eq!(bits_for(1), 0);
        assert_eq!(bits_for(2), 1);
        assert_eq!(bits_for(8), 3);
        assert_eq!(bits_for(9), 4);
        assert_eq!(bits_for(1 << 20), 20);
    }

    #[test]
    fn layout_widths_follow_limits() {
        let layout = TagLayout::new(2, 40 * 4 * 8, 4, 8).unwrap();
        assert_eq!(layout.rx_bits(), 1 + 11);
        assert_eq!(layout.gen_bits(), 32 + 2 + 3);
    }

    #[test]
    fn rx_tag_rejects_thread_past_limit() {
        let layout = TagLayout::new(2, 16, 4, 8).unwrap();
        let err = RxTag::new(2, 0).encode(&layout).unwrap_err();
        assert!(matches!(err, TagError::OutOfRange { field: TagField::Thread, value: 2, .. }));
    }

    #[test]
    fn gen_tag_rejects_id_that_fits_bits_but_not_limit() {
        // 5 antennas need 3 bits, which could hold 7: still rejected.
        let layout = TagLayout::new(1, 16, 4, 5).unwrap();
        let err = GenTag::new(0, 0, 5).encode(&layout).unwrap_err();
        assert!(matches!(err, TagError::OutOfRange { field: TagField::Id, limit: 5, .. }));
    }

    #[test]
    fn layout_too_wide_is_rejected() {
        let err = TagLayout::new(1, 16, 1 << 20, 1 << 20).unwrap_err();
        assert_eq!(err, TagError::LayoutTooWide { shape: "generic", bits: 72 });
    }

    #[test]
    fn max_frame_round_trips() {
        let layout = TagLayout::new(4, 1024, 70, 64).unwrap();
        let tag = GenTag::new(u32::MAX, 69, 63);
        assert_eq!(GenTag::decode(tag.encode(&layout).unwrap(), &layout), tag);
    }

    proptest! {
        #[test]
        fn rx_tag_round_trip(
            (threads, slots, thread, offset) in (1usize..64, 1usize..100_000)
                .prop_flat_map(|(t, s)| (Just(t), Just(s), 0..t, 0..s))
        ) {
            let layout = TagLayout::new(threads, slots, 1, 1).unwrap();
            let tag = RxTag::new(thread, offset);
            prop_assert_eq!(RxTag::decode(tag.encode(&layout).unwrap(), &layout), tag);
        }

        #[test]
        fn gen_tag_round_trip(
            (symbols, ids, frame, symbol, id) in (1usize..256, 1usize..4096)
                .prop_flat_map(|(s, i)| (Just(s), Just(i), any::<u32>(), 0..s, 0..i))
        ) {
            let layout = TagLayout::new(1, 1, symbols, ids).unwrap();
            let tag = GenTag::new(frame, symbol, id);
            prop_assert_eq!(GenTag::decode(tag.encode(&layout).unwrap(), &layout), tag);
        }
    }
}
