//! Events exchanged between the I/O workers and the compute thread.

use std::fmt;

use crate::tag::Tag;

/// What an [`Event`] announces. The variant decides how its tag is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// A radio packet landed in a ring slot. Tag: `RxTag`.
    PacketReceived,
    /// A packet from the secondary (MAC) link landed in a ring slot. Tag: `RxTag`.
    PacketFromSecondaryLink,
    /// Compute asks a worker to transmit one unit. Tag: logical offset or `GenTag`.
    TransmitRequest,
    /// A radio transmit finished. Tag: the request's tag, unchanged.
    TransmitDone,
    /// A secondary-link transmit finished. Tag: the request's tag, unchanged.
    TransmitToSecondaryLink,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PacketReceived => "packet-received",
            Self::PacketFromSecondaryLink => "packet-from-secondary-link",
            Self::TransmitRequest => "transmit-request",
            Self::TransmitDone => "transmit-done",
            Self::TransmitToSecondaryLink => "transmit-to-secondary-link",
        };
        f.write_str(name)
    }
}

/// A queue entry: an event kind plus its packed tag. `Copy` and 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub event_type: EventType,
    pub tag: Tag,
}

impl Event {
    #[must_use]
    pub const fn new(event_type: EventType, tag: Tag) -> Self {
        Self { event_type, tag }
    }
}
