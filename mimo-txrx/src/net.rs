//! UDP primitives for the socket link.
//!
//! One non-blocking socket per simulated radio, addressed as
//! `base_port + radio` on each end.

pub mod endpoint;
pub mod socket;

pub use endpoint::Endpoint;
pub use socket::UdpSocket;
