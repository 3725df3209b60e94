//! Non-blocking datagram socket for one simulated radio.
//!
//! Built on [`mio::net::UdpSocket`] without a poll registry: workers spin
//! over their radios, so "would block" is folded into `Ok(None)` and never
//! reaches the caller as an error. Socket options mio does not expose go
//! through `rustix`.

use std::io::{self, ErrorKind};
use std::os::fd::{AsFd, BorrowedFd};

use rustix::net::sockopt;

use super::Endpoint;

pub struct UdpSocket {
    inner: mio::net::UdpSocket,
}

impl UdpSocket {
    /// Binds a non-blocking socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        Ok(Self { inner: mio::net::UdpSocket::bind(endpoint.into())? })
    }

    /// Address actually bound, with the OS-chosen port if 0 was asked for.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be read.
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Reads one datagram into `buf`. `Ok(None)` if none is queued.
    ///
    /// A datagram longer than `buf` is truncated and reported at the length
    /// that was copied.
    ///
    /// # Errors
    ///
    /// Returns any receive error other than would-block.
    pub fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.inner.recv_from(buf) {
            Ok((len, _)) => Ok(Some(len)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sends `buf` as one datagram and returns the bytes the kernel took.
    ///
    /// # Errors
    ///
    /// Returns the send error, including would-block when the send buffer
    /// is full.
    pub fn send_datagram(&self, buf: &[u8], dest: Endpoint) -> io::Result<usize> {
        self.inner.send_to(buf, dest.into())
    }

    /// Asks for a kernel receive buffer of `size` bytes. Linux doubles the
    /// request and caps it at `net.core.rmem_max`.
    ///
    /// # Errors
    ///
    /// Returns an error if the option is rejected.
    pub fn set_recv_buffer(&self, size: usize) -> io::Result<()> {
        sockopt::set_socket_recv_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }

    /// Current kernel receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be read.
    pub fn recv_buffer(&self) -> io::Result<usize> {
        Ok(sockopt::socket_recv_buffer_size(self.inner.as_fd())?)
    }
}

impl AsFd for UdpSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_spin(socket: &UdpSocket, buf: &mut [u8]) -> usize {
        for _ in 0..10_000 {
            if let Some(len) = socket.recv_datagram(buf).unwrap() {
                return len;
            }
            std::thread::sleep(std::time::Duration::from_micros(100));
        }
        panic!("no datagram");
    }

    #[test]
    fn ephemeral_bind_gets_a_port() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let bound = socket.local_endpoint().unwrap();
        assert_eq!(bound.ip(), Endpoint::localhost(0).ip());
        assert_ne!(bound.port(), 0);
    }

    #[test]
    fn empty_socket_reports_none() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        assert_eq!(socket.recv_datagram(&mut [0u8; 16]).unwrap(), None);
    }

    #[test]
    fn datagram_crosses_loopback_whole() {
        let a = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let b = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let sent = a.send_datagram(&[7u8; 48], b.local_endpoint().unwrap()).unwrap();
        assert_eq!(sent, 48);

        let mut buf = [0u8; 64];
        assert_eq!(recv_spin(&b, &mut buf), 48);
        assert!(buf[..48].iter().all(|&x| x == 7));
    }

    #[test]
    fn receive_buffer_can_grow() {
        let socket = UdpSocket::bind(Endpoint::localhost(0)).unwrap();
        let before = socket.recv_buffer().unwrap();
        assert!(before > 0);
        socket.set_recv_buffer(before * 2).unwrap();
        assert!(socket.recv_buffer().unwrap() >= before);
    }
}
