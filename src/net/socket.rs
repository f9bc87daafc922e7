use crate::error::IoResult as Result;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

/// The stream protocols used for reachability probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProtocol {
    Tcp,
    Sctp,
}

#[cfg_attr(test, mockall::automock)]
pub trait Socket
where
    Self: Sized,
{
    /// Create the raw IPv4 socket for sending, with the IP header included.
    ///
    /// The engine supplies complete IPv4 headers, so header inclusion is
    /// enabled on this socket.  It stays in blocking mode: it is only ever
    /// written with single-shot sends of small packets.
    fn new_raw_send_socket_ipv4() -> Result<Self>;
    /// Create the raw IPv4 socket for receiving ICMP.
    fn new_recv_socket_ipv4() -> Result<Self>;
    /// Create the raw IPv6 socket for sending ICMPv6.
    fn new_icmp_send_socket_ipv6() -> Result<Self>;
    /// Create the raw IPv6 socket for sending UDP.
    fn new_udp_send_socket_ipv6() -> Result<Self>;
    /// Create the raw IPv6 socket for receiving ICMPv6.
    fn new_recv_socket_ipv6() -> Result<Self>;
    /// Create a non-blocking IPv4 stream socket for a reachability probe.
    fn new_stream_socket_ipv4(protocol: StreamProtocol) -> Result<Self>;
    /// Create a non-blocking IPv6 stream socket for a reachability probe.
    fn new_stream_socket_ipv6(protocol: StreamProtocol) -> Result<Self>;
    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<()>;
    fn set_ttl(&mut self, ttl: u32) -> Result<()>;
    fn set_unicast_hops_v6(&mut self, hops: u8) -> Result<()>;
    fn bind(&mut self, address: SocketAddr) -> Result<()>;
    fn connect(&mut self, address: SocketAddr) -> Result<()>;
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<()>;
    fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, Option<SocketAddr>)>;
    /// Returns true if the socket is currently writable, false otherwise.
    fn is_writable(&mut self) -> Result<bool>;
    fn take_error(&mut self) -> Result<Option<SocketError>>;
    /// The raw descriptor, for readiness multiplexing by the event loop.
    fn raw_fd(&self) -> RawFd;
}

/// A socket error returned by `Socket::take_error`.
#[derive(Debug)]
pub enum SocketError {
    ConnectionRefused,
    Other(io::Error),
}

#[cfg(test)]
pub mod tests {
    #[macro_export]
    macro_rules! mocket_recv_from {
        ($packet: expr, $addr: expr) => {
            move |buf: &mut [u8]| -> IoResult<(usize, Option<SocketAddr>)> {
                buf[..$packet.len()].copy_from_slice(&$packet);
                Ok(($packet.len(), Some($addr)))
            }
        };
    }
}
