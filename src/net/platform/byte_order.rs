use crate::error::{Error, IoResult, Result};
use crate::net::socket::Socket;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tracing::instrument;

/// The total length of the discovery echo packet (IPv4 header plus minimal
/// ICMP echo request).
const TEST_PACKET_LENGTH: u16 = 28;

/// The byte order to encode the `total_length` field of the IPv4 header.
///
/// Nearly all fields in a caller-supplied IPv4 header must be encoded in
/// network byte order, but the required byte order of the length field is
/// inconsistent between operating systems and operating system versions.
/// FreeBSD 11 requires the length field in network byte order, some older
/// versions of FreeBSD require host byte order, and OS X requires host byte
/// order.  Linux accepts either.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Ipv4ByteOrder {
    Host,
    Network,
}

impl Ipv4ByteOrder {
    /// The byte order to use for this host.
    ///
    /// Linux accepts either byte order for the `total_length` field, so the
    /// discovery send is skipped there and network byte order is used
    /// unconditionally.
    #[cfg(target_os = "linux")]
    #[expect(clippy::unnecessary_wraps)]
    pub fn for_host<S: Socket>(_send_socket: &mut S) -> Result<Self> {
        Ok(Self::Network)
    }

    /// The byte order to use for this host, discovered empirically.
    #[cfg(not(target_os = "linux"))]
    pub fn for_host<S: Socket>(send_socket: &mut S) -> Result<Self> {
        Self::detect(send_socket)
    }

    /// Discover the required byte order by sending a minimal ICMP echo to
    /// localhost over the raw send socket.
    ///
    /// The echo is first attempted with the `total_length` field in network
    /// byte order.  If the kernel rejects the send the echo is rebuilt with
    /// the field swapped and sent again; if that attempt also fails there is
    /// no byte order the kernel will take and startup cannot proceed.
    #[instrument(skip(send_socket), ret, level = "trace")]
    pub fn detect<S: Socket>(send_socket: &mut S) -> Result<Self> {
        match send_test_packet(send_socket, Self::Network) {
            Ok(()) => Ok(Self::Network),
            Err(_) => match send_test_packet(send_socket, Self::Host) {
                Ok(()) => Ok(Self::Host),
                Err(err) => Err(Error::ByteOrderUndetermined(err)),
            },
        }
    }

    /// Adjust the IPv4 `total_length` header field for this byte order.
    #[must_use]
    pub const fn adjust_length(self, ipv4_total_length: u16) -> u16 {
        match self {
            Self::Host => ipv4_total_length.swap_bytes(),
            Self::Network => ipv4_total_length,
        }
    }
}

/// Send the discovery echo to localhost with the given byte order.
fn send_test_packet<S: Socket>(send_socket: &mut S, byte_order: Ipv4ByteOrder) -> IoResult<()> {
    let packet = make_test_packet(byte_order);
    let remote_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    send_socket.send_to(&packet, remote_addr)
}

/// Build the discovery echo: an IPv4 header around a minimal ICMP echo
/// request with identifier and sequence zero, ttl 255, destination
/// localhost.  The source address and IPv4 header checksum are left zero for
/// the kernel to fill in.
fn make_test_packet(byte_order: Ipv4ByteOrder) -> [u8; TEST_PACKET_LENGTH as usize] {
    let mut packet = [0_u8; TEST_PACKET_LENGTH as usize];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&byte_order.adjust_length(TEST_PACKET_LENGTH).to_be_bytes());
    packet[8] = 0xff;
    packet[9] = 0x01;
    packet[16..20].copy_from_slice(&Ipv4Addr::LOCALHOST.octets());
    packet[20] = 0x08;
    let checksum = icmp_checksum(&packet[20..]);
    packet[22..24].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// RFC 1071 ones-complement checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum = data.chunks(2).fold(0_u32, |sum, chunk| {
        let word = match *chunk {
            [high, low] => u32::from(u16::from_be_bytes([high, low])),
            [high] => u32::from(u16::from_be_bytes([high, 0])),
            _ => 0,
        };
        sum + word
    });
    while sum >> 16 > 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
