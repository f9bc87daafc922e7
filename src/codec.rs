use crate::config::ProbeRequest;
use crate::error::Result;
use crate::net::Ipv4ByteOrder;
use crate::net::socket::Socket;
use crate::probe::IcmpResponseType;
use crate::types::Port;
use std::net::SocketAddr;

/// The facts about the host a packet constructor needs.
#[derive(Debug, Clone, Copy)]
pub struct NetInfo {
    /// The byte order the kernel expects for the IPv4 total-length header
    /// field on egress.
    pub ipv4_length_order: Ipv4ByteOrder,
    /// Whether SCTP sockets can be created on this host.
    pub sctp_support: bool,
}

/// The result of constructing a probe packet.
pub enum Constructed<S> {
    /// A connectionless packet of the given length was written into the
    /// buffer and should be sent on the raw socket for its family and
    /// protocol.
    Datagram(usize),
    /// A stream probe: a non-blocking socket with a connect in flight.  The
    /// probe owns the socket and its writability signals connect completion.
    Stream(S),
    /// The stream connect was refused before the socket went non-blocking.
    /// The refusal proves the probe reached the destination host and is
    /// correlated as an echo-reply equivalent.
    Refused,
}

/// The correlation key recovered from a received ICMP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedReply {
    /// The transient port of the originating probe, recovered from the
    /// headers embedded in the ICMP payload.
    pub port: Port,
    /// The kind of response.
    pub response: IcmpResponseType,
}

/// Packet construction and parsing.
///
/// The engine is agnostic to packet byte layout: constructing outbound
/// headers and digging the originating probe's key out of inbound ICMP
/// payloads both live behind this trait.
pub trait PacketCodec<S: Socket> {
    /// Construct the packet for a probe.
    ///
    /// For connectionless protocols the packet is written into `buf` and its
    /// length returned as [`Constructed::Datagram`].  For stream protocols
    /// no bytes are produced; instead a non-blocking connect is initiated
    /// and the socket returned as [`Constructed::Stream`], or
    /// [`Constructed::Refused`] if the connect was refused outright.
    fn construct(
        &mut self,
        info: &NetInfo,
        port: Port,
        dest: SocketAddr,
        request: &ProbeRequest,
        buf: &mut [u8],
    ) -> Result<Constructed<S>>;

    /// Parse a packet read from the IPv4 ICMP socket, returning the
    /// correlation key if it responds to one of our probes.
    fn parse_ipv4(&mut self, packet: &[u8]) -> Option<ParsedReply>;

    /// Parse a packet read from the IPv6 ICMP socket, returning the
    /// correlation key if it responds to one of our probes.
    fn parse_ipv6(&mut self, packet: &[u8]) -> Option<ParsedReply>;
}
