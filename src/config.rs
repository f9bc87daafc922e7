use crate::types::{PacketSize, Port, TimeToLive, Token};
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// The protocol of a probe.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Protocol {
    /// Internet Control Message Protocol.
    Icmp,
    /// User Datagram Protocol.
    Udp,
    /// Transmission Control Protocol.
    Tcp,
    /// Stream Control Transmission Protocol.
    Sctp,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Icmp => write!(f, "icmp"),
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
            Self::Sctp => write!(f, "sctp"),
        }
    }
}

impl Protocol {
    /// Returns true for protocols probed with a connected stream socket
    /// rather than a crafted datagram.
    #[must_use]
    pub const fn is_stream(self) -> bool {
        matches!(self, Self::Tcp | Self::Sctp)
    }
}

/// The IP protocol version of a probe.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IpVersion {
    /// Internet Protocol version 4.
    V4,
    /// Internet Protocol version 6.
    V6,
}

impl Display for IpVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V4 => write!(f, "4"),
            Self::V6 => write!(f, "6"),
        }
    }
}

/// Default values for probe commands.
pub mod defaults {
    use super::{Duration, PacketSize, TimeToLive};

    /// The default value for `timeout`.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// The default value for `ttl`.
    pub const DEFAULT_TTL: TimeToLive = TimeToLive(255);

    /// The default value for `packet_size`.
    pub const DEFAULT_PACKET_SIZE: PacketSize = PacketSize(64);
}

/// The parameters of a single probe command.
///
/// One `ProbeRequest` corresponds to one command line read from the
/// controlling process and produces exactly one result line keyed by
/// `token`, either synchronously (diagnostics) or once a response arrives or
/// the timeout expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    /// The command token to key the result line with.
    pub token: Token,
    /// The probe protocol.
    pub protocol: Protocol,
    /// The IP version of the destination.
    pub ip_version: IpVersion,
    /// The IP time-to-live for the outbound packet.
    pub ttl: TimeToLive,
    /// The destination address literal.
    ///
    /// No name resolution is performed.
    pub address: String,
    /// The source port, where the protocol has one.
    pub local_port: Option<Port>,
    /// The destination port, where the protocol has one.
    pub remote_port: Option<Port>,
    /// The total size of the packet to construct, as a hint to the packet
    /// constructor.
    pub packet_size: PacketSize,
    /// How long to wait for a response before reporting `no-reply`.
    pub timeout: Duration,
}

impl ProbeRequest {
    /// Create a `ProbeRequest` with default ttl, packet size and timeout.
    #[must_use]
    pub fn new(
        token: Token,
        protocol: Protocol,
        ip_version: IpVersion,
        address: impl Into<String>,
    ) -> Self {
        Self {
            token,
            protocol,
            ip_version,
            ttl: defaults::DEFAULT_TTL,
            address: address.into(),
            local_port: None,
            remote_port: None,
            packet_size: defaults::DEFAULT_PACKET_SIZE,
            timeout: defaults::DEFAULT_TIMEOUT,
        }
    }
}
