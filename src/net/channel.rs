use crate::codec::NetInfo;
use crate::config::{IpVersion, Protocol};
use crate::error::{IoError, IoResult, Result};
use crate::net::platform::Ipv4ByteOrder;
use crate::net::socket::{Socket, StreamProtocol};
use nix::errno::Errno;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use tracing::instrument;

/// The set of raw sockets used to emit probes and collect responses.
///
/// Construction is split into two phases so that elevated privileges can be
/// dropped as early as possible: [`ProbeChannel::open`] creates the raw
/// sockets and nothing else, and [`ProbeChannel::init`] runs at normal
/// privilege to switch the receive sockets to non-blocking mode and perform
/// the runtime feature probes.
pub struct ProbeChannel<S: Socket> {
    ip4_send_socket: S,
    ip4_recv_socket: S,
    icmp6_send_socket: S,
    udp6_send_socket: S,
    ip6_recv_socket: S,
    ipv4_length_order: Ipv4ByteOrder,
    sctp_support: bool,
}

impl<S: Socket> ProbeChannel<S> {
    /// Open the raw sockets.
    ///
    /// This operation requires elevated privileges (the `CAP_NET_RAW`
    /// capability on Linux).
    #[instrument(skip_all)]
    pub fn open() -> Result<Self> {
        Ok(Self {
            ip4_send_socket: S::new_raw_send_socket_ipv4()?,
            ip4_recv_socket: S::new_recv_socket_ipv4()?,
            icmp6_send_socket: S::new_icmp_send_socket_ipv6()?,
            udp6_send_socket: S::new_udp_send_socket_ipv6()?,
            ip6_recv_socket: S::new_recv_socket_ipv6()?,
            ipv4_length_order: Ipv4ByteOrder::Network,
            sctp_support: false,
        })
    }

    /// Finish channel setup at normal privilege.
    ///
    /// Switches the receive sockets to non-blocking mode, discovers the
    /// required IPv4 length byte order and checks for SCTP support.
    #[instrument(skip_all)]
    pub fn init(&mut self) -> Result<()> {
        self.ip4_recv_socket.set_nonblocking(true)?;
        self.ip6_recv_socket.set_nonblocking(true)?;
        self.ipv4_length_order = Ipv4ByteOrder::for_host(&mut self.ip4_send_socket)?;
        self.sctp_support = check_sctp_support::<S>();
        tracing::debug!(
            ipv4_length_order = ?self.ipv4_length_order,
            sctp_support = self.sctp_support
        );
        Ok(())
    }

    /// The facts about the host a packet constructor needs.
    #[must_use]
    pub const fn info(&self) -> NetInfo {
        NetInfo {
            ipv4_length_order: self.ipv4_length_order,
            sctp_support: self.sctp_support,
        }
    }

    /// The discovered IPv4 length byte order.
    #[must_use]
    pub const fn ipv4_length_order(&self) -> Ipv4ByteOrder {
        self.ipv4_length_order
    }

    /// Whether SCTP sockets can be created on this host.
    #[must_use]
    pub const fn sctp_support(&self) -> bool {
        self.sctp_support
    }

    /// Returns true if probes can be transmitted with the given protocol.
    #[must_use]
    pub const fn is_protocol_supported(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Icmp | Protocol::Udp | Protocol::Tcp => true,
            Protocol::Sctp => self.sctp_support,
        }
    }

    /// Send a constructed packet on the raw socket for the destination
    /// family and protocol.
    ///
    /// All IPv4 probes go out over the single raw send socket with header
    /// inclusion; IPv6 probes are split by protocol since the kernel
    /// composes the IPv6 header.  Combinations with no matching socket are
    /// rejected as invalid.
    #[instrument(skip(self, packet), level = "trace")]
    pub fn send(&mut self, protocol: Protocol, packet: &[u8], dest: SocketAddr) -> IoResult<()> {
        let socket = match (dest, protocol) {
            (SocketAddr::V4(_), _) => &mut self.ip4_send_socket,
            (SocketAddr::V6(_), Protocol::Icmp) => &mut self.icmp6_send_socket,
            (SocketAddr::V6(_), Protocol::Udp) => &mut self.udp6_send_socket,
            (SocketAddr::V6(_), _) => {
                return Err(IoError::SendTo(io::Error::from(Errno::EINVAL), dest));
            }
        };
        socket.send_to(packet, dest)
    }

    /// The receive socket for an IP version.
    pub(crate) fn recv_socket_mut(&mut self, version: IpVersion) -> &mut S {
        match version {
            IpVersion::V4 => &mut self.ip4_recv_socket,
            IpVersion::V6 => &mut self.ip6_recv_socket,
        }
    }

    /// The raw descriptors of the receive sockets, for the event loop
    /// readable set.
    #[must_use]
    pub fn recv_fds(&self) -> [RawFd; 2] {
        [self.ip4_recv_socket.raw_fd(), self.ip6_recv_socket.raw_fd()]
    }

    #[cfg(test)]
    pub(crate) fn with_sockets(
        ip4_send_socket: S,
        ip4_recv_socket: S,
        icmp6_send_socket: S,
        udp6_send_socket: S,
        ip6_recv_socket: S,
    ) -> Self {
        Self {
            ip4_send_socket,
            ip4_recv_socket,
            icmp6_send_socket,
            udp6_send_socket,
            ip6_recv_socket,
            ipv4_length_order: Ipv4ByteOrder::Network,
            sctp_support: false,
        }
    }
}

/// Attempt to create an SCTP socket to see whether the protocol is usable.
///
/// The SCTP protocol constant being defined is necessary but not sufficient:
/// some platforms define it yet fail socket creation, so the check must be
/// made at runtime.
fn check_sctp_support<S: Socket>() -> bool {
    S::new_stream_socket_ipv4(StreamProtocol::Sctp).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IoOperation;
    use crate::net::socket::MockSocket;
    use mockall::predicate;
    use std::str::FromStr;
    use std::sync::Mutex;
    use test_case::test_case;

    static MTX: Mutex<()> = Mutex::new(());

    fn mock_channel() -> ProbeChannel<MockSocket> {
        ProbeChannel::with_sockets(
            MockSocket::new(),
            MockSocket::new(),
            MockSocket::new(),
            MockSocket::new(),
            MockSocket::new(),
        )
    }

    #[test]
    fn test_send_ipv4_uses_raw_send_socket() {
        let dest = SocketAddr::from_str("1.2.3.4:0").unwrap();
        let mut channel = mock_channel();
        channel
            .ip4_send_socket
            .expect_send_to()
            .with(predicate::eq([0xde, 0xad]), predicate::eq(dest))
            .times(2)
            .returning(|_, _| Ok(()));
        channel.send(Protocol::Icmp, &[0xde, 0xad], dest).unwrap();
        channel.send(Protocol::Udp, &[0xde, 0xad], dest).unwrap();
    }

    #[test]
    fn test_send_ipv6_icmp_uses_icmp6_socket() {
        let dest = SocketAddr::from_str("[::1]:0").unwrap();
        let mut channel = mock_channel();
        channel
            .icmp6_send_socket
            .expect_send_to()
            .times(1)
            .returning(|_, _| Ok(()));
        channel.send(Protocol::Icmp, &[0x00], dest).unwrap();
    }

    #[test]
    fn test_send_ipv6_udp_uses_udp6_socket() {
        let dest = SocketAddr::from_str("[::1]:0").unwrap();
        let mut channel = mock_channel();
        channel
            .udp6_send_socket
            .expect_send_to()
            .times(1)
            .returning(|_, _| Ok(()));
        channel.send(Protocol::Udp, &[0x00], dest).unwrap();
    }

    #[test]
    fn test_send_ipv6_stream_combination_is_invalid() {
        let dest = SocketAddr::from_str("[::1]:0").unwrap();
        let mut channel = mock_channel();
        let err = channel.send(Protocol::Tcp, &[0x00], dest).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(Errno::EINVAL as i32));
    }

    #[test_case(Protocol::Icmp, false, true)]
    #[test_case(Protocol::Udp, false, true)]
    #[test_case(Protocol::Tcp, false, true)]
    #[test_case(Protocol::Sctp, false, false)]
    #[test_case(Protocol::Sctp, true, true)]
    fn test_is_protocol_supported(protocol: Protocol, sctp_support: bool, expected: bool) {
        let mut channel = mock_channel();
        channel.sctp_support = sctp_support;
        assert_eq!(channel.is_protocol_supported(protocol), expected);
    }

    #[test]
    fn test_check_sctp_supported() {
        let _m = MTX.lock();

        let ctx = MockSocket::new_stream_socket_ipv4_context();
        ctx.expect()
            .with(predicate::eq(StreamProtocol::Sctp))
            .times(1)
            .returning(|_| Ok(MockSocket::new()));
        assert!(check_sctp_support::<MockSocket>());
    }

    #[test]
    fn test_check_sctp_unsupported() {
        let _m = MTX.lock();

        let ctx = MockSocket::new_stream_socket_ipv4_context();
        ctx.expect().times(1).returning(|_| {
            Err(IoError::Other(
                io::Error::from(Errno::EPROTONOSUPPORT),
                IoOperation::NewSocket,
            ))
        });
        assert!(!check_sctp_support::<MockSocket>());
    }

    #[test]
    fn test_init_runs_feature_probes() {
        let _m = MTX.lock();

        let ctx = MockSocket::new_stream_socket_ipv4_context();
        ctx.expect().returning(|_| Ok(MockSocket::new()));

        let mut channel = mock_channel();
        channel
            .ip4_send_socket
            .expect_send_to()
            .returning(|_, _| Ok(()));
        channel
            .ip4_recv_socket
            .expect_set_nonblocking()
            .with(predicate::eq(true))
            .times(1)
            .returning(|_| Ok(()));
        channel
            .ip6_recv_socket
            .expect_set_nonblocking()
            .with(predicate::eq(true))
            .times(1)
            .returning(|_| Ok(()));
        channel.init().unwrap();
        assert!(channel.sctp_support());
    }
}
