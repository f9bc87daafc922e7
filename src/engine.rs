use crate::codec::{Constructed, PacketCodec};
use crate::config::{IpVersion, ProbeRequest, Protocol};
use crate::constants::PACKET_BUFFER_SIZE;
use crate::error::{Error, ErrorKind, Result};
use crate::net::channel::ProbeChannel;
use crate::net::socket::{Socket, SocketError};
use crate::probe::{IcmpResponseType, ProbeId, ProbeTable};
use crate::respond::{Diagnostic, ProbeReply, Responder};
use crate::time::{TimeDelta, Timestamp};
use crate::types::Token;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::str::FromStr;
use std::time::Duration;
use tracing::instrument;

/// The probe lifecycle engine.
///
/// Owns the raw socket set and the table of outstanding probes, and drives
/// each probe from dispatch to its single result line:
///
/// - [`send_probe`](Self::send_probe) allocates a slot, constructs the
///   packet via the [`PacketCodec`] and transmits it;
/// - [`receive_replies`](Self::receive_replies) drains the ICMP sockets,
///   correlates parsed responses back to probes and polls outstanding
///   stream connects;
/// - [`check_timeouts`](Self::check_timeouts) retires probes which never
///   saw a response;
/// - [`next_deadline`](Self::next_deadline) tells the caller's event loop
///   how long it may sleep.
///
/// All socket IO is non-blocking or single-shot; the engine never suspends.
pub struct ProbeEngine<S: Socket, C: PacketCodec<S>, R: Responder> {
    channel: ProbeChannel<S>,
    table: ProbeTable<S>,
    codec: C,
    responder: R,
}

/// How a dispatch attempt left the probe slot.
enum DispatchOutcome {
    /// The probe is in flight and awaits a response or timeout.
    Outstanding,
    /// A stream connect was refused immediately, proving reachability.
    Refused(SocketAddr),
    /// The probe could not be sent; the slot is reclaimed.
    Failed(Diagnostic),
}

/// The result of polling one outstanding stream probe.
enum StreamOutcome {
    /// The connect completed or was refused; either way the destination
    /// host was reached.
    Reached(IpAddr),
    /// The connect failed.
    Failed(Token, Diagnostic),
}

impl<S, C, R> ProbeEngine<S, C, R>
where
    S: Socket,
    C: PacketCodec<S>,
    R: Responder,
{
    /// Open the engine's raw sockets.
    ///
    /// This is the privileged half of engine construction and does nothing
    /// else; call [`init`](Self::init) once privileges have been dropped.
    pub fn open(codec: C, responder: R) -> Result<Self> {
        Ok(Self {
            channel: ProbeChannel::open()?,
            table: ProbeTable::new(),
            codec,
            responder,
        })
    }

    /// Finish engine setup at normal privilege.
    pub fn init(&mut self) -> Result<()> {
        self.channel.init()
    }

    /// Returns true if probes can be transmitted with the given protocol.
    #[must_use]
    pub const fn is_protocol_supported(&self, protocol: Protocol) -> bool {
        self.channel.is_protocol_supported(protocol)
    }

    /// The number of outstanding probes.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.table.outstanding()
    }

    /// Dispatch a probe for a command.
    ///
    /// Emits exactly one diagnostic line synchronously on failure;
    /// otherwise the probe becomes outstanding and its result line is
    /// emitted later by [`receive_replies`](Self::receive_replies) or
    /// [`check_timeouts`](Self::check_timeouts).
    #[instrument(skip_all, fields(token = request.token.0))]
    pub fn send_probe(&mut self, request: &ProbeRequest) -> Result<()> {
        let token = request.token;
        let Some(id) = self.table.allocate(token) else {
            self.responder.report(token, Diagnostic::ProbesExhausted);
            return Ok(());
        };
        match self.dispatch(id, request)? {
            DispatchOutcome::Outstanding => {}
            DispatchOutcome::Refused(remote_addr) => {
                let timestamp = Timestamp::now()?;
                self.receive_probe(id, IcmpResponseType::EchoReply, remote_addr.ip(), timestamp);
            }
            DispatchOutcome::Failed(diagnostic) => {
                self.responder.report(token, diagnostic);
                self.table.free(id);
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, id: ProbeId, request: &ProbeRequest) -> Result<DispatchOutcome> {
        let Some(remote_addr) = decode_dest_addr(request) else {
            return Ok(DispatchOutcome::Failed(Diagnostic::InvalidArgument));
        };
        let Some(probe) = self.table.get(id) else {
            unreachable!()
        };
        let port = probe.port;
        let departure_time = Timestamp::now()?;
        let info = self.channel.info();
        let mut buf = [0_u8; PACKET_BUFFER_SIZE];
        let constructed = match self
            .codec
            .construct(&info, port, remote_addr, request, &mut buf)
        {
            Ok(constructed) => constructed,
            Err(Error::IoError(err)) => {
                return Ok(DispatchOutcome::Failed(Diagnostic::from_send_error(&err)));
            }
            Err(err) => return Err(err),
        };
        let stream_socket = match constructed {
            Constructed::Stream(socket) => Some(socket),
            Constructed::Datagram(length) if length > 0 => {
                if let Err(err) = self.channel.send(request.protocol, &buf[..length], remote_addr)
                {
                    return Ok(DispatchOutcome::Failed(Diagnostic::from_send_error(&err)));
                }
                None
            }
            Constructed::Datagram(_) => None,
            Constructed::Refused => {
                self.arm(id, remote_addr, departure_time, request.timeout, None);
                return Ok(DispatchOutcome::Refused(remote_addr));
            }
        };
        self.arm(id, remote_addr, departure_time, request.timeout, stream_socket);
        Ok(DispatchOutcome::Outstanding)
    }

    /// Record the send on the probe slot and start its timeout clock.
    fn arm(
        &mut self,
        id: ProbeId,
        remote_addr: SocketAddr,
        departure_time: Timestamp,
        timeout: Duration,
        stream_socket: Option<S>,
    ) {
        if let Some(probe) = self.table.get_mut(id) {
            probe.remote_addr = remote_addr;
            probe.departure_time = departure_time;
            probe.timeout_time = departure_time + timeout;
            probe.stream_socket = stream_socket;
        }
    }

    /// Collect any responses which have arrived.
    ///
    /// Drains both ICMP receive sockets and then polls the connect state of
    /// every outstanding stream probe.
    #[instrument(skip_all)]
    pub fn receive_replies(&mut self) -> Result<()> {
        self.drain_icmp(IpVersion::V4)?;
        self.drain_icmp(IpVersion::V6)?;
        self.poll_stream_probes()
    }

    /// Read packets from one ICMP receive socket until it is drained.
    ///
    /// The receive timestamp is captured immediately after each read
    /// returns to keep round-trip timing as precise as possible.
    fn drain_icmp(&mut self, version: IpVersion) -> Result<()> {
        let mut buf = [0_u8; PACKET_BUFFER_SIZE];
        loop {
            let received = self.channel.recv_socket_mut(version).recv_from(&mut buf);
            let timestamp = Timestamp::now()?;
            match received {
                Ok((length, addr)) => {
                    let Some(addr) = addr else { continue };
                    let packet = &buf[..length];
                    let parsed = match version {
                        IpVersion::V4 => self.codec.parse_ipv4(packet),
                        IpVersion::V6 => self.codec.parse_ipv6(packet),
                    };
                    if let Some(reply) = parsed {
                        if let Some(id) = self.table.find_by_port(reply.port) {
                            self.receive_probe(id, reply.response, addr.ip(), timestamp);
                        }
                    }
                }
                Err(err) => match err.kind() {
                    ErrorKind::Std(io::ErrorKind::WouldBlock) => return Ok(()),
                    ErrorKind::Std(io::ErrorKind::Interrupted) => {}
                    _ => return Err(Error::IoError(err)),
                },
            }
        }
    }

    /// Poll the connect state of every outstanding stream probe.
    ///
    /// A writable socket means the connect attempt has completed: success
    /// and connection-refused both prove the probe reached the destination
    /// host and are correlated as echo-reply equivalents.
    fn poll_stream_probes(&mut self) -> Result<()> {
        for id in self.table.ids() {
            let outcome = match self.table.get_mut(id) {
                Some(probe) => match probe.stream_socket.as_mut() {
                    Some(socket) => {
                        if socket.is_writable()? {
                            match socket.take_error()? {
                                None | Some(SocketError::ConnectionRefused) => {
                                    Some(StreamOutcome::Reached(probe.remote_addr.ip()))
                                }
                                Some(SocketError::Other(err)) => Some(StreamOutcome::Failed(
                                    probe.token,
                                    Diagnostic::from_io_error(&err),
                                )),
                            }
                        } else {
                            None
                        }
                    }
                    None => None,
                },
                None => None,
            };
            match outcome {
                Some(StreamOutcome::Reached(addr)) => {
                    let timestamp = Timestamp::now()?;
                    self.receive_probe(id, IcmpResponseType::EchoReply, addr, timestamp);
                }
                Some(StreamOutcome::Failed(token, diagnostic)) => {
                    self.responder.report(token, diagnostic);
                    self.table.free(id);
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Complete a probe: compute the round trip, emit the result line and
    /// reclaim the slot.
    fn receive_probe(
        &mut self,
        id: ProbeId,
        response: IcmpResponseType,
        responder_addr: IpAddr,
        timestamp: Timestamp,
    ) {
        if let Some(probe) = self.table.free(id) {
            let round_trip = timestamp - probe.departure_time;
            let reply = ProbeReply {
                token: probe.token,
                response,
                responder: responder_addr,
                round_trip_us: u64::try_from(round_trip.as_micros()).unwrap_or_default(),
            };
            tracing::debug!(?reply);
            self.responder.respond(&reply);
        }
    }

    /// Retire probes whose timeout has passed, reporting `no-reply` for
    /// each.
    #[instrument(skip_all)]
    pub fn check_timeouts(&mut self) -> Result<()> {
        let now = Timestamp::now()?;
        for id in self.table.ids() {
            let expired = self
                .table
                .get(id)
                .is_some_and(|probe| probe.timeout_time < now);
            if expired {
                if let Some(probe) = self.table.free(id) {
                    self.responder.report(probe.token, Diagnostic::NoReply);
                }
            }
        }
        Ok(())
    }

    /// The remaining time until the earliest outstanding probe times out,
    /// or `None` if no probes are outstanding and the event loop may sleep
    /// indefinitely.
    ///
    /// The returned span is negative if the deadline has already passed.
    pub fn next_deadline(&self) -> Result<Option<TimeDelta>> {
        let now = Timestamp::now()?;
        Ok(self
            .table
            .iter()
            .map(|(_, probe)| probe.timeout_time - now)
            .min())
    }

    /// The raw descriptors of all outstanding stream probe sockets, for the
    /// event loop writable set.
    #[must_use]
    pub fn stream_fds(&self) -> Vec<RawFd> {
        self.table
            .iter()
            .filter_map(|(_, probe)| probe.stream_socket.as_ref().map(Socket::raw_fd))
            .collect()
    }

    /// The raw descriptors of the receive sockets, for the event loop
    /// readable set.
    #[must_use]
    pub fn recv_fds(&self) -> [RawFd; 2] {
        self.channel.recv_fds()
    }
}

/// Parse the destination address literal of a command.
///
/// Only numeric addresses are accepted and the family must agree with the
/// command's IP version.
fn decode_dest_addr(request: &ProbeRequest) -> Option<SocketAddr> {
    let addr = IpAddr::from_str(request.address.as_str()).ok()?;
    match (request.ip_version, addr) {
        (IpVersion::V4, IpAddr::V4(_)) | (IpVersion::V6, IpAddr::V6(_)) => {
            Some(SocketAddr::new(addr, 0))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ParsedReply;
    use crate::constants::{MAX_PROBES, MIN_PORT};
    use crate::error::{IoError, IoOperation, IoResult};
    use crate::mocket_recv_from;
    use crate::net::socket::MockSocket;
    use crate::respond::CommandResponder;
    use crate::types::Port;
    use mockall::Sequence;
    use nix::errno::Errno;
    use std::collections::VecDeque;

    type TestEngine = ProbeEngine<MockSocket, StubCodec, CommandResponder<Vec<u8>>>;

    #[derive(Default)]
    struct StubCodec {
        construct: VecDeque<Result<Constructed<MockSocket>>>,
        parse: VecDeque<Option<ParsedReply>>,
        parsed_ipv4_packets: Vec<Vec<u8>>,
        parsed_ipv6_packets: Vec<Vec<u8>>,
    }

    impl StubCodec {
        fn with_construct(mut self, result: Result<Constructed<MockSocket>>) -> Self {
            self.construct.push_back(result);
            self
        }

        fn with_parse(mut self, reply: Option<ParsedReply>) -> Self {
            self.parse.push_back(reply);
            self
        }
    }

    impl PacketCodec<MockSocket> for StubCodec {
        fn construct(
            &mut self,
            _info: &crate::codec::NetInfo,
            _port: Port,
            _dest: SocketAddr,
            _request: &ProbeRequest,
            _buf: &mut [u8],
        ) -> Result<Constructed<MockSocket>> {
            self.construct
                .pop_front()
                .unwrap_or(Ok(Constructed::Datagram(0)))
        }

        fn parse_ipv4(&mut self, packet: &[u8]) -> Option<ParsedReply> {
            self.parsed_ipv4_packets.push(packet.to_vec());
            self.parse.pop_front().unwrap_or(None)
        }

        fn parse_ipv6(&mut self, packet: &[u8]) -> Option<ParsedReply> {
            self.parsed_ipv6_packets.push(packet.to_vec());
            self.parse.pop_front().unwrap_or(None)
        }
    }

    fn would_block() -> IoError {
        IoError::Other(
            io::Error::from(io::ErrorKind::WouldBlock),
            IoOperation::RecvFrom,
        )
    }

    fn drained_socket() -> MockSocket {
        let mut mocket = MockSocket::new();
        mocket
            .expect_recv_from()
            .returning(|_| Err(would_block()));
        mocket
    }

    fn make_engine(channel: ProbeChannel<MockSocket>, codec: StubCodec) -> TestEngine {
        ProbeEngine {
            channel,
            table: ProbeTable::new(),
            codec,
            responder: CommandResponder::new(Vec::new()),
        }
    }

    fn quiet_engine(codec: StubCodec) -> TestEngine {
        make_engine(
            ProbeChannel::with_sockets(
                MockSocket::new(),
                drained_socket(),
                MockSocket::new(),
                MockSocket::new(),
                drained_socket(),
            ),
            codec,
        )
    }

    fn lines(engine: &TestEngine) -> Vec<String> {
        String::from_utf8(engine.responder.get_ref().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn icmp_request(token: u32, address: &str) -> ProbeRequest {
        ProbeRequest::new(Token(token), Protocol::Icmp, IpVersion::V4, address)
    }

    #[test]
    fn test_send_probe_exhausted() -> anyhow::Result<()> {
        let mut engine = make_engine(
            ProbeChannel::with_sockets(
                MockSocket::new(),
                MockSocket::new(),
                MockSocket::new(),
                MockSocket::new(),
                MockSocket::new(),
            ),
            StubCodec::default(),
        );
        for _ in 0..MAX_PROBES {
            engine.table.allocate(Token(0));
        }
        engine.send_probe(&icmp_request(9, "127.0.0.1"))?;
        assert_eq!(lines(&engine), ["9 probes-exhausted"]);
        assert_eq!(engine.outstanding(), MAX_PROBES);
        Ok(())
    }

    #[test]
    fn test_send_probe_invalid_address() -> anyhow::Result<()> {
        let mut engine = quiet_engine(StubCodec::default());
        engine.send_probe(&icmp_request(1, "not-an-address"))?;
        assert_eq!(lines(&engine), ["1 invalid-argument"]);
        assert_eq!(engine.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn test_send_probe_family_mismatch() -> anyhow::Result<()> {
        let mut engine = quiet_engine(StubCodec::default());
        let request = ProbeRequest::new(Token(1), Protocol::Icmp, IpVersion::V6, "1.2.3.4");
        engine.send_probe(&request)?;
        assert_eq!(lines(&engine), ["1 invalid-argument"]);
        assert_eq!(engine.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn test_send_probe_datagram() -> anyhow::Result<()> {
        let dest = SocketAddr::from_str("10.0.0.1:0")?;
        let mut ip4_send = MockSocket::new();
        ip4_send
            .expect_send_to()
            .withf(move |buf, addr| buf.len() == 64 && *addr == dest)
            .times(1)
            .returning(|_, _| Ok(()));
        let mut engine = make_engine(
            ProbeChannel::with_sockets(
                ip4_send,
                MockSocket::new(),
                MockSocket::new(),
                MockSocket::new(),
                MockSocket::new(),
            ),
            StubCodec::default().with_construct(Ok(Constructed::Datagram(64))),
        );
        engine.send_probe(&icmp_request(1, "10.0.0.1"))?;
        assert!(lines(&engine).is_empty());
        assert_eq!(engine.outstanding(), 1);
        let (_, probe) = engine.table.iter().next().unwrap();
        assert_eq!(probe.port, Port(MIN_PORT));
        assert_eq!(probe.remote_addr, dest);
        assert_eq!(
            probe.timeout_time - probe.departure_time,
            TimeDelta(10_000_000)
        );
        Ok(())
    }

    #[test]
    fn test_send_probe_empty_datagram_sends_nothing() -> anyhow::Result<()> {
        let mut engine = quiet_engine(StubCodec::default().with_construct(Ok(
            Constructed::Datagram(0),
        )));
        engine.send_probe(&icmp_request(1, "10.0.0.1"))?;
        assert!(lines(&engine).is_empty());
        assert_eq!(engine.outstanding(), 1);
        Ok(())
    }

    #[test]
    fn test_send_probe_construct_error_is_classified() -> anyhow::Result<()> {
        let err = IoError::Other(io::Error::from(Errno::ENETDOWN), IoOperation::NewSocket);
        let mut engine =
            quiet_engine(StubCodec::default().with_construct(Err(Error::IoError(err))));
        engine.send_probe(&icmp_request(2, "10.0.0.1"))?;
        assert_eq!(lines(&engine), ["2 network-down"]);
        assert_eq!(engine.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn test_send_probe_send_error_is_classified() -> anyhow::Result<()> {
        let dest = SocketAddr::from_str("10.0.0.1:0")?;
        let mut ip4_send = MockSocket::new();
        ip4_send
            .expect_send_to()
            .times(1)
            .returning(move |_, _| Err(IoError::SendTo(io::Error::from(Errno::EPERM), dest)));
        let mut engine = make_engine(
            ProbeChannel::with_sockets(
                ip4_send,
                MockSocket::new(),
                MockSocket::new(),
                MockSocket::new(),
                MockSocket::new(),
            ),
            StubCodec::default().with_construct(Ok(Constructed::Datagram(8))),
        );
        engine.send_probe(&icmp_request(2, "10.0.0.1"))?;
        assert_eq!(lines(&engine), ["2 permission-denied"]);
        assert_eq!(engine.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn test_send_probe_refused_is_reply() -> anyhow::Result<()> {
        let mut engine = quiet_engine(StubCodec::default().with_construct(Ok(Constructed::Refused)));
        let request = ProbeRequest::new(Token(3), Protocol::Tcp, IpVersion::V4, "127.0.0.1");
        engine.send_probe(&request)?;
        let lines = lines(&engine);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("3 reply 127.0.0.1 "));
        assert_eq!(engine.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn test_send_probe_stream_is_outstanding() -> anyhow::Result<()> {
        let mut stream = MockSocket::new();
        stream.expect_raw_fd().return_const(7);
        let mut engine =
            quiet_engine(StubCodec::default().with_construct(Ok(Constructed::Stream(stream))));
        let request = ProbeRequest::new(Token(3), Protocol::Tcp, IpVersion::V4, "10.0.0.9");
        engine.send_probe(&request)?;
        assert!(lines(&engine).is_empty());
        assert_eq!(engine.outstanding(), 1);
        let (_, probe) = engine.table.iter().next().unwrap();
        assert!(probe.has_stream_socket());
        assert_eq!(engine.stream_fds(), [7]);
        Ok(())
    }

    #[test]
    fn test_stream_connect_completion_is_reply() -> anyhow::Result<()> {
        let mut stream = MockSocket::new();
        stream.expect_is_writable().returning(|| Ok(true));
        stream.expect_take_error().returning(|| Ok(None));
        let mut engine =
            quiet_engine(StubCodec::default().with_construct(Ok(Constructed::Stream(stream))));
        let request = ProbeRequest::new(Token(3), Protocol::Tcp, IpVersion::V4, "10.0.0.9");
        engine.send_probe(&request)?;
        engine.receive_replies()?;
        let lines = lines(&engine);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("3 reply 10.0.0.9 "));
        assert_eq!(engine.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn test_stream_connect_refused_is_reply() -> anyhow::Result<()> {
        let mut stream = MockSocket::new();
        stream.expect_is_writable().returning(|| Ok(true));
        stream
            .expect_take_error()
            .returning(|| Ok(Some(SocketError::ConnectionRefused)));
        let mut engine =
            quiet_engine(StubCodec::default().with_construct(Ok(Constructed::Stream(stream))));
        let request = ProbeRequest::new(Token(3), Protocol::Tcp, IpVersion::V4, "127.0.0.1");
        engine.send_probe(&request)?;
        engine.receive_replies()?;
        let lines = lines(&engine);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("3 reply 127.0.0.1 "));
        assert_eq!(engine.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn test_stream_connect_error_is_classified() -> anyhow::Result<()> {
        let mut stream = MockSocket::new();
        stream.expect_is_writable().returning(|| Ok(true));
        stream
            .expect_take_error()
            .returning(|| Ok(Some(SocketError::Other(io::Error::from(Errno::ENETUNREACH)))));
        let mut engine =
            quiet_engine(StubCodec::default().with_construct(Ok(Constructed::Stream(stream))));
        let request = ProbeRequest::new(Token(4), Protocol::Tcp, IpVersion::V4, "10.0.0.9");
        engine.send_probe(&request)?;
        engine.receive_replies()?;
        assert_eq!(lines(&engine), ["4 no-route"]);
        assert_eq!(engine.outstanding(), 0);
        Ok(())
    }

    #[test]
    fn test_stream_connect_incomplete_is_left_outstanding() -> anyhow::Result<()> {
        let mut stream = MockSocket::new();
        stream.expect_is_writable().returning(|| Ok(false));
        let mut engine =
            quiet_engine(StubCodec::default().with_construct(Ok(Constructed::Stream(stream))));
        let request = ProbeRequest::new(Token(3), Protocol::Tcp, IpVersion::V4, "10.0.0.9");
        engine.send_probe(&request)?;
        engine.receive_replies()?;
        assert!(lines(&engine).is_empty());
        assert_eq!(engine.outstanding(), 1);
        Ok(())
    }

    #[test]
    fn test_drain_correlates_response() -> anyhow::Result<()> {
        let responder_addr = SocketAddr::from_str("192.0.2.45:0")?;
        let packet = [0x45_u8; 48];
        let mut seq = Sequence::new();
        let mut ip4_recv = MockSocket::new();
        ip4_recv
            .expect_recv_from()
            .times(1)
            .in_sequence(&mut seq)
            .returning(mocket_recv_from!(packet, responder_addr));
        ip4_recv
            .expect_recv_from()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(would_block()));
        let codec = StubCodec::default()
            .with_construct(Ok(Constructed::Datagram(0)))
            .with_parse(Some(ParsedReply {
                port: Port(MIN_PORT),
                response: IcmpResponseType::TimeExceeded,
            }));
        let mut engine = make_engine(
            ProbeChannel::with_sockets(
                MockSocket::new(),
                ip4_recv,
                MockSocket::new(),
                MockSocket::new(),
                drained_socket(),
            ),
            codec,
        );
        engine.send_probe(&icmp_request(1, "10.0.0.1"))?;
        engine.receive_replies()?;
        let lines = lines(&engine);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("1 ttl-expired 192.0.2.45 "));
        assert_eq!(engine.outstanding(), 0);
        assert_eq!(engine.codec.parsed_ipv4_packets, [packet.to_vec()]);
        Ok(())
    }

    #[test]
    fn test_drain_correlates_ipv6_response() -> anyhow::Result<()> {
        let responder_addr = SocketAddr::from_str("[2001:db8::1]:0")?;
        let packet = [0x60_u8; 48];
        let mut seq = Sequence::new();
        let mut ip6_recv = MockSocket::new();
        ip6_recv
            .expect_recv_from()
            .times(1)
            .in_sequence(&mut seq)
            .returning(mocket_recv_from!(packet, responder_addr));
        ip6_recv
            .expect_recv_from()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(would_block()));
        let codec = StubCodec::default()
            .with_construct(Ok(Constructed::Datagram(0)))
            .with_parse(Some(ParsedReply {
                port: Port(MIN_PORT),
                response: IcmpResponseType::TimeExceeded,
            }));
        let mut engine = make_engine(
            ProbeChannel::with_sockets(
                MockSocket::new(),
                drained_socket(),
                MockSocket::new(),
                MockSocket::new(),
                ip6_recv,
            ),
            codec,
        );
        let request = ProbeRequest::new(Token(1), Protocol::Icmp, IpVersion::V6, "2001:db8::99");
        engine.send_probe(&request)?;
        engine.receive_replies()?;
        let lines = lines(&engine);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("1 ttl-expired 2001:db8::1 "));
        assert_eq!(engine.outstanding(), 0);
        assert!(engine.codec.parsed_ipv4_packets.is_empty());
        assert_eq!(engine.codec.parsed_ipv6_packets, [packet.to_vec()]);
        Ok(())
    }

    #[test]
    fn test_drain_ignores_unknown_port() -> anyhow::Result<()> {
        let responder_addr = SocketAddr::from_str("192.0.2.45:0")?;
        let packet = [0x45_u8; 48];
        let mut seq = Sequence::new();
        let mut ip4_recv = MockSocket::new();
        ip4_recv
            .expect_recv_from()
            .times(1)
            .in_sequence(&mut seq)
            .returning(mocket_recv_from!(packet, responder_addr));
        ip4_recv
            .expect_recv_from()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(would_block()));
        let codec = StubCodec::default()
            .with_construct(Ok(Constructed::Datagram(0)))
            .with_parse(Some(ParsedReply {
                port: Port(999),
                response: IcmpResponseType::EchoReply,
            }));
        let mut engine = make_engine(
            ProbeChannel::with_sockets(
                MockSocket::new(),
                ip4_recv,
                MockSocket::new(),
                MockSocket::new(),
                drained_socket(),
            ),
            codec,
        );
        engine.send_probe(&icmp_request(1, "10.0.0.1"))?;
        engine.receive_replies()?;
        assert!(lines(&engine).is_empty());
        assert_eq!(engine.outstanding(), 1);
        Ok(())
    }

    #[test]
    fn test_drain_retries_after_interrupt() -> anyhow::Result<()> {
        let responder_addr = SocketAddr::from_str("192.0.2.45:0")?;
        let packet = [0x45_u8; 28];
        let mut seq = Sequence::new();
        let mut ip4_recv = MockSocket::new();
        ip4_recv
            .expect_recv_from()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                Err(IoError::Other(
                    io::Error::from(Errno::EINTR),
                    IoOperation::RecvFrom,
                ))
            });
        ip4_recv
            .expect_recv_from()
            .times(1)
            .in_sequence(&mut seq)
            .returning(mocket_recv_from!(packet, responder_addr));
        ip4_recv
            .expect_recv_from()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(would_block()));
        let mut engine = make_engine(
            ProbeChannel::with_sockets(
                MockSocket::new(),
                ip4_recv,
                MockSocket::new(),
                MockSocket::new(),
                drained_socket(),
            ),
            StubCodec::default(),
        );
        engine.receive_replies()?;
        assert_eq!(engine.codec.parsed_ipv4_packets.len(), 1);
        Ok(())
    }

    #[test]
    fn test_drain_terminates_after_queued_packets() -> anyhow::Result<()> {
        let responder_addr = SocketAddr::from_str("192.0.2.45:0")?;
        let packet = [0x45_u8; 28];
        let mut seq = Sequence::new();
        let mut ip4_recv = MockSocket::new();
        for _ in 0..3 {
            ip4_recv
                .expect_recv_from()
                .times(1)
                .in_sequence(&mut seq)
                .returning(mocket_recv_from!(packet, responder_addr));
        }
        ip4_recv
            .expect_recv_from()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(would_block()));
        let mut engine = make_engine(
            ProbeChannel::with_sockets(
                MockSocket::new(),
                ip4_recv,
                MockSocket::new(),
                MockSocket::new(),
                drained_socket(),
            ),
            StubCodec::default(),
        );
        engine.receive_replies()?;
        assert_eq!(engine.codec.parsed_ipv4_packets.len(), 3);
        Ok(())
    }

    #[test]
    fn test_drain_unexpected_error_is_fatal() {
        let mut ip4_recv = MockSocket::new();
        ip4_recv.expect_recv_from().returning(|_| {
            Err(IoError::Other(
                io::Error::from(Errno::EBADF),
                IoOperation::RecvFrom,
            ))
        });
        let mut engine = make_engine(
            ProbeChannel::with_sockets(
                MockSocket::new(),
                ip4_recv,
                MockSocket::new(),
                MockSocket::new(),
                MockSocket::new(),
            ),
            StubCodec::default(),
        );
        assert!(engine.receive_replies().is_err());
    }

    #[test]
    fn test_round_trip_is_exact() -> anyhow::Result<()> {
        let mut engine = quiet_engine(StubCodec::default());
        let id = engine.table.allocate(Token(5)).unwrap();
        let departure = Timestamp::new(1000, 250_000);
        engine.table.get_mut(id).unwrap().departure_time = departure;
        engine.receive_probe(
            id,
            IcmpResponseType::EchoReply,
            IpAddr::from_str("1.2.3.4")?,
            departure + Duration::from_micros(12_345),
        );
        assert_eq!(lines(&engine), ["5 reply 1.2.3.4 12345"]);
        Ok(())
    }

    #[test]
    fn test_timeout_fires_exactly_once() -> anyhow::Result<()> {
        let mut engine = quiet_engine(StubCodec::default());
        engine.send_probe(&icmp_request(1, "10.0.0.1"))?;
        let id = engine.table.ids()[0];
        engine.table.get_mut(id).unwrap().timeout_time = Timestamp::new(0, 0);
        engine.check_timeouts()?;
        engine.check_timeouts()?;
        assert_eq!(lines(&engine), ["1 no-reply"]);
        assert_eq!(engine.outstanding(), 0);
        assert_eq!(engine.next_deadline()?, None);
        Ok(())
    }

    #[test]
    fn test_timeout_not_due_is_left_outstanding() -> anyhow::Result<()> {
        let mut engine = quiet_engine(StubCodec::default());
        engine.send_probe(&icmp_request(1, "10.0.0.1"))?;
        engine.check_timeouts()?;
        assert!(lines(&engine).is_empty());
        assert_eq!(engine.outstanding(), 1);
        Ok(())
    }

    #[test]
    fn test_next_deadline_returns_earliest() -> anyhow::Result<()> {
        let mut engine = quiet_engine(StubCodec::default());
        let mut sooner = icmp_request(1, "10.0.0.1");
        sooner.timeout = Duration::from_secs(5);
        let mut later = icmp_request(2, "10.0.0.2");
        later.timeout = Duration::from_secs(10);
        engine.send_probe(&sooner)?;
        engine.send_probe(&later)?;
        let deadline = engine.next_deadline()?.unwrap();
        assert!(deadline.as_micros() > 4_000_000);
        assert!(deadline.as_micros() <= 5_000_000);
        Ok(())
    }

    #[test]
    fn test_recv_fds() {
        let mut ip4_recv = MockSocket::new();
        ip4_recv.expect_raw_fd().return_const(3);
        let mut ip6_recv = MockSocket::new();
        ip6_recv.expect_raw_fd().return_const(4);
        let engine = make_engine(
            ProbeChannel::with_sockets(
                MockSocket::new(),
                ip4_recv,
                MockSocket::new(),
                MockSocket::new(),
                ip6_recv,
            ),
            StubCodec::default(),
        );
        assert_eq!(engine.recv_fds(), [3, 4]);
    }

    #[test]
    fn test_decode_dest_addr() {
        let v4 = icmp_request(1, "10.0.0.1");
        assert_eq!(
            decode_dest_addr(&v4),
            Some(SocketAddr::from_str("10.0.0.1:0").unwrap())
        );
        let v6 = ProbeRequest::new(Token(1), Protocol::Icmp, IpVersion::V6, "::1");
        assert_eq!(
            decode_dest_addr(&v6),
            Some(SocketAddr::from_str("[::1]:0").unwrap())
        );
        let mismatch = ProbeRequest::new(Token(1), Protocol::Icmp, IpVersion::V4, "::1");
        assert_eq!(decode_dest_addr(&mismatch), None);
        let garbage = icmp_request(1, "example.com");
        assert_eq!(decode_dest_addr(&garbage), None);
    }
}
