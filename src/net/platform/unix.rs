use crate::error::{IoError, IoOperation, IoResult};
use crate::net::socket::{Socket, SocketError, StreamProtocol};
use itertools::Itertools;
use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::time::{TimeVal, TimeValLike};
use socket2::{Domain, Protocol, SockAddr, Type};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use tracing::instrument;

/// A network socket.
pub struct SocketImpl {
    inner: socket2::Socket,
}

impl SocketImpl {
    fn new(domain: Domain, ty: Type, protocol: Protocol) -> IoResult<Self> {
        Ok(Self {
            inner: socket2::Socket::new(domain, ty, Some(protocol))
                .map_err(|err| IoError::Other(err, IoOperation::NewSocket))?,
        })
    }

    fn new_raw_ipv4(protocol: Protocol) -> IoResult<Self> {
        Self::new(Domain::IPV4, Type::RAW, protocol)
    }

    fn new_raw_ipv6(protocol: Protocol) -> IoResult<Self> {
        Self::new(Domain::IPV6, Type::RAW, protocol)
    }

    fn set_header_included(&mut self) -> IoResult<()> {
        self.inner
            .set_header_included_v4(true)
            .map_err(|err| IoError::Other(err, IoOperation::SetHeaderIncluded))
    }

    fn set_reuse_port(&mut self) -> IoResult<()> {
        self.inner
            .set_reuse_port(true)
            .map_err(|err| IoError::Other(err, IoOperation::SetReusePort))
    }
}

fn stream_protocol(protocol: StreamProtocol) -> Protocol {
    match protocol {
        StreamProtocol::Tcp => Protocol::TCP,
        StreamProtocol::Sctp => Protocol::from(nix::libc::IPPROTO_SCTP),
    }
}

impl Socket for SocketImpl {
    #[instrument(level = "trace")]
    fn new_raw_send_socket_ipv4() -> IoResult<Self> {
        let mut socket = Self::new_raw_ipv4(Protocol::from(nix::libc::IPPROTO_RAW))?;
        socket.set_header_included()?;
        Ok(socket)
    }
    #[instrument(level = "trace")]
    fn new_recv_socket_ipv4() -> IoResult<Self> {
        Self::new_raw_ipv4(Protocol::ICMPV4)
    }
    #[instrument(level = "trace")]
    fn new_icmp_send_socket_ipv6() -> IoResult<Self> {
        Self::new_raw_ipv6(Protocol::ICMPV6)
    }
    #[instrument(level = "trace")]
    fn new_udp_send_socket_ipv6() -> IoResult<Self> {
        Self::new_raw_ipv6(Protocol::UDP)
    }
    #[instrument(level = "trace")]
    fn new_recv_socket_ipv6() -> IoResult<Self> {
        Self::new_raw_ipv6(Protocol::ICMPV6)
    }
    #[instrument(level = "trace")]
    fn new_stream_socket_ipv4(protocol: StreamProtocol) -> IoResult<Self> {
        let mut socket = Self::new(Domain::IPV4, Type::STREAM, stream_protocol(protocol))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_port()?;
        Ok(socket)
    }
    #[instrument(level = "trace")]
    fn new_stream_socket_ipv6(protocol: StreamProtocol) -> IoResult<Self> {
        let mut socket = Self::new(Domain::IPV6, Type::STREAM, stream_protocol(protocol))?;
        socket.set_nonblocking(true)?;
        socket.set_reuse_port()?;
        Ok(socket)
    }
    #[instrument(skip(self), level = "trace")]
    fn set_nonblocking(&mut self, nonblocking: bool) -> IoResult<()> {
        self.inner
            .set_nonblocking(nonblocking)
            .map_err(|err| IoError::Other(err, IoOperation::SetNonBlocking))
    }
    #[instrument(skip(self), level = "trace")]
    fn set_ttl(&mut self, ttl: u32) -> IoResult<()> {
        self.inner
            .set_ttl_v4(ttl)
            .map_err(|err| IoError::Other(err, IoOperation::SetTtl))
    }
    #[instrument(skip(self), level = "trace")]
    fn set_unicast_hops_v6(&mut self, hops: u8) -> IoResult<()> {
        self.inner
            .set_unicast_hops_v6(u32::from(hops))
            .map_err(|err| IoError::Other(err, IoOperation::SetUnicastHopsV6))
    }
    #[instrument(skip(self), level = "trace")]
    fn bind(&mut self, address: SocketAddr) -> IoResult<()> {
        self.inner
            .bind(&SockAddr::from(address))
            .map_err(|err| IoError::Bind(err, address))
    }
    #[instrument(skip(self), level = "trace")]
    fn connect(&mut self, address: SocketAddr) -> IoResult<()> {
        tracing::trace!(?address);
        self.inner
            .connect(&SockAddr::from(address))
            .map_err(|err| IoError::Connect(err, address))
    }
    #[instrument(skip(self, buf), level = "trace")]
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> IoResult<()> {
        tracing::trace!(buf = format!("{:02x?}", buf.iter().format(" ")), ?addr);
        self.inner
            .send_to(buf, &SockAddr::from(addr))
            .map_err(|err| IoError::SendTo(err, addr))?;
        Ok(())
    }
    #[instrument(skip(self, buf), level = "trace")]
    fn recv_from(&mut self, buf: &mut [u8]) -> IoResult<(usize, Option<SocketAddr>)> {
        let (bytes_read, addr) = self
            .inner
            .recv_from_into_buf(buf)
            .map_err(|err| IoError::Other(err, IoOperation::RecvFrom))?;
        tracing::trace!(
            buf = format!("{:02x?}", buf[..bytes_read].iter().format(" ")),
            bytes_read,
            ?addr
        );
        Ok((bytes_read, addr))
    }
    #[instrument(skip(self), level = "trace")]
    fn is_writable(&mut self) -> IoResult<bool> {
        let mut write = FdSet::new();
        write.insert(self.inner.as_fd());
        let writable = select(
            None,
            None,
            Some(&mut write),
            None,
            Some(&mut TimeVal::zero()),
        );
        match writable {
            Ok(writable) => Ok(writable == 1),
            Err(Errno::EINTR) => Ok(false),
            Err(err) => Err(IoError::Other(io::Error::from(err), IoOperation::Select)),
        }
    }
    #[instrument(skip(self), ret, level = "trace")]
    fn take_error(&mut self) -> IoResult<Option<SocketError>> {
        self.inner
            .take_error()
            .map(|err| {
                err.map(|e| match e.raw_os_error() {
                    Some(errno) if Errno::from_raw(errno) == Errno::ECONNREFUSED => {
                        SocketError::ConnectionRefused
                    }
                    _ => SocketError::Other(e),
                })
            })
            .map_err(|err| IoError::Other(err, IoOperation::TakeError))
    }
    fn raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// A `recv_from` which reads into an ordinary initialised `&mut [u8]`.
///
/// `socket2::Socket::recv_from` takes `&mut [MaybeUninit<u8>]` so that it
/// can be handed a fresh uninitialised buffer; our receive buffer is a
/// zeroed stack array reused across the drain loop, so this shim bridges
/// the two signatures.
trait RecvFrom {
    fn recv_from_into_buf(&self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)>;
}

impl RecvFrom for socket2::Socket {
    // Safety: an initialised `[u8]` is always a valid `[MaybeUninit<u8>]`
    // and `recv_from` only ever writes initialised bytes into it, so the
    // buffer is still fully initialised when the call returns.
    #![allow(unsafe_code)]
    fn recv_from_into_buf(&self, buf: &mut [u8]) -> io::Result<(usize, Option<SocketAddr>)> {
        let buf = unsafe {
            &mut *(std::ptr::from_mut::<[u8]>(buf) as *mut [std::mem::MaybeUninit<u8>])
        };
        self.recv_from(buf)
            .map(|(bytes_read, addr)| (bytes_read, addr.as_socket()))
    }
}
