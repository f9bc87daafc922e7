use crate::error::{ErrorKind, IoError};
use crate::probe::IcmpResponseType;
use crate::types::Token;
use nix::errno::Errno;
use std::fmt::{Display, Formatter};
use std::io::{self, Write};
use std::net::IpAddr;

/// A diagnostic reported on the command stream in place of a probe response.
///
/// The vocabulary is closed: platform error codes outside the table are
/// folded into [`Diagnostic::Unexpected`] with the raw errno value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    /// All probe slots are in use.
    ProbesExhausted,
    /// The command parameters could not be used to send a probe.
    InvalidArgument,
    /// The local network interface is down.
    NetworkDown,
    /// There is no route to the destination.
    NoRoute,
    /// The probe was refused by the operating system.
    PermissionDenied,
    /// The probe's local address is already in use.
    AddressInUse,
    /// No response arrived before the probe timeout.
    NoReply,
    /// Any other platform error, reported by raw errno value.
    Unexpected(i32),
}

impl Diagnostic {
    /// Classify a raw OS error value.
    #[must_use]
    pub fn from_raw_os_error(errno: i32) -> Self {
        match Errno::from_raw(errno) {
            Errno::EINVAL => Self::InvalidArgument,
            Errno::ENETDOWN => Self::NetworkDown,
            Errno::ENETUNREACH => Self::NoRoute,
            Errno::EPERM => Self::PermissionDenied,
            Errno::EADDRINUSE => Self::AddressInUse,
            _ => Self::Unexpected(errno),
        }
    }

    /// Classify a `std::io::Error`.
    #[must_use]
    pub fn from_io_error(err: &io::Error) -> Self {
        err.raw_os_error()
            .map_or_else(|| Self::from_io_error_kind(err.kind()), Self::from_raw_os_error)
    }

    /// Classify a socket IO error.
    #[must_use]
    pub fn from_send_error(err: &IoError) -> Self {
        err.raw_os_error().map_or_else(
            || match err.kind() {
                ErrorKind::NetUnreachable => Self::NoRoute,
                ErrorKind::Std(kind) => Self::from_io_error_kind(kind),
                _ => Self::Unexpected(0),
            },
            Self::from_raw_os_error,
        )
    }

    fn from_io_error_kind(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::InvalidInput => Self::InvalidArgument,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::AddrInUse => Self::AddressInUse,
            _ => Self::Unexpected(0),
        }
    }
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProbesExhausted => write!(f, "probes-exhausted"),
            Self::InvalidArgument => write!(f, "invalid-argument"),
            Self::NetworkDown => write!(f, "network-down"),
            Self::NoRoute => write!(f, "no-route"),
            Self::PermissionDenied => write!(f, "permission-denied"),
            Self::AddressInUse => write!(f, "address-in-use"),
            Self::NoReply => write!(f, "no-reply"),
            Self::Unexpected(errno) => write!(f, "unexpected-error errno {errno}"),
        }
    }
}

/// A correlated probe response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReply {
    /// The command token of the originating probe.
    pub token: Token,
    /// The type of response which completed the probe.
    pub response: IcmpResponseType,
    /// The address of the responding hop.
    pub responder: IpAddr,
    /// Microseconds elapsed between send and response.
    pub round_trip_us: u64,
}

/// The final emitter for probe outcomes.
///
/// The engine calls exactly one of these methods per probe; the probe slot
/// is freed once the call returns.
#[cfg_attr(test, mockall::automock)]
pub trait Responder {
    /// Emit the result line for a correlated probe response.
    fn respond(&mut self, reply: &ProbeReply);

    /// Emit a diagnostic line for a probe which produced no response.
    fn report(&mut self, token: Token, diagnostic: Diagnostic);
}

/// A [`Responder`] which writes outcomes as single lines on the command
/// stream.
pub struct CommandResponder<W> {
    out: W,
}

impl<W: Write> CommandResponder<W> {
    pub const fn new(out: W) -> Self {
        Self { out }
    }

    /// The underlying writer.
    pub const fn get_ref(&self) -> &W {
        &self.out
    }
}

impl<W: Write> Responder for CommandResponder<W> {
    fn respond(&mut self, reply: &ProbeReply) {
        let outcome = match reply.response {
            IcmpResponseType::EchoReply => "reply",
            IcmpResponseType::TimeExceeded => "ttl-expired",
            IcmpResponseType::DestinationUnreachable => "dest-unreachable",
        };
        let _ = writeln!(
            self.out,
            "{} {} {} {}",
            reply.token.0, outcome, reply.responder, reply.round_trip_us
        );
        let _ = self.out.flush();
    }

    fn report(&mut self, token: Token, diagnostic: Diagnostic) {
        let _ = writeln!(self.out, "{} {diagnostic}", token.0);
        let _ = self.out.flush();
    }
}
