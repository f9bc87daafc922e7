use nix::errno::Errno;
use std::fmt::{Display, Formatter};
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// A probe engine result.
pub type Result<T> = std::result::Result<T, Error>;

/// A probe engine error.
///
/// Errors of this type are fatal to the engine: they indicate environmental
/// misconfiguration beyond per-probe recovery.  Per-probe failures are
/// reported on the command stream as [`crate::Diagnostic`] lines instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    IoError(#[from] IoError),
    #[error("system clock is unavailable or behind the unix epoch")]
    ClockUnavailable,
    #[error("unable to send to localhost in either byte order: {0}")]
    ByteOrderUndetermined(IoError),
}

/// Custom IO error result.
pub type IoResult<T> = std::result::Result<T, IoError>;

/// Custom IO error.
#[derive(Error, Debug)]
pub enum IoError {
    #[error("Bind error for {1}: {0}")]
    Bind(io::Error, SocketAddr),
    #[error("Connect error for {1}: {0}")]
    Connect(io::Error, SocketAddr),
    #[error("Sendto error for {1}: {0}")]
    SendTo(io::Error, SocketAddr),
    #[error("Failed to {1}: {0}")]
    Other(io::Error, IoOperation),
}

impl IoError {
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Bind(e, _) | Self::Connect(e, _) | Self::SendTo(e, _) | Self::Other(e, _) => {
                e.raw_os_error()
            }
        }
    }
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Bind(e, _) | Self::Connect(e, _) | Self::SendTo(e, _) | Self::Other(e, _) => {
                ErrorKind::from(e)
            }
        }
    }
}

/// Io operation.
#[derive(Debug)]
pub enum IoOperation {
    NewSocket,
    SetNonBlocking,
    Select,
    RecvFrom,
    SetTtl,
    SetUnicastHopsV6,
    SetHeaderIncluded,
    SetReusePort,
    TakeError,
}

impl Display for IoOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSocket => write!(f, "create new socket"),
            Self::SetNonBlocking => write!(f, "set non-blocking"),
            Self::Select => write!(f, "select"),
            Self::RecvFrom => write!(f, "recv from"),
            Self::SetTtl => write!(f, "set TTL"),
            Self::SetUnicastHopsV6 => write!(f, "set unicast hops v6"),
            Self::SetHeaderIncluded => write!(f, "set header included"),
            Self::SetReusePort => write!(f, "set reuse port"),
            Self::TakeError => write!(f, "take error"),
        }
    }
}

/// A classification of IO errors.
///
/// Raw OS errors which the engine must react to individually are split out
/// from the standard [`io::ErrorKind`] taxonomy, which folds several of them
/// together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InProgress,
    ConnectionRefused,
    HostUnreachable,
    NetUnreachable,
    Std(io::ErrorKind),
}

impl From<&io::Error> for ErrorKind {
    fn from(value: &io::Error) -> Self {
        if value.raw_os_error() == io::Error::from(Errno::EINPROGRESS).raw_os_error() {
            Self::InProgress
        } else if value.raw_os_error() == io::Error::from(Errno::ECONNREFUSED).raw_os_error() {
            Self::ConnectionRefused
        } else if value.raw_os_error() == io::Error::from(Errno::EHOSTUNREACH).raw_os_error() {
            Self::HostUnreachable
        } else if value.raw_os_error() == io::Error::from(Errno::ENETUNREACH).raw_os_error() {
            Self::NetUnreachable
        } else {
            Self::Std(value.kind())
        }
    }
}

// only used for unit tests
impl From<ErrorKind> for io::Error {
    fn from(value: ErrorKind) -> Self {
        match value {
            ErrorKind::InProgress => Self::from(Errno::EINPROGRESS),
            ErrorKind::ConnectionRefused => Self::from(Errno::ECONNREFUSED),
            ErrorKind::HostUnreachable => Self::from(Errno::EHOSTUNREACH),
            ErrorKind::NetUnreachable => Self::from(Errno::ENETUNREACH),
            ErrorKind::Std(kind) => Self::from(kind),
        }
    }
}
