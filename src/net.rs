/// Platform specific network code.
mod platform;

/// A network socket.
pub mod socket;

/// The raw socket set.
pub mod channel;

pub use platform::{Ipv4ByteOrder, SocketImpl};
