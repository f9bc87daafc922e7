pub mod byte_order;

pub use byte_order::Ipv4ByteOrder;

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::SocketImpl;
