/// The maximum number of probes which may be outstanding at any one time.
///
/// Commands which would exceed this are refused synchronously rather than
/// queued.
pub const MAX_PROBES: usize = 3000;

/// The lowest transient probe port.
///
/// This is the canonical traceroute base port.  The port is used to key
/// outbound packets (source or destination port for UDP/TCP/SCTP, identifier
/// and sequence for ICMP) so that responses can be correlated back to the
/// originating probe.
pub const MIN_PORT: u16 = 33434;

/// The highest transient probe port.
///
/// The port allocator wraps back to `MIN_PORT` after handing out this value.
pub const MAX_PORT: u16 = 65535;

/// The size of the buffer used to construct and receive packets.
pub const PACKET_BUFFER_SIZE: usize = 1024;
