//! Hoplink - a per-hop network probe engine.
//!
//! This crate provides the probe engine of a network diagnostic tool which
//! measures per-hop latency and reachability along the path to a destination
//! host.  A controlling process issues probe commands, each keyed by an
//! integer token; for each command the engine transmits a crafted IP packet,
//! correlates any resulting ICMP response or TCP/SCTP connect outcome back
//! to the originating probe, and emits a single textual result line naming
//! the responding hop and the round-trip time.
//!
//! The engine is single-threaded and never blocks: send calls are
//! single-shot, receive sockets are drained in non-blocking mode and stream
//! connects are polled with zero-timeout readiness checks.  The caller's
//! event loop multiplexes over [`ProbeEngine::recv_fds`],
//! [`ProbeEngine::stream_fds`] and [`ProbeEngine::next_deadline`] and calls
//! back into the engine as the sockets become ready or the deadline passes.
//!
//! Packet byte layout is deliberately not part of the engine: constructing
//! outbound headers and parsing inbound ICMP payloads live behind the
//! [`PacketCodec`] trait, and result lines are emitted through the
//! [`Responder`] trait (with [`CommandResponder`] writing the textual
//! command-stream form).
//!
//! # See Also
//!
//! - [`ProbeEngine::open`] - open the raw sockets (privileged).
//! - [`ProbeEngine::init`] - feature-probe the host and finish setup.
//! - [`ProbeEngine::send_probe`] - dispatch a probe for a command.
//! - [`ProbeEngine::receive_replies`] - collect and correlate responses.
//! - [`ProbeEngine::check_timeouts`] - retire unanswered probes.
#![warn(clippy::all, clippy::pedantic, clippy::nursery, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::use_self,
    clippy::option_if_let_else,
    clippy::missing_const_for_fn,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
    clippy::cast_precision_loss
)]
#![deny(unsafe_code)]

mod codec;
mod config;
mod constants;
mod engine;
mod error;
mod net;
mod probe;
mod respond;
mod time;
mod types;

pub use codec::{Constructed, NetInfo, PacketCodec, ParsedReply};
pub use config::{defaults, IpVersion, ProbeRequest, Protocol};
pub use constants::{MAX_PORT, MAX_PROBES, MIN_PORT, PACKET_BUFFER_SIZE};
pub use engine::ProbeEngine;
pub use error::{Error, ErrorKind, IoError, IoOperation, IoResult, Result};
pub use net::channel::ProbeChannel;
pub use net::socket::{Socket, SocketError, StreamProtocol};
pub use net::{Ipv4ByteOrder, SocketImpl};
pub use probe::{IcmpResponseType, Probe, ProbeId, ProbeTable};
pub use respond::{CommandResponder, Diagnostic, ProbeReply, Responder};
pub use time::{TimeDelta, Timestamp};
pub use types::{PacketSize, Port, TimeToLive, Token};
