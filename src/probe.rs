use crate::constants::{MAX_PORT, MAX_PROBES, MIN_PORT};
use crate::time::Timestamp;
use crate::types::{Port, Token};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// The type of response which completed a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpResponseType {
    /// `TimeExceeded` packet: an intermediate hop dropped the probe.
    TimeExceeded,
    /// `EchoReply` packet, or a stream connect outcome proving the probe
    /// reached the destination host.
    EchoReply,
    /// `DestinationUnreachable` packet.
    DestinationUnreachable,
}

/// A single outstanding probe.
///
/// A probe is created when a command is dispatched and lives until a
/// response is correlated to it, a send error is reported, or its timeout
/// expires.  Stream probes additionally own the non-blocking socket whose
/// connect outcome stands in for an ICMP response; the socket is closed when
/// the slot is freed.
pub struct Probe<S> {
    /// The command token the result line will be keyed with.
    pub token: Token,
    /// The transient port identifying this probe in packet fields.
    pub port: Port,
    /// The destination.
    pub remote_addr: SocketAddr,
    /// Captured immediately before the packet is sent.
    pub departure_time: Timestamp,
    /// `departure_time` plus the command timeout.
    pub timeout_time: Timestamp,
    pub(crate) stream_socket: Option<S>,
}

impl<S> Probe<S> {
    fn new(token: Token, port: Port) -> Self {
        Self {
            token,
            port,
            remote_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            departure_time: Timestamp::default(),
            timeout_time: Timestamp::default(),
            stream_socket: None,
        }
    }

    /// Returns true if this probe tests reachability via a connected stream
    /// socket.
    #[must_use]
    pub const fn has_stream_socket(&self) -> bool {
        self.stream_socket.is_some()
    }
}

/// Identifies a slot in the [`ProbeTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeId(usize);

/// A fixed-capacity table of outstanding probes.
///
/// Slots are allocated first-free and each allocation is assigned the next
/// port from a monotonically advancing allocator which wraps from
/// [`MAX_PORT`] back to [`MIN_PORT`].  The allocator does not scan for port
/// reuse: the range is far larger than the table so a collision would
/// require a probe to stay outstanding across a full wrap of the range.
pub struct ProbeTable<S> {
    slots: Vec<Option<Probe<S>>>,
    next_port: u16,
}

impl<S> ProbeTable<S> {
    #[must_use]
    pub fn new() -> Self {
        let mut slots = Vec::new();
        slots.resize_with(MAX_PROBES, || None);
        Self {
            slots,
            next_port: MIN_PORT,
        }
    }

    /// Allocate a probe slot, or `None` if all slots are in use.
    pub fn allocate(&mut self, token: Token) -> Option<ProbeId> {
        let index = self.slots.iter().position(Option::is_none)?;
        let port = Port(self.next_port);
        self.next_port = if self.next_port >= MAX_PORT {
            MIN_PORT
        } else {
            self.next_port + 1
        };
        self.slots[index] = Some(Probe::new(token, port));
        Some(ProbeId(index))
    }

    /// Free a probe slot, returning the probe.
    ///
    /// Dropping the returned probe closes its stream socket, if any.
    pub fn free(&mut self, id: ProbeId) -> Option<Probe<S>> {
        self.slots[id.0].take()
    }

    #[must_use]
    pub fn get(&self, id: ProbeId) -> Option<&Probe<S>> {
        self.slots[id.0].as_ref()
    }

    pub fn get_mut(&mut self, id: ProbeId) -> Option<&mut Probe<S>> {
        self.slots[id.0].as_mut()
    }

    /// Find the outstanding probe keyed by `port`, if any.
    #[must_use]
    pub fn find_by_port(&self, port: Port) -> Option<ProbeId> {
        self.iter()
            .find_map(|(id, probe)| (probe.port == port).then_some(id))
    }

    /// Iterate over the outstanding probes.
    pub fn iter(&self) -> impl Iterator<Item = (ProbeId, &Probe<S>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|probe| (ProbeId(index), probe)))
    }

    /// The ids of all outstanding probes.
    #[must_use]
    pub fn ids(&self) -> Vec<ProbeId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// The number of outstanding probes.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

impl<S> Default for ProbeTable<S> {
    fn default() -> Self {
        Self::new()
    }
}
