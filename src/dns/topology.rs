//! Upstream topology: interfaces and their server rings (C2).
//!
//! The source models this as two circular intrusive lists with
//! sentinel heads. Per §9's REDESIGN FLAGS this is instead an arena of
//! `Interface`s, each owning a plain `Vec<Server>`; "ring" iteration is
//! simulated with modular arithmetic over that vector rather than
//! pointer-chasing, which removes the aliasing hazards of the original
//! structure while preserving the "every node visited exactly once"
//! invariant.

use std::net::SocketAddrV4;

use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum TopologyError {
    #[display(fmt = "unknown interface")]
    UnknownInterface,
    #[display(fmt = "unknown server")]
    UnknownServer,
    #[display(fmt = "an interface must have at least one server")]
    EmptyInterface,
}

type Result<T> = std::result::Result<T, TopologyError>;

/// Index of an [`Interface`] within a [`Topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceId(pub usize);

/// Index of a [`Server`] within its interface's ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServerId {
    pub interface: InterfaceId,
    pub index: usize,
}

/// One upstream server. Two servers with the same IP on different
/// interfaces are distinct entries -- identity is positional
/// (`ServerId`), never the address alone.
#[derive(Debug, Clone)]
pub struct Server {
    pub addr: SocketAddrV4,
    /// 0 means active; otherwise the unix time the server was
    /// deactivated.
    pub inactive_since: i64,
    /// 0 means no outstanding liveness probe.
    pub send_time: i64,
    pub send_count: u64,
}

impl Server {
    fn new(addr: SocketAddrV4) -> Server {
        Server {
            addr,
            inactive_since: 0,
            send_time: 0,
            send_count: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.inactive_since == 0
    }
}

/// One egress interface and its ring of upstream servers.
pub struct Interface {
    pub name: String,
    servers: Vec<Server>,
    /// Index into `servers` of the presently selected upstream.
    current: Option<usize>,
    /// Accepted from configuration; has no effect on selection order
    /// in this implementation (§9 Open Questions).
    pub round_robin: bool,
}

impl Interface {
    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }
}

#[derive(Default)]
pub struct Topology {
    interfaces: Vec<Interface>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology {
            interfaces: Vec::new(),
        }
    }

    pub fn interfaces(&self) -> impl Iterator<Item = (InterfaceId, &Interface)> {
        self.interfaces
            .iter()
            .enumerate()
            .map(|(i, iface)| (InterfaceId(i), iface))
    }

    /// Create an interface if it does not already exist; return its id
    /// either way.
    pub fn add_interface(&mut self, name: &str) -> InterfaceId {
        if let Some(id) = self.search_interface(name) {
            return id;
        }
        self.interfaces.push(Interface {
            name: name.to_string(),
            servers: Vec::new(),
            current: None,
            round_robin: false,
        });
        InterfaceId(self.interfaces.len() - 1)
    }

    pub fn search_interface(&self, name: &str) -> Option<InterfaceId> {
        self.interfaces
            .iter()
            .position(|iface| iface.name == name)
            .map(InterfaceId)
    }

    pub fn interface(&self, id: InterfaceId) -> Result<&Interface> {
        self.interfaces.get(id.0).ok_or(TopologyError::UnknownInterface)
    }

    fn interface_mut(&mut self, id: InterfaceId) -> Result<&mut Interface> {
        self.interfaces
            .get_mut(id.0)
            .ok_or(TopologyError::UnknownInterface)
    }

    /// Append a server to the interface's ring. The newly appended
    /// server becomes `current` if the ring was previously empty.
    pub fn add_server(&mut self, id: InterfaceId, addr: SocketAddrV4) -> Result<ServerId> {
        let iface = self.interface_mut(id)?;
        iface.servers.push(Server::new(addr));
        let index = iface.servers.len() - 1;
        if iface.current.is_none() {
            iface.current = Some(index);
        }
        Ok(ServerId { interface: id, index })
    }

    pub fn search_server(&self, id: InterfaceId, addr: SocketAddrV4) -> Option<ServerId> {
        let iface = self.interfaces.get(id.0)?;
        iface
            .servers
            .iter()
            .position(|s| s.addr == addr)
            .map(|index| ServerId { interface: id, index })
    }

    pub fn server(&self, id: ServerId) -> Result<&Server> {
        self.interfaces
            .get(id.interface.0)
            .and_then(|iface| iface.servers.get(id.index))
            .ok_or(TopologyError::UnknownServer)
    }

    fn server_mut(&mut self, id: ServerId) -> Result<&mut Server> {
        self.interfaces
            .get_mut(id.interface.0)
            .and_then(|iface| iface.servers.get_mut(id.index))
            .ok_or(TopologyError::UnknownServer)
    }

    /// Starting from `current` (or the ring head if unset), return the
    /// next server whose `inactive_since` is 0, advancing strictly in
    /// ring order. Visits every server at most once; returns `None`
    /// rather than looping forever if all are inactive.
    pub fn next_active(&self, id: InterfaceId) -> Result<Option<ServerId>> {
        let iface = self.interface(id)?;
        if iface.servers.is_empty() {
            return Err(TopologyError::EmptyInterface);
        }
        let len = iface.servers.len();
        let start = iface.current.unwrap_or(0);
        for step in 0..len {
            let idx = (start + step) % len;
            if iface.servers[idx].is_active() {
                return Ok(Some(ServerId { interface: id, index: idx }));
            }
        }
        Ok(None)
    }

    /// Mark the current server inactive and advance `current` to the
    /// next active one (or leave it pointed at the same, now-inactive,
    /// slot if none remain -- `next_active` will then correctly report
    /// `None`). Idempotent: deactivating an already-inactive server
    /// just re-stamps the timestamp.
    pub fn deactivate_current(&mut self, id: InterfaceId, now: i64) -> Result<Option<ServerId>> {
        let current_idx = {
            let iface = self.interface(id)?;
            match iface.current {
                Some(idx) => idx,
                None => return Ok(None),
            }
        };
        {
            let iface = self.interface_mut(id)?;
            iface.servers[current_idx].inactive_since = now;
        }
        let next = self.next_active(id)?;
        let iface = self.interface_mut(id)?;
        iface.current = next.map(|s| s.index).or(Some(current_idx));
        Ok(next)
    }

    /// Deactivate a specific server directly, regardless of whether it
    /// is presently its interface's `current` -- used by the liveness
    /// driver to penalize only the server(s) a timed-out query
    /// actually targeted (§4.8), not whatever happens to be current
    /// now. If `id` was current, `current` advances the same way
    /// [`Topology::deactivate_current`] does.
    pub fn deactivate(&mut self, id: ServerId, now: i64) -> Result<()> {
        {
            let iface = self.interface_mut(id.interface)?;
            if id.index >= iface.servers.len() {
                return Err(TopologyError::UnknownServer);
            }
            iface.servers[id.index].inactive_since = now;
        }
        let was_current = self.interface(id.interface)?.current == Some(id.index);
        if was_current {
            let next = self.next_active(id.interface)?;
            let iface = self.interface_mut(id.interface)?;
            iface.current = next.map(|s| s.index).or(Some(id.index));
        }
        Ok(())
    }

    /// Clear a server's inactive/probe state, e.g. on any reply
    /// received from it.
    pub fn reactivate(&mut self, id: ServerId) -> Result<()> {
        let server = self.server_mut(id)?;
        server.inactive_since = 0;
        server.send_time = 0;
        Ok(())
    }

    /// For every inactive server on `interface` whose deactivation is
    /// older than `delay` seconds, refresh its timestamp and return it
    /// so the caller (C8) can enqueue a liveness probe.
    pub fn retry_sweep(&mut self, id: InterfaceId, delay: i64, now: i64) -> Result<Vec<ServerId>> {
        if delay == 0 {
            // retry_interval == 0 disables deactivation entirely (§8);
            // nothing to sweep.
            return Ok(Vec::new());
        }
        let iface = self.interface_mut(id)?;
        let mut due = Vec::new();
        for (index, server) in iface.servers.iter_mut().enumerate() {
            if server.inactive_since != 0 && now - server.inactive_since >= delay {
                server.inactive_since = now;
                due.push(ServerId { interface: id, index });
            }
        }
        Ok(due)
    }

    /// Store the configured round-robin flag on every interface. Has
    /// no effect on `next_active`'s selection order (§9 Open
    /// Questions); accepted and stored only for configuration-surface
    /// completeness.
    pub fn set_round_robin_all(&mut self, round_robin: bool) {
        for iface in &mut self.interfaces {
            iface.round_robin = round_robin;
        }
    }
}
