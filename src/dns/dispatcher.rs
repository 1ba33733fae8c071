//! Upstream/interface selection and send (C6).
//!
//! Candidate interfaces are chosen by precedence (special-host pin,
//! then configured defaults, then every interface) and visited in
//! ring order; each gets at most one egress socket per record, up to
//! [`crate::dns::query_table::QueryRecord::MAX_FANOUT`].

use std::collections::HashMap;
use std::net::SocketAddr;

use mio::{Registry, Token};

use crate::dns::egress::{EgressError, EgressManager, EgressSocket};
use crate::dns::query_table::{QueryTable, SlotId};
use crate::dns::topology::{InterfaceId, ServerId, Topology};

/// Special-host pins and configured default interfaces; immutable
/// after startup.
pub struct Dispatcher {
    /// Lowercased hostname -> interface name.
    special_hosts: HashMap<String, String>,
    default_interfaces: Vec<String>,
}

impl Dispatcher {
    pub fn new(special_hosts: Vec<(String, String)>, default_interfaces: Vec<String>) -> Dispatcher {
        Dispatcher {
            special_hosts: special_hosts
                .into_iter()
                .map(|(name, iface)| (name.to_ascii_lowercase(), iface))
                .collect(),
            default_interfaces,
        }
    }

    fn candidate_interfaces(&self, topology: &Topology, qname: &str) -> Vec<InterfaceId> {
        if let Some(iface_name) = self.special_hosts.get(&qname.to_ascii_lowercase()) {
            if let Some(id) = topology.search_interface(iface_name) {
                return vec![id];
            }
        }
        if !self.default_interfaces.is_empty() {
            return self
                .default_interfaces
                .iter()
                .filter_map(|name| topology.search_interface(name))
                .collect();
        }
        topology.interfaces().map(|(id, _)| id).collect()
    }

    /// Whether the first candidate interface for `qname` would
    /// presently dispatch to a deactivated server, used to implement
    /// `ignore_inactive_cache_hits`.
    pub fn would_hit_deactivated_server(&self, topology: &Topology, qname: &str) -> bool {
        let Some(iface_id) = self.candidate_interfaces(topology, qname).into_iter().next() else {
            return false;
        };
        let Ok(iface) = topology.interface(iface_id) else {
            return false;
        };
        match iface.current_index() {
            Some(index) => iface.servers().get(index).map(|s| !s.is_active()).unwrap_or(false),
            None => false,
        }
    }

    /// Fan a client query out across candidate interfaces, opening and
    /// registering one egress socket per successful send. Returns
    /// whether at least one send succeeded. `sockets` is the daemon's
    /// token -> socket map; entries this call creates are inserted
    /// there for the event loop to later poll and read from.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch_client(
        &self,
        slot: SlotId,
        qname: &str,
        buf: &[u8],
        table: &mut QueryTable,
        topology: &mut Topology,
        egress: &mut EgressManager,
        registry: &Registry,
        sockets: &mut HashMap<Token, EgressSocket>,
        retry_interval: i64,
        now: i64,
    ) -> bool {
        let candidates = self.candidate_interfaces(topology, qname);
        let mut sent_any = false;

        'candidates: for iface_id in candidates {
            let free = table.get(slot).map(QueryRecordFreeSlots::free).unwrap_or(0);
            if free == 0 {
                break;
            }

            loop {
                let server_id = match topology.next_active(iface_id) {
                    Ok(Some(server)) => server,
                    _ => break,
                };

                match self.try_send(slot, server_id, iface_id, buf, table, topology, egress, registry, sockets) {
                    TrySend::Sent => {
                        sent_any = true;
                        break;
                    }
                    TrySend::CeilingExceeded => break 'candidates,
                    TrySend::Failed => {
                        if retry_interval != 0 {
                            let _ = topology.deactivate_current(iface_id, now);
                            continue;
                        }
                        break;
                    }
                }
            }
        }

        sent_any
    }

    /// Send a single, directly-targeted probe (C8). No candidate
    /// selection: the liveness driver already knows which server it
    /// wants to re-check.
    pub fn dispatch_probe(
        &self,
        slot: SlotId,
        server_id: ServerId,
        buf: &[u8],
        table: &mut QueryTable,
        topology: &Topology,
        egress: &mut EgressManager,
        registry: &Registry,
        sockets: &mut HashMap<Token, EgressSocket>,
    ) -> bool {
        matches!(
            self.try_send(
                slot,
                server_id,
                server_id.interface,
                buf,
                table,
                topology,
                egress,
                registry,
                sockets,
            ),
            TrySend::Sent
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn try_send(
        &self,
        slot: SlotId,
        server_id: ServerId,
        iface_id: InterfaceId,
        buf: &[u8],
        table: &mut QueryTable,
        topology: &Topology,
        egress: &mut EgressManager,
        registry: &Registry,
        sockets: &mut HashMap<Token, EgressSocket>,
    ) -> TrySend {
        let server_addr = match topology.server(server_id) {
            Ok(s) => s.addr,
            Err(_) => return TrySend::Failed,
        };
        let iface_name = match topology.interface(iface_id) {
            Ok(i) => i.name.clone(),
            Err(_) => return TrySend::Failed,
        };

        let mut socket = match egress.open(registry) {
            Ok(s) => s,
            Err(EgressError::SocketCeilingExceeded) => return TrySend::CeilingExceeded,
            Err(e) => {
                log::debug!("egress.open failed: {}", e);
                return TrySend::Failed;
            }
        };
        egress.bind_to_interface(&mut socket, &iface_name);

        match egress.send_to(&socket, buf, SocketAddr::V4(server_addr)) {
            Ok(_) => {
                let token = socket.token;
                table.register_egress(slot, token, server_id);
                sockets.insert(token, socket);
                TrySend::Sent
            }
            Err(e) => {
                log::debug!("sendto {} failed: {}", server_addr, e);
                egress.close(registry, socket);
                TrySend::Failed
            }
        }
    }
}

enum TrySend {
    Sent,
    Failed,
    CeilingExceeded,
}

/// Small helper trait so `dispatch_client`'s loop reads naturally;
/// avoids importing `QueryRecord` just for one field access.
trait QueryRecordFreeSlots {
    fn free(&self) -> usize;
}

impl QueryRecordFreeSlots for crate::dns::query_table::QueryRecord {
    fn free(&self) -> usize {
        self.free_fanout_slots()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(o: u8) -> std::net::SocketAddrV4 {
        std::net::SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, o), 53)
    }

    #[test]
    fn special_host_pin_restricts_to_one_interface() {
        let mut topology = Topology::new();
        let eth0 = topology.add_interface("eth0");
        let eth1 = topology.add_interface("eth1");
        topology.add_server(eth0, addr(1)).unwrap();
        topology.add_server(eth1, addr(2)).unwrap();

        let dispatcher = Dispatcher::new(vec![("pinned.test".to_string(), "eth1".to_string())], vec![]);
        let candidates = dispatcher.candidate_interfaces(&topology, "pinned.test");
        assert_eq!(candidates, vec![eth1]);
    }

    #[test]
    fn default_interfaces_used_when_no_pin_matches() {
        let mut topology = Topology::new();
        let eth0 = topology.add_interface("eth0");
        topology.add_interface("eth1");
        topology.add_server(eth0, addr(1)).unwrap();

        let dispatcher = Dispatcher::new(vec![], vec!["eth0".to_string()]);
        let candidates = dispatcher.candidate_interfaces(&topology, "anything.test");
        assert_eq!(candidates, vec![eth0]);
    }

    #[test]
    fn falls_back_to_every_interface_with_no_pin_or_default() {
        let mut topology = Topology::new();
        let eth0 = topology.add_interface("eth0");
        let eth1 = topology.add_interface("eth1");
        topology.add_server(eth0, addr(1)).unwrap();
        topology.add_server(eth1, addr(2)).unwrap();

        let dispatcher = Dispatcher::new(vec![], vec![]);
        let candidates = dispatcher.candidate_interfaces(&topology, "anything.test");
        assert_eq!(candidates.len(), 2);
    }
}
