//! The `Daemon` value tying every component together.
//!
//! Per the single-threaded design, the QID pool, socket-ceiling
//! counter, topology, and query table all live together on one
//! `Daemon` value owned by the event loop thread -- there is no
//! locking anywhere in this module.

use std::collections::HashMap;
use std::net::SocketAddr;

use mio::{Token, net::UdpSocket};

use crate::config::DaemonConfig;
use crate::dns::cache::ResponseCache;
use crate::dns::dispatcher::Dispatcher;
use crate::dns::egress::{EgressManager, EgressSocket};
use crate::dns::errors::{DaemonError, Result};
use crate::dns::liveness::LivenessDriver;
use crate::dns::masterfile::MasterFile;
use crate::dns::query_table::QueryTable;
use crate::dns::topology::Topology;

/// Token reserved for the listening socket; every egress socket gets a
/// token starting at 1 (see [`EgressManager::new`]).
pub const LISTENER_TOKEN: Token = Token(0);

/// Everything the event loop needs, wired up from a [`DaemonConfig`].
pub struct Daemon {
    pub listener: UdpSocket,
    pub bind_address: SocketAddr,
    pub topology: Topology,
    pub query_table: QueryTable,
    pub egress: EgressManager,
    pub sockets: HashMap<Token, EgressSocket>,
    pub cache: ResponseCache,
    pub masterfile: MasterFile,
    pub dispatcher: Dispatcher,
    pub liveness: LivenessDriver,
    pub forward_timeout: i64,
    pub retry_interval: i64,
    pub ignore_inactive_cache_hits: bool,
}

impl Daemon {
    pub fn new(config: &DaemonConfig) -> Result<Daemon> {
        let listener = UdpSocket::bind(config.bind_address).map_err(DaemonError::Io)?;

        let mut topology = Topology::new();
        for spec in &config.servers {
            let iface_id = topology
                .search_interface(&spec.interface)
                .unwrap_or_else(|| topology.add_interface(&spec.interface));
            topology.add_server(iface_id, spec.addr)?;
        }
        // Interfaces named only in --default-interface, with no -s entry
        // of their own, still need to exist so dispatch can find them.
        for name in &config.default_interfaces {
            if topology.search_interface(name).is_none() {
                topology.add_interface(name);
            }
        }
        for host in &config.special_hosts {
            if topology.search_interface(&host.interface).is_none() {
                topology.add_interface(&host.interface);
            }
        }
        topology.set_round_robin_all(config.round_robin);

        let masterfile = match &config.masterfile_path {
            Some(path) => MasterFile::load(path).map_err(DaemonError::Io)?,
            None => MasterFile::empty(),
        };

        let dispatcher = Dispatcher::new(
            config
                .special_hosts
                .iter()
                .map(|h| (h.name.clone(), h.interface.clone()))
                .collect(),
            config.default_interfaces.clone(),
        );

        Ok(Daemon {
            listener,
            bind_address: config.bind_address,
            topology,
            query_table: QueryTable::new(),
            egress: EgressManager::new(config.max_sockets, &config.excluded_ports),
            sockets: HashMap::new(),
            cache: ResponseCache::new(),
            masterfile,
            dispatcher,
            liveness: LivenessDriver::new(),
            forward_timeout: config.forward_timeout,
            retry_interval: config.retry_interval,
            ignore_inactive_cache_hits: config.ignore_inactive_cache_hits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DaemonConfig, ServerSpec};
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn new_daemon_seeds_topology_from_configured_servers() {
        let mut config = DaemonConfig::default();
        config.bind_address = "127.0.0.1:0".parse().unwrap();
        config.servers.push(ServerSpec {
            addr: SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53),
            interface: "eth0".to_string(),
        });

        let daemon = Daemon::new(&config).unwrap();
        let iface = daemon.topology.search_interface("eth0");
        assert!(iface.is_some());
    }

    #[test]
    fn default_interface_with_no_servers_still_gets_created() {
        let mut config = DaemonConfig::default();
        config.bind_address = "127.0.0.1:0".parse().unwrap();
        config.default_interfaces.push("eth9".to_string());

        let daemon = Daemon::new(&config).unwrap();
        assert!(daemon.topology.search_interface("eth9").is_some());
    }
}
