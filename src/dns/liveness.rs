//! Liveness driver (C8): timeout sweeps and retry probes.
//!
//! Two independent ticks drive this, both invoked from the event
//! loop's timer: a frequent `sweep_timeouts` (once per second in the
//! reference configuration) and a slower `retry_probe_sweep` paced by
//! `retry_interval`.

use std::collections::HashMap;
use std::net::SocketAddr;

use mio::{Registry, Token};

use crate::dns::dispatcher::Dispatcher;
use crate::dns::egress::{EgressManager, EgressSocket};
use crate::dns::framing;
use crate::dns::query_table::QueryTable;
use crate::dns::topology::{InterfaceId, Topology};

const PROBE_QNAME: &[u8] = b"localhost";
const QTYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

/// Owns only the incrementing ID counter probes use; everything else
/// it touches lives on the `Daemon`.
pub struct LivenessDriver {
    next_probe_id: u16,
}

impl Default for LivenessDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessDriver {
    pub fn new() -> LivenessDriver {
        LivenessDriver { next_probe_id: 1 }
    }

    fn build_probe_query(&mut self) -> Vec<u8> {
        let id = self.next_probe_id;
        self.next_probe_id = self.next_probe_id.wrapping_add(1).max(1);

        let mut buf = vec![0u8; 12];
        buf[0..2].copy_from_slice(&id.to_be_bytes());
        buf[5] = 1; // QDCOUNT
        buf.push(PROBE_QNAME.len() as u8);
        buf.extend_from_slice(PROBE_QNAME);
        buf.push(0);
        buf.extend_from_slice(&QTYPE_A.to_be_bytes());
        buf.extend_from_slice(&CLASS_IN.to_be_bytes());
        buf
    }

    /// Walk every live record; deliver any owed cached failure, and
    /// deactivate only the server(s) each timed-out record actually
    /// targeted (never a blanket `deactivate_current`). A
    /// `retry_interval` of 0 disables deactivation entirely, matching
    /// C2's own handling of that setting.
    #[allow(clippy::too_many_arguments)]
    pub fn sweep_timeouts(
        &self,
        now: i64,
        retry_interval: i64,
        table: &mut QueryTable,
        topology: &mut Topology,
        egress: &mut EgressManager,
        registry: &Registry,
        sockets: &mut HashMap<Token, EgressSocket>,
    ) -> Vec<(SocketAddr, Vec<u8>)> {
        let outcomes = table.sweep_timeouts(now);
        let mut delivers = Vec::new();

        for outcome in outcomes {
            if retry_interval != 0 {
                if let Some(record) = table.get(outcome.slot) {
                    for server in record.chosen_servers.clone() {
                        let _ = topology.deactivate(server, now);
                    }
                }
            }

            if let Some(delivery) = outcome.deliver {
                delivers.push(delivery);
            }

            if let Some(reclaimed) = table.delete(outcome.slot) {
                for token in reclaimed.egress_sockets {
                    if let Some(socket) = sockets.remove(&token) {
                        egress.close(registry, socket);
                    }
                }
            }
        }

        delivers
    }

    /// For every interface, ask C2 which inactive servers are due for
    /// a retry probe and send one to each.
    #[allow(clippy::too_many_arguments)]
    pub fn retry_probe_sweep(
        &mut self,
        now: i64,
        retry_interval: i64,
        table: &mut QueryTable,
        topology: &mut Topology,
        dispatcher: &Dispatcher,
        egress: &mut EgressManager,
        registry: &Registry,
        sockets: &mut HashMap<Token, EgressSocket>,
    ) {
        if retry_interval == 0 {
            return;
        }

        let interface_ids: Vec<InterfaceId> = topology.interfaces().map(|(id, _)| id).collect();
        for iface_id in interface_ids {
            let due = match topology.retry_sweep(iface_id, retry_interval, now) {
                Ok(due) => due,
                Err(_) => continue,
            };

            for server_id in due {
                let mut buf = self.build_probe_query();
                let slot = match table.add_probe(now, retry_interval) {
                    Ok(slot) => slot,
                    Err(_) => {
                        log::debug!("QID pool exhausted, skipping a liveness probe");
                        continue;
                    }
                };
                let my_qid = table.get(slot).expect("just inserted").my_qid;
                let _ = framing::write_qid(&mut buf, my_qid);

                let sent = dispatcher.dispatch_probe(slot, server_id, &buf, table, topology, egress, registry, sockets);
                if !sent {
                    let _ = table.delete(slot);
                }
            }
        }
    }
}
