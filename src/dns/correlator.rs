//! Receiver / correlator (C7).
//!
//! Called by the event loop whenever a registered egress socket
//! becomes readable. Owns the "last outstanding wins" partial-failure
//! policy: the first successful reply wins immediately, a non-success
//! reply is remembered only until something better arrives or the
//! record's last outstanding send comes back.

use std::collections::HashMap;
use std::net::SocketAddr;

use mio::{Registry, Token};

use crate::dns::cache::ResponseCache;
use crate::dns::egress::{self, EgressManager, EgressSocket};
use crate::dns::framing;
use crate::dns::query_table::{QueryTable, SlotId};
use crate::dns::topology::Topology;

/// Process one datagram received on `token`. Returns the reply to
/// deliver to the client, if this receipt completed one.
#[allow(clippy::too_many_arguments)]
pub fn handle_reply(
    token: Token,
    data: &[u8],
    peer: SocketAddr,
    ingress_ifindex: Option<u32>,
    table: &mut QueryTable,
    topology: &mut Topology,
    egress: &mut EgressManager,
    registry: &Registry,
    sockets: &mut HashMap<Token, EgressSocket>,
    cache: &ResponseCache,
    now: i64,
) -> Option<(SocketAddr, Vec<u8>)> {
    let slot = table.find_by_socket(token)?;

    if framing::check_reply(data).is_err() {
        log::debug!("dropping malformed reply from {}", peer);
        finish_fanout(slot, table, topology, egress, registry, sockets);
        return None;
    }

    reactivate_replying_server(peer, ingress_ifindex, topology);

    let is_probe = table.get(slot).map(|r| r.is_probe).unwrap_or(true);
    if is_probe {
        finish_fanout(slot, table, topology, egress, registry, sockets);
        return None;
    }

    let already_responded = table.get(slot).map(|r| r.client_responded).unwrap_or(true);
    let deliver = if already_responded {
        None
    } else {
        apply_reply_policy(slot, data, table, cache, now)
    };

    finish_fanout(slot, table, topology, egress, registry, sockets);
    deliver
}

/// RCODE==0, or this is the last outstanding send for the record:
/// cache and forward immediately. Otherwise, stash the first failure
/// seen and keep waiting.
fn apply_reply_policy(
    slot: SlotId,
    data: &[u8],
    table: &mut QueryTable,
    cache: &ResponseCache,
    now: i64,
) -> Option<(SocketAddr, Vec<u8>)> {
    let record = table.get(slot)?;
    let is_last_outstanding = record.fanout_pending <= 1;
    let client_qid = record.client_qid;
    let client_addr = record.client_addr;

    if framing::rcode(data).is_success() || is_last_outstanding {
        let mut out = data.to_vec();
        let _ = framing::write_qid(&mut out, client_qid);
        let _ = cache.insert(&out, now);
        if let Some(record) = table.get_mut(slot) {
            record.client_responded = true;
        }
        Some((client_addr, out))
    } else {
        if let Some(record) = table.get_mut(slot) {
            if record.cached_failure.is_none() {
                record.cached_failure = Some(data.to_vec());
            }
        }
        None
    }
}

fn reactivate_replying_server(peer: SocketAddr, ingress_ifindex: Option<u32>, topology: &mut Topology) {
    let SocketAddr::V4(peer_v4) = peer else {
        return;
    };
    let Some(ifindex) = ingress_ifindex else {
        return;
    };
    let Some(iface_name) = egress::ifindex_to_name(ifindex) else {
        return;
    };
    let Some(iface_id) = topology.search_interface(&iface_name) else {
        return;
    };
    if let Some(server_id) = topology.search_server(iface_id, peer_v4) {
        let _ = topology.reactivate(server_id);
    }
}

/// Decrement `fanout_pending`; when it reaches zero, forgive every
/// server this record targeted (§4.7 step 7) and tear the record down,
/// closing and unregistering its egress sockets.
fn finish_fanout(
    slot: SlotId,
    table: &mut QueryTable,
    topology: &mut Topology,
    egress: &mut EgressManager,
    registry: &Registry,
    sockets: &mut HashMap<Token, EgressSocket>,
) {
    let done = match table.get_mut(slot) {
        Some(record) => {
            record.fanout_pending = record.fanout_pending.saturating_sub(1);
            record.fanout_pending == 0
        }
        None => return,
    };
    if !done {
        return;
    }

    if let Some(record) = table.get(slot) {
        for server in record.chosen_servers.clone() {
            let _ = topology.reactivate(server);
        }
    }

    if let Some(reclaimed) = table.delete(slot) {
        for token in reclaimed.egress_sockets {
            if let Some(socket) = sockets.remove(&token) {
                egress.close(registry, socket);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::topology::ServerId;
    use std::net::{IpAddr, Ipv4Addr};

    fn reply(qid: u16, rcode: u8) -> Vec<u8> {
        let mut buf = vec![0u8; 12];
        let q = qid.to_be_bytes();
        buf[0] = q[0];
        buf[1] = q[1];
        buf[2] = 0x80; // QR=1
        buf[3] = rcode & 0x0F;
        buf[5] = 1; // QDCOUNT
        buf
    }

    fn client(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[test]
    fn success_reply_delivers_immediately_even_with_fanout_remaining() {
        let mut table = QueryTable::new();
        let mut topology = Topology::new();
        let mut egress_mgr = EgressManager::new(8, &[]);
        let poll = mio::Poll::new().unwrap();
        let mut sockets: HashMap<Token, EgressSocket> = HashMap::new();
        let cache = ResponseCache::new();

        let mut buf = vec![0u8; 12];
        let (slot, _) = table.add_client(client(5000), crate::dns::framing::Qid(1), &mut buf, 0, 10).unwrap();
        let server = ServerId { interface: topology.add_interface("eth0"), index: 0 };
        table.register_egress(slot, Token(1), server);
        table.register_egress(slot, Token(2), server);
        let my_qid = table.get(slot).unwrap().my_qid;

        let data = reply(my_qid.0, 0);
        let outcome = handle_reply(
            Token(1),
            &data,
            client(53),
            None,
            &mut table,
            &mut topology,
            &mut egress_mgr,
            poll.registry(),
            &mut sockets,
            &cache,
            0,
        );
        assert!(outcome.is_some());
        // record still alive: one more outstanding send
        assert_eq!(table.get(slot).unwrap().fanout_pending, 1);
        assert!(table.get(slot).unwrap().client_responded);
    }

    #[test]
    fn failure_then_success_prefers_the_success() {
        let mut table = QueryTable::new();
        let mut topology = Topology::new();
        let mut egress_mgr = EgressManager::new(8, &[]);
        let poll = mio::Poll::new().unwrap();
        let mut sockets: HashMap<Token, EgressSocket> = HashMap::new();
        let cache = ResponseCache::new();

        let mut buf = vec![0u8; 12];
        let (slot, _) = table.add_client(client(5000), crate::dns::framing::Qid(1), &mut buf, 0, 10).unwrap();
        let server = ServerId { interface: topology.add_interface("eth0"), index: 0 };
        table.register_egress(slot, Token(1), server);
        table.register_egress(slot, Token(2), server);
        let my_qid = table.get(slot).unwrap().my_qid;

        let fail = reply(my_qid.0, 2);
        let first = handle_reply(
            Token(1), &fail, client(53), None, &mut table, &mut topology, &mut egress_mgr,
            poll.registry(), &mut sockets, &cache, 0,
        );
        assert!(first.is_none());
        assert!(!table.get(slot).unwrap().client_responded);
        assert!(table.get(slot).unwrap().cached_failure.is_some());

        let success = reply(my_qid.0, 0);
        let second = handle_reply(
            Token(2), &success, client(53), None, &mut table, &mut topology, &mut egress_mgr,
            poll.registry(), &mut sockets, &cache, 0,
        );
        assert!(second.is_some());
        // record fully resolved and deleted
        assert!(table.get(slot).is_none());
    }

    #[test]
    fn last_outstanding_failure_is_forwarded() {
        let mut table = QueryTable::new();
        let mut topology = Topology::new();
        let mut egress_mgr = EgressManager::new(8, &[]);
        let poll = mio::Poll::new().unwrap();
        let mut sockets: HashMap<Token, EgressSocket> = HashMap::new();
        let cache = ResponseCache::new();

        let mut buf = vec![0u8; 12];
        let (slot, _) = table.add_client(client(5000), crate::dns::framing::Qid(1), &mut buf, 0, 10).unwrap();
        let server = ServerId { interface: topology.add_interface("eth0"), index: 0 };
        table.register_egress(slot, Token(1), server);
        let my_qid = table.get(slot).unwrap().my_qid;

        let fail = reply(my_qid.0, 2);
        let outcome = handle_reply(
            Token(1), &fail, client(53), None, &mut table, &mut topology, &mut egress_mgr,
            poll.registry(), &mut sockets, &cache, 0,
        );
        assert!(outcome.is_some());
        assert!(table.get(slot).is_none());
    }
}
