//! The outstanding-query table (C4).
//!
//! Per §9's REDESIGN FLAGS this is an arena (`Vec<Option<QueryRecord>>`)
//! with free-list reuse rather than an intrusive linked list; the
//! "find the record for this socket" lookup the original did by
//! scanning the list is instead a direct `Token -> SlotId` map.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};

use mio::Token;

use crate::dns::framing::{write_qid, Qid};
use crate::dns::qid::{QidPool, QidPoolExhausted};
use crate::dns::topology::ServerId;

/// Handle to a live [`QueryRecord`]. Stable across table mutations
/// until the record is deleted; indices are reused after deletion, so
/// a stale `SlotId` must never be held across a `delete` call for the
/// same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

/// A single outstanding query: either a real client query or a
/// synthetic liveness probe (`is_probe`).
pub struct QueryRecord {
    pub my_qid: Qid,
    pub client_qid: Qid,
    pub client_addr: SocketAddr,
    pub client_time: i64,
    pub client_count: u32,
    pub ttl: i64,
    pub is_probe: bool,
    /// One entry per egress socket this record has dispatched on, in
    /// the order they were sent. At most 3 for a client query, at
    /// most 1 for a probe.
    pub egress_sockets: Vec<Token>,
    /// Parallel to `egress_sockets`: which server each socket targets.
    pub chosen_servers: Vec<ServerId>,
    pub fanout_pending: u32,
    pub client_responded: bool,
    pub cached_failure: Option<Vec<u8>>,
}

impl QueryRecord {
    /// Maximum simultaneous egress sockets a single client query may
    /// hold (the fan-out width).
    pub const MAX_FANOUT: usize = 3;

    fn new_client(my_qid: Qid, client_qid: Qid, client_addr: SocketAddr, now: i64, ttl: i64) -> QueryRecord {
        QueryRecord {
            my_qid,
            client_qid,
            client_addr,
            client_time: now,
            client_count: 1,
            ttl,
            is_probe: false,
            egress_sockets: Vec::with_capacity(Self::MAX_FANOUT),
            chosen_servers: Vec::with_capacity(Self::MAX_FANOUT),
            fanout_pending: 0,
            client_responded: false,
            cached_failure: None,
        }
    }

    fn new_probe(my_qid: Qid, now: i64, ttl: i64) -> QueryRecord {
        let placeholder: SocketAddr = SocketAddr::V4(SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0));
        QueryRecord {
            my_qid,
            client_qid: Qid(0),
            client_addr: placeholder,
            client_time: now,
            client_count: 1,
            ttl,
            is_probe: true,
            egress_sockets: Vec::with_capacity(1),
            chosen_servers: Vec::with_capacity(1),
            fanout_pending: 0,
            client_responded: false,
            cached_failure: None,
        }
    }

    /// Remaining egress socket slots this record may still open.
    pub fn free_fanout_slots(&self) -> usize {
        let cap = if self.is_probe { 1 } else { Self::MAX_FANOUT };
        cap.saturating_sub(self.egress_sockets.len())
    }
}

/// A timed-out record, with an optional final delivery the caller
/// must send to the client before deleting the slot.
pub struct TimeoutOutcome {
    pub slot: SlotId,
    pub deliver: Option<(SocketAddr, Vec<u8>)>,
}

/// The removed record's resources, returned so the caller (which owns
/// the egress socket manager and the socket-ceiling counter) can close
/// sockets and reclaim accounting.
pub struct Reclaimed {
    pub my_qid: Qid,
    pub egress_sockets: Vec<Token>,
}

#[derive(Default)]
pub struct QueryTable {
    slots: Vec<Option<QueryRecord>>,
    free: Vec<usize>,
    qids: QidPool,
    by_client: HashMap<(SocketAddr, Qid), SlotId>,
    by_token: HashMap<Token, SlotId>,
}

impl QueryTable {
    pub fn new() -> QueryTable {
        QueryTable {
            slots: Vec::new(),
            free: Vec::new(),
            qids: QidPool::new(),
            by_client: HashMap::new(),
            by_token: HashMap::new(),
        }
    }

    fn insert(&mut self, record: QueryRecord) -> SlotId {
        if let Some(index) = self.free.pop() {
            self.slots[index] = Some(record);
            SlotId(index)
        } else {
            self.slots.push(Some(record));
            SlotId(self.slots.len() - 1)
        }
    }

    /// Coalesce onto an existing record for `(client_addr,
    /// client_qid)`, or allocate a new one. `buf[0..2]` is rewritten in
    /// place with the record's `my_qid` either way. Returns the slot
    /// and whether a new record was created.
    pub fn add_client(
        &mut self,
        client_addr: SocketAddr,
        client_qid: Qid,
        buf: &mut [u8],
        now: i64,
        forward_timeout: i64,
    ) -> Result<(SlotId, bool), QidPoolExhausted> {
        if let Some(&slot) = self.by_client.get(&(client_addr, client_qid)) {
            let record = self.slots[slot.0].as_mut().expect("indexed slot must be live");
            record.client_time = now;
            record.client_count += 1;
            let _ = write_qid(buf, record.my_qid);
            return Ok((slot, false));
        }

        let my_qid = self.qids.get()?;
        let record = QueryRecord::new_client(my_qid, client_qid, client_addr, now, forward_timeout);
        let _ = write_qid(buf, my_qid);
        let slot = self.insert(record);
        self.by_client.insert((client_addr, client_qid), slot);
        Ok((slot, true))
    }

    /// Allocate a synthetic liveness-probe record. Probes are never
    /// indexed by `(client_addr, client_qid)` since nothing ever
    /// resends one.
    pub fn add_probe(&mut self, now: i64, retry_interval: i64) -> Result<SlotId, QidPoolExhausted> {
        let my_qid = self.qids.get()?;
        let record = QueryRecord::new_probe(my_qid, now, retry_interval);
        Ok(self.insert(record))
    }

    /// Record that `token` was sent on behalf of `slot`, targeting
    /// `server`. Called by the dispatcher immediately after a
    /// successful `sendto`.
    pub fn register_egress(&mut self, slot: SlotId, token: Token, server: ServerId) {
        if let Some(record) = self.slots[slot.0].as_mut() {
            record.egress_sockets.push(token);
            record.chosen_servers.push(server);
            record.fanout_pending += 1;
            self.by_token.insert(token, slot);
        }
    }

    pub fn get(&self, slot: SlotId) -> Option<&QueryRecord> {
        self.slots.get(slot.0).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut QueryRecord> {
        self.slots.get_mut(slot.0).and_then(|s| s.as_mut())
    }

    pub fn find_by_socket(&self, token: Token) -> Option<SlotId> {
        self.by_token.get(&token).copied()
    }

    /// Remove a record, release its QID, and return its egress tokens
    /// so the caller can unregister/close the corresponding sockets.
    pub fn delete(&mut self, slot: SlotId) -> Option<Reclaimed> {
        let record = self.slots.get_mut(slot.0)?.take()?;
        self.free.push(slot.0);
        self.by_client.remove(&(record.client_addr, record.client_qid));
        for token in &record.egress_sockets {
            self.by_token.remove(token);
        }
        self.qids.release(record.my_qid);
        Some(Reclaimed {
            my_qid: record.my_qid,
            egress_sockets: record.egress_sockets,
        })
    }

    /// Walk every live record; for each whose `client_time + ttl <
    /// now`, prepare a cached-failure delivery if one is owed and due
    /// for removal. Does not itself delete or send -- the caller does
    /// both, then calls `delete` for each returned slot.
    pub fn sweep_timeouts(&mut self, now: i64) -> Vec<TimeoutOutcome> {
        let mut outcomes = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(record) = slot else { continue };
            if record.client_time + record.ttl >= now {
                continue;
            }
            let deliver = if !record.client_responded {
                record.cached_failure.take().map(|mut buf| {
                    let _ = write_qid(&mut buf, record.client_qid);
                    (record.client_addr, buf)
                })
            } else {
                None
            };
            outcomes.push(TimeoutOutcome { slot: SlotId(index), deliver });
        }
        outcomes
    }

    pub fn available_qids(&self) -> usize {
        self.qids.available_count()
    }

    #[cfg(test)]
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn client(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn query_buf(qid: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 12];
        let b = qid.to_be_bytes();
        buf[0] = b[0];
        buf[1] = b[1];
        buf
    }

    #[test]
    fn resend_with_same_client_and_qid_coalesces() {
        let mut table = QueryTable::new();
        let mut buf1 = query_buf(0x0042);
        let (slot1, created1) = table.add_client(client(5000), Qid(0x0042), &mut buf1, 0, 10).unwrap();
        assert!(created1);

        let mut buf2 = query_buf(0x0042);
        let (slot2, created2) = table.add_client(client(5000), Qid(0x0042), &mut buf2, 1, 10).unwrap();
        assert!(!created2);
        assert_eq!(slot1, slot2);
        assert_eq!(table.get(slot1).unwrap().client_count, 2);
        // both buffers were rewritten to the same my_qid
        assert_eq!(&buf1[0..2], &buf2[0..2]);
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn different_clients_same_qid_do_not_coalesce() {
        let mut table = QueryTable::new();
        let mut buf1 = query_buf(7);
        let (slot1, _) = table.add_client(client(5000), Qid(7), &mut buf1, 0, 10).unwrap();
        let mut buf2 = query_buf(7);
        let (slot2, created) = table.add_client(client(5001), Qid(7), &mut buf2, 0, 10).unwrap();
        assert!(created);
        assert_ne!(slot1, slot2);
    }

    #[test]
    fn delete_releases_qid_and_unlinks_indices() {
        let mut table = QueryTable::new();
        let mut buf = query_buf(1);
        let (slot, _) = table.add_client(client(5000), Qid(1), &mut buf, 0, 10).unwrap();
        let before = table.available_qids();
        table.delete(slot).unwrap();
        assert_eq!(table.available_qids(), before + 1);
        assert_eq!(table.live_count(), 0);
        // the slot is reusable
        let mut buf2 = query_buf(2);
        let (_slot2, created) = table.add_client(client(5002), Qid(2), &mut buf2, 0, 10).unwrap();
        assert!(created);
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn sweep_timeouts_forwards_cached_failure_once() {
        let mut table = QueryTable::new();
        let mut buf = query_buf(9);
        let (slot, _) = table.add_client(client(5000), Qid(9), &mut buf, 0, 5).unwrap();
        table.get_mut(slot).unwrap().cached_failure = Some(vec![0u8; 12]);

        let outcomes = table.sweep_timeouts(100);
        assert_eq!(outcomes.len(), 1);
        let (addr, delivered) = outcomes[0].deliver.as_ref().unwrap();
        assert_eq!(*addr, client(5000));
        assert_eq!(&delivered[0..2], &9u16.to_be_bytes());
    }

    #[test]
    fn sweep_timeouts_skips_already_responded_records() {
        let mut table = QueryTable::new();
        let mut buf = query_buf(9);
        let (slot, _) = table.add_client(client(5000), Qid(9), &mut buf, 0, 5).unwrap();
        {
            let record = table.get_mut(slot).unwrap();
            record.cached_failure = Some(vec![0u8; 12]);
            record.client_responded = true;
        }
        let outcomes = table.sweep_timeouts(100);
        assert!(outcomes[0].deliver.is_none());
    }
}
