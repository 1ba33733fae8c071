//! Response cache (C9, ambient).
//!
//! A `RwLock` guarding a plain map, looked up and populated from the
//! single event-loop thread today but built behind a lock because a
//! future multi-worker variant would share exactly this piece of
//! state. Stores raw reply buffers rather than decoded records: the
//! core never decodes answer data beyond the question section and
//! RCODE.

use std::collections::HashMap;
use std::sync::RwLock;

use derive_more::{Display, Error};

use crate::dns::framing::{decode_question, min_answer_ttl};

#[derive(Debug, Display, Error)]
#[display(fmt = "response cache lock was poisoned")]
pub struct CacheError;

type Result<T> = std::result::Result<T, CacheError>;

/// Key: lowercased QNAME, QTYPE, QCLASS.
type CacheKey = (String, u16, u16);

struct CacheEntry {
    buf: Vec<u8>,
    expires_at: i64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<CacheKey, CacheEntry>,
}

/// TTL floor so a record with an advertised TTL of 0 is still usable
/// for the instant it's looked up rather than treated as already
/// expired.
const MIN_TTL_SECS: i64 = 1;

pub struct ResponseCache {
    inner: RwLock<Inner>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseCache {
    pub fn new() -> ResponseCache {
        ResponseCache {
            inner: RwLock::new(Inner::default()),
        }
    }

    fn key_for(buf: &[u8]) -> Result<CacheKey> {
        let question = decode_question(buf, 12).map_err(|_| CacheError)?;
        Ok((question.name.to_ascii_lowercase(), question.qtype, question.qclass))
    }

    /// Look up a cached reply for the question `query_buf` carries.
    /// Expired entries are evicted lazily on lookup.
    pub fn lookup(&self, query_buf: &[u8], now: i64) -> Result<Option<Vec<u8>>> {
        let key = match Self::key_for(query_buf) {
            Ok(k) => k,
            Err(_) => return Ok(None),
        };
        let mut inner = self.inner.write().map_err(|_| CacheError)?;
        match inner.entries.get(&key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.buf.clone())),
            Some(_) => {
                inner.entries.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Insert a successful reply, keyed on its own question section.
    /// Expiry is the minimum TTL among its answer records (floor of
    /// [`MIN_TTL_SECS`]); a reply with no answers is not cached.
    pub fn insert(&self, reply_buf: &[u8], now: i64) -> Result<()> {
        let key = match Self::key_for(reply_buf) {
            Ok(k) => k,
            Err(_) => return Ok(()),
        };
        let ttl = match min_answer_ttl(reply_buf) {
            Ok(Some(ttl)) => ttl,
            Ok(None) => return Ok(()),
            Err(_) => return Ok(()),
        };
        let expires_at = now + (ttl as i64).max(MIN_TTL_SECS);
        let mut inner = self.inner.write().map_err(|_| CacheError)?;
        inner.entries.retain(|_, e| e.expires_at > now);
        inner.entries.insert(
            key,
            CacheEntry {
                buf: reply_buf.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(qr: bool, ancount: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 12];
        buf[2] = if qr { 0x80 } else { 0x00 };
        buf[5] = 1; // QDCOUNT = 1
        let a = ancount.to_be_bytes();
        buf[6] = a[0];
        buf[7] = a[1];
        buf
    }

    fn question(buf: &mut Vec<u8>, name: &str) {
        for label in name.split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
    }

    fn reply_with_answer(name: &str, ttl: u32) -> Vec<u8> {
        let mut buf = header(true, 1);
        question(&mut buf, name);
        buf.push(0xC0);
        buf.push(12);
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&ttl.to_be_bytes());
        buf.extend_from_slice(&4u16.to_be_bytes());
        buf.extend_from_slice(&[127, 0, 0, 1]);
        buf
    }

    fn query(name: &str) -> Vec<u8> {
        let mut buf = header(false, 0);
        question(&mut buf, name);
        buf
    }

    #[test]
    fn insert_then_lookup_hits_before_expiry() {
        let cache = ResponseCache::new();
        let reply = reply_with_answer("example.com", 300);
        cache.insert(&reply, 1_000).unwrap();

        let q = query("example.com");
        let hit = cache.lookup(&q, 1_100).unwrap();
        assert_eq!(hit, Some(reply));
    }

    #[test]
    fn lookup_is_case_insensitive_on_qname() {
        let cache = ResponseCache::new();
        let reply = reply_with_answer("Example.COM", 300);
        cache.insert(&reply, 0).unwrap();
        let q = query("example.com");
        assert!(cache.lookup(&q, 1).unwrap().is_some());
    }

    #[test]
    fn expired_entry_is_evicted_on_lookup() {
        let cache = ResponseCache::new();
        let reply = reply_with_answer("example.com", 10);
        cache.insert(&reply, 0).unwrap();
        assert_eq!(cache.len(), 1);

        let q = query("example.com");
        let hit = cache.lookup(&q, 1_000).unwrap();
        assert_eq!(hit, None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn reply_with_no_answers_is_not_cached() {
        let cache = ResponseCache::new();
        let mut reply = header(true, 0);
        question(&mut reply, "example.com");
        cache.insert(&reply, 0).unwrap();
        assert_eq!(cache.len(), 0);
    }
}
