//! Optional authoritative "don't know" / blacklist responder (ambient).
//!
//! A narrow stand-in for a general zone server: a flat `name ->
//! verdict` table loaded once at startup. When the dispatcher cannot
//! reach any upstream for a query, it asks `master_dontknow` for a
//! synthetic reply before giving up on the client entirely.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::dns::framing::{self, decode_qname, Rcode};

const SYNTHETIC_TTL: u32 = 300;

#[derive(Debug, Clone, Copy)]
enum Verdict {
    Block,
    Address(Ipv4Addr),
}

/// Loaded once at startup; `None` when no file was configured, in
/// which case `master_dontknow` always returns `None`.
#[derive(Default)]
pub struct MasterFile {
    entries: HashMap<String, Verdict>,
}

impl MasterFile {
    pub fn empty() -> MasterFile {
        MasterFile::default()
    }

    /// Parse a text file of `name BLOCK` or `name A.B.C.D` lines, one
    /// entry per line; blank lines and lines starting with `#` are
    /// ignored.
    pub fn load(path: &Path) -> io::Result<MasterFile> {
        let text = fs::read_to_string(path)?;
        let mut entries = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(name), Some(verdict)) = (parts.next(), parts.next()) else {
                continue;
            };
            let verdict = if verdict.eq_ignore_ascii_case("BLOCK") {
                Verdict::Block
            } else {
                match verdict.parse::<Ipv4Addr>() {
                    Ok(addr) => Verdict::Address(addr),
                    Err(_) => {
                        log::warn!("masterfile: ignoring unparseable entry {:?}", line);
                        continue;
                    }
                }
            };
            entries.insert(name.to_ascii_lowercase(), verdict);
        }
        log::info!("masterfile: loaded {} entries from {:?}", entries.len(), path);
        Ok(MasterFile { entries })
    }

    /// Build a synthetic reply for `query_buf`'s question, if this
    /// table has a matching entry. Never sends anything itself -- the
    /// caller is responsible for delivering the reply (§9 Open
    /// Questions: "return the synthetic reply to the caller; never
    /// send directly from within the collaborator").
    pub fn master_dontknow(&self, query_buf: &[u8]) -> Option<Vec<u8>> {
        let name = decode_qname(query_buf, 12).ok()?;
        let verdict = self.entries.get(&name.to_ascii_lowercase())?;

        let mut reply = query_buf.to_vec();
        match verdict {
            Verdict::Block => {
                framing::make_reply(&mut reply, Rcode(3) /* NXDOMAIN */).ok()?;
            }
            Verdict::Address(addr) => {
                framing::make_reply(&mut reply, Rcode::NOERROR).ok()?;
                framing::set_ancount(&mut reply, 1).ok()?;
                reply.push(0xC0);
                reply.push(12); // pointer back to the question's name
                reply.extend_from_slice(&1u16.to_be_bytes()); // TYPE A
                reply.extend_from_slice(&1u16.to_be_bytes()); // CLASS IN
                reply.extend_from_slice(&SYNTHETIC_TTL.to_be_bytes());
                reply.extend_from_slice(&4u16.to_be_bytes());
                reply.extend_from_slice(&addr.octets());
            }
        }
        Some(reply)
    }
}
