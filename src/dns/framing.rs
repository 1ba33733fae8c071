//! Byte-level DNS header and QID access.
//!
//! This module owns every byte-level touch of a raw DNS message so the
//! rest of the core works in terms of [`Qid`] and [`Rcode`] rather than
//! indexing into a buffer directly (see DESIGN.md's framing entry).
//!
//! Only the header and the single question are decoded: this is a
//! forwarding proxy, not a validating resolver, so answer records are
//! never parsed, only counted and passed through verbatim.

use derive_more::{Display, Error, From};

/// Maximum DNS message size this core will ever read or write (RFC 1035,
/// no EDNS0).
pub const MAX_MESSAGE_LEN: usize = 512;

const HEADER_LEN: usize = 12;
const QDCOUNT_OFFSET: usize = 4;
const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 255;
const MAX_POINTER_HOPS: usize = 32;

#[derive(Debug, Display, From, Error)]
pub enum FramingError {
    #[display(fmt = "packet shorter than a DNS header")]
    TooShort,
    #[display(fmt = "query packet has QR=1 or QDCOUNT != 1")]
    NotAQuery,
    #[display(fmt = "reply packet has QR=0 or QDCOUNT != 1")]
    NotAReply,
    #[display(fmt = "qname label or pointer chain malformed")]
    MalformedName,
    #[display(fmt = "qname exceeds {} bytes", MAX_NAME_LEN)]
    NameTooLong,
}

type Result<T> = std::result::Result<T, FramingError>;

/// The 16-bit DNS transaction ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Qid(pub u16);

/// The 4-bit RCODE field. `Rcode::NOERROR` (0) is the only "successful"
/// value; every other value is treated as a failure worth remembering
/// but not necessarily forwarding immediately (see the correlator's
/// last-outstanding rule).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rcode(pub u8);

impl Rcode {
    pub const NOERROR: Rcode = Rcode(0);

    pub fn is_success(self) -> bool {
        self.0 == 0
    }
}

/// Read the QID from bytes 0-1, network byte order.
pub fn read_qid(buf: &[u8]) -> Result<Qid> {
    if buf.len() < 2 {
        return Err(FramingError::TooShort);
    }
    Ok(Qid(u16::from_be_bytes([buf[0], buf[1]])))
}

/// Overwrite the QID in bytes 0-1 in place.
pub fn write_qid(buf: &mut [u8], qid: Qid) -> Result<()> {
    if buf.len() < 2 {
        return Err(FramingError::TooShort);
    }
    let bytes = qid.0.to_be_bytes();
    buf[0] = bytes[0];
    buf[1] = bytes[1];
    Ok(())
}

fn qr_bit(buf: &[u8]) -> bool {
    // Flags occupy bytes 2-3; QR is the high bit of byte 2.
    buf[2] & 0x80 != 0
}

fn qdcount(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[QDCOUNT_OFFSET], buf[QDCOUNT_OFFSET + 1]])
}

/// Validate a datagram received on the listening socket: minimum
/// length, QR=0, QDCOUNT=1.
pub fn check_query(buf: &[u8]) -> Result<()> {
    if buf.len() < HEADER_LEN {
        return Err(FramingError::TooShort);
    }
    if qr_bit(buf) || qdcount(buf) != 1 {
        return Err(FramingError::NotAQuery);
    }
    Ok(())
}

/// Validate a datagram received from an upstream: QR=1, QDCOUNT=1.
/// ANCOUNT is read but not bounds-checked against the buffer, since the
/// core never walks the answer section.
pub fn check_reply(buf: &[u8]) -> Result<()> {
    if buf.len() < HEADER_LEN {
        return Err(FramingError::TooShort);
    }
    if !qr_bit(buf) || qdcount(buf) != 1 {
        return Err(FramingError::NotAReply);
    }
    Ok(())
}

/// The 4-bit RCODE from the second flags byte.
pub fn rcode(buf: &[u8]) -> Rcode {
    Rcode(buf[3] & 0x0F)
}

/// Decode the (possibly compressed) QNAME starting at `offset`, which is
/// always 12 for a freshly received query. Returns the printable,
/// dot-joined name.
pub fn decode_qname(buf: &[u8], offset: usize) -> Result<String> {
    decode_name_with_len(buf, offset).map(|(name, _)| name)
}

/// Like [`decode_qname`], but also returns how many bytes of the
/// *linear* stream starting at `offset` the name occupies -- i.e. up
/// to and including the first compression pointer encountered, or the
/// terminating zero byte if the name was never compressed. This is the
/// offset the QTYPE/QCLASS fields that follow a question's name
/// actually sit at, which is not the same as `pos` once a pointer has
/// been followed.
fn decode_name_with_len(buf: &[u8], offset: usize) -> Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = offset;
    let mut jumped = false;
    let mut jumps = 0usize;
    let mut total_len = 0usize;
    let mut linear_len = 0usize;

    loop {
        if pos >= buf.len() {
            return Err(FramingError::MalformedName);
        }
        let len = buf[pos] as usize;

        if len == 0 {
            pos += 1;
            if !jumped {
                linear_len += 1;
            }
            break;
        }

        if len & 0xC0 == 0xC0 {
            if pos + 1 >= buf.len() {
                return Err(FramingError::MalformedName);
            }
            jumps += 1;
            if jumps > MAX_POINTER_HOPS {
                return Err(FramingError::MalformedName);
            }
            let b2 = buf[pos + 1] as usize;
            let pointer = ((len & 0x3F) << 8) | b2;
            if !jumped {
                linear_len += 2;
                jumped = true;
            }
            pos = pointer;
            continue;
        }

        if len > MAX_LABEL_LEN {
            return Err(FramingError::MalformedName);
        }
        let start = pos + 1;
        let end = start + len;
        if end > buf.len() {
            return Err(FramingError::MalformedName);
        }
        total_len += len + 1;
        if total_len > MAX_NAME_LEN {
            return Err(FramingError::NameTooLong);
        }
        if !jumped {
            linear_len += len + 1;
        }
        labels.push(String::from_utf8_lossy(&buf[start..end]).into_owned());
        pos = end;
    }

    Ok((labels.join("."), linear_len))
}

/// A decoded question-section entry: name, QTYPE, QCLASS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// Decode the single question a query/reply carries, including the
/// QTYPE/QCLASS fields that follow the name (C9 keys its cache on
/// these).
pub fn decode_question(buf: &[u8], offset: usize) -> Result<Question> {
    let (name, len) = decode_name_with_len(buf, offset)?;
    let fields_start = offset + len;
    if fields_start + 4 > buf.len() {
        return Err(FramingError::MalformedName);
    }
    let qtype = u16::from_be_bytes([buf[fields_start], buf[fields_start + 1]]);
    let qclass = u16::from_be_bytes([buf[fields_start + 2], buf[fields_start + 3]]);
    Ok(Question { name, qtype, qclass })
}

/// Turn a query buffer into a synthetic reply in place: set QR=1 and
/// the given RCODE. Used by the optional "don't know" responder, which
/// never touches header bytes directly (§9: framing owns all
/// byte-level header access).
pub fn make_reply(buf: &mut [u8], rcode: Rcode) -> Result<()> {
    if buf.len() < HEADER_LEN {
        return Err(FramingError::TooShort);
    }
    buf[2] |= 0x80;
    buf[3] = (buf[3] & 0xF0) | (rcode.0 & 0x0F);
    Ok(())
}

/// Overwrite ANCOUNT (bytes 6-7).
pub fn set_ancount(buf: &mut [u8], count: u16) -> Result<()> {
    if buf.len() < HEADER_LEN {
        return Err(FramingError::TooShort);
    }
    let c = count.to_be_bytes();
    buf[6] = c[0];
    buf[7] = c[1];
    Ok(())
}

fn ancount(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[6], buf[7]])
}

/// Walk the answer section just far enough to collect every record's
/// TTL, without interpreting RDATA -- the core never needs the answer
/// content itself, only the minimum TTL, to bound how long a reply may
/// sit in the response cache (C9). Returns `None` when ANCOUNT is 0.
pub fn min_answer_ttl(buf: &[u8]) -> Result<Option<u32>> {
    if buf.len() < HEADER_LEN {
        return Err(FramingError::TooShort);
    }
    let count = ancount(buf);
    if count == 0 {
        return Ok(None);
    }

    let question = decode_question(buf, HEADER_LEN)?;
    let (_, qname_len) = decode_name_with_len(buf, HEADER_LEN)?;
    let _ = question; // name content unused here, only its on-wire length
    let mut pos = HEADER_LEN + qname_len + 4;

    let mut min_ttl: Option<u32> = None;
    for _ in 0..count {
        let (_, name_len) = decode_name_with_len(buf, pos)?;
        pos += name_len + 2 /* type */ + 2 /* class */;
        if pos + 4 > buf.len() {
            return Err(FramingError::MalformedName);
        }
        let ttl = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
        pos += 4;
        if pos + 2 > buf.len() {
            return Err(FramingError::MalformedName);
        }
        let rdlength = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
        pos += 2 + rdlength;
        if pos > buf.len() {
            return Err(FramingError::MalformedName);
        }
        min_ttl = Some(min_ttl.map_or(ttl, |m: u32| m.min(ttl)));
    }
    Ok(min_ttl)
}
