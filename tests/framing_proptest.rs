//! Property-based testing for the DNS header/QID/qname byte-level access.

use proptest::prelude::*;
use relaydns::dns::framing::{
    check_query, check_reply, decode_qname, decode_question, min_answer_ttl, read_qid, rcode,
    write_qid, Qid, Rcode,
};

fn header(qr: bool, qdcount: u16) -> Vec<u8> {
    let mut buf = vec![0u8; 12];
    buf[2] = if qr { 0x80 } else { 0x00 };
    let c = qdcount.to_be_bytes();
    buf[4] = c[0];
    buf[5] = c[1];
    buf
}

fn write_qname(buf: &mut Vec<u8>, labels: &[String]) {
    for label in labels {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
}

// Labels restricted to 1..=63 ASCII bytes, matching the wire-format
// ceiling `decode_qname` enforces.
fn label_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,63}"
}

fn qname_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(label_strategy(), 1..5)
}

proptest! {
    #[test]
    fn qid_round_trips_through_arbitrary_headers(
        qid in any::<u16>(),
        qr in any::<bool>(),
    ) {
        let mut buf = header(qr, 1);
        write_qid(&mut buf, Qid(qid)).unwrap();
        prop_assert_eq!(read_qid(&buf).unwrap(), Qid(qid));
        // Rewriting the QID must never disturb bytes past offset 1.
        let flags_and_counts = buf[2..].to_vec();
        let mut buf2 = header(qr, 1);
        buf2[2..].copy_from_slice(&flags_and_counts);
        write_qid(&mut buf2, Qid(qid)).unwrap();
        prop_assert_eq!(&buf2[2..], &flags_and_counts[..]);
    }

    #[test]
    fn decode_qname_round_trips_uncompressed_labels(labels in qname_strategy()) {
        let mut buf = header(false, 1);
        write_qname(&mut buf, &labels);
        let decoded = decode_qname(&buf, 12).unwrap();
        prop_assert_eq!(decoded, labels.join("."));
    }

    #[test]
    fn decode_question_reads_back_whatever_type_and_class_were_written(
        labels in qname_strategy(),
        qtype in any::<u16>(),
        qclass in any::<u16>(),
    ) {
        let mut buf = header(false, 1);
        write_qname(&mut buf, &labels);
        buf.extend_from_slice(&qtype.to_be_bytes());
        buf.extend_from_slice(&qclass.to_be_bytes());
        let q = decode_question(&buf, 12).unwrap();
        prop_assert_eq!(q.name, labels.join("."));
        prop_assert_eq!(q.qtype, qtype);
        prop_assert_eq!(q.qclass, qclass);
    }

    #[test]
    fn rcode_is_always_confined_to_the_low_nibble(byte in any::<u8>()) {
        let mut buf = header(true, 1);
        buf[3] = byte;
        prop_assert!(rcode(&buf).0 <= 0x0F);
        prop_assert_eq!(rcode(&buf), Rcode(byte & 0x0F));
    }

    #[test]
    fn parsers_never_panic_on_random_input(random_bytes in prop::collection::vec(any::<u8>(), 0..1024)) {
        // None of these should panic on arbitrary bytes, whatever they
        // return.
        let _ = check_query(&random_bytes);
        let _ = check_reply(&random_bytes);
        let _ = read_qid(&random_bytes);
        let _ = decode_qname(&random_bytes, 12);
        let _ = decode_question(&random_bytes, 12);
        let _ = min_answer_ttl(&random_bytes);
        prop_assert!(true);
    }

    #[test]
    fn well_formed_query_header_always_passes_check_query(qid in any::<u16>()) {
        let mut buf = header(false, 1);
        write_qid(&mut buf, Qid(qid)).unwrap();
        prop_assert!(check_query(&buf).is_ok());
        prop_assert!(check_reply(&buf).is_err());
    }

    #[test]
    fn well_formed_reply_header_always_passes_check_reply(qid in any::<u16>()) {
        let mut buf = header(true, 1);
        write_qid(&mut buf, Qid(qid)).unwrap();
        prop_assert!(check_reply(&buf).is_ok());
        prop_assert!(check_query(&buf).is_err());
    }
}
