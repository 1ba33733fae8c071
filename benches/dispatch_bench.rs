//! Performance benchmarks for the query-handling hot path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use relaydns::dns::cache::ResponseCache;
use relaydns::dns::dispatcher::Dispatcher;
use relaydns::dns::framing;
use relaydns::dns::topology::Topology;

use std::net::{Ipv4Addr, SocketAddrV4};

fn build_query(name: &str) -> Vec<u8> {
    let mut buf = vec![0u8; 12];
    buf[5] = 1; // QDCOUNT
    for label in name.split('.') {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    buf.extend_from_slice(&1u16.to_be_bytes()); // A
    buf.extend_from_slice(&1u16.to_be_bytes()); // IN
    buf
}

fn build_reply(name: &str, ttl: u32) -> Vec<u8> {
    let mut buf = build_query(name);
    buf[2] = 0x80;
    buf[7] = 1; // ANCOUNT
    buf.push(0xC0);
    buf.push(12); // pointer back to the question's qname
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&ttl.to_be_bytes());
    buf.extend_from_slice(&4u16.to_be_bytes());
    buf.extend_from_slice(&[127, 0, 0, 1]);
    buf
}

fn benchmark_qname_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("qname decode");
    let names = ["a.com", "www.example.com", "deeply.nested.subdomain.example.com"];

    for name in names {
        let query = build_query(name);
        group.bench_with_input(BenchmarkId::from_parameter(name), &query, |b, query| {
            b.iter(|| black_box(framing::decode_qname(query, 12).unwrap()));
        });
    }
    group.finish();
}

fn benchmark_min_answer_ttl(c: &mut Criterion) {
    let reply = build_reply("example.com", 300);
    c.bench_function("min_answer_ttl", |b| {
        b.iter(|| black_box(framing::min_answer_ttl(&reply).unwrap()));
    });
}

fn benchmark_cache_roundtrip(c: &mut Criterion) {
    let cache = ResponseCache::new();
    let query = build_query("cached.example.com");
    let reply = build_reply("cached.example.com", 300);
    cache.insert(&reply, 0).unwrap();

    let mut group = c.benchmark_group("response cache");
    group.throughput(Throughput::Elements(1));
    group.bench_function("lookup_hit", |b| {
        b.iter(|| black_box(cache.lookup(&query, 0).unwrap()));
    });
    group.finish();
}

fn benchmark_candidate_interfaces(c: &mut Criterion) {
    let mut topology = Topology::new();
    for i in 0..4u8 {
        let iface = topology.add_interface(&format!("eth{}", i));
        topology
            .add_server(iface, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, i), 53))
            .unwrap();
    }
    let dispatcher = Dispatcher::new(
        vec![("pinned.example.com".to_string(), "eth2".to_string())],
        vec!["eth0".to_string(), "eth1".to_string()],
    );

    let mut group = c.benchmark_group("dispatcher routing");
    group.bench_function("special_host_pin", |b| {
        b.iter(|| black_box(dispatcher.would_hit_deactivated_server(&topology, "pinned.example.com")));
    });
    group.bench_function("default_interfaces", |b| {
        b.iter(|| black_box(dispatcher.would_hit_deactivated_server(&topology, "anything.example.com")));
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_qname_decode,
    benchmark_min_answer_ttl,
    benchmark_cache_roundtrip,
    benchmark_candidate_interfaces,
);
criterion_main!(benches);
