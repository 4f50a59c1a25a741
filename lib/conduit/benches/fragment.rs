use chassis::logging::{o, Discard, Logger};
use conduit::net::fragment::{Fragmenter, Reassembler};
use conduit::net::frame::UdpHeader;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};

fn roundtrip(buf: &[u8], fec_rate: f32, log: &Logger) -> usize {
    let mut fragmenter = Fragmenter::new();
    let mut packets = Vec::new();
    fragmenter.fragment(buf, fec_rate, |packet| packets.push(packet.to_vec()));

    let mut reassembler = Reassembler::new(fec_rate, log.clone());
    let mut reassembled = 0;
    for packet in &packets {
        let header = UdpHeader::read(&packet[..UdpHeader::SIZE]).unwrap();
        if let Some(payload) = reassembler.process(&header, &packet[UdpHeader::SIZE..]) {
            reassembled = payload.len();
        }
    }
    reassembled
}

fn bench_fragment(c: &mut Criterion) {
    let log = Logger::root(Discard, o!());
    let buf: Vec<u8> = (0..64 * 1024).map(|i| i as u8).collect();

    let mut group = c.benchmark_group("fragment");
    group.throughput(Throughput::Bytes(buf.len() as u64));

    group.bench_function("roundtrip_64k_plain", |b| {
        b.iter(|| assert_eq!(roundtrip(&buf, 0.0, &log), buf.len()))
    });
    group.bench_function("roundtrip_64k_fec2", |b| {
        b.iter(|| assert_eq!(roundtrip(&buf, 2.0, &log), buf.len()))
    });

    group.finish();
}

criterion_group!(benches, bench_fragment);
criterion_main!(benches);
