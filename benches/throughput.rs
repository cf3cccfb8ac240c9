//! Request encoding, reply decoding and RTU framing throughput

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use voltage_serial::modbus::rtu::{crc16, decode_frame, encode_frame};
use voltage_serial::Request;

fn register_reply(count: u16) -> Vec<u8> {
    let mut reply = vec![0x03, (count * 2) as u8];
    for i in 0..count {
        reply.extend_from_slice(&i.to_be_bytes());
    }
    reply
}

fn benchmark_request_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_encoding");

    let read = Request::read_holding_registers(0x0100, 125).unwrap();
    group.bench_function("read_holding_registers", |b| {
        b.iter(|| black_box(&read).encode().unwrap())
    });

    let values: Vec<u16> = (0..123).collect();
    let write = Request::write_multiple_registers(0x0200, &values).unwrap();
    group.bench_function("write_multiple_registers_123", |b| {
        b.iter(|| black_box(&write).encode().unwrap())
    });

    group.finish();
}

fn benchmark_reply_decoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("reply_decoding");

    for count in [1u16, 16, 64, 125] {
        let request = Request::read_holding_registers(0, count).unwrap();
        let reply = register_reply(count);
        group.throughput(Throughput::Bytes(reply.len() as u64));
        group.bench_with_input(BenchmarkId::new("registers", count), &reply, |b, reply| {
            b.iter(|| request.decode_reply(black_box(reply)).unwrap())
        });
    }

    let coils = Request::read_coils(0, 2000).unwrap();
    let mut reply = vec![0x01, 250];
    reply.extend(std::iter::repeat(0xA5).take(250));
    group.bench_function("coils_2000", |b| {
        b.iter(|| coils.decode_reply(black_box(&reply)).unwrap())
    });

    let exception = [0x83, 0x02];
    let request = Request::read_holding_registers(0, 10).unwrap();
    group.bench_function("exception", |b| {
        b.iter(|| request.decode_reply(black_box(&exception)).unwrap_err())
    });

    group.finish();
}

fn benchmark_rtu_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("rtu_framing");

    for count in [1u16, 125] {
        let pdu = register_reply(count);
        let frame = encode_frame(0x11, &pdu).unwrap();
        group.throughput(Throughput::Bytes(frame.len() as u64));

        group.bench_with_input(BenchmarkId::new("crc16", frame.len()), &pdu, |b, pdu| {
            b.iter(|| crc16(black_box(pdu)))
        });
        group.bench_with_input(BenchmarkId::new("encode", frame.len()), &pdu, |b, pdu| {
            b.iter(|| encode_frame(0x11, black_box(pdu)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("decode", frame.len()), &frame, |b, frame| {
            b.iter(|| decode_frame(black_box(frame)).unwrap().0)
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_request_encoding,
    benchmark_reply_decoding,
    benchmark_rtu_framing
);
criterion_main!(benches);
