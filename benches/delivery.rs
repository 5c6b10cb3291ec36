//! Performance benchmarks for envelope sealing, splitting and loopback delivery

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use postern_core::envelope::PartPayload;
use postern_core::{
    CoreConfig, CoreEvent, Envelope, MessageReassembler, MessageSplitter, PeerId,
};
use postern_integration_tests::fixtures::{TwoPeerFixture, wait_for};
use serde_json::json;
use std::time::Duration;

/// Benchmark envelope creation (canonical encoding + sha256)
fn bench_envelope_seal(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_seal");

    for size in [64usize, 4 * 1024, 64 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        let body = "x".repeat(size);

        group.bench_with_input(BenchmarkId::from_parameter(size), &body, |b, body| {
            b.iter(|| Envelope::new("text", json!(black_box(body)), None).unwrap());
        });
    }

    group.finish();
}

/// Benchmark splitting an oversized envelope and reassembling its parts
fn bench_split_reassemble(c: &mut Criterion) {
    let mut group = c.benchmark_group("split_reassemble");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = CoreConfig::default();
    let sender = PeerId::new("did:bench:sender").unwrap();

    for size in [256 * 1024usize, 1024 * 1024, 4 * 1024 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        let envelope = Envelope::new("text", json!("y".repeat(size)), None).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(size), &envelope, |b, envelope| {
            b.iter(|| {
                rt.block_on(async {
                    let splitter = MessageSplitter::new(&config);
                    let reassembler = MessageReassembler::new(4);
                    let mut rebuilt = None;
                    for part in splitter.split(envelope).await.unwrap() {
                        let payload: PartPayload = part.payload().unwrap();
                        rebuilt = reassembler.reassemble(&sender, &payload).await.unwrap();
                    }
                    black_box(rebuilt)
                })
            });
        });
    }

    group.finish();
}

/// Benchmark a send with its `received` round trip over the loopback relays
fn bench_loopback_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut fixture = rt.block_on(TwoPeerFixture::new()).unwrap();
    let bob = fixture.bob.id.clone();

    c.bench_function("loopback_round_trip", |b| {
        b.iter(|| {
            rt.block_on(async {
                let id = fixture
                    .alice
                    .messenger
                    .send(&bob, "text", json!("ping"))
                    .await
                    .unwrap();
                wait_for(&mut fixture.alice.events, Duration::from_secs(5), |e| {
                    matches!(e, CoreEvent::Received { ids, .. } if ids.contains(&id))
                })
                .await
                .unwrap();
            });
        });
    });

    rt.block_on(fixture.shutdown());
}

criterion_group!(
    benches,
    bench_envelope_seal,
    bench_split_reassemble,
    bench_loopback_round_trip
);
criterion_main!(benches);
