//! Benchmarks for pipelined versus blocking pulls
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use smax_client::transport::MemoryTransport;
use smax_client::{Payload, Session, SmaxConfig, TypeTag, VarRef};
use std::sync::Arc;
use std::time::Duration;

const ROUND_TRIP: Duration = Duration::from_micros(200);

fn open() -> (Session, Vec<VarRef>) {
    let transport = Arc::new(MemoryTransport::new().with_latency(ROUND_TRIP));
    let vars: Vec<VarRef> = (0..16)
        .map(|i| VarRef::new("bench", format!("var{}", i)).expect("valid name"))
        .collect();
    for var in &vars {
        transport.share_remote("bench", var, Payload::scalar("1.5", TypeTag::Float64));
    }
    let session = Session::open(transport, SmaxConfig::default()).expect("session opens");
    (session, vars)
}

fn bench_pulls(c: &mut Criterion) {
    let mut group = c.benchmark_group("pulls");
    let (session, vars) = open();

    for count in [1usize, 16, 128].iter() {
        group.throughput(Throughput::Elements(*count as u64));

        group.bench_with_input(BenchmarkId::new("blocking", count), count, |b, &count| {
            b.iter(|| {
                for i in 0..count {
                    black_box(session.pull(&vars[i % vars.len()]).expect("pull"));
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("pipelined", count), count, |b, &count| {
            b.iter(|| {
                let handles: Vec<_> = (0..count)
                    .map(|i| session.queue_pull(&vars[i % vars.len()]).expect("queue"))
                    .collect();
                session.flush(Duration::from_secs(10)).expect("flush");
                black_box(handles);
            });
        });
    }

    group.finish();
}

fn bench_lazy_reads(c: &mut Criterion) {
    let (session, vars) = open();
    session.lazy_pull(&vars[0]).expect("first pull");

    c.bench_function("lazy_pull_cached", |b| {
        b.iter(|| black_box(session.lazy_pull(&vars[0]).expect("cached")));
    });
}

criterion_group!(benches, bench_pulls, bench_lazy_reads);
criterion_main!(benches);
