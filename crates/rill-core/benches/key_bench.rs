// Benchmarks for key placement
// Measures key hashing and home lookup across cloud sizes

use std::hint::black_box;
use std::net::SocketAddr;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rill_core::Cloud;
use rill_core::Key;
use rill_core::service::node::NodeRegistry;

fn cloud_of(size: u16) -> Cloud {
    let registry = NodeRegistry::new(SocketAddr::from(([127, 0, 0, 1], 54321)));
    let members: Vec<_> = (0..size)
        .map(|i| registry.intern(SocketAddr::from(([10, 0, (i / 250) as u8, (i % 250) as u8 + 1], 54321))))
        .collect();
    Cloud::new(members, 0, 1)
}

fn bench_key_hash(c: &mut Criterion) {
    let short = Key::user("counter").unwrap();
    let long = Key::user(&"frame/chunk/".repeat(40)).unwrap();

    c.bench_function("key_hash_short", |b| b.iter(|| black_box(&short).hash()));
    c.bench_function("key_hash_long", |b| b.iter(|| black_box(&long).hash()));
}

fn bench_key_home(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_home");
    let keys: Vec<Key> = (0..1000)
        .map(|i| Key::user(&format!("key-{}", i)).unwrap())
        .collect();

    for size in [1u16, 8, 64, 512] {
        let cloud = Arc::new(cloud_of(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &cloud, |b, cloud| {
            b.iter(|| {
                for key in &keys {
                    black_box(key.home(cloud));
                }
            })
        });
    }
    group.finish();
}

fn bench_pinned_home(c: &mut Criterion) {
    let cloud = cloud_of(64);
    let pinned = Key::system_homed(
        "type-map",
        "10.0.0.9:54321".parse().unwrap(),
    )
    .unwrap();

    c.bench_function("key_home_pinned", |b| {
        b.iter(|| black_box(pinned.home(black_box(&cloud))))
    });
}

criterion_group!(benches, bench_key_hash, bench_key_home, bench_pinned_home);
criterion_main!(benches);
