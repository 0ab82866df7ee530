use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dashmap::DashMap;
use flowmap_rs::ProbeMap;
use rand::prelude::*;
use std::alloc::{alloc_zeroed, Layout};
use std::thread;

const THREADS: usize = 4;
const KEYS: usize = 16384;

type Probe = ProbeMap<u64, u64, 8>;

fn generate_test_data(size: usize) -> Vec<(u64, u64)> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..size).map(|_| (rng.gen(), rng.gen())).collect()
}

fn benchmark_concurrent_upsert(c: &mut Criterion) {
    let test_data = generate_test_data(KEYS);

    let total = KEYS as u32 * 2;
    let layout =
        Layout::from_size_align(Probe::calculate_sizeof(total), Probe::buffer_align()).unwrap();
    let base = unsafe { alloc_zeroed(layout) };
    assert!(!base.is_null());
    let mut map = Probe::new();
    unsafe { map.update_pointer(base, 0, total) };
    map.clear();
    let map = &map;

    c.bench_function("probemap_concurrent_upsert", |b| {
        let test_data = &test_data;
        b.iter(|| {
            thread::scope(|s| {
                for _ in 0..THREADS {
                    s.spawn(move || {
                        for (k, v) in test_data {
                            black_box(map.insert_or_update(*k, *v));
                        }
                    });
                }
            });
        })
    });

    let dashmap = DashMap::<u64, u64>::with_capacity(KEYS * 2);
    let dashmap = &dashmap;

    c.bench_function("dashmap_concurrent_insert", |b| {
        let test_data = &test_data;
        b.iter(|| {
            thread::scope(|s| {
                for _ in 0..THREADS {
                    s.spawn(move || {
                        for (k, v) in test_data {
                            black_box(dashmap.insert(*k, *v));
                        }
                    });
                }
            });
        })
    });
}

fn benchmark_concurrent_read(c: &mut Criterion) {
    let test_data = generate_test_data(KEYS);

    let total = KEYS as u32 * 2;
    let layout =
        Layout::from_size_align(Probe::calculate_sizeof(total), Probe::buffer_align()).unwrap();
    let base = unsafe { alloc_zeroed(layout) };
    assert!(!base.is_null());
    let mut map = Probe::new();
    unsafe { map.update_pointer(base, 0, total) };
    map.clear();
    for (k, v) in &test_data {
        map.insert_or_update(*k, *v);
    }
    let map = &map;

    c.bench_function("probemap_concurrent_read", |b| {
        let test_data = &test_data;
        b.iter(|| {
            thread::scope(|s| {
                for _ in 0..THREADS {
                    s.spawn(move || {
                        for (k, _) in test_data {
                            black_box(map.get(k));
                        }
                    });
                }
            });
        })
    });

    let dashmap = DashMap::<u64, u64>::with_capacity(KEYS * 2);
    for (k, v) in &test_data {
        dashmap.insert(*k, *v);
    }
    let dashmap = &dashmap;

    c.bench_function("dashmap_concurrent_read", |b| {
        let test_data = &test_data;
        b.iter(|| {
            thread::scope(|s| {
                for _ in 0..THREADS {
                    s.spawn(move || {
                        for (k, _) in test_data {
                            black_box(dashmap.get(k).map(|r| *r));
                        }
                    });
                }
            });
        })
    });
}

criterion_group!(benches, benchmark_concurrent_upsert, benchmark_concurrent_read);
criterion_main!(benches);
