use flowmap_rs::{ChainMap, ProbeMap};
use std::alloc::{alloc_zeroed, Layout};
use std::hash::Hash;
use std::thread;

const NUM_THREADS: usize = 8;
const NUM_REPETITIONS: usize = 2;
const TOTAL_VALUES: i32 = 65536;
const VALUE_SIZE: usize = 64;

#[derive(Clone, Copy)]
struct TestEntry {
    key: i32,
    value: [u8; VALUE_SIZE],
}

fn new_chain<K, V, const P: usize, const E: usize, const C1: usize, const C2: usize>(
) -> &'static mut ChainMap<K, V, P, E, C1, C2>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    let layout = Layout::from_size_align(
        ChainMap::<K, V, P, E, C1, C2>::calculate_sizeof(),
        ChainMap::<K, V, P, E, C1, C2>::buffer_align(),
    )
    .unwrap();
    let base = unsafe { alloc_zeroed(layout) };
    assert!(!base.is_null());
    unsafe { ChainMap::from_zeroed(base) }
}

fn new_probe<K, V, const C: usize>(total: u32) -> ProbeMap<K, V, C>
where
    K: Copy + Eq + Hash,
    V: Copy,
{
    let layout = Layout::from_size_align(
        ProbeMap::<K, V, C>::calculate_sizeof(total),
        ProbeMap::<K, V, C>::buffer_align(),
    )
    .unwrap();
    let base = unsafe { alloc_zeroed(layout) };
    assert!(!base.is_null());
    let mut map = ProbeMap::<K, V, C>::new();
    unsafe { map.update_pointer(base, 0, total) };
    map.clear();
    map
}

/// Eight writers insert the full key range, then eight readers verify it.
/// Each thread checksums the subset it owns (`key % NUM_THREADS == thread_id`)
/// on the first repetition; write and read checksums must agree.
#[test]
fn chain_concurrent_writers_then_readers_checksums() {
    let table = new_chain::<i32, TestEntry, 16384, 16384, 4, 4>();
    let seed: u8 = rand::random();
    let table = &*table;

    let write_sums: Vec<u64> = thread::scope(|s| {
        (0..NUM_THREADS)
            .map(|t| {
                s.spawn(move || {
                    let mut sum = 0u64;
                    for rep in 0..NUM_REPETITIONS {
                        for i in 0..TOTAL_VALUES {
                            let mut entry = TestEntry {
                                key: i,
                                value: [seed; VALUE_SIZE],
                            };
                            let id = i as usize % NUM_THREADS;
                            entry.value[id] = id as u8;
                            assert!(table.insert(i, entry));
                            if rep == 0 && id == t {
                                sum += i as u64 + id as u64 + seed as u64;
                            }
                        }
                    }
                    sum
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect()
    });

    let stats = table.stats();
    assert_eq!(stats.pairs, TOTAL_VALUES as u64);
    assert_eq!(stats.insert_failed, 0);

    let read_sums: Vec<u64> = thread::scope(|s| {
        (0..NUM_THREADS)
            .map(|t| {
                s.spawn(move || {
                    let mut sum = 0u64;
                    for i in 0..TOTAL_VALUES {
                        let found = table
                            .lookup(&i)
                            .expect("key must be present after writers join");
                        assert_eq!(found.key, i);
                        let id = i as usize % NUM_THREADS;
                        if id == t {
                            sum += i as u64 + found.value[t] as u64 + seed as u64;
                        }
                    }
                    sum
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect()
    });

    assert_eq!(write_sums, read_sums);
}

#[test]
fn probe_concurrent_insert_or_update_checksums() {
    let map = new_probe::<i32, TestEntry, 8>(TOTAL_VALUES as u32);
    let seed: u8 = rand::random();
    let map = &map;

    let write_sums: Vec<u64> = thread::scope(|s| {
        (0..NUM_THREADS)
            .map(|t| {
                s.spawn(move || {
                    let mut sum = 0u64;
                    for rep in 0..NUM_REPETITIONS {
                        for i in 0..TOTAL_VALUES {
                            let mut entry = TestEntry {
                                key: i,
                                value: [seed; VALUE_SIZE],
                            };
                            let id = i as usize % NUM_THREADS;
                            entry.value[id] = id as u8;
                            assert!(map.insert_or_update(i, entry));
                            if rep == 0 && id == t {
                                sum += i as u64 + id as u64 + seed as u64;
                            }
                        }
                    }
                    sum
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect()
    });

    let stats = map.stats();
    assert_eq!(stats.pairs, TOTAL_VALUES as u64);
    assert_eq!(stats.insert_failed, 0);

    let read_sums: Vec<u64> = thread::scope(|s| {
        (0..NUM_THREADS)
            .map(|t| {
                s.spawn(move || {
                    let mut sum = 0u64;
                    for i in 0..TOTAL_VALUES {
                        let (_, found) = map.lookup(&i);
                        let found = found.expect("key must be present after writers join");
                        assert_eq!(found.key, i);
                        let id = i as usize % NUM_THREADS;
                        if id == t {
                            sum += i as u64 + found.value[t] as u64 + seed as u64;
                        }
                    }
                    sum
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect()
    });

    assert_eq!(write_sums, read_sums);
}

/// Writers own disjoint key ranges; after they join, every reader sees the
/// union.
#[test]
fn chain_concurrent_disjoint_writers_then_readers() {
    const PER_THREAD: i32 = 8192;
    let table = new_chain::<i32, u64, 16384, 16384, 4, 4>();
    let table = &*table;

    thread::scope(|s| {
        for t in 0..NUM_THREADS {
            s.spawn(move || {
                let lo = t as i32 * PER_THREAD;
                for i in lo..lo + PER_THREAD {
                    assert!(table.insert(i, i as u64 * 3));
                }
            });
        }
    });

    assert_eq!(table.len(), NUM_THREADS * PER_THREAD as usize);

    thread::scope(|s| {
        for _ in 0..NUM_THREADS {
            s.spawn(move || {
                for i in 0..NUM_THREADS as i32 * PER_THREAD {
                    assert_eq!(table.get(&i), Some(i as u64 * 3));
                }
            });
        }
    });
}

/// Concurrent readers keep running while writers overwrite the same keys;
/// a reader must only ever observe a fully written value for the key it
/// asked for.
#[test]
fn probe_readers_never_observe_foreign_keys() {
    const KEYS: i32 = 1024;
    let map = new_probe::<i32, u64, 8>(KEYS as u32 * 2);
    let map = &map;

    for i in 0..KEYS {
        assert!(map.insert_or_update(i, i as u64));
    }

    thread::scope(|s| {
        for _ in 0..NUM_THREADS / 2 {
            s.spawn(move || {
                for rep in 0..8u64 {
                    for i in 0..KEYS {
                        assert!(map.insert_or_update(i, i as u64 + rep * KEYS as u64));
                    }
                }
            });
        }
        for _ in 0..NUM_THREADS / 2 {
            s.spawn(move || {
                for _ in 0..8 {
                    for i in 0..KEYS {
                        let (_, found) = map.lookup(&i);
                        let value = *found.expect("key was inserted before readers started");
                        assert_eq!((value as i64 % KEYS as i64) as i32, i);
                    }
                }
            });
        }
    });
}
