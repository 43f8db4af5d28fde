use core::hint::black_box;

use adapt_hash::DictTable;
use adapt_hash::Key;
use criterion::BatchSize;
use criterion::Criterion;
use criterion::Throughput;
use criterion::criterion_group;
use criterion::criterion_main;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

const SIZE: usize = 10_000;

fn int_keys() -> Vec<i64> {
    let mut rng = SmallRng::seed_from_u64(0x5eed);
    let mut keys: Vec<i64> = (0..SIZE as i64).collect();
    keys.shuffle(&mut rng);
    keys
}

fn str_keys() -> Vec<String> {
    let mut rng = SmallRng::seed_from_u64(0x5eed);
    let mut keys: Vec<String> = (0..SIZE).map(|k| format!("key_{k:08x}")).collect();
    keys.shuffle(&mut rng);
    keys
}

fn filled_dict(keys: &[i64]) -> DictTable<i64> {
    let table = DictTable::with_capacity(keys.len());
    for &k in keys {
        table.add(Key::from(k), k);
    }
    table
}

fn filled_hashbrown(keys: &[i64]) -> hashbrown::HashMap<i64, i64> {
    let mut map = hashbrown::HashMap::with_capacity(keys.len());
    for &k in keys {
        map.insert(k, k);
    }
    map
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.throughput(Throughput::Elements(SIZE as u64));

    let keys = int_keys();
    group.bench_function("dict_table/int", |b| {
        b.iter_batched(
            DictTable::new,
            |table| {
                for &k in &keys {
                    table.add(Key::from(k), k);
                }
                table
            },
            BatchSize::SmallInput,
        )
    });
    group.bench_function("hashbrown/int", |b| {
        b.iter_batched(
            hashbrown::HashMap::new,
            |mut map| {
                for &k in &keys {
                    map.insert(k, k);
                }
                map
            },
            BatchSize::SmallInput,
        )
    });

    let strings = str_keys();
    group.bench_function("dict_table/str", |b| {
        b.iter_batched(
            DictTable::new,
            |table| {
                for (value, k) in strings.iter().enumerate() {
                    table.add(Key::from(k.as_str()), value as i64);
                }
                table
            },
            BatchSize::SmallInput,
        )
    });
    group.bench_function("hashbrown/str", |b| {
        b.iter_batched(
            hashbrown::HashMap::new,
            |mut map| {
                for (value, k) in strings.iter().enumerate() {
                    map.insert(k.clone(), value as i64);
                }
                map
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");
    group.throughput(Throughput::Elements(SIZE as u64));

    let keys = int_keys();
    let dict = filled_dict(&keys);
    let map = filled_hashbrown(&keys);

    group.bench_function("dict_table/hit", |b| {
        b.iter(|| {
            let mut sum = 0i64;
            for &k in &keys {
                sum += dict.try_get(&Key::from(k)).unwrap();
            }
            black_box(sum)
        })
    });
    group.bench_function("hashbrown/hit", |b| {
        b.iter(|| {
            let mut sum = 0i64;
            for &k in &keys {
                sum += map.get(&k).unwrap();
            }
            black_box(sum)
        })
    });

    group.bench_function("dict_table/miss", |b| {
        b.iter(|| {
            let mut found = 0usize;
            for &k in &keys {
                if dict.contains(&Key::from(k + SIZE as i64)) {
                    found += 1;
                }
            }
            black_box(found)
        })
    });
    group.bench_function("hashbrown/miss", |b| {
        b.iter(|| {
            let mut found = 0usize;
            for &k in &keys {
                if map.contains_key(&(k + SIZE as i64)) {
                    found += 1;
                }
            }
            black_box(found)
        })
    });
    group.finish();
}

fn bench_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("churn");
    group.throughput(Throughput::Elements(SIZE as u64));

    let keys = int_keys();
    let dict = filled_dict(&keys);
    let map = filled_hashbrown(&keys);

    group.bench_function("dict_table/remove_reinsert", |b| {
        b.iter_batched(
            || dict.clone(),
            |table| {
                for &k in &keys {
                    table.remove(&Key::from(k));
                    table.add(Key::from(k), k + 1);
                }
                table
            },
            BatchSize::SmallInput,
        )
    });
    group.bench_function("hashbrown/remove_reinsert", |b| {
        b.iter_batched(
            || map.clone(),
            |mut map| {
                for &k in &keys {
                    map.remove(&k);
                    map.insert(k, k + 1);
                }
                map
            },
            BatchSize::SmallInput,
        )
    });

    // Batched mutation under one lock acquisition.
    group.bench_function("dict_table/remove_reinsert_locked", |b| {
        b.iter_batched(
            || dict.clone(),
            |table| {
                {
                    let write = table.lock();
                    for &k in &keys {
                        write.remove(&Key::from(k));
                        write.add(Key::from(k), k + 1);
                    }
                }
                table
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

criterion_group!(benches, bench_insert, bench_lookup, bench_churn);
criterion_main!(benches);
