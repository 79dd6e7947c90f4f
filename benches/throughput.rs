//! Throughput Benchmark for EmberKV
//!
//! Measures the hot paths of a request: decoding, dictionary operations and
//! command execution, plus the expiry cycle run by the cron timer.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use emberkv::commands;
use emberkv::protocol::Decoder;
use emberkv::storage::{expiry, Db, Dict, DictType, ExpiryConfig, Value};

const NOW: i64 = 1_700_000_000_000;

/// Benchmark dictionary inserts, including incremental rehashing
fn bench_dict_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("dict_set");
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("grow_from_empty", |b| {
        let keys: Vec<Value> = (0..10_000)
            .map(|i| Value::from(format!("key:{}", i).as_str()))
            .collect();
        let val = Value::from("value");
        b.iter(|| {
            let mut dict = Dict::new(DictType::STRING_KEYS);
            for key in &keys {
                dict.set(key.clone(), val.clone());
            }
            black_box(dict.len());
        });
    });

    group.finish();
}

/// Benchmark dictionary lookups
fn bench_dict_get(c: &mut Criterion) {
    let mut dict = Dict::new(DictType::STRING_KEYS);
    for i in 0..100_000 {
        dict.set(
            Value::from(format!("key:{}", i).as_str()),
            Value::from(format!("value:{}", i).as_str()),
        );
    }
    while dict.rehash(100) {}

    let mut group = c.benchmark_group("dict_get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Value::from(format!("key:{}", i % 100_000).as_str());
            black_box(dict.get(&key));
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Value::from(format!("missing:{}", i).as_str());
            black_box(dict.get(&key));
            i += 1;
        });
    });

    group.bench_function("random_entry", |b| {
        b.iter(|| {
            black_box(dict.random_entry().is_some());
        });
    });

    group.finish();
}

/// Benchmark request decoding
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(1));

    group.bench_function("multibulk_set", |b| {
        let mut decoder = Decoder::new();
        let request = b"*3\r\n$3\r\nSET\r\n$8\r\nkey:1234\r\n$11\r\nsmall_value\r\n";
        b.iter(|| {
            let mut buf = BytesMut::from(&request[..]);
            black_box(decoder.decode(&mut buf).unwrap());
        });
    });

    group.bench_function("inline_get", |b| {
        let mut decoder = Decoder::new();
        b.iter(|| {
            let mut buf = BytesMut::from(&b"GET key:1234\r\n"[..]);
            black_box(decoder.decode(&mut buf).unwrap());
        });
    });

    group.bench_function("pipeline_100", |b| {
        let mut decoder = Decoder::new();
        let request = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n".repeat(100);
        b.iter(|| {
            let mut buf = BytesMut::from(&request[..]);
            let mut count = 0;
            while let Some(args) = decoder.decode(&mut buf).unwrap() {
                count += args.len();
            }
            black_box(count);
        });
    });

    group.finish();
}

/// Benchmark mixed workload (80% reads, 20% writes) through the dispatcher
fn bench_execute_mixed(c: &mut Criterion) {
    let mut db = Db::new();
    for i in 0..10_000 {
        db.set(
            Value::from(format!("key:{}", i).as_str()),
            Value::from(format!("value:{}", i).as_str()),
        );
    }

    let mut group = c.benchmark_group("execute");
    group.throughput(Throughput::Elements(1));

    group.bench_function("80_read_20_write", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let args = if i % 5 == 0 {
                vec![
                    Value::from("SET"),
                    Value::from(format!("new:{}", i).as_str()),
                    Value::from("value"),
                ]
            } else {
                vec![
                    Value::from("GET"),
                    Value::from(format!("key:{}", i % 10_000).as_str()),
                ]
            };
            black_box(commands::execute(&mut db, args, NOW));
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark the active expiry cycle
fn bench_expiry(c: &mut Criterion) {
    let mut group = c.benchmark_group("expiry");
    let config = ExpiryConfig::default();

    group.bench_function("cycle_all_live", |b| {
        let mut db = Db::new();
        for i in 0..10_000 {
            let key = Value::from(format!("key:{}", i).as_str());
            db.set(key.clone(), Value::from("value"));
            db.set_expire(key, NOW + 3_600_000);
        }
        b.iter(|| {
            black_box(expiry::run_cycle(&mut db, &config, NOW));
        });
    });

    group.bench_function("expire_command", |b| {
        let mut db = Db::new();
        for i in 0..10_000 {
            db.set(
                Value::from(format!("expire:{}", i).as_str()),
                Value::from("value"),
            );
        }
        let mut i = 0u64;
        b.iter(|| {
            let args = vec![
                Value::from("EXPIRE"),
                Value::from(format!("expire:{}", i % 10_000).as_str()),
                Value::from("3600"),
            ];
            black_box(commands::execute(&mut db, args, NOW));
            i += 1;
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_dict_set,
    bench_dict_get,
    bench_decode,
    bench_execute_mixed,
    bench_expiry,
);

criterion_main!(benches);
