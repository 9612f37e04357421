//! Criterion benchmarks for placeholder binding and for the full statement path through a
//! [`Connection`] backed by the in-memory driver.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use sql_pipes::binding::bind_placeholders;
use sql_pipes::driver::escape_string;
use sql_pipes::prelude::*;
use sql_pipes::test_utils::MockDriver;
use std::hint::black_box;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::runtime::Builder;
use tokio::task::LocalSet;

fn statement_with(placeholders: usize) -> (String, Vec<RowValues>) {
    let columns: Vec<String> = (0..placeholders).map(|idx| format!("c{idx} = ?")).collect();
    let sql = format!(
        "update items set note = 'is this a ?' /* or ? */, {} where id = 1",
        columns.join(", ")
    );
    let bindings = (0..placeholders)
        .map(|idx| {
            if idx % 2 == 0 {
                RowValues::Int(i64::try_from(idx).unwrap_or_default())
            } else {
                RowValues::Text(format!("it's value {idx}"))
            }
        })
        .collect();
    (sql, bindings)
}

fn bench_binding(c: &mut Criterion) {
    let mut group = c.benchmark_group("bind_placeholders");
    for placeholders in [1_usize, 8, 64] {
        let (sql, bindings) = statement_with(placeholders);
        group.throughput(Throughput::Bytes(sql.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(placeholders),
            &(sql, bindings),
            |b, (sql, bindings)| {
                b.iter(|| {
                    bind_placeholders(black_box(sql), black_box(bindings), &escape_string)
                        .map(|bound| bound.len())
                        .unwrap_or_default()
                });
            },
        );
    }
    group.finish();
}

fn bench_statement_roundtrip(c: &mut Criterion) {
    let rt = Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime");

    let mut group = c.benchmark_group("connection");
    group.sample_size(10);
    group.bench_function("select_one", |b| {
        b.iter_custom(|iters| {
            let local = LocalSet::new();
            local.block_on(&rt, async move {
                let config = PipesConfig::builder("127.0.0.1")
                    .num_connections(4)
                    .finish();
                let conn = Connection::new(config, Rc::new(MockDriver::new()))
                    .expect("valid config");
                let started = Instant::now();
                for id in 0..iters {
                    let id = i64::try_from(id).unwrap_or_default();
                    let row = conn
                        .select_one("select * from items where id = ?", &[RowValues::Int(id)], None)
                        .await
                        .expect("statement failed");
                    black_box(row);
                }
                let elapsed: Duration = started.elapsed();
                conn.disconnect();
                elapsed
            })
        });
    });
    group.finish();
}

criterion_group!(benches, bench_binding, bench_statement_roundtrip);
criterion_main!(benches);
