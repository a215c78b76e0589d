//! Transaction throughput benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use petek::{Stm, TxAttr};
use std::sync::atomic::AtomicUsize;

const STRIDE: usize = 8;

fn make_words(n: usize) -> Vec<AtomicUsize> {
    (0..n * STRIDE).map(|_| AtomicUsize::new(0)).collect()
}

fn word(mem: &[AtomicUsize], i: usize) -> *mut usize {
    mem[i * STRIDE].as_ptr()
}

fn bench_read_only(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_only");
    let stm = Stm::new();
    let thr = stm.register_thread();
    let attr = TxAttr {
        read_only: true,
        ..TxAttr::default()
    };

    for size in [1usize, 8, 64].iter() {
        let mem = make_words(*size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let sum = thr
                    .atomically(attr, |tx| {
                        let mut acc = 0usize;
                        for i in 0..size {
                            acc = acc.wrapping_add(unsafe { tx.load(word(&mem, i))? });
                        }
                        Ok(acc)
                    })
                    .unwrap();
                black_box(sum);
            });
        });
    }
    group.finish();
}

fn bench_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("update");
    let stm = Stm::new();
    let thr = stm.register_thread();

    for size in [1usize, 8, 64].iter() {
        let mem = make_words(*size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                thr.atomically(TxAttr::default(), |tx| unsafe {
                    for i in 0..size {
                        let v = tx.load(word(&mem, i))?;
                        tx.store(word(&mem, i), v.wrapping_add(1))?;
                    }
                    Ok(())
                })
                .unwrap();
            });
        });
    }
    group.finish();
}

fn bench_masked_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("masked_update");
    let stm = Stm::new();
    let thr = stm.register_thread();
    let mem = make_words(1);

    group.bench_function("byte_lane", |b| {
        b.iter(|| {
            thr.atomically(TxAttr::default(), |tx| unsafe {
                let v = tx.load(word(&mem, 0))?;
                tx.store_masked(word(&mem, 0), (v & 0xFF).wrapping_add(1), 0xFF)?;
                Ok(())
            })
            .unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, bench_read_only, bench_update, bench_masked_update);
criterion_main!(benches);
