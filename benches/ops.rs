
use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use criterion::BatchSize;

use evq::Evq;

fn bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("ops");

    {
        // make this massive so we don't have to worry about ooms
        let q = Evq::with_size(64*1024*1024);
        group.bench_function("alloc", |b| b.iter_with_large_drop(
            || {
                q.alloc(|| {}).unwrap()
            }
        ));
    }

    {
        let q = Evq::with_size(64*1024*1024);
        group.bench_function("post_cancel", |b| b.iter(
            || {
                let id = q.call_in(1_000_000, || {}).unwrap();
                q.cancel(id)
            }
        ));
    }

    {
        let q = Evq::with_size(64*1024*1024);
        group.bench_function("cancel", |b| b.iter_batched(
            || q.call_in(1_000_000, || {}).unwrap(),
            |id| {
                q.cancel(id)
            },
            BatchSize::SmallInput
        ));
    }

    {
        // we handle dispatch a bit differently to avoid state issues
        group.bench_function("dispatch", |b| b.iter_batched_ref(
            || {
                let q = Evq::with_size(4*evq::EVENT_SIZE);
                q.call(|| {}).unwrap();
                q
            },
            |q| {
                q.dispatch_ready()
            },
            BatchSize::SmallInput
        ));
    }

    {
        let q = Evq::with_size(64*1024*1024);
        group.bench_function("time_left", |b| b.iter_batched(
            || q.call_in(1_000_000, || {}).unwrap(),
            |id| {
                let left = q.time_left(id);
                q.cancel(id);
                left
            },
            BatchSize::SmallInput
        ));
    }
}

criterion_group!(benches, bench);
criterion_main!(benches);
