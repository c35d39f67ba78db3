//! Hot-path primitive benchmarks: slot pool and signaling queue.

use criterion::{criterion_group, criterion_main, Criterion};

use zrpc_core::task::TaskKind;
use zrpc_module::signal_queue::SignalQueue;
use zrpc_module::slot_pool::SlotPool;

fn bench_slot_pool(c: &mut Criterion) {
    let pool = SlotPool::new(1024);
    c.bench_function("slot_pool_allocate_release", |b| {
        b.iter(|| {
            let id = pool.allocate(3, TaskKind::Io).unwrap();
            pool.release(id);
        })
    });
}

fn bench_signal_queue(c: &mut Criterion) {
    let queue: SignalQueue<u64> = SignalQueue::new(1024).unwrap();
    c.bench_function("signal_queue_enqueue_dequeue", |b| {
        b.iter(|| {
            assert!(queue.enqueue(1));
            assert_eq!(queue.dequeue(), Some(1));
        })
    });
}

criterion_group!(benches, bench_slot_pool, bench_signal_queue);
criterion_main!(benches);
