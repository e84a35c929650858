// Benchmarks for MemoryLockService
// Measures uncontended acquire/release and handoff through the waiter queue

use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use quince_common::MemberId;
use quince_consistency::{
    DistributedLockService, LockAcquireRequest, LockKey, LockOwner, MemoryLockService,
};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn bench_acquire_release(c: &mut Criterion) {
    let rt = runtime();
    let service = MemoryLockService::new();
    let owner = LockOwner::next(MemberId::new("bench"));

    c.bench_function("acquire_release_uncontended", |b| {
        b.to_async(&rt).iter(|| async {
            let request =
                LockAcquireRequest::new(LockKey::new("/ROOT/bench", "KEY"), owner.clone());
            let handle = service.acquire(black_box(request)).await.unwrap();
            service.release(&handle).await.unwrap();
        })
    });
}

fn bench_acquire_many_keys(c: &mut Criterion) {
    let rt = runtime();
    let service = MemoryLockService::new();
    let owner = LockOwner::next(MemberId::new("bench"));

    c.bench_function("acquire_release_1000_keys", |b| {
        b.to_async(&rt).iter(|| async {
            for i in 0..1000 {
                let request = LockAcquireRequest::new(
                    LockKey::new("/ROOT/bench", format!("key-{}", i)),
                    owner.clone(),
                );
                let handle = service.acquire(request).await.unwrap();
                service.release(&handle).await.unwrap();
            }
        })
    });
}

fn bench_contended_handoff(c: &mut Criterion) {
    let rt = runtime();
    let service = Arc::new(MemoryLockService::new());

    c.bench_function("contended_handoff_4_tasks", |b| {
        b.to_async(&rt).iter(|| {
            let service = service.clone();
            async move {
                let mut tasks = Vec::new();
                for t in 0..4 {
                    let service = service.clone();
                    tasks.push(tokio::spawn(async move {
                        let owner = LockOwner::next(MemberId::new(format!("m{}", t)));
                        for _ in 0..50 {
                            let request = LockAcquireRequest::new(
                                LockKey::new("/ROOT/bench", "HOT"),
                                owner.clone(),
                            )
                            .with_wait_ms(-1);
                            let handle = service.acquire(request).await.unwrap();
                            service.release(&handle).await.unwrap();
                        }
                    }));
                }
                for task in tasks {
                    task.await.unwrap();
                }
            }
        })
    });
}

criterion_group!(
    benches,
    bench_acquire_release,
    bench_acquire_many_keys,
    bench_contended_handoff
);
criterion_main!(benches);
