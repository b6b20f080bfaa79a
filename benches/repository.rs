//! Benchmarks for the entity repository
//!
//! Cache-hit lookups, create+commit round trips and minor allocation.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use storage_controller_core::{
    AccessContext, BitmapPool, ControllerDatabase, CoreConfig, NodeArgs, NodeName, NumberPool,
    Repository, RequestExecutor,
};

fn bench_cached_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("repository");
    group.throughput(Throughput::Elements(1));

    let repo = Repository::controller(ControllerDatabase::in_memory(), &CoreConfig::default()).unwrap();
    let acc = AccessContext::system();
    let ctx = repo.new_context();
    let names: Vec<NodeName> = (0..1000)
        .map(|i| NodeName::new(format!("node-{:04}", i)).unwrap())
        .collect();
    for name in &names {
        repo.get_node(&acc, &ctx, name, NodeArgs::default(), true, true).unwrap();
    }
    ctx.commit().unwrap();

    group.bench_function("get_node_cache_hit", |b| {
        let ctx = repo.new_context();
        let mut counter = 0usize;
        b.iter(|| {
            counter += 1;
            let name = &names[counter % names.len()];
            let _ = repo.get_node(&acc, &ctx, black_box(name), NodeArgs::default(), false, false);
        });
    });

    group.finish();
}

fn bench_create_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("repository");
    group.throughput(Throughput::Elements(1));

    group.bench_function("create_node_and_commit", |b| {
        let repo = Repository::controller(ControllerDatabase::in_memory(), &CoreConfig::default()).unwrap();
        let acc = AccessContext::system();
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let name = NodeName::new(format!("node-{}", counter)).unwrap();
            let ctx = repo.new_context();
            let _ = repo.get_node(&acc, &ctx, black_box(&name), NodeArgs::default(), true, true);
            ctx.commit().unwrap();
        });
    });

    group.finish();
}

fn bench_executor(c: &mut Criterion) {
    let mut group = c.benchmark_group("executor");
    group.throughput(Throughput::Elements(100));

    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("concurrent_100_node_creates", |b| {
        let repo = Repository::controller(ControllerDatabase::in_memory(), &CoreConfig::default()).unwrap();
        let executor = RequestExecutor::new(repo, 16);
        let mut round = 0u64;
        b.iter(|| {
            round += 1;
            rt.block_on(async {
                let mut handles = Vec::new();
                for i in 0..100 {
                    let executor = executor.clone();
                    let name = format!("node-{}-{}", round, i);
                    handles.push(tokio::spawn(async move {
                        executor
                            .execute("create-node", move |repo, ctx| {
                                let name = NodeName::new(name)?;
                                repo.get_node(&AccessContext::system(), ctx, &name, NodeArgs::default(), true, true)?;
                                Ok(())
                            })
                            .await
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            });
        });
    });

    group.finish();
}

fn bench_minor_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("minor_pool");
    group.throughput(Throughput::Elements(1));

    group.bench_function("auto_allocate_and_release", |b| {
        let pool = BitmapPool::new(1000..=49999).unwrap();
        for n in 1000..30000 {
            pool.allocate(n).unwrap();
        }
        b.iter(|| {
            let minor = pool.auto_allocate().unwrap();
            pool.deallocate(black_box(minor));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_cached_lookup,
    bench_create_commit,
    bench_executor,
    bench_minor_allocation
);
criterion_main!(benches);
