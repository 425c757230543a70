use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use mercurius::algorithm::{Algorithm, AlgorithmFunction};
use mercurius::config::Config;
use mercurius::namespace::Namespace;
use mercurius::pool::WorkerPool;
use mercurius::types::{Order, Portfolio};
use mercurius::wire::Fields;
use mercurius::worker;
use serde_json::json;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

fn symbols() -> Vec<String> {
    (0..20).map(|i| format!("S{i:02}")).collect()
}

fn pool_with_worker(rt: &Runtime) -> WorkerPool {
    rt.block_on(async {
        let pool = WorkerPool::new(&Config::default()).await.unwrap();
        pool.set_algorithm(
            Algorithm::new(
                vec![
                    AlgorithmFunction::new("load").first(),
                    AlgorithmFunction::new("signal").parallel(),
                    AlgorithmFunction::new("rebalance").last(),
                ],
                vec!["signals".to_string()],
            )
            .unwrap(),
        );

        let (broker, _) = pool.configure();
        let replier = Arc::new(worker::connect("127.0.0.1", broker).await.unwrap());
        tokio::spawn(worker::serve(replier, |task| {
            Ok(task
                .symbols
                .iter()
                .map(|symbol| Order::market_buy(symbol.as_str(), 1.0))
                .collect())
        }));
        pool
    })
}

fn benchmarks(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let pool = pool_with_worker(&rt);
    let symbols = symbols();
    let portfolio = Portfolio::default();
    let cancel = CancellationToken::new();

    c.bench_function("process cycle", |b| {
        b.to_async(&rt)
            .iter(|| pool.process(&cancel, 100, &symbols, &portfolio))
    });

    let namespace = Namespace::new(["signals"]);
    let mut fields = Fields::new();
    fields.insert("ABC".to_string(), json!(0.5));
    c.bench_function("namespace set and get", |b| {
        b.iter(|| {
            namespace.set("signals", fields.clone()).unwrap();
            namespace.get("signals")
        })
    });
}

criterion_group!(benches, benchmarks);
criterion_main!(benches);
