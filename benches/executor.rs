use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use model_executor::cache::{CacheEntry, CacheKey, ResultCache};
use model_executor::prelude::*;

fn dense_descriptor(inputs: usize, outputs: usize) -> serde_json::Value {
    let weights: Vec<Vec<f32>> = (0..outputs)
        .map(|o| (0..inputs).map(|i| ((o + i) % 7) as f32 * 0.1).collect())
        .collect();
    serde_json::json!({
        "input_shape": [inputs],
        "output_shape": [outputs],
        "weights": weights,
        "activation": "softmax"
    })
}

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("result_cache");
    let model = ModelId::from("bench");

    for size in [64usize, 1024].iter() {
        let cache = ResultCache::new(10_000, 256 * 1024 * 1024);
        let keys: Vec<CacheKey> = (0..1000)
            .map(|i| CacheKey::new(model.clone(), &Payload::from(vec![i as f32; *size])))
            .collect();
        for key in &keys {
            cache.put(key.clone(), CacheEntry::new(Payload::zeros(*size), 1.0));
        }

        group.bench_with_input(BenchmarkId::new("get", size), &keys, |b, keys| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % keys.len();
                black_box(cache.get(&keys[i]))
            })
        });

        group.bench_with_input(BenchmarkId::new("key", size), size, |b, size| {
            let input = Payload::from(vec![0.5_f32; *size]);
            b.iter(|| black_box(CacheKey::new(model.clone(), &input)))
        });
    }

    group.finish();
}

fn bench_inference(c: &mut Criterion) {
    let mut group = c.benchmark_group("inference");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dense.json");
    std::fs::write(&path, dense_descriptor(128, 16).to_string()).unwrap();

    let executor = ModelExecutor::new(ExecutorConfig::default(), Arc::new(DenseModelLoader::new())).unwrap();
    let model = executor.load_model("dense", &path, ExecutionDevice::Cpu).unwrap();

    group.bench_function("sync_cache_hit", |b| {
        let input = vec![0.25_f32; 128];
        executor.run_inference::<Vec<f32>>(&model, input.clone(), 5).unwrap();
        b.iter(|| {
            executor
                .run_inference::<Vec<f32>>(&model, black_box(input.clone()), 5)
                .unwrap()
        })
    });

    group.bench_function("sync_cache_miss", |b| {
        let mut n = 0u32;
        b.iter(|| {
            n = n.wrapping_add(1);
            let mut input = vec![0.0_f32; 128];
            input[0] = n as f32;
            executor
                .run_inference::<Vec<f32>>(&model, black_box(input), 5)
                .unwrap()
        })
    });

    group.finish();
    executor.shutdown();
}

criterion_group!(benches, bench_cache, bench_inference);
criterion_main!(benches);
