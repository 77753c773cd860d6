// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1

//! Dataset Throughput Benchmarks
//!
//! Benchmark Categories:
//! 1. Prompt composition for both caption sources
//! 2. Batch collation and full data-loader passes
//! 3. Answer normalization for accuracy scoring
//! 4. Encoder preprocessing on synthetic images
//!
//! None of these need model files.

use aravqa::captioning::Caption;
use aravqa::dataset::{
    AuxiliaryRecord, BaseRecord, BatchCollator, DataLoader, DualSourceDataset, InMemorySource,
    Metadata, PromptComposer,
};
use aravqa::evaluation::normalize_answer;
use aravqa::vision::{preprocess_batch, PreprocessConfig};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use image::{Rgb, RgbImage};

type Dataset = DualSourceDataset<InMemorySource<BaseRecord>, InMemorySource<AuxiliaryRecord>>;

fn sample_captions(seed: usize, count: usize) -> Vec<Caption> {
    let words = [
        "سيارة", "حمراء", "في", "الشارع", "رجل", "يركب", "دراجة", "قطة", "على", "الطاولة",
    ];
    (0..count)
        .map(|i| {
            let text: Vec<&str> = (0..6).map(|j| words[(seed + i + j) % words.len()]).collect();
            Caption::with_confidence(text.join(" "), 1.0 / (i as f32 + 1.0))
        })
        .collect()
}

fn build_dataset(n: usize) -> Dataset {
    let base: Vec<BaseRecord> = (0..n)
        .map(|i| {
            BaseRecord::new(Metadata::new(i as i64, i as i64), "ما لون السيارة؟")
                .with_answers(["أحمر", "أحمر", "قرمزي"])
                .with_multiple_choice_answer("أحمر")
                .with_captions(sample_captions(i, 3))
        })
        .collect();
    let aux: Vec<AuxiliaryRecord> = (0..n)
        .map(|i| AuxiliaryRecord::new(sample_captions(i + 5, 3)))
        .collect();
    DualSourceDataset::new(base.into(), aux.into()).unwrap()
}

//
// CATEGORY 1: Prompt composition
//

fn bench_compose(c: &mut Criterion) {
    let composer = PromptComposer::default();
    let a = sample_captions(0, 5);
    let b = sample_captions(3, 5);

    c.bench_function("compose_prompt", |bench| {
        bench.iter(|| composer.compose(black_box("ما لون السيارة؟"), black_box(&a), black_box(&b)))
    });
}

//
// CATEGORY 2: Collation
//

fn bench_collate(c: &mut Criterion) {
    let dataset = build_dataset(1024);
    let collator = BatchCollator::default();

    let mut group = c.benchmark_group("collate");
    for size in [8usize, 32, 128].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |bench, &size| {
            bench.iter(|| {
                let records = (0..size).filter_map(|i| dataset.get(i));
                collator.collate(black_box(records)).unwrap()
            })
        });
    }
    group.finish();
}

fn bench_loader_pass(c: &mut Criterion) {
    let dataset = build_dataset(1024);

    c.bench_function("loader_full_pass_32", |bench| {
        bench.iter(|| {
            let loader = DataLoader::new(&dataset, BatchCollator::default(), 32).unwrap();
            let total: usize = loader.map(|batch| batch.unwrap().len()).sum();
            assert_eq!(total, 1024);
            total
        })
    });
}

//
// CATEGORY 3: Answer normalization
//

fn bench_normalize_answer(c: &mut Criterion) {
    c.bench_function("normalize_answer", |bench| {
        bench.iter(|| normalize_answer(black_box("  أَحْمَـــر، The Red car!  ")))
    });
}

//
// CATEGORY 4: Preprocessing
//

fn bench_preprocess(c: &mut Criterion) {
    let images: Vec<RgbImage> = (0..8)
        .map(|i| RgbImage::from_pixel(320 + i * 16, 240, Rgb([i as u8 * 20, 100, 200])))
        .collect();
    let config = PreprocessConfig::clip();

    c.bench_function("preprocess_batch_8", |bench| {
        bench.iter(|| preprocess_batch(black_box(&images), &config))
    });
}

criterion_group!(
    benches,
    bench_compose,
    bench_collate,
    bench_loader_pass,
    bench_normalize_answer,
    bench_preprocess
);
criterion_main!(benches);
