//! Merge pass benchmarks
//!
//! Measures adapter parsing and a full merge pass over a small synthetic
//! model, for f32 and Q8_0 targets and several thread counts.
//!
//! ## Usage
//!
//! ```bash
//! cargo bench --bench merge
//! cargo bench --bench merge -- merge_pass/q8_0
//! ```

#![allow(clippy::cast_precision_loss)]

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

use adaptar::lora::format::LoraAdapterFile;
use adaptar::lora::LoraFileBuilder;
use adaptar::{apply_lora, quantize, ElementType, LoadedModel, LoraConfig, TensorDesc};

const RANK: usize = 8;
const DIM: usize = 256;
const LAYERS: usize = 4;

fn ramp(n: usize, seed: usize) -> Vec<f32> {
    (0..n).map(|i| ((i * 31 + seed * 7) % 97) as f32 / 97.0 - 0.5).collect()
}

fn tensor_name(layer: usize) -> String {
    format!("blk.{layer}.attn_q.weight")
}

fn write_adapter(dir: &TempDir) -> std::path::PathBuf {
    let mut builder = LoraFileBuilder::new(RANK as u32, 16);
    for layer in 0..LAYERS {
        let name = tensor_name(layer);
        builder = builder
            .add_f16(&format!("{name}.loraA"), &[RANK, DIM], &ramp(RANK * DIM, layer))
            .add_f16(&format!("{name}.loraB"), &[RANK, DIM], &ramp(RANK * DIM, layer + 1));
    }
    let path = dir.path().join("bench.ggla");
    builder.write_to(&path).expect("write adapter");
    path
}

fn build_model(dtype: ElementType) -> LoadedModel {
    let mut model = LoadedModel::new();
    for layer in 0..LAYERS {
        let data = quantize::encode(dtype, &ramp(DIM * DIM, layer)).expect("encode");
        model
            .insert(tensor_name(layer), TensorDesc::new(dtype, [DIM, DIM]), data)
            .expect("insert");
    }
    model
}

fn benchmark_parse(c: &mut Criterion) {
    let dir = TempDir::new().expect("tempdir");
    let path = write_adapter(&dir);

    c.bench_function("adapter_parse", |b| {
        b.iter(|| black_box(LoraAdapterFile::open(&path).expect("parse")));
    });
}

fn benchmark_merge(c: &mut Criterion) {
    let dir = TempDir::new().expect("tempdir");
    let path = write_adapter(&dir);

    let mut group = c.benchmark_group("merge_pass");
    group.throughput(Throughput::Elements((LAYERS * DIM * DIM) as u64));
    group.sample_size(20);

    for (label, dtype) in [("f32", ElementType::F32), ("q8_0", ElementType::Q8_0)] {
        let model = build_model(dtype);
        for threads in [1usize, 4] {
            let config = LoraConfig::default().with_threads(threads);
            group.bench_with_input(BenchmarkId::new(label, threads), &config, |b, config| {
                b.iter_batched(
                    || model.clone(),
                    |mut model| black_box(apply_lora(&mut model, &path, config).expect("merge")),
                    BatchSize::LargeInput,
                );
            });
        }
    }

    group.finish();
}

criterion_group!(benches, benchmark_parse, benchmark_merge);
criterion_main!(benches);
