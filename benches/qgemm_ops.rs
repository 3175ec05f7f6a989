//! Quantized GEMM benchmarks on the emulated graph device
//!
//! Measures one full execute (compile, bind, upload, dispatch, readback) on
//! the fused fast path and on the reference lowering, plus the host kernels
//! alone.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use qgemm::backends::{EmulatedDevice, GraphBackend};
use qgemm::operator::{ExecutionTarget, GraphConfig, Operator, QuantizedGemm, QuantizedGemmParams};
use qgemm::quant::BlockQuantizedView;
use qgemm::tensor::ResourceIndex;

fn params(size: u32) -> QuantizedGemmParams {
    QuantizedGemmParams {
        m: size,
        k: size,
        n: size,
        block_size: 32,
        b_transposed: true,
    }
}

fn bench_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("qgemm_execute");
    group.sample_size(10);

    for size in [64u32, 128, 256] {
        let op = QuantizedGemm::new(params(size)).unwrap();
        group.throughput(Throughput::Elements(u64::from(size).pow(3)));

        for (label, config) in [("fused", GraphConfig::default()), ("reference", GraphConfig::reference())] {
            group.bench_with_input(BenchmarkId::new(label, size), &size, |bencher, _| {
                let mut backend = GraphBackend::Emulated(EmulatedDevice::new());
                bencher.iter(|| {
                    black_box(
                        op.execute(ExecutionTarget::Graph {
                            backend: &mut backend,
                            config,
                        })
                        .unwrap(),
                    );
                });
            });
        }
    }

    group.finish();
}

fn bench_dequantize(c: &mut Criterion) {
    let mut group = c.benchmark_group("qgemm_dequantize");

    for size in [128u32, 512] {
        let op = QuantizedGemm::new(params(size)).unwrap();
        let view = BlockQuantizedView::new(
            size as usize,
            size as usize,
            32,
            op.buffer(ResourceIndex::B),
            op.buffer(ResourceIndex::BScale),
            op.buffer(ResourceIndex::BZeroPoint),
        )
        .unwrap();
        group.throughput(Throughput::Elements(u64::from(size) * u64::from(size)));

        group.bench_with_input(BenchmarkId::new("view", size), &size, |bencher, _| {
            bencher.iter(|| {
                let mut sum = 0.0f32;
                for row in 0..view.rows() {
                    for col in 0..view.cols() {
                        sum += view.get(row, col).to_f32();
                    }
                }
                black_box(sum)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_execute, bench_dequantize);
criterion_main!(benches);
