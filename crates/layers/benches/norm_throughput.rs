use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::{ComputePolicy, LayerNorm, Linear, LinearConfig, LinearInit, NormConfig};

fn bench_projection_and_norm(c: &mut Criterion) {
    let device = Device::Cpu;
    let batch = 4usize;
    let seq = 64usize;

    for dtype in [DType::F32, DType::BF16] {
        let mut group = c.benchmark_group(format!("proj_norm/{dtype:?}"));
        for hidden in [256usize, 512, 1024] {
            let input = Tensor::randn(0f32, 1.0, (batch, seq, hidden), &device)
                .and_then(|t| t.to_dtype(dtype))
                .expect("input");
            let policy = ComputePolicy::from_parameter_dtype(dtype);
            let norm = LayerNorm::identity(NormConfig::new(hidden), &device, dtype).expect("norm");
            let proj = Linear::with_init(
                LinearConfig::without_bias(hidden, hidden),
                &LinearInit::XavierUniform,
                &device,
                dtype,
            )
            .expect("projection");

            group.throughput(Throughput::Elements((batch * seq * hidden) as u64));
            group.bench_with_input(
                BenchmarkId::new("layer_norm", hidden),
                &(norm, input.clone()),
                |b, (norm, input)| {
                    b.iter(|| black_box(norm.forward(black_box(input), &policy).expect("forward")));
                },
            );
            group.bench_with_input(
                BenchmarkId::new("projection", hidden),
                &(proj, input),
                |b, (proj, input)| {
                    b.iter(|| black_box(proj.forward(black_box(input), &policy).expect("forward")));
                },
            );
        }
        group.finish();
    }
}

criterion_group!(benches, bench_projection_and_norm);
criterion_main!(benches);
