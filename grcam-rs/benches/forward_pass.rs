use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use grcam_rs::data::SyntheticDataset;
use grcam_rs::{GrcamConfig, GrcamModel, Trainer};

const TINY_YAML: &str = r#"
model:
  img_width: 8
  img_height: 8
  glimpse_width: 4
  glimpse_height: 4
  g_size: 16
  l_size: 16
  glimpse_output_size: 8
  cell_size: 16
  nb_glimpses: 2
  nb_classes: 2
training:
  learning_rate: 5.0e-3
  batch_size: 2
output_dir: ./outputs/bench
seed: 42
"#;

fn bench_config_from_yaml(c: &mut Criterion) {
    c.bench_function("config_from_yaml", |b| {
        b.iter(|| {
            let config: GrcamConfig = black_box(serde_yaml::from_str(TINY_YAML).unwrap());
            black_box(config.validate()).unwrap();
        });
    });
}

fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward");
    let config = GrcamConfig::mnist_preset();
    let mut model = GrcamModel::new(&config, &Device::Cpu).unwrap();

    for batch in [1usize, 8, 32] {
        let signals = Tensor::randn(0f32, 1.0, (batch, 28, 28), &Device::Cpu).unwrap();
        group.bench_with_input(BenchmarkId::new("mnist", batch), &batch, |b, _| {
            b.iter(|| black_box(model.forward(&signals).unwrap()));
        });
    }

    group.finish();
}

fn bench_train_step(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = GrcamConfig::mnist_preset();
    config.output_dir = dir.path().to_string_lossy().into_owned();
    let dataset = SyntheticDataset::generate(&config.model, 32, config.seed);
    let batch = dataset.batch(0, 32, &Device::Cpu).unwrap();
    let mut trainer = Trainer::with_device(config, Device::Cpu).unwrap();

    c.bench_function("train_step_mnist_32", |b| {
        b.iter(|| black_box(trainer.train_step(&batch).unwrap()));
    });
}

criterion_group!(benches, bench_config_from_yaml, bench_forward, bench_train_step);
criterion_main!(benches);
