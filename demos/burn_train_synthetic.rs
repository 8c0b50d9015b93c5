//! Train the residue MLP baseline against the structural loss on synthetic batches.
//!
//! Usage: `cargo run --example burn_train_synthetic -- [cpu-execution|accelerated-execution] [epochs]`
//!
//! `accelerated-execution` needs the `wgpu` feature; without it the demo falls back to the CPU.

#[cfg(not(feature = "burn"))]
fn main() {
    eprintln!("This example requires the `burn` feature.");
    eprintln!("Run: cargo run --example burn_train_synthetic --features burn");
}

#[cfg(feature = "burn")]
fn run<B: burn_core::tensor::backend::AutodiffBackend>(device: B::Device, epochs: usize) {
    use foldloss::burn_train::{
        train, AngleBatch, RecorderCheckpointSink, ResidueMlpConfig, SaveMode, TrainConfig,
    };
    use foldloss::synthetic::{basin_tokens, position_ids, random_angle_batch};

    let max_len = 48;
    let make = |n: usize, seed: u64| -> Vec<AngleBatch<B>> {
        (0..n)
            .map(|i| {
                let (tgt, lens) = random_angle_batch(8, max_len, 12, seed + i as u64).unwrap();
                let seq = basin_tokens(&tgt, &lens).unwrap();
                let pos = position_ids(&lens, max_len).unwrap();
                AngleBatch::from_arrays(&device, &seq, &pos, &tgt)
                    .unwrap()
                    .with_lengths(lens)
                    .unwrap()
            })
            .collect()
    };
    let train_data = make(16, 1);
    let valid_data = make(4, 10_000);

    let model = ResidueMlpConfig {
        n_tokens: 3,
        max_positions: max_len + 1,
        d_model: 64,
        hidden: 128,
    }
    .init::<B>(&device);

    let out_dir = std::env::temp_dir().join("foldloss_demo");
    std::fs::create_dir_all(&out_dir).unwrap();
    let cfg = TrainConfig {
        epochs,
        step_when: Some(5),
        d_model: 64,
        warmup_steps: 32,
        lr_factor: 0.5,
        save_mode: SaveMode::Best,
        log_prefix: Some(out_dir.join("structural")),
        ..TrainConfig::default()
    };
    let mut sink = RecorderCheckpointSink::new(out_dir.join("model"));

    let (_, report) = train(model, &train_data, &valid_data, &cfg, &device, Some(&mut sink)).unwrap();
    for r in &report.epochs {
        println!(
            "epoch {:>3}  train {:>9.4}  valid {:>9.4}",
            r.epoch, r.train_loss, r.valid_loss
        );
    }
    println!(
        "best epoch: {:?}, stopped early: {}, logs in {}",
        report.best_epoch,
        report.stopped_early,
        out_dir.display()
    );
}

#[cfg(feature = "burn")]
fn main() {
    use foldloss::config::ExecutionTarget;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let target: ExecutionTarget = args
        .get(1)
        .map(|s| s.parse().unwrap())
        .unwrap_or_default();
    let epochs: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(20);
    println!("execution target: {target}");

    match target {
        ExecutionTarget::Cpu => run::<foldloss::burn_train::BurnBackend>(Default::default(), epochs),
        ExecutionTarget::Accelerated => {
            #[cfg(feature = "wgpu")]
            {
                type Accel = burn_autodiff::Autodiff<burn_wgpu::Wgpu>;
                run::<Accel>(burn_wgpu::WgpuDevice::default(), epochs);
            }
            #[cfg(not(feature = "wgpu"))]
            {
                tracing::warn!("built without the `wgpu` feature, running on the CPU");
                run::<foldloss::burn_train::BurnBackend>(Default::default(), epochs);
            }
        }
    }
}
