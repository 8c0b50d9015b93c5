//! Structural loss vs. angle noise on a synthetic batch (ndarray path).
//!
//! Usage: `cargo run --example drmsd_synthetic -- [batch] [max_len] [seed]`

use foldloss::config::{LossConfig, Parallelism};
use foldloss::loss::{angle_mse_loss, structural_loss_report};
use foldloss::synthetic::{perturb_batch, random_angle_batch};
use std::time::Instant;

fn arg_or<T: std::str::FromStr>(args: &[String], i: usize, default: T) -> T {
    args.get(i).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    let batch: usize = arg_or(&args, 1, 16);
    let max_len: usize = arg_or(&args, 2, 128);
    let seed: u64 = arg_or(&args, 3, 7);

    let (gold, lens) = random_angle_batch(batch, max_len, max_len / 4, seed).unwrap();
    println!(
        "batch={batch} max_len={max_len} lengths={:?}",
        lens.0
    );
    println!("{:>8} {:>12} {:>12} {:>10}", "noise", "dRMSD (Å)", "angle MSE", "ms");

    let cfg = LossConfig {
        parallelism: Parallelism::Rayon,
        ..LossConfig::default()
    };
    for (k, scale) in [0.0f32, 0.02, 0.05, 0.1, 0.2, 0.5, 1.0].into_iter().enumerate() {
        let pred = perturb_batch(&gold, &lens, scale, seed + 100 + k as u64).unwrap();
        let start = Instant::now();
        let report = structural_loss_report(&pred.view(), &gold.view(), Some(&lens), &cfg).unwrap();
        let ms = start.elapsed().as_secs_f64() * 1e3;
        let mse = angle_mse_loss(&pred.view(), &gold.view(), Some(&lens)).unwrap();
        println!("{scale:>8.2} {:>12.4} {mse:>12.5} {ms:>10.2}", report.mean);
    }
}
