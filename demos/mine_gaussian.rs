//! MINE on correlated Gaussians, then a short information-bottleneck run.
//!
//! Prints:
//! - the batch eMI trace (moving average) against the closed-form `I(X; Z)`
//! - per-epoch train/valid error and eMI for the alternating loop
//!
//! Optional argument: path to a `TrainConfig` JSON file for the second part.
//! Set `RUST_LOG=debug` for per-step logs.

use mine_ib::checkpoint::{resolve_bottleneck_dim, Checkpoint};
use mine_ib::config::TrainConfig;
use mine_ib::data::{correlated_gaussians, gaussian_blobs, gaussian_mi, LabeledLoader, PairedDataset};
use mine_ib::mine::{Criterion, Mine};
use mine_ib::model::{MlpClassifier, MlpClassifierConfig};
use mine_ib::optim::{build_optimizer, OptimOptions, ParamGroup};
use mine_ib::stats::{MlpStatistics, MlpStatisticsConfig};
use mine_ib::Trainer;
use tracing_subscriber::EnvFilter;

fn estimate_gaussian_mi() -> Result<(), Box<dyn std::error::Error>> {
    let d = 2usize;
    let noise_std = 0.5f32;
    let stats = MlpStatistics::new(&MlpStatisticsConfig {
        dx: d,
        dz: d,
        hidden: 64,
        noise_std: 0.0,
        seed: 3,
    });
    let mut mine = Mine::new(stats, Criterion::MineD, 0.99, 5)?;
    let mut opt = build_optimizer(
        "adam",
        vec![ParamGroup::all()],
        OptimOptions {
            lr: 1e-3,
            ..Default::default()
        },
    )?;

    let mut avg = 0.0f32;
    for step in 0..2_000u64 {
        let (x, z) = correlated_gaussians(256, d, noise_std, 1_000 + step);
        let (emi, loss) = mine.estimate_on_batch(&x.view(), &z.view())?;
        opt.zero_grad(mine.statistics_mut());
        mine.backward(&loss);
        opt.step(mine.statistics_mut())?;

        avg = if step == 0 { emi } else { 0.98 * avg + 0.02 * emi };
        if step % 200 == 0 {
            println!("step={step:4} eMI(avg)={avg:.4}");
        }
    }

    let (x, z) = correlated_gaussians(4096, d, noise_std, 7);
    let mut loader = PairedDataset::new(x, z, 256, true, 11)?;
    let dataset_emi = mine.estimate_on_dataset(&mut loader)?;
    println!(
        "dataset eMI={dataset_emi:.4} closed form={:.4}",
        gaussian_mi(d, noise_std)
    );
    Ok(())
}

fn information_bottleneck(cfg: TrainConfig) -> Result<(), Box<dyn std::error::Error>> {
    let existing = match &cfg.checkpoint_path {
        Some(path) => Checkpoint::load_if_exists(path)?,
        None => None,
    };
    let cfg = TrainConfig {
        bottleneck_dim: resolve_bottleneck_dim(cfg.bottleneck_dim, existing.as_ref()),
        ..cfg
    };

    let num_classes = 4;
    let input_dim = 2;
    let train = gaussian_blobs(2_048, num_classes, input_dim, 3.0, cfg.seed)?;
    let valid = gaussian_blobs(512, num_classes, input_dim, 3.0, cfg.seed + 1)?;
    let mut train = LabeledLoader::new(train, cfg.batch_size, true, cfg.drop_last, cfg.seed)?;
    let mut valid = LabeledLoader::new(valid, cfg.batch_size, false, false, cfg.seed)?;

    let classifier = MlpClassifier::new(&MlpClassifierConfig {
        input_dim,
        hidden: 64,
        bottleneck_dim: cfg.bottleneck_dim,
        num_classes,
        seed: cfg.seed,
    });
    let stats = MlpStatistics::new(&MlpStatisticsConfig {
        dx: input_dim,
        dz: cfg.bottleneck_dim,
        hidden: 64,
        noise_std: 0.3,
        seed: cfg.seed + 2,
    });
    let mut trainer = Trainer::from_config(&cfg, classifier, stats)?;
    if let Some(ckpt) = existing {
        trainer.restore(ckpt)?;
        println!("resumed at epoch {}", trainer.epoch());
    }

    let reports = trainer.fit(&mut train, &mut valid, cfg.epochs, cfg.checkpoint_path.as_deref())?;
    for r in &reports {
        println!(
            "epoch={:3} train_err={:5.2}% valid_err={:5.2}% best={:5.2}% xent={:.4} eMI={:.4}",
            r.epoch, r.train_error, r.valid_error, r.best_valid_error, r.xent, r.emi
        );
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    estimate_gaussian_mi()?;

    let cfg = match std::env::args().nth(1) {
        Some(path) => TrainConfig::from_json_file(path)?,
        None => TrainConfig {
            batch_size: 64,
            epochs: 5,
            bottleneck_dim: 8,
            lr_mine: 1e-3,
            ..Default::default()
        },
    };
    information_bottleneck(cfg)
}
