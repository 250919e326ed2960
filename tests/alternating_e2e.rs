use mine_ib::checkpoint::{resolve_bottleneck_dim, Checkpoint};
use mine_ib::config::TrainConfig;
use mine_ib::data::{gaussian_blobs, LabeledLoader};
use mine_ib::mine::Criterion;
use mine_ib::model::{MlpClassifier, MlpClassifierConfig};
use mine_ib::param::Parameterized;
use mine_ib::schedule::{Phase, Schedule};
use mine_ib::stats::{MlpStatistics, MlpStatisticsConfig};
use mine_ib::{Error, Trainer};
use std::path::PathBuf;

fn config() -> TrainConfig {
    TrainConfig {
        schedule: Some(Schedule::Interleaved { period: 3 }),
        criterion: Criterion::MineD,
        lr_clf: 0.05,
        lr_mine: 0.01,
        momentum: 0.5,
        batch_size: 32,
        epochs: 4,
        bottleneck_dim: 4,
        ema_decay: 0.9,
        seed: 11,
        ..Default::default()
    }
}

fn build(cfg: &TrainConfig) -> mine_ib::Result<Trainer<MlpClassifier, MlpStatistics>> {
    build_with_noise(cfg, 0.0)
}

fn build_with_noise(cfg: &TrainConfig, noise_std: f32) -> mine_ib::Result<Trainer<MlpClassifier, MlpStatistics>> {
    let clf = MlpClassifier::new(&MlpClassifierConfig {
        input_dim: 2,
        hidden: 16,
        bottleneck_dim: cfg.bottleneck_dim,
        num_classes: 3,
        seed: cfg.seed,
    });
    let stats = MlpStatistics::new(&MlpStatisticsConfig {
        dx: 2,
        dz: cfg.bottleneck_dim,
        hidden: 16,
        noise_std,
        seed: cfg.seed + 1,
    });
    Trainer::from_config(cfg, clf, stats)
}

/// Unshuffled loaders, so two runs see identical batches.
fn loaders(cfg: &TrainConfig) -> (LabeledLoader, LabeledLoader) {
    let train = gaussian_blobs(256, 3, 2, 4.0, 1).unwrap();
    let valid = gaussian_blobs(96, 3, 2, 4.0, 2).unwrap();
    (
        LabeledLoader::new(train, cfg.batch_size, false, cfg.drop_last, cfg.seed).unwrap(),
        LabeledLoader::new(valid, cfg.batch_size, false, false, cfg.seed).unwrap(),
    )
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join(format!("mine-ib-e2e-{}-{name}", std::process::id()))
        .join("ckpt.json")
}

fn max_abs_diff(a: &[ndarray::Array2<f32>], b: &[ndarray::Array2<f32>]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .flat_map(|(x, y)| x.iter().zip(y.iter()).map(|(p, q)| (p - q).abs()))
        .fold(0.0, f32::max)
}

#[test]
fn exactly_one_side_moves_per_minibatch() {
    let cfg = config();
    let mut trainer = build(&cfg).unwrap();
    let (mut train, _) = loaders(&cfg);

    let mut phases = Vec::new();
    for (step, (x, y)) in train.epoch().enumerate() {
        let clf_before = trainer.classifier().snapshot();
        let stats_before = trainer.mine().statistics().snapshot();

        let r = trainer.train_step(&x.view(), &y, step).unwrap();
        assert!(r.classifier_stepped ^ r.estimator_stepped, "step {step}: {r:?}");
        assert!(r.emi.is_finite() && r.xent.is_finite());

        let clf_moved = trainer.classifier().snapshot() != clf_before;
        let stats_moved = trainer.mine().statistics().snapshot() != stats_before;
        assert_eq!(clf_moved, r.classifier_stepped, "step {step}: classifier");
        assert_eq!(stats_moved, r.estimator_stepped, "step {step}: statistics");
        phases.push(r.phase);
    }

    // 256 rows / 32 = 8 steps; period 3 puts the classifier on steps 0, 3, 6.
    let expected: Vec<Phase> = (0..8)
        .map(|i| if i % 3 == 0 { Phase::Classifier } else { Phase::Estimator })
        .collect();
    assert_eq!(phases, expected);
    assert_eq!(trainer.global_step(), 8);
}

#[test]
fn fit_tracks_best_validation_and_saves_on_improvement() {
    let cfg = config();
    let mut trainer = build(&cfg).unwrap();
    let (mut train, mut valid) = loaders(&cfg);
    let path = temp_path("fit");

    let reports = trainer.fit(&mut train, &mut valid, 3, Some(&path)).unwrap();
    assert_eq!(reports.len(), 3);
    assert!(reports[0].improved, "first validation always counts as an improvement");

    let mut best = f32::INFINITY;
    for r in &reports {
        assert!((0.0..=100.0).contains(&r.valid_error), "{r:?}");
        best = best.min(r.valid_error);
        assert_eq!(r.best_valid_error, best);
        assert_eq!(r.steps, 8);
    }
    assert_eq!(trainer.epoch(), 3);

    let saved = Checkpoint::load(&path).unwrap();
    let saved_best = saved.best_validation_error.unwrap();
    assert!((saved_best - best).abs() < 1e-4, "saved={saved_best} best={best}");
    assert_eq!(saved.bottleneck_dim, 4);
    assert!(saved.mine.is_some(), "EMA persisted by default");
    std::fs::remove_dir_all(path.parent().unwrap()).ok();
}

#[test]
fn resumed_run_matches_uninterrupted_run() {
    let cfg = config();

    let mut straight = build(&cfg).unwrap();
    let (mut train, mut valid) = loaders(&cfg);
    straight.fit(&mut train, &mut valid, 4, None).unwrap();

    let path = temp_path("resume");
    let mut first_half = build(&cfg).unwrap();
    let (mut train, mut valid) = loaders(&cfg);
    first_half.fit(&mut train, &mut valid, 2, None).unwrap();
    first_half.checkpoint().save(&path).unwrap();
    let ema_at_save = first_half.mine().ema_denominator();
    drop(first_half);

    let ckpt = Checkpoint::load(&path).unwrap();
    let mut resumed = build(&cfg).unwrap();
    resumed.restore(ckpt).unwrap();
    assert_eq!(resumed.epoch(), 2);
    assert_eq!(resumed.global_step(), 16);
    assert_eq!(resumed.mine().ema_denominator(), ema_at_save);

    let (mut train, mut valid) = loaders(&cfg);
    let reports = resumed.fit(&mut train, &mut valid, 4, None).unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].epoch, 3);

    let d_clf = max_abs_diff(&resumed.classifier().snapshot(), &straight.classifier().snapshot());
    let d_stats = max_abs_diff(
        &resumed.mine().statistics().snapshot(),
        &straight.mine().statistics().snapshot(),
    );
    assert!(d_clf < 1e-4, "classifier drift {d_clf}");
    assert!(d_stats < 1e-4, "statistics drift {d_stats}");
    assert_eq!(resumed.global_step(), straight.global_step());
    std::fs::remove_dir_all(path.parent().unwrap()).ok();
}

#[test]
fn resumed_run_replays_statistics_noise() {
    let cfg = config();

    let mut straight = build_with_noise(&cfg, 0.3).unwrap();
    let (mut train, mut valid) = loaders(&cfg);
    straight.fit(&mut train, &mut valid, 3, None).unwrap();

    let path = temp_path("noise");
    let mut first = build_with_noise(&cfg, 0.3).unwrap();
    let (mut train, mut valid) = loaders(&cfg);
    first.fit(&mut train, &mut valid, 1, None).unwrap();
    first.checkpoint().save(&path).unwrap();
    drop(first);

    let ckpt = Checkpoint::load(&path).unwrap();
    assert!(ckpt.statistics_noise.is_some());
    let mut resumed = build_with_noise(&cfg, 0.3).unwrap();
    resumed.restore(ckpt).unwrap();
    let (mut train, mut valid) = loaders(&cfg);
    resumed.fit(&mut train, &mut valid, 3, None).unwrap();

    let d_stats = max_abs_diff(
        &resumed.mine().statistics().snapshot(),
        &straight.mine().statistics().snapshot(),
    );
    let d_clf = max_abs_diff(&resumed.classifier().snapshot(), &straight.classifier().snapshot());
    assert!(d_stats < 1e-4, "statistics drift {d_stats}");
    assert!(d_clf < 1e-4, "classifier drift {d_clf}");
    std::fs::remove_dir_all(path.parent().unwrap()).ok();
}

#[test]
fn stored_bottleneck_width_overrides_request() {
    let cfg = config();
    let trainer = build(&cfg).unwrap();
    let ckpt = trainer.checkpoint();

    let requested = TrainConfig {
        bottleneck_dim: 8,
        ..config()
    };
    let dim = resolve_bottleneck_dim(requested.bottleneck_dim, Some(&ckpt));
    assert_eq!(dim, 4);

    let resolved = TrainConfig {
        bottleneck_dim: dim,
        ..requested.clone()
    };
    build(&resolved).unwrap().restore(ckpt.clone()).unwrap();

    let mut wrong = build(&requested).unwrap();
    assert!(matches!(wrong.restore(ckpt), Err(Error::Config(_))));
}

#[test]
fn checkpoint_without_ema_restarts_bias_correction() {
    let cfg = TrainConfig {
        persist_ema: false,
        ..config()
    };
    let mut trainer = build(&cfg).unwrap();
    let (mut train, mut valid) = loaders(&cfg);
    trainer.fit(&mut train, &mut valid, 1, None).unwrap();
    assert!(trainer.mine().ema_denominator().is_some());

    let ckpt = trainer.checkpoint();
    assert!(ckpt.mine.is_none());

    let mut resumed = build(&cfg).unwrap();
    resumed.restore(ckpt).unwrap();
    assert!(resumed.mine().ema_denominator().is_none());
    assert_eq!(resumed.epoch(), 1);
}
