use burn::optim::AdamConfig;
use clap::Parser;
use std::fs;
use std::path::Path;
use training::loss::{LossKind, SegmentationLoss};
use training::util::{ADBackend, ModelKind, TrainEpochConfig};
use training::{
    infer, resolve_config, run, train_epoch, RegularizationConfig, SegmentationArgs,
    SegmentationNetwork, TrainBackend,
};
use volume_dataset::{
    write_phantom_dataset, MriDatasetConfig, MriSegmentation, PhantomConfig, VolumeManifest,
    DEFAULT_MANIFEST_NAME,
};

fn phantom_root(root: &Path) -> anyhow::Result<()> {
    let cfg = PhantomConfig {
        shape: [9, 8, 7],
        num_classes: 3,
        noise: 0.02,
        seed: 11,
    };
    let subjects: Vec<String> = ["t1", "t2", "v1", "x1"].iter().map(|s| s.to_string()).collect();
    write_phantom_dataset(root, &subjects, &cfg)?;
    fs::write(
        root.join("segmentation.toml"),
        format!(
            "dataset_root = \"{}\"\n\n[splits]\ntrain = [\"t1\", \"t2\"]\nvalidation = [\"v1\"]\ntest = [\"x1\"]\n",
            root.display()
        ),
    )?;
    Ok(())
}

fn args(root: &Path, extra: &[&str]) -> anyhow::Result<SegmentationArgs> {
    let mut argv: Vec<String> = vec![
        "train".into(),
        "--model".into(),
        "tiny".into(),
        "--config".into(),
        root.join("segmentation.toml").display().to_string(),
        "--patch-size".into(),
        "4".into(),
        "--batch-size".into(),
        "2".into(),
        "--seed".into(),
        "7".into(),
        "--metrics-out".into(),
        root.join("logs/metrics.jsonl").display().to_string(),
    ];
    argv.extend(extra.iter().map(|s| s.to_string()));
    Ok(SegmentationArgs::try_parse_from(argv)?)
}

#[test]
fn train_then_test_on_phantom_dataset() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path();
    phantom_root(root)?;
    let ckpt = root.join("ckpt/seg.bin");

    let train_args = args(
        root,
        &[
            "--training-epochs",
            "2",
            "--loss",
            "dice",
            "--randomize-orientation",
            "--batchsize-multiplier",
            "2",
            "--lr-decay-start",
            "0",
            "--lr-decay-base",
            "0.5",
            "--checkpoint-out",
            &ckpt.display().to_string(),
        ],
    )?;
    let cfg = resolve_config(&train_args)?;
    let summary = run(&train_args, &cfg)?;
    assert!((0.0..=1.0).contains(&summary.dice), "{summary:?}");
    assert!(summary.loss.is_finite());
    assert!(ckpt.exists());

    let metrics = fs::read_to_string(root.join("logs/metrics.jsonl"))?;
    let lines: Vec<serde_json::Value> = metrics
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1]["lr"], 5e-3);

    let preds = root.join("preds");
    let test_args = args(
        root,
        &[
            "--mode",
            "test",
            "--loss",
            "cross-entropy",
            "--class-weighting",
            "--checkpoint",
            &ckpt.display().to_string(),
            "--predictions-out",
            &preds.display().to_string(),
        ],
    )?;
    let cfg = resolve_config(&test_args)?;
    let summary = run(&test_args, &cfg)?;
    assert!((0.0..=1.0).contains(&summary.dice));

    let manifest = VolumeManifest::load(&preds.join(DEFAULT_MANIFEST_NAME))?;
    assert_eq!(manifest.subjects.len(), 1);
    assert_eq!(manifest.subjects[0].id, "x1");
    assert_eq!(manifest.subjects[0].shape, [9, 8, 7]);
    Ok(())
}

#[test]
fn overlapping_splits_are_refused() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path();
    phantom_root(root)?;
    fs::write(
        root.join("segmentation.toml"),
        format!(
            "dataset_root = \"{}\"\n\n[splits]\ntrain = [\"t1\"]\nvalidation = [\"t1\"]\ntest = [\"x1\"]\n",
            root.display()
        ),
    )?;
    let a = args(root, &["--training-epochs", "1"])?;
    let cfg = resolve_config(&a)?;
    let err = run(&a, &cfg).unwrap_err();
    assert!(err.to_string().contains("overlap"), "{err}");
    Ok(())
}

#[test]
fn inference_covers_every_voxel_with_shifted_grids() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    phantom_root(tmp.path())?;
    let manifest = tmp.path().join(DEFAULT_MANIFEST_NAME);
    let subjects = vec!["t1".to_string(), "v1".to_string()];
    let dataset_cfg = MriDatasetConfig {
        seed: Some(3),
        ..MriDatasetConfig::cubic(4)
    };
    let dataset = MriSegmentation::open(&manifest, &subjects, &dataset_cfg)?;

    let device = Default::default();
    let model = SegmentationNetwork::<TrainBackend>::new(&ModelKind::Tiny.config(1, 3), &device);
    let loss = SegmentationLoss::new(LossKind::CrossEntropy, None);
    let (volumes, loss_value) = infer(&model, &dataset, &loss, 3, &device)?;
    assert_eq!(volumes.len(), 2);
    assert!(volumes.iter().all(|v| v.len() == 9 * 8 * 7));
    assert!(volumes.iter().flatten().all(|&l| l < 3));
    assert!(loss_value.is_finite() && loss_value > 0.0);
    Ok(())
}

#[test]
fn trailing_accumulated_gradients_are_applied() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    phantom_root(tmp.path())?;
    let manifest = tmp.path().join(DEFAULT_MANIFEST_NAME);
    let dataset = MriSegmentation::open(
        &manifest,
        &["t1".to_string()],
        &MriDatasetConfig {
            randomize_patch_offsets: false,
            ..MriDatasetConfig::cubic(4)
        },
    )?;
    // 9x8x7 with 4^3 patches and no offset: 3 * 2 * 2 = 12 patches, 6 batches.
    assert_eq!(dataset.len(), 12);

    let device = Default::default();
    let model = SegmentationNetwork::<ADBackend>::new(&ModelKind::Tiny.config(1, 3), &device);
    let mut optim = AdamConfig::new().init();
    let loss = SegmentationLoss::new(LossKind::Dice, None);
    let cfg = TrainEpochConfig {
        epoch: 0,
        lr: 1e-2,
        batch_size: 2,
        batchsize_multiplier: 4,
        randomize_orientation: false,
        seed: Some(1),
    };
    let reg = RegularizationConfig {
        conv_weight_l2: 1e-4,
        ..Default::default()
    };
    let (_model, stats) =
        train_epoch(model, &mut optim, &dataset, &loss, &reg, &cfg, &device)?;
    assert_eq!(stats.batches, 6);
    assert!(stats.loss.is_some_and(f64::is_finite));
    assert!(stats.dice.is_some());
    Ok(())
}
