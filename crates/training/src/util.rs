use burn::backend::Autodiff;
use burn::lr_scheduler::LrScheduler;
use burn::module::{AutodiffModule, Module};
use burn::optim::{AdamConfig, GradientsAccumulator, GradientsParams, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use clap::{Parser, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};
use volume_dataset::{
    voxel_count, MriDatasetConfig, MriSegmentation, PatchBatchIter, PatchLoaderConfig, Volume,
    VolumeManifest, VolumeManifestBuilder,
};

use crate::config::SegmentConfig;
use crate::logging::{EpochMetrics, MetricsWriter};
use crate::loss::{class_weights, valid_mask, LossAccumulator, LossKind, SegmentationLoss};
use crate::metrics::{binary_dice_parts, masked_patch_dice, DiceAccumulator};
use crate::schedule::ExponentialSchedule;
use crate::stitch::VolumeAssembler;
use crate::{RegularizationConfig, SegmentationNetwork, SegmentationNetworkConfig, TrainBackend};

pub type ADBackend = Autodiff<TrainBackend>;
pub type TrainDevice = <TrainBackend as Backend>::Device;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Tiny,
    Dilated,
}

impl ModelKind {
    pub fn config(self, in_channels: usize, num_classes: usize) -> SegmentationNetworkConfig {
        match self {
            ModelKind::Tiny => SegmentationNetworkConfig::tiny(in_channels, num_classes),
            ModelKind::Dilated => SegmentationNetworkConfig::dilated(in_channels, num_classes),
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Validate,
    Test,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Validate => "validate",
            Mode::Test => "test",
        }
    }

    fn set_label(self) -> &'static str {
        match self {
            Mode::Test => "TEST SET",
            _ => "VALIDATION SET",
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "train",
    about = "Train, validate or test a patch-based 3D MRI segmentation network"
)]
pub struct SegmentationArgs {
    /// Network architecture.
    #[arg(long, value_enum)]
    pub model: ModelKind,
    /// Edge length of the cubic training/inference patches.
    #[arg(long, alias = "patch_size", default_value_t = 64)]
    pub patch_size: usize,
    #[arg(long, value_enum, default_value_t = LossKind::CrossEntropy)]
    pub loss: LossKind,
    #[arg(long, value_enum, default_value_t = Mode::Train)]
    pub mode: Mode,
    #[arg(long, alias = "training_epochs", default_value_t = 100)]
    pub training_epochs: usize,
    /// Random axis flips/permutations of training patches.
    #[arg(long, alias = "randomize_orientation")]
    pub randomize_orientation: bool,
    #[arg(long, alias = "batch_size", default_value_t = 2)]
    pub batch_size: usize,
    /// Mini-batches whose gradients are accumulated before each optimizer step.
    #[arg(long, alias = "batchsize_multiplier", default_value_t = 1)]
    pub batchsize_multiplier: usize,
    /// Weight cross-entropy by inverse training-set class frequency.
    #[arg(long, alias = "class_weighting")]
    pub class_weighting: bool,
    #[arg(long, alias = "initial_lr", default_value_t = 1e-2)]
    pub initial_lr: f64,
    /// First epoch at which the learning rate decays.
    #[arg(long, alias = "lr_decay_start", default_value_t = 1)]
    pub lr_decay_start: usize,
    #[arg(long, alias = "lr_decay_base", default_value_t = 1.0)]
    pub lr_decay_base: f64,
    #[arg(long, alias = "lamb_conv_weight_L1", default_value_t = 0.0)]
    pub lamb_conv_weight_l1: f32,
    #[arg(long, alias = "lamb_conv_weight_L2", default_value_t = 0.0)]
    pub lamb_conv_weight_l2: f32,
    #[arg(long, alias = "lamb_conv_bias_L1", default_value_t = 0.0)]
    pub lamb_conv_bias_l1: f32,
    #[arg(long, alias = "lamb_conv_bias_L2", default_value_t = 0.0)]
    pub lamb_conv_bias_l2: f32,
    #[arg(long, alias = "lamb_normalization_weight_L1", default_value_t = 0.0)]
    pub lamb_normalization_weight_l1: f32,
    #[arg(long, alias = "lamb_normalization_weight_L2", default_value_t = 0.0)]
    pub lamb_normalization_weight_l2: f32,
    #[arg(long, alias = "lamb_normalization_bias_L1", default_value_t = 0.0)]
    pub lamb_normalization_bias_l1: f32,
    #[arg(long, alias = "lamb_normalization_bias_L2", default_value_t = 0.0)]
    pub lamb_normalization_bias_l2: f32,
    #[arg(long, alias = "lamb_norm_activ_bias_L1", default_value_t = 0.0)]
    pub lamb_norm_activation_bias_l1: f32,
    #[arg(long, alias = "lamb_norm_activ_bias_L2", default_value_t = 0.0)]
    pub lamb_norm_activation_bias_l2: f32,
    /// Dataset directory containing the manifest (overrides the config file).
    #[arg(long)]
    pub dataset_root: Option<PathBuf>,
    /// Manifest file name relative to the dataset root.
    #[arg(long)]
    pub manifest: Option<String>,
    /// TOML config file (defaults to $SEGMENT_CONFIG or ./segmentation.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Weights to start from (train) or to evaluate (validate/test).
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,
    /// Where training writes its checkpoint.
    #[arg(long)]
    pub checkpoint_out: Option<PathBuf>,
    /// Directory for predicted label shards in validate/test mode.
    #[arg(long)]
    pub predictions_out: Option<PathBuf>,
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,
    /// Mirror log output to this file.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
    /// Seed for patch offsets, shuffling and orientations.
    #[arg(long)]
    pub seed: Option<u64>,
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Recompute shard checksums while loading volumes.
    #[arg(long)]
    pub verify_checksums: bool,
}

impl SegmentationArgs {
    pub fn regularization(&self) -> RegularizationConfig {
        RegularizationConfig {
            conv_weight_l1: self.lamb_conv_weight_l1,
            conv_weight_l2: self.lamb_conv_weight_l2,
            conv_bias_l1: self.lamb_conv_bias_l1,
            conv_bias_l2: self.lamb_conv_bias_l2,
            normalization_weight_l1: self.lamb_normalization_weight_l1,
            normalization_weight_l2: self.lamb_normalization_weight_l2,
            normalization_bias_l1: self.lamb_normalization_bias_l1,
            normalization_bias_l2: self.lamb_normalization_bias_l2,
            norm_activation_bias_l1: self.lamb_norm_activation_bias_l1,
            norm_activation_bias_l2: self.lamb_norm_activation_bias_l2,
        }
    }

    pub fn schedule(&self) -> ExponentialSchedule {
        ExponentialSchedule::new(self.initial_lr, self.lr_decay_start, self.lr_decay_base)
    }

    fn dataset_config(&self, randomize_patch_offsets: bool) -> MriDatasetConfig {
        MriDatasetConfig {
            randomize_patch_offsets,
            seed: self.seed,
            verify_checksums: self.verify_checksums,
            ..MriDatasetConfig::cubic(self.patch_size)
        }
    }
}

/// Config file (if any) with CLI overrides applied.
pub fn resolve_config(args: &SegmentationArgs) -> anyhow::Result<SegmentConfig> {
    let mut cfg = SegmentConfig::load(args.config.as_deref())?;
    if let Some(root) = &args.dataset_root {
        cfg.dataset_root = root.clone();
    }
    if let Some(manifest) = &args.manifest {
        cfg.manifest = manifest.clone();
    }
    if let Some(path) = &args.metrics_out {
        cfg.metrics_path = path.clone();
    }
    if let Some(path) = &args.log_file {
        cfg.log_path = Some(path.clone());
    }
    if let Some(path) = &args.predictions_out {
        cfg.predictions_root = Some(path.clone());
    }
    Ok(cfg)
}

/// Final scores of a run: last epoch for training, the evaluated split otherwise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub loss: f64,
    pub dice: f64,
}

pub fn run(args: &SegmentationArgs, cfg: &SegmentConfig) -> anyhow::Result<RunSummary> {
    validate_backend_choice(args.backend)?;
    if args.patch_size == 0 || args.batch_size == 0 || args.batchsize_multiplier == 0 {
        anyhow::bail!("patch size, batch size and batch size multiplier must be positive");
    }
    cfg.splits.ensure_disjoint()?;
    info!(?args, "options");
    info!(
        dataset = %cfg.dataset_root.display(),
        train = cfg.splits.train.len(),
        validation = cfg.splits.validation.len(),
        test = cfg.splits.test.len(),
        "subject splits"
    );

    let device = TrainDevice::default();
    match args.mode {
        Mode::Train => train(args, cfg, &device),
        Mode::Validate => evaluate(args, cfg, &cfg.splits.validation, &device),
        Mode::Test => evaluate(args, cfg, &cfg.splits.test, &device),
    }
}

fn build_loss(args: &SegmentationArgs, class_count: &[u64]) -> SegmentationLoss {
    if !args.class_weighting {
        return SegmentationLoss::new(args.loss, None);
    }
    if args.loss == LossKind::Dice {
        warn!("--class-weighting only affects the cross-entropy loss; ignoring it for dice");
        return SegmentationLoss::new(args.loss, None);
    }
    let weights = class_weights(class_count);
    info!(?weights, "class weights");
    SegmentationLoss::new(args.loss, Some(weights))
}

fn train(
    args: &SegmentationArgs,
    cfg: &SegmentConfig,
    device: &TrainDevice,
) -> anyhow::Result<RunSummary> {
    let manifest = cfg.manifest_path();
    let mut train_set =
        MriSegmentation::open(&manifest, &cfg.splits.train, &args.dataset_config(true))?;
    let val_set =
        MriSegmentation::open(&manifest, &cfg.splits.validation, &args.dataset_config(false))?;
    info!(
        train_patches = train_set.len(),
        validation_patches = val_set.len(),
        num_classes = train_set.num_classes(),
        "datasets ready"
    );

    let net_cfg = args.model.config(train_set.channels(), train_set.num_classes());
    let mut model = match &args.checkpoint {
        Some(path) => load_model::<ADBackend>(&net_cfg, path, device)?,
        None => SegmentationNetwork::<ADBackend>::new(&net_cfg, device),
    };
    info!(model = ?args.model, params = model.num_params(), "built model");

    let loss = build_loss(args, &train_set.class_count());
    let reg = args.regularization();
    let mut schedule = args.schedule();
    let mut optim = AdamConfig::new().init();
    let metrics = MetricsWriter::create(&cfg.metrics_path)?;
    let ckpt_path = args
        .checkpoint_out
        .clone()
        .unwrap_or_else(|| cfg.checkpoint_path.clone());
    if let Some(parent) = ckpt_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut summary = RunSummary {
        loss: f64::NAN,
        dice: f64::NAN,
    };
    let mut prev_lr = None;
    for epoch in 0..args.training_epochs {
        let started = Instant::now();
        let lr = schedule.step();
        if prev_lr != Some(lr) {
            info!(epoch, lr, "learning rate");
            prev_lr = Some(lr);
        }

        let epoch_cfg = TrainEpochConfig {
            epoch,
            lr,
            batch_size: args.batch_size,
            batchsize_multiplier: args.batchsize_multiplier,
            randomize_orientation: args.randomize_orientation,
            seed: args.seed.map(|s| s.wrapping_add(epoch as u64)),
        };
        let (trained, stats) =
            train_epoch(model, &mut optim, &train_set, &loss, &reg, &epoch_cfg, device)?;
        model = trained;

        let (predictions, val_loss) =
            infer(&model.valid(), &val_set, &loss, args.batch_size, device)?;
        let dice = calc_binary_dice_score(&val_set, &predictions)?;
        info!("VALIDATION SET [{epoch}] loss={val_loss:.5} acc={dice:.5}");

        metrics.append(&EpochMetrics {
            mode: Mode::Train.as_str(),
            epoch,
            lr,
            train_loss: stats.loss,
            train_dice: stats.dice,
            loss: val_loss,
            dice,
            seconds: started.elapsed().as_secs_f64(),
        })?;
        save_checkpoint(&model, &ckpt_path)?;
        summary = RunSummary {
            loss: val_loss,
            dice,
        };

        train_set.initialize_patch_indices()?;
    }

    info!(checkpoint = %ckpt_path.display(), "training finished");
    Ok(summary)
}

fn evaluate(
    args: &SegmentationArgs,
    cfg: &SegmentConfig,
    subjects: &[String],
    device: &TrainDevice,
) -> anyhow::Result<RunSummary> {
    let started = Instant::now();
    let dataset =
        MriSegmentation::open(&cfg.manifest_path(), subjects, &args.dataset_config(false))?;
    let net_cfg = args.model.config(dataset.channels(), dataset.num_classes());
    let ckpt = args.checkpoint.clone().or_else(|| {
        cfg.checkpoint_path
            .exists()
            .then(|| cfg.checkpoint_path.clone())
    });
    let model = match ckpt {
        Some(path) => load_model::<TrainBackend>(&net_cfg, &path, device)?,
        None => {
            warn!("no checkpoint found; evaluating an untrained model");
            SegmentationNetwork::<TrainBackend>::new(&net_cfg, device)
        }
    };
    info!(model = ?args.model, params = model.num_params(), "built model");

    let loss = build_loss(args, &dataset.class_count());
    let (predictions, loss_value) = infer(&model, &dataset, &loss, args.batch_size, device)?;
    let dice = calc_binary_dice_score(&dataset, &predictions)?;
    info!(
        "{} loss={loss_value:.5} acc={dice:.5}",
        args.mode.set_label()
    );

    MetricsWriter::create(&cfg.metrics_path)?.append(&EpochMetrics {
        mode: args.mode.as_str(),
        epoch: 0,
        lr: 0.0,
        train_loss: None,
        train_dice: None,
        loss: loss_value,
        dice,
        seconds: started.elapsed().as_secs_f64(),
    })?;

    if let Some(root) = &cfg.predictions_root {
        let manifest = write_predictions(&dataset, &predictions, root, args.mode)?;
        info!(
            root = %root.display(),
            subjects = manifest.subjects.len(),
            "wrote predictions"
        );
    }
    Ok(RunSummary {
        loss: loss_value,
        dice,
    })
}

#[derive(Debug, Clone)]
pub struct TrainEpochConfig {
    pub epoch: usize,
    pub lr: f64,
    pub batch_size: usize,
    pub batchsize_multiplier: usize,
    pub randomize_orientation: bool,
    pub seed: Option<u64>,
}

/// Mean batch loss and dataset-level binary dice of one training epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub loss: Option<f64>,
    pub dice: Option<f64>,
    pub batches: usize,
}

/// One pass over `dataset`. Gradients of `batchsize_multiplier` consecutive
/// batches are summed before each optimizer step; a trailing partial group is
/// still applied at the end of the epoch.
pub fn train_epoch<O>(
    mut model: SegmentationNetwork<ADBackend>,
    optim: &mut O,
    dataset: &MriSegmentation,
    loss: &SegmentationLoss,
    reg: &RegularizationConfig,
    cfg: &TrainEpochConfig,
    device: &TrainDevice,
) -> anyhow::Result<(SegmentationNetwork<ADBackend>, EpochStats)>
where
    O: Optimizer<SegmentationNetwork<ADBackend>, ADBackend>,
{
    let loader = PatchLoaderConfig {
        seed: cfg.seed,
        randomize_orientation: cfg.randomize_orientation,
        ..PatchLoaderConfig::training(cfg.batch_size)
    };
    let mut iter = PatchBatchIter::new(dataset, loader)?;
    let total = iter.len();
    if total == 0 {
        warn!(
            patches = dataset.len(),
            batch_size = cfg.batch_size,
            "training set yields no full batch"
        );
    }
    let patch_shape = dataset.patch_shape();
    let num_classes = dataset.num_classes();

    let mut accumulator = GradientsAccumulator::new();
    let mut pending = 0usize;
    let mut dice = DiceAccumulator::new(num_classes);
    let mut loss_sum = 0.0;
    let mut batches = 0usize;

    while let Some(batch) = iter.next_batch::<ADBackend>(device)? {
        let started = Instant::now();
        let mask = valid_mask::<ADBackend>(&batch.indices, patch_shape, device);
        let logits = model.forward(batch.data);
        let pred: Vec<i64> = logits
            .clone()
            .detach()
            .argmax(1)
            .into_data()
            .iter::<i64>()
            .collect();

        let mut objective = loss.forward(logits, batch.target, mask);
        let loss_value = scalar(objective.clone());
        if !reg.is_zero() {
            objective = objective + model.regularization_penalty(reg, device);
        }
        let grads = GradientsParams::from_grads(objective.backward(), &model);
        accumulator.accumulate(&model, grads);
        pending += 1;
        if pending == cfg.batchsize_multiplier {
            model = optim.step(cfg.lr, model, accumulator.grads());
            pending = 0;
        }

        let batch_dice = masked_patch_dice(
            &pred,
            &batch.labels,
            &batch.indices,
            patch_shape,
            num_classes,
        );
        let acc = batch_dice.mean().unwrap_or(f64::NAN);
        dice.merge(&batch_dice);
        loss_sum += loss_value;
        info!(
            "[{}:{}/{}] loss={:.5} acc={:.5} time={:.2}s",
            cfg.epoch,
            batches,
            total,
            loss_value,
            acc,
            started.elapsed().as_secs_f64()
        );
        batches += 1;
    }
    if pending > 0 {
        model = optim.step(cfg.lr, model, accumulator.grads());
    }

    let stats = EpochStats {
        loss: (batches > 0).then(|| loss_sum / batches as f64),
        dice: dice.mean(),
        batches,
    };
    Ok((model, stats))
}

/// Predict every patch of `dataset`, stitch the predictions back into full
/// label volumes and return them with the dataset-level loss.
pub fn infer<B: Backend>(
    model: &SegmentationNetwork<B>,
    dataset: &MriSegmentation,
    loss: &SegmentationLoss,
    batch_size: usize,
    device: &B::Device,
) -> anyhow::Result<(Vec<Vec<u16>>, f64)> {
    let mut iter = PatchBatchIter::new(dataset, PatchLoaderConfig::inference(batch_size))?;
    let patch_shape = dataset.patch_shape();
    let voxels = voxel_count(patch_shape);
    let mut assembler = VolumeAssembler::new(&dataset.unpadded_shapes());
    let mut loss_acc = LossAccumulator::new(loss, dataset.num_classes());

    while let Some(batch) = iter.next_batch::<B>(device)? {
        let mask = valid_mask::<B>(&batch.indices, patch_shape, device);
        let logits = model.forward(batch.data);
        let pred: Vec<i64> = logits
            .clone()
            .argmax(1)
            .into_data()
            .iter::<i64>()
            .collect();
        loss_acc.push(loss.parts(logits, batch.target, mask));
        for (j, index) in batch.indices.iter().enumerate() {
            assembler.insert(index, patch_shape, &pred[j * voxels..(j + 1) * voxels])?;
        }
    }

    let volumes = assembler.finish()?;
    Ok((volumes, loss_acc.value()))
}

/// Mean per-class dice of stitched predictions against the original labels,
/// aggregated over all volumes before dividing.
pub fn calc_binary_dice_score(
    dataset: &MriSegmentation,
    predictions: &[Vec<u16>],
) -> anyhow::Result<f64> {
    if predictions.len() != dataset.num_volumes() {
        anyhow::bail!(
            "got {} predicted volumes for {} dataset volumes",
            predictions.len(),
            dataset.num_volumes()
        );
    }
    let num_classes = dataset.num_classes();
    let mut acc = DiceAccumulator::new(num_classes);
    for (volume, pred) in dataset.volumes().iter().zip(predictions) {
        if pred.len() != volume.labels.len() {
            anyhow::bail!(
                "prediction for {} has {} voxels, expected {}",
                volume.subject,
                pred.len(),
                volume.labels.len()
            );
        }
        let (num, den) = binary_dice_parts(
            pred.iter().copied(),
            volume.labels.iter().copied(),
            num_classes,
        );
        acc.push(&num, &den);
    }
    acc.mean()
        .ok_or_else(|| anyhow::anyhow!("no class occurs in predictions or ground truth"))
}

/// Store predicted label volumes as shards next to their source intensities.
pub fn write_predictions(
    dataset: &MriSegmentation,
    predictions: &[Vec<u16>],
    root: &Path,
    mode: Mode,
) -> anyhow::Result<VolumeManifest> {
    let mut builder = VolumeManifestBuilder::new(
        root,
        format!("{}-predictions", mode.as_str()),
        dataset.num_classes(),
    );
    for (volume, labels) in dataset.volumes().iter().zip(predictions) {
        let predicted = Volume::new(
            volume.subject.clone(),
            volume.shape,
            volume.channels,
            volume.image.clone(),
            labels.clone(),
        )?;
        builder.add_volume(&predicted)?;
    }
    Ok(builder.finish()?)
}

pub fn load_model<B: Backend>(
    cfg: &SegmentationNetworkConfig,
    path: &Path,
    device: &B::Device,
) -> anyhow::Result<SegmentationNetwork<B>> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let model = SegmentationNetwork::<B>::new(cfg, device)
        .load_file(path, &recorder, device)
        .map_err(|e| anyhow::anyhow!("failed to load checkpoint {}: {e}", path.display()))?;
    info!(path = %path.display(), "loaded checkpoint");
    Ok(model)
}

pub fn save_checkpoint<B: Backend>(
    model: &SegmentationNetwork<B>,
    path: &Path,
) -> anyhow::Result<()> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(path, &recorder)
        .map_err(|e| anyhow::anyhow!("failed to save checkpoint {}: {e}", path.display()))
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            warn!("built with backend-wgpu; running on WGPU despite --backend nd-array");
        }
        _ => {}
    }
    Ok(())
}

fn scalar<B: Backend>(t: Tensor<B, 1>) -> f64 {
    t.into_data().iter::<f64>().next().unwrap_or(f64::NAN)
}
