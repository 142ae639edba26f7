#![recursion_limit = "256"]

pub mod config;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod schedule;
pub mod stitch;
pub mod util;

pub use config::SegmentConfig;
pub use logging::{init_tracing, EpochMetrics, MetricsWriter};
pub use loss::{LossAccumulator, LossKind, LossParts, SegmentationLoss};
pub use metrics::{binary_dice_parts, masked_patch_dice, DiceAccumulator};
pub use models::{RegularizationConfig, SegmentationNetwork, SegmentationNetworkConfig};
pub use schedule::ExponentialSchedule;
pub use stitch::{StitchError, VolumeAssembler};
pub use util::{
    calc_binary_dice_score, infer, resolve_config, run, train_epoch, RunSummary,
    SegmentationArgs,
};
/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
