//! Burn 3D segmentation networks.
//!
//! - `SegmentationNetwork`: fully-convolutional stack of `ConvBlock`s with a 1x1x1
//!   classifier head. Every convolution is stride 1 with "same" padding, so the
//!   output logits `[N, K, X, Y, Z]` are voxel-aligned with the input patch.
//! - `RegularizationConfig`: L1/L2 factors per parameter group, turned into an
//!   additive loss term by `SegmentationNetwork::regularization_penalty`.
//!
//! These are pure Burn Modules; the `training` crate owns losses and loops.

use burn::module::{Module, Param};
use burn::nn::conv::{Conv3d, Conv3dConfig};
use burn::nn::{GroupNorm, GroupNormConfig, PaddingConfig3d};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

#[derive(Debug, Clone)]
pub struct SegmentationNetworkConfig {
    pub in_channels: usize,
    pub num_classes: usize,
    /// Feature channels of every hidden block.
    pub width: usize,
    pub depth: usize,
    /// Dilation of block `i` is `dilation_growth^i` (1 keeps all blocks undilated).
    pub dilation_growth: usize,
}

impl SegmentationNetworkConfig {
    pub fn tiny(in_channels: usize, num_classes: usize) -> Self {
        Self {
            in_channels,
            num_classes,
            width: 16,
            depth: 3,
            dilation_growth: 1,
        }
    }

    /// Wider context through exponentially growing dilation.
    pub fn dilated(in_channels: usize, num_classes: usize) -> Self {
        Self {
            in_channels,
            num_classes,
            width: 32,
            depth: 4,
            dilation_growth: 2,
        }
    }

    pub fn dilation(&self, block: usize) -> usize {
        self.dilation_growth.max(1).pow(block as u32)
    }
}

impl Default for SegmentationNetworkConfig {
    fn default() -> Self {
        Self::tiny(1, 135)
    }
}

/// L1/L2 penalty factors per parameter group. Zero disables a term.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RegularizationConfig {
    pub conv_weight_l1: f32,
    pub conv_weight_l2: f32,
    pub conv_bias_l1: f32,
    pub conv_bias_l2: f32,
    pub normalization_weight_l1: f32,
    pub normalization_weight_l2: f32,
    pub normalization_bias_l1: f32,
    pub normalization_bias_l2: f32,
    pub norm_activation_bias_l1: f32,
    pub norm_activation_bias_l2: f32,
}

impl RegularizationConfig {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Conv3d (k=3) → GroupNorm → per-channel bias → ReLU.
#[derive(Debug, Module)]
pub struct ConvBlock<B: Backend> {
    conv: Conv3d<B>,
    norm: GroupNorm<B>,
    activation_bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, dilation: usize, device: &B::Device) -> Self {
        let conv = Conv3dConfig::new([in_channels, out_channels], [3, 3, 3])
            .with_dilation([dilation; 3])
            .with_padding(PaddingConfig3d::Explicit(dilation, dilation, dilation))
            .init(device);
        let norm = GroupNormConfig::new(group_count(out_channels), out_channels).init(device);
        let activation_bias = Param::from_tensor(Tensor::zeros([out_channels], device));
        Self {
            conv,
            norm,
            activation_bias,
        }
    }

    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        let x = self.norm.forward(self.conv.forward(input));
        let channels = self.activation_bias.val().dims()[0];
        let bias = self.activation_bias.val().reshape([1, channels, 1, 1, 1]);
        relu(x + bias)
    }

    fn penalty(&self, reg: &RegularizationConfig, device: &B::Device) -> Tensor<B, 1> {
        let mut total = conv_penalty(&self.conv, reg, device);
        if let Some(gamma) = &self.norm.gamma {
            total = total
                + l1_l2(
                    gamma.val(),
                    reg.normalization_weight_l1,
                    reg.normalization_weight_l2,
                    device,
                );
        }
        if let Some(beta) = &self.norm.beta {
            total = total
                + l1_l2(
                    beta.val(),
                    reg.normalization_bias_l1,
                    reg.normalization_bias_l2,
                    device,
                );
        }
        total
            + l1_l2(
                self.activation_bias.val(),
                reg.norm_activation_bias_l1,
                reg.norm_activation_bias_l2,
                device,
            )
    }
}

#[derive(Debug, Module)]
pub struct SegmentationNetwork<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    head: Conv3d<B>,
    num_classes: usize,
}

impl<B: Backend> SegmentationNetwork<B> {
    pub fn new(cfg: &SegmentationNetworkConfig, device: &B::Device) -> Self {
        let mut blocks = Vec::with_capacity(cfg.depth);
        let mut channels = cfg.in_channels;
        for i in 0..cfg.depth {
            blocks.push(ConvBlock::new(channels, cfg.width, cfg.dilation(i), device));
            channels = cfg.width;
        }
        let head = Conv3dConfig::new([channels, cfg.num_classes], [1, 1, 1]).init(device);
        Self {
            blocks,
            head,
            num_classes: cfg.num_classes,
        }
    }

    /// `[N, C, X, Y, Z]` intensities → `[N, K, X, Y, Z]` class logits.
    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        let mut x = input;
        for block in &self.blocks {
            x = block.forward(x);
        }
        self.head.forward(x)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Sum of the configured L1/L2 terms over all parameter groups, shape `[1]`.
    pub fn regularization_penalty(
        &self,
        reg: &RegularizationConfig,
        device: &B::Device,
    ) -> Tensor<B, 1> {
        let mut total = conv_penalty(&self.head, reg, device);
        for block in &self.blocks {
            total = total + block.penalty(reg, device);
        }
        total
    }
}

fn conv_penalty<B: Backend>(
    conv: &Conv3d<B>,
    reg: &RegularizationConfig,
    device: &B::Device,
) -> Tensor<B, 1> {
    let mut total = l1_l2(conv.weight.val(), reg.conv_weight_l1, reg.conv_weight_l2, device);
    if let Some(bias) = &conv.bias {
        total = total + l1_l2(bias.val(), reg.conv_bias_l1, reg.conv_bias_l2, device);
    }
    total
}

fn l1_l2<B: Backend, const D: usize>(
    param: Tensor<B, D>,
    l1: f32,
    l2: f32,
    device: &B::Device,
) -> Tensor<B, 1> {
    let mut total = Tensor::<B, 1>::zeros([1], device);
    if l1 != 0.0 {
        total = total + param.clone().abs().sum().mul_scalar(l1);
    }
    if l2 != 0.0 {
        total = total + (param.clone() * param).sum().mul_scalar(l2);
    }
    total
}

/// Largest group count ≤ 8 that divides `channels`.
fn group_count(channels: usize) -> usize {
    (1..=channels.min(8))
        .rev()
        .find(|g| channels % g == 0)
        .unwrap_or(1)
}

pub mod prelude {
    pub use super::{
        ConvBlock, RegularizationConfig, SegmentationNetwork, SegmentationNetworkConfig,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn group_count_divides_channels() {
        assert_eq!(group_count(16), 8);
        assert_eq!(group_count(12), 6);
        assert_eq!(group_count(7), 7);
        assert_eq!(group_count(11), 1);
    }

    #[test]
    fn dilation_grows_geometrically() {
        let cfg = SegmentationNetworkConfig::dilated(1, 4);
        assert_eq!(
            (0..cfg.depth).map(|i| cfg.dilation(i)).collect::<Vec<_>>(),
            vec![1, 2, 4, 8]
        );
        assert_eq!(SegmentationNetworkConfig::tiny(1, 4).dilation(2), 1);
    }

    #[test]
    fn forward_keeps_spatial_shape() {
        let device = Default::default();
        for cfg in [
            SegmentationNetworkConfig {
                width: 4,
                depth: 2,
                ..SegmentationNetworkConfig::tiny(1, 5)
            },
            SegmentationNetworkConfig {
                width: 4,
                depth: 3,
                ..SegmentationNetworkConfig::dilated(2, 3)
            },
        ] {
            let model = SegmentationNetwork::<B>::new(&cfg, &device);
            let input = Tensor::<B, 5>::zeros([2, cfg.in_channels, 6, 5, 4], &device);
            let out = model.forward(input);
            assert_eq!(out.dims(), [2, cfg.num_classes, 6, 5, 4]);
        }
    }

    #[test]
    fn zero_regularization_has_zero_penalty() {
        let device = Default::default();
        let cfg = SegmentationNetworkConfig {
            width: 4,
            depth: 1,
            ..SegmentationNetworkConfig::tiny(1, 2)
        };
        let model = SegmentationNetwork::<B>::new(&cfg, &device);
        let reg = RegularizationConfig::default();
        assert!(reg.is_zero());
        let penalty: f32 = model
            .regularization_penalty(&reg, &device)
            .into_data()
            .iter::<f32>()
            .next()
            .unwrap_or(f32::NAN);
        assert_eq!(penalty, 0.0);

        let l2 = RegularizationConfig {
            conv_weight_l2: 1.0,
            ..Default::default()
        };
        let penalty: f32 = model
            .regularization_penalty(&l2, &device)
            .into_data()
            .iter::<f32>()
            .next()
            .unwrap_or(0.0);
        assert!(penalty > 0.0);
    }
}
