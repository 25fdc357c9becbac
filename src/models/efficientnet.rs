//! EfficientNet feature extractor.
//!
//! Mingxing Tan, Quoc V. Le, "EfficientNet: Rethinking Model Scaling for Convolutional
//! Neural Networks", ICML 2019.
//!
//! Only the convolutional trunk is built. The classification head (final 1x1 conv,
//! pooling, dropout and fully connected layer) never contributes to detection features,
//! and neither do the MBConv blocks after the last stride 2 block.

use burn::{
    module::Module,
    nn::{
        BatchNorm, BatchNormConfig, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
    },
    prelude::*,
    tensor::activation::{sigmoid, silu},
};

const BN_MOMENTUM: f64 = 0.01;
const BN_EPSILON: f64 = 1e-3;
const SE_RATIO: f64 = 0.25;
const FILTER_DIVISOR: usize = 8;
const STEM_FILTERS: usize = 32;

/// `(width, depth)` multipliers of `efficientnet-b0` .. `efficientnet-b7`.
pub const COMPOUND_SCALING: [(f64, f64); 8] = [
    (1.0, 1.0),
    (1.0, 1.1),
    (1.1, 1.2),
    (1.2, 1.4),
    (1.4, 1.8),
    (1.6, 2.2),
    (1.8, 2.6),
    (2.0, 3.1),
];

/// b0 stages as `(kernel, stride, expand_ratio, output_filters, repeats)` (Table 1).
const BASE_STAGES: [(usize, usize, usize, usize, usize); 7] = [
    (3, 1, 1, 16, 1),
    (3, 2, 6, 24, 2),
    (5, 2, 6, 40, 2),
    (3, 2, 6, 80, 3),
    (5, 1, 6, 112, 3),
    (5, 2, 6, 192, 4),
    (3, 1, 6, 320, 1),
];

/// Scales a channel count by `width` and rounds it to a multiple of 8, never going below
/// 90% of the scaled value.
pub fn round_filters(filters: usize, width: f64) -> usize {
    let scaled = filters as f64 * width;
    let half = (FILTER_DIVISOR / 2) as f64;

    let mut rounded = ((scaled + half) as usize / FILTER_DIVISOR * FILTER_DIVISOR).max(FILTER_DIVISOR);
    if (rounded as f64) < 0.9 * scaled {
        rounded += FILTER_DIVISOR;
    }

    rounded
}

pub fn round_repeats(repeats: usize, depth: f64) -> usize {
    (repeats as f64 * depth).ceil() as usize
}

/// Hyper parameters of a single MBConv block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockArgs {
    pub kernel: usize,
    pub stride: usize,
    pub expand_ratio: usize,
    pub input_filters: usize,
    pub output_filters: usize,
}

/// Every block of the scaled trunk, ending with the last stride 2 block.
pub fn block_args(coefficient: usize) -> Vec<BlockArgs> {
    let (width, depth) = COMPOUND_SCALING[coefficient];

    let mut blocks = vec![];
    let mut input_filters = round_filters(STEM_FILTERS, width);

    for (kernel, stride, expand_ratio, output_filters, repeats) in BASE_STAGES {
        let output_filters = round_filters(output_filters, width);

        for i in 0..round_repeats(repeats, depth) {
            blocks.push(BlockArgs {
                kernel,
                // only the first block of a stage changes resolution or width
                stride: if i == 0 { stride } else { 1 },
                expand_ratio,
                input_filters: if i == 0 { input_filters } else { output_filters },
                output_filters,
            });
        }

        input_filters = output_filters;
    }

    if let Some(last_tap) = blocks.iter().rposition(|b| b.stride == 2) {
        blocks.truncate(last_tap + 1);
    }

    blocks
}

/// Channels of the C3, C4 and C5 taps.
pub fn tap_channels(coefficient: usize) -> (usize, usize, usize) {
    let taps: Vec<usize> = block_args(coefficient)
        .iter()
        .filter(|b| b.stride == 2)
        .map(|b| b.output_filters)
        .collect();

    (taps[1], taps[2], taps[3])
}

fn batch_norm<B: Backend>(device: &B::Device, channels: usize) -> BatchNorm<B, 2> {
    BatchNormConfig::new(channels)
        .with_momentum(BN_MOMENTUM)
        .with_epsilon(BN_EPSILON)
        .init(device)
}

fn pointwise<B: Backend>(device: &B::Device, in_channels: usize, out_channels: usize, bias: bool) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [1, 1])
        .with_bias(bias)
        .init(device)
}

/// 1x1 expansion conv with its batch norm.
#[derive(Module, Debug)]
pub struct Expansion<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
}

/// Mobile inverted bottleneck with squeeze and excitation.
#[derive(Module, Debug)]
pub struct MBConvBlock<B: Backend> {
    expansion: Option<Expansion<B>>,
    depthwise: Conv2d<B>,
    depthwise_norm: BatchNorm<B, 2>,
    se_reduce: Conv2d<B>,
    se_expand: Conv2d<B>,
    project: Conv2d<B>,
    project_norm: BatchNorm<B, 2>,
    stride: usize,
    identity_skip: bool,
}

impl<B: Backend> MBConvBlock<B> {
    pub fn new(device: &B::Device, args: BlockArgs) -> Self {
        let hidden = args.input_filters * args.expand_ratio;

        let expansion = (args.expand_ratio != 1).then(|| Expansion {
            conv: pointwise(device, args.input_filters, hidden, false),
            norm: batch_norm(device, hidden),
        });

        let pad = args.kernel / 2;
        let depthwise = Conv2dConfig::new([hidden, hidden], [args.kernel, args.kernel])
            .with_groups(hidden)
            .with_stride([args.stride, args.stride])
            .with_padding(PaddingConfig2d::Explicit(pad, pad))
            .with_bias(false)
            .init(device);

        let squeezed = ((args.input_filters as f64 * SE_RATIO) as usize).max(1);

        Self {
            expansion,
            depthwise,
            depthwise_norm: batch_norm(device, hidden),
            se_reduce: pointwise(device, hidden, squeezed, true),
            se_expand: pointwise(device, squeezed, hidden, true),
            project: pointwise(device, hidden, args.output_filters, false),
            project_norm: batch_norm(device, args.output_filters),
            stride: args.stride,
            identity_skip: args.stride == 1 && args.input_filters == args.output_filters,
        }
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn forward(&self, inputs: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expansion {
            Some(e) => silu(e.norm.forward(e.conv.forward(inputs.clone()))),
            None => inputs.clone(),
        };

        let x = silu(self.depthwise_norm.forward(self.depthwise.forward(x)));

        // Squeeze and excitation
        let squeezed = x.clone().mean_dim(2).mean_dim(3);
        let squeezed = self.se_expand.forward(silu(self.se_reduce.forward(squeezed)));
        let x = x * sigmoid(squeezed);

        let x = self.project_norm.forward(self.project.forward(x));

        if self.identity_skip { x + inputs } else { x }
    }
}

/// Backbone outputs at strides 8, 16 and 32.
#[derive(Debug, Clone)]
pub struct BackboneFeatures<B: Backend> {
    pub c3: Tensor<B, 4>,
    pub c4: Tensor<B, 4>,
    pub c5: Tensor<B, 4>,
}

#[derive(Module, Debug)]
pub struct EfficientNet<B: Backend> {
    stem: Conv2d<B>,
    stem_norm: BatchNorm<B, 2>,
    blocks: Vec<MBConvBlock<B>>,
}

impl<B: Backend> EfficientNet<B> {
    /// Builds `efficientnet-b{coefficient}`, `coefficient` must be in `0..8`.
    pub fn new(device: &B::Device, coefficient: usize) -> Self {
        let (width, _) = COMPOUND_SCALING[coefficient];
        let stem_filters = round_filters(STEM_FILTERS, width);

        let stem = Conv2dConfig::new([3, stem_filters], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);

        let blocks = block_args(coefficient)
            .into_iter()
            .map(|args| MBConvBlock::new(device, args))
            .collect();

        Self {
            stem,
            stem_norm: batch_norm(device, stem_filters),
            blocks,
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> BackboneFeatures<B> {
        let mut x = silu(self.stem_norm.forward(self.stem.forward(images)));

        let mut taps = Vec::with_capacity(4);
        for block in &self.blocks {
            x = block.forward(x);
            if block.stride() == 2 {
                taps.push(x.clone());
            }
        }

        // the stride 4 tap is too fine for the detection pyramid
        let mut taps = taps.into_iter().skip(1);
        let mut next = || taps.next().unwrap_or_else(|| unreachable!("trunk ends on the C5 tap"));

        BackboneFeatures {
            c3: next(),
            c4: next(),
            c5: next(),
        }
    }
}
