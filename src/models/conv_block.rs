use burn::{
    module::{Module, Param},
    nn::{
        BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
    },
    prelude::*,
    tensor::activation::relu,
};

pub const CONV_BLOCK_EPSILON: f64 = 4e-5;

/// Weight of the batch statistic in the running mean and variance update,
/// `running = running * (1 - m) + batch * m`.
pub const CONV_BLOCK_MOMENTUM: f64 = 0.9997;

/// He style normal initialisation, `N(0, sqrt(2 / (k * k * out_channels)))`.
pub fn conv_initializer(kernel: usize, out_channels: usize) -> Initializer {
    let fan_out = (kernel * kernel * out_channels) as f64;
    Initializer::Normal {
        mean: 0.0,
        std: (2.0 / fan_out).sqrt(),
    }
}

/// Default conv bias, `U(-1 / sqrt(fan_in), 1 / sqrt(fan_in))` with
/// `fan_in = in_channels / groups * kh * kw`.
pub fn default_bias<B: Backend>(config: &Conv2dConfig, device: &B::Device) -> Param<Tensor<B, 1>> {
    let [in_channels, out_channels] = config.channels;
    let [kh, kw] = config.kernel_size;
    let bound = 1.0 / ((in_channels / config.groups * kh * kw) as f64).sqrt();

    Initializer::Uniform {
        min: -bound,
        max: bound,
    }
    .init([out_channels], device)
}

/// Builds `config` with He normal weights from [`conv_initializer`] and a [`default_bias`].
pub fn init_conv<B: Backend>(config: Conv2dConfig, device: &B::Device) -> Conv2d<B> {
    let [kernel, _] = config.kernel_size;
    let [_, out_channels] = config.channels;
    let bias = default_bias(&config, device);

    let mut conv = config
        .with_initializer(conv_initializer(kernel, out_channels))
        .init(device);
    conv.bias = Some(bias);
    conv
}

/// Separable 3x3 convolution followed by batch norm and ReLU.
///
/// Channel count and spatial size are preserved, this is the smoothing step after every
/// BiFPN fusion.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    depthwise: Conv2d<B>,
    pointwise: Conv2d<B>,
    norm: BatchNorm<B, 2>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(device: &B::Device, channels: usize) -> Self {
        let depthwise = init_conv(
            Conv2dConfig::new([channels, channels], [3, 3])
                .with_groups(channels)
                .with_padding(PaddingConfig2d::Explicit(1, 1)),
            device,
        );

        let pointwise = init_conv(Conv2dConfig::new([channels, channels], [1, 1]), device);

        let norm = BatchNormConfig::new(channels)
            .with_epsilon(CONV_BLOCK_EPSILON)
            .with_momentum(CONV_BLOCK_MOMENTUM)
            .init(device);

        Self {
            depthwise,
            pointwise,
            norm,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.depthwise.forward(x);
        let x = self.pointwise.forward(x);
        relu(self.norm.forward(x))
    }
}
