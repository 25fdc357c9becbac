use burn::{
    module::{Module, Param},
    nn::{
        Initializer, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
    },
    prelude::*,
    tensor::activation::{relu, sigmoid},
};

use crate::config::CLASSIFIER_PRIOR;
use crate::models::conv_block::init_conv;

fn conv3x3(in_channels: usize, out_channels: usize) -> Conv2dConfig {
    Conv2dConfig::new([in_channels, out_channels], [3, 3]).with_padding(PaddingConfig2d::Explicit(1, 1))
}

/// `depth` x (3x3 conv + ReLU), shared by both heads.
#[derive(Module, Debug)]
pub struct HeadTower<B: Backend> {
    layers: Vec<Conv2d<B>>,
}

impl<B: Backend> HeadTower<B> {
    pub fn new(device: &B::Device, channels: usize, depth: usize) -> Self {
        let layers = (0..depth)
            .map(|_| init_conv(conv3x3(channels, channels), device))
            .collect();

        Self { layers }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers
            .iter()
            .fold(x, |x, conv| relu(conv.forward(x)))
    }
}

/// `[B, A * K, H, W]` header output to `[B, H * W * A, K]`, matching the anchor order.
fn flatten_anchors<B: Backend>(x: Tensor<B, 4>, values: usize) -> Tensor<B, 3> {
    let [batch, channels, height, width] = x.dims();
    let anchors = channels / values;

    x.permute([0, 2, 3, 1])
        .reshape([batch, height * width * anchors, values])
}

/// Box regression head. Predicts 4 deltas per anchor.
#[derive(Module, Debug)]
pub struct Regressor<B: Backend> {
    tower: HeadTower<B>,
    header: Conv2d<B>,
}

impl<B: Backend> Regressor<B> {
    pub fn new(device: &B::Device, channels: usize, num_anchors: usize, depth: usize) -> Self {
        Self {
            tower: HeadTower::new(device, channels, depth),
            header: conv3x3(channels, num_anchors * 4)
                .with_initializer(Initializer::Zeros)
                .init(device),
        }
    }

    /// `[B, C, H, W]` -> `[B, H * W * A, 4]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        let x = self.header.forward(self.tower.forward(x));
        flatten_anchors(x, 4)
    }
}

/// Classification head. Predicts a sigmoid score per anchor and class.
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    tower: HeadTower<B>,
    header: Conv2d<B>,
    num_classes: usize,
}

impl<B: Backend> Classifier<B> {
    pub fn new(device: &B::Device, channels: usize, num_anchors: usize, num_classes: usize, depth: usize) -> Self {
        let mut header = conv3x3(channels, num_anchors * num_classes)
            .with_initializer(Initializer::Zeros)
            .init(device);

        // Start every anchor at the foreground prior so the background dominated focal
        // loss is stable on the first iterations (RetinaNet, Sec. 4.1)
        let bias = -((1.0 - CLASSIFIER_PRIOR) / CLASSIFIER_PRIOR).ln();
        header.bias = Some(Param::from_tensor(Tensor::full(
            [num_anchors * num_classes],
            bias,
            device,
        )));

        Self {
            tower: HeadTower::new(device, channels, depth),
            header,
            num_classes,
        }
    }

    /// `[B, C, H, W]` -> `[B, H * W * A, num_classes]` with values in `(0, 1)`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 3> {
        let x = sigmoid(self.header.forward(self.tower.forward(x)));
        flatten_anchors(x, self.num_classes)
    }
}

/// Applies one shared head to every pyramid level and concatenates along the anchor axis.
pub fn forward_levels<B: Backend, F>(pyramid: &[Tensor<B, 4>], head: F) -> Tensor<B, 3>
where
    F: Fn(Tensor<B, 4>) -> Tensor<B, 3>,
{
    let per_level = pyramid.iter().map(|level| head(level.clone())).collect();
    Tensor::cat(per_level, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{NdArray, ndarray::NdArrayDevice},
        tensor::{Distribution, Tolerance},
    };

    type B = NdArray<f32>;
    type FT = f32;

    #[test]
    fn test_regressor_starts_at_zero() {
        let device = &NdArrayDevice::default();
        B::seed(42);

        let regressor = Regressor::<B>::new(device, 8, 9, 3);
        let x = Tensor::<B, 4>::random([2, 8, 4, 3], Distribution::Default, device);
        let y = regressor.forward(x);

        assert_eq!(y.dims(), [2, 4 * 3 * 9, 4]);
        y.to_data()
            .assert_approx_eq::<FT>(&Tensor::<B, 3>::zeros([2, 108, 4], device).to_data(), Tolerance::default());
    }

    #[test]
    fn test_classifier_starts_at_prior() {
        let device = &NdArrayDevice::default();
        B::seed(42);

        let classifier = Classifier::<B>::new(device, 8, 9, 20, 3);
        let x = Tensor::<B, 4>::random([1, 8, 5, 5], Distribution::Default, device);
        let y = classifier.forward(x);

        assert_eq!(y.dims(), [1, 5 * 5 * 9, 20]);
        let expected = Tensor::<B, 3>::full([1, 225, 20], CLASSIFIER_PRIOR as f32, device);
        y.to_data()
            .assert_approx_eq::<FT>(&expected.to_data(), Tolerance::absolute(1e-5));
    }

    #[test]
    fn test_classifier_output_in_unit_interval() {
        let device = &NdArrayDevice::default();
        B::seed(42);

        let mut classifier = Classifier::<B>::new(device, 4, 9, 3, 2);
        // non trivial header so the outputs spread away from the prior
        classifier.header = init_conv(conv3x3(4, 27), device);

        let x = Tensor::<B, 4>::random([1, 4, 6, 6], Distribution::Normal(0.0, 3.0), device);
        let y = classifier.forward(x);

        let min = y.clone().min().into_scalar();
        let max = y.max().into_scalar();
        assert!(min > 0.0 && max < 1.0, "{min} {max}");
    }

    #[test]
    fn test_flatten_anchor_order() {
        let device = &NdArrayDevice::default();

        // 2 anchors x 1 value on a 1x2 map: channel c at column x -> row x * 2 + c
        let x = Tensor::<B, 4>::from_floats([[[[0.0, 1.0]], [[10.0, 11.0]]]], device);
        let y = flatten_anchors(x, 1);

        let expected = Tensor::<B, 3>::from_floats([[[0.0], [10.0], [1.0], [11.0]]], device);
        y.to_data()
            .assert_approx_eq::<FT>(&expected.to_data(), Tolerance::default());
    }

    #[test]
    fn test_forward_levels_concatenates() {
        let device = &NdArrayDevice::default();
        let regressor = Regressor::<B>::new(device, 4, 9, 1);

        let pyramid = vec![
            Tensor::<B, 4>::zeros([1, 4, 4, 4], device),
            Tensor::<B, 4>::zeros([1, 4, 2, 2], device),
            Tensor::<B, 4>::zeros([1, 4, 1, 1], device),
        ];
        let y = forward_levels(&pyramid, |x| regressor.forward(x));

        assert_eq!(y.dims(), [1, (16 + 4 + 1) * 9, 4]);
    }

    #[test]
    fn test_tower_and_header_biases() {
        let device = &NdArrayDevice::default();
        B::seed(42);

        let regressor = Regressor::<B>::new(device, 16, 9, 2);
        // fan_in = 16 * 3 * 3
        let bound = 1.0 / 12.0;

        for conv in &regressor.tower.layers {
            let bias = conv.bias.as_ref().map(|b| b.val()).unwrap();
            let max = bias.clone().abs().max().into_scalar();
            assert!(max <= bound && max > 0.0, "{max}");
        }

        let header = regressor.header.bias.as_ref().map(|b| b.val()).unwrap();
        header
            .to_data()
            .assert_approx_eq::<FT>(&Tensor::<B, 1>::zeros([36], device).to_data(), Tolerance::default());
    }
}
