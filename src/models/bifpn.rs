use burn::{
    module::{Ignored, Module, Param},
    nn::pool::{MaxPool2d, MaxPool2dConfig},
    prelude::*,
    tensor::{
        activation::relu,
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use crate::config::FUSION_EPSILON;
use crate::models::conv_block::ConvBlock;
use crate::models::topology::{FusionGraph, FusionNodeSpec, Topology};

/// Fast normalised fusion weights, `relu(w) / (sum(relu(w)) + eps)`.
///
/// The result is non-negative and sums to just under 1. If every raw weight is `<= 0`
/// the result is all zeros rather than NaN.
pub fn normalize_fusion_weights<B: Backend>(raw: Tensor<B, 1>) -> Tensor<B, 1> {
    let w = relu(raw);
    let sum = w.clone().sum();
    w / (sum + FUSION_EPSILON)
}

/// `sum_i weights[i] * sources[i]` for `[B, C, H, W]` sources of identical shape.
pub fn weighted_sum<B: Backend>(weights: Tensor<B, 1>, sources: Vec<Tensor<B, 4>>) -> Tensor<B, 4> {
    let [n] = weights.dims();
    assert_eq!(
        n,
        sources.len(),
        "{} fusion weights for {} sources",
        n,
        sources.len()
    );

    let stacked: Tensor<B, 5> = Tensor::stack(sources, 0);
    let weights = weights.reshape([n, 1, 1, 1, 1]);

    (stacked * weights).sum_dim(0).squeeze(0)
}

/// Learned weights and smoothing conv of a single fusion node.
#[derive(Module, Debug)]
pub struct FusionNode<B: Backend> {
    pub weights: Param<Tensor<B, 1>>,
    conv: ConvBlock<B>,
}

impl<B: Backend> FusionNode<B> {
    pub fn new(device: &B::Device, channels: usize, arity: usize) -> Self {
        Self {
            weights: Param::from_tensor(Tensor::ones([arity], device)),
            conv: ConvBlock::new(device, channels),
        }
    }

    pub fn arity(&self) -> usize {
        let [n] = self.weights.val().dims();
        n
    }

    pub fn normalized_weights(&self) -> Tensor<B, 1> {
        normalize_fusion_weights(self.weights.val())
    }

    pub fn forward(&self, sources: Vec<Tensor<B, 4>>) -> Tensor<B, 4> {
        let fused = weighted_sum(self.normalized_weights(), sources);
        self.conv.forward(fused)
    }
}

/// One bidirectional feature pyramid block.
///
/// Takes a pyramid of same width feature maps, finest first, and returns a pyramid of the
/// same shapes. Every fusion node of [`Topology`] owns its own weights, blocks are stacked
/// by feeding one block's outputs straight into the next.
#[derive(Module, Debug)]
pub struct BiFpn<B: Backend> {
    nodes: Vec<FusionNode<B>>,
    pool: MaxPool2d,
    topology: Ignored<Topology>,
}

impl<B: Backend> BiFpn<B> {
    pub fn new(device: &B::Device, channels: usize) -> Self {
        Self::with_topology(device, channels, &Topology::default())
    }

    pub fn with_topology(device: &B::Device, channels: usize, topology: &Topology) -> Self {
        let nodes: Vec<FusionNode<B>> = topology
            .nodes()
            .iter()
            .map(|spec| FusionNode::new(device, channels, spec.arity()))
            .collect();

        Self {
            nodes,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            topology: Ignored(topology.clone()),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Normalised fusion weights of every node, in evaluation order.
    pub fn fusion_weights(&self) -> Vec<Tensor<B, 1>> {
        self.nodes.iter().map(|n| n.normalized_weights()).collect()
    }

    pub fn nodes(&self) -> &[FusionNode<B>] {
        &self.nodes
    }

    pub fn forward(&self, inputs: Vec<Tensor<B, 4>>) -> Vec<Tensor<B, 4>> {
        self.topology.evaluate(self, inputs)
    }
}

impl<B: Backend> FusionGraph for BiFpn<B> {
    type Feature = Tensor<B, 4>;

    fn upsample(&self, feature: Tensor<B, 4>, target: &Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, h, w] = target.dims();
        interpolate(
            feature,
            [h, w],
            InterpolateOptions::new(InterpolateMode::Nearest),
        )
    }

    fn downsample(&self, feature: Tensor<B, 4>, target: &Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, h, w] = target.dims();
        let [_, _, fh, fw] = feature.dims();

        // Odd sized maps are padded so the pooled size rounds up like a strided conv.
        // Fusion outputs are post-ReLU so a zero border never wins the max.
        let pad_bottom = (2 * h).saturating_sub(fh);
        let pad_right = (2 * w).saturating_sub(fw);
        let feature = if pad_bottom > 0 || pad_right > 0 {
            feature.pad((0, pad_right, 0, pad_bottom), 0.0)
        } else {
            feature
        };

        self.pool.forward(feature)
    }

    fn fuse(&self, node: usize, _spec: &FusionNodeSpec, sources: Vec<Tensor<B, 4>>) -> Tensor<B, 4> {
        self.nodes[node].forward(sources)
    }
}
