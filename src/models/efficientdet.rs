use burn::{
    module::Module,
    nn::{
        PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
    },
    prelude::*,
    tensor::activation::relu,
};

use crate::{
    anchors::Anchors,
    config::{EfficientDetConfig, ModelScale, NMS_IOU_THRESHOLD, SCORE_THRESHOLD},
    inference::{Detections, postprocess},
    loss::{DetectionLoss, FocalLoss},
    models::{
        bifpn::BiFpn,
        conv_block::init_conv,
        efficientnet::EfficientNet,
        heads::{Classifier, Regressor, forward_levels},
    },
};

/// What the detector is asked to do with a batch.
#[derive(Debug, Clone)]
pub enum DetectorInput<B: Backend> {
    /// `[B, 3, H, W]` images.
    Inference(Tensor<B, 4>),
    /// Images plus `[B, M, 5]` annotations, padding rows carry class `-1`.
    Training {
        images: Tensor<B, 4>,
        annotations: Tensor<B, 3>,
    },
}

#[derive(Debug, Clone)]
pub enum DetectorOutput<B: Backend> {
    Detections(Detections<B>),
    Loss(DetectionLoss<B>),
}

/// Dense per anchor predictions for a batch.
#[derive(Debug, Clone)]
pub struct HeadOutputs<B: Backend> {
    /// `[B, N, num_classes]` sigmoid scores.
    pub classification: Tensor<B, 3>,
    /// `[B, N, 4]` box deltas.
    pub regression: Tensor<B, 3>,
    /// `[1, N, 4]` anchors the predictions refer to.
    pub anchors: Tensor<B, 3>,
}

/// EfficientDet: EfficientNet backbone, stacked BiFPN blocks and shared box and class heads.
///
/// Mingxing Tan, Ruoming Pang, Quoc V. Le, "EfficientDet: Scalable and Efficient Object
/// Detection", CVPR 2020.
#[derive(Module, Debug)]
pub struct EfficientDet<B: Backend> {
    backbone: EfficientNet<B>,
    conv3: Conv2d<B>,
    conv4: Conv2d<B>,
    conv5: Conv2d<B>,
    conv6: Conv2d<B>,
    conv7: Conv2d<B>,
    bifpn: Vec<BiFpn<B>>,
    regressor: Regressor<B>,
    classifier: Classifier<B>,
    num_classes: usize,
    focal_alpha: f32,
    focal_gamma: f32,
}

fn lateral<B: Backend>(device: &B::Device, in_channels: usize, out_channels: usize) -> Conv2d<B> {
    init_conv(Conv2dConfig::new([in_channels, out_channels], [1, 1]), device)
}

fn strided<B: Backend>(device: &B::Device, in_channels: usize, out_channels: usize) -> Conv2d<B> {
    init_conv(
        Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1)),
        device,
    )
}

impl<B: Backend> EfficientDet<B> {
    /// Use [`EfficientDetConfig::init`], which validates `config` before building.
    pub fn new(device: &B::Device, scale: ModelScale, config: &EfficientDetConfig) -> Self {
        let channels = scale.channels;
        let (c3, c4, c5) = scale.backbone_channels;
        let num_anchors = Anchors::default().num_anchors();

        log::info!(
            "Building EfficientDet-D{}: {} BiFPN blocks of {} channels, heads of depth {}, {} classes",
            scale.coefficient,
            scale.bifpn_repeats,
            channels,
            scale.head_depth,
            config.num_classes
        );

        Self {
            backbone: EfficientNet::new(device, scale.coefficient),
            conv3: lateral(device, c3, channels),
            conv4: lateral(device, c4, channels),
            conv5: lateral(device, c5, channels),
            // P6 and P7 are not backbone taps, they are strided projections of C5
            conv6: strided(device, c5, channels),
            conv7: strided(device, channels, channels),
            bifpn: (0..scale.bifpn_repeats)
                .map(|_| BiFpn::new(device, channels))
                .collect(),
            regressor: Regressor::new(device, channels, num_anchors, scale.head_depth),
            classifier: Classifier::new(
                device,
                channels,
                num_anchors,
                config.num_classes,
                scale.head_depth,
            ),
            num_classes: config.num_classes,
            focal_alpha: config.focal_alpha,
            focal_gamma: config.focal_gamma,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn bifpn(&self) -> &[BiFpn<B>] {
        &self.bifpn
    }

    /// Backbone, lateral projections and the BiFPN stack. Returns P3 .. P7.
    pub fn forward_pyramid(&self, images: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let features = self.backbone.forward(images);

        let p6 = self.conv6.forward(features.c5.clone());
        let p7 = self.conv7.forward(relu(p6.clone()));

        let pyramid = vec![
            self.conv3.forward(features.c3),
            self.conv4.forward(features.c4),
            self.conv5.forward(features.c5),
            p6,
            p7,
        ];

        log::debug!(
            "pyramid sizes {:?}",
            pyramid.iter().map(|p| p.dims()[2..].to_vec()).collect::<Vec<_>>()
        );

        self.bifpn
            .iter()
            .fold(pyramid, |pyramid, block| block.forward(pyramid))
    }

    pub fn forward_heads(&self, images: Tensor<B, 4>) -> HeadOutputs<B> {
        let anchors = Anchors::default().forward(&images);
        let pyramid = self.forward_pyramid(images);

        let regression = forward_levels(&pyramid, |x| self.regressor.forward(x));
        let classification = forward_levels(&pyramid, |x| self.classifier.forward(x));

        HeadOutputs {
            classification,
            regression,
            anchors,
        }
    }

    /// Detections for the first image of `images`.
    pub fn detect(&self, images: Tensor<B, 4>) -> Detections<B> {
        let heads = self.forward_heads(images.clone());

        let detections = postprocess(
            heads.classification,
            heads.regression,
            heads.anchors,
            &images,
            SCORE_THRESHOLD,
            NMS_IOU_THRESHOLD,
        );

        log::debug!("{} detections after NMS", detections.len());
        detections
    }

    pub fn loss(&self, images: Tensor<B, 4>, annotations: Tensor<B, 3>) -> DetectionLoss<B> {
        let heads = self.forward_heads(images);

        FocalLoss::new(self.focal_alpha, self.focal_gamma).forward(
            heads.classification,
            heads.regression,
            heads.anchors,
            annotations,
        )
    }

    pub fn forward(&self, input: DetectorInput<B>) -> DetectorOutput<B> {
        match input {
            DetectorInput::Inference(images) => DetectorOutput::Detections(self.detect(images)),
            DetectorInput::Training {
                images,
                annotations,
            } => DetectorOutput::Loss(self.loss(images, annotations)),
        }
    }
}
