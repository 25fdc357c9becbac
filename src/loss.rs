use burn::nn::loss::HuberLossConfig;
use burn::prelude::*;
use burn::tensor::cast::ToElement;
use burn::tensor::{Bool, s};

use crate::boxes::{BOX_WEIGHTS, encode_boxes, iou};

/// Anchors overlapping a ground truth box at least this much are positives.
pub const POSITIVE_IOU: f32 = 0.5;

/// Anchors whose best overlap is below this are negatives, everything in between is ignored.
pub const NEGATIVE_IOU: f32 = 0.4;

/// Predicted probabilities are kept this far away from 0 and 1 before taking logs.
pub const PROBABILITY_CLAMP: f32 = 1e-4;

/// Transition point of the smooth L1 regression loss.
pub const SMOOTH_L1_BETA: f32 = 1.0 / 9.0;

/// Batch averaged detection losses.
#[derive(Debug, Clone)]
pub struct DetectionLoss<B: Backend> {
    /// `[1]` focal classification loss.
    pub classification: Tensor<B, 1>,
    /// `[1]` smooth L1 box regression loss.
    pub regression: Tensor<B, 1>,
}

impl<B: Backend> DetectionLoss<B> {
    pub fn total(&self) -> Tensor<B, 1> {
        self.classification.clone() + self.regression.clone()
    }
}

/// Focal loss for dense detection.
///
/// Tsung-Yi Lin, Priya Goyal, Ross Girshick, Kaiming He, Piotr Dollár, "Focal Loss for Dense
/// Object Detection", ICCV 2017.
///
/// Each anchor is matched to the ground truth box it overlaps most. The classification
/// term is a per class binary cross entropy down weighted for easy examples:
///
/// ```text
///   FL(p ) = -α  (1 - p )^γ log(p )
///       t      t       t         t
/// ```
///
/// normalised by the number of positive anchors. Positives also contribute a smooth L1 loss
/// between the predicted and the encoded ground truth deltas.
#[derive(Debug, Clone)]
pub struct FocalLoss {
    pub alpha: f32,
    pub gamma: f32,
}

impl Default for FocalLoss {
    fn default() -> Self {
        Self::new(0.25, 2.0)
    }
}

impl FocalLoss {
    pub fn new(alpha: f32, gamma: f32) -> Self {
        Self { alpha, gamma }
    }

    /// # Arguments
    /// * `classification` - `[B, N, K]` sigmoid scores.
    /// * `regression` - `[B, N, 4]` predicted box deltas.
    /// * `anchors` - `[1, N, 4]` anchors in pixel `xyxy`.
    /// * `annotations` - `[B, M, 5]` ground truth `(x1, y1, x2, y2, class)`, padding rows
    ///   carry class `-1`.
    pub fn forward<B: Backend>(
        &self,
        classification: Tensor<B, 3>,
        regression: Tensor<B, 3>,
        anchors: Tensor<B, 3>,
        annotations: Tensor<B, 3>,
    ) -> DetectionLoss<B> {
        let [batch_size, _, _] = classification.dims();
        let anchors: Tensor<B, 2> = anchors.slice(s![0..1, .., ..]).squeeze(0);

        let mut classification_losses = vec![];
        let mut regression_losses = vec![];

        for i in 0..batch_size {
            let classification: Tensor<B, 2> = classification.clone().slice(s![i..i + 1, .., ..]).squeeze(0);
            let regression: Tensor<B, 2> = regression.clone().slice(s![i..i + 1, .., ..]).squeeze(0);
            let annotations: Tensor<B, 2> = annotations.clone().slice(s![i..i + 1, .., ..]).squeeze(0);

            let (cls_loss, reg_loss) =
                self.image_loss(classification, regression, anchors.clone(), annotations);

            classification_losses.push(cls_loss);
            regression_losses.push(reg_loss);
        }

        DetectionLoss {
            classification: Tensor::cat(classification_losses, 0).mean(),
            regression: Tensor::cat(regression_losses, 0).mean(),
        }
    }

    fn image_loss<B: Backend>(
        &self,
        classification: Tensor<B, 2>,
        regression: Tensor<B, 2>,
        anchors: Tensor<B, 2>,
        annotations: Tensor<B, 2>,
    ) -> (Tensor<B, 1>, Tensor<B, 1>) {
        let device = &classification.device();
        let [num_anchors, num_classes] = classification.dims();

        let classification = classification.clamp(PROBABILITY_CLAMP, 1.0 - PROBABILITY_CLAMP);

        let Some(annotations) = strip_padding(annotations) else {
            // Every anchor is background
            let targets = Tensor::zeros([num_anchors, num_classes], device);
            let cls_loss = self.focal_term(classification, targets).sum();
            return (cls_loss, Tensor::zeros([1], device));
        };

        // Match every anchor to the annotation it overlaps most
        let overlaps = iou(anchors.clone(), annotations.clone().slice(s![.., 0..4]));
        let (iou_max, iou_argmax) = overlaps.max_dim_with_indices(1);
        let iou_max: Tensor<B, 1> = iou_max.squeeze(1);
        let iou_argmax: Tensor<B, 1, Int> = iou_argmax.squeeze(1);

        let positive = iou_max.clone().greater_equal_elem(POSITIVE_IOU);
        let negative = iou_max.lower_elem(NEGATIVE_IOU);
        let num_positive = positive.clone().int().sum().into_scalar().to_i64() as usize;

        let assigned = annotations.select(0, iou_argmax);
        let assigned_class: Tensor<B, 1, Int> = assigned.clone().slice(s![.., 4]).squeeze(1).int();

        // Targets: 1 for the matched class of a positive, 0 for background, -1 ignored
        let class_ids = Tensor::<B, 1, Int>::arange(0..num_classes as i64, device)
            .reshape([1, num_classes])
            .repeat_dim(0, num_anchors);
        let one_hot = class_ids
            .equal(assigned_class.reshape([num_anchors, 1]).repeat_dim(1, num_classes))
            .float();

        let row_mask = |mask: Tensor<B, 1, Bool>| mask.reshape([num_anchors, 1]).repeat_dim(1, num_classes);

        let targets = Tensor::<B, 2>::full([num_anchors, num_classes], -1.0, device)
            .mask_fill(row_mask(negative), 0.0)
            .mask_where(row_mask(positive.clone()), one_hot);

        let ignored = targets.clone().equal_elem(-1.0);
        let cls_loss = self
            .focal_term(classification, targets)
            .mask_fill(ignored, 0.0)
            .sum()
            / num_positive.max(1) as f32;

        if num_positive == 0 {
            return (cls_loss, Tensor::zeros([1], device));
        }

        let positive_index = positive.nonzero()[0].clone();

        let gt_boxes = assigned.select(0, positive_index.clone()).slice(s![.., 0..4]);
        let anchor_boxes = anchors.select(0, positive_index.clone());
        let box_targets = encode_boxes(gt_boxes, anchor_boxes, BOX_WEIGHTS);

        let predicted = regression.select(0, positive_index);

        // smooth_l1(x, β) == huber(x, δ = β) / β
        let reg_loss = HuberLossConfig::new(SMOOTH_L1_BETA)
            .init()
            .forward_no_reduction(predicted, box_targets)
            / SMOOTH_L1_BETA;

        (cls_loss, reg_loss.mean())
    }

    /// Element wise `α_t (1 - p_t)^γ BCE(p, t)` for targets in `{0, 1}`.
    ///
    /// Entries whose target is neither 0 nor 1 produce meaningless values and must be masked
    /// by the caller.
    fn focal_term<B: Backend>(&self, p: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 2> {
        let is_fg = targets.clone().equal_elem(1.0);

        let alpha_t = p.zeros_like().add_scalar(1.0 - self.alpha).mask_fill(is_fg.clone(), self.alpha);

        // 1 - p_t
        let hardness = p.clone().mask_where(is_fg, p.clone().neg() + 1.0);
        let focal_weight = alpha_t * hardness.powf_scalar(self.gamma);

        //  BCE = -(t log(p) + (1 - t) log(1 - p))
        let bce = (targets.clone() * p.clone().log() + (targets.neg() + 1.0) * (p.neg() + 1.0).log()).neg();

        focal_weight * bce
    }
}

/// Drops the padding rows (class `-1`) of a `[M, 5]` annotation tensor, `None` if no
/// annotation is left.
pub fn strip_padding<B: Backend>(annotations: Tensor<B, 2>) -> Option<Tensor<B, 2>> {
    let valid = annotations
        .clone()
        .slice(s![.., 4])
        .squeeze::<1>(1)
        .not_equal_elem(-1.0);

    if valid.clone().int().sum().into_scalar().to_i64() == 0 {
        return None;
    }

    let index = valid.nonzero()[0].clone();
    Some(annotations.select(0, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::non_finite_count;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    type B = NdArray<f32>;

    fn single_anchor_setup(device: &NdArrayDevice) -> (Tensor<B, 3>, Tensor<B, 3>) {
        // anchor 0 matches the annotation exactly, anchor 1 is far away
        let anchors = Tensor::<B, 3>::from_floats(
            [[[0.0, 0.0, 10.0, 10.0], [50.0, 50.0, 60.0, 60.0]]],
            device,
        );
        let annotations = Tensor::<B, 3>::from_floats(
            [[[0.0, 0.0, 10.0, 10.0, 1.0], [-1.0, -1.0, -1.0, -1.0, -1.0]]],
            device,
        );
        (anchors, annotations)
    }

    #[test]
    fn test_good_predictions_have_lower_loss() {
        let device = &NdArrayDevice::default();
        let (anchors, annotations) = single_anchor_setup(device);
        let regression = Tensor::<B, 3>::zeros([1, 2, 4], device);

        let good = Tensor::<B, 3>::from_floats([[[0.01, 0.99], [0.01, 0.01]]], device);
        let bad = Tensor::<B, 3>::from_floats([[[0.9, 0.1], [0.8, 0.7]]], device);

        let loss_fn = FocalLoss::default();
        let good = loss_fn.forward(good, regression.clone(), anchors.clone(), annotations.clone());
        let bad = loss_fn.forward(bad, regression, anchors, annotations);

        let good = good.classification.into_scalar();
        let bad = bad.classification.into_scalar();
        assert!(good < bad, "{good} >= {bad}");
    }

    #[test]
    fn test_exact_anchor_has_zero_regression_loss() {
        let device = &NdArrayDevice::default();
        let (anchors, annotations) = single_anchor_setup(device);

        let classification = Tensor::<B, 3>::full([1, 2, 2], 0.5, device);
        let regression = Tensor::<B, 3>::zeros([1, 2, 4], device);

        let loss = FocalLoss::default().forward(classification, regression, anchors.clone(), annotations.clone());
        assert!(loss.regression.into_scalar().abs() < 1e-6);

        // an offset prediction is penalised
        let classification = Tensor::<B, 3>::full([1, 2, 2], 0.5, device);
        let regression = Tensor::<B, 3>::from_floats([[[1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 0.0]]], device);
        let loss = FocalLoss::default().forward(classification, regression, anchors, annotations);

        // |1.0| > β: (1 - β / 2) averaged over 4 coordinates
        let expected = (1.0 - SMOOTH_L1_BETA * 0.5) / 4.0;
        let actual = loss.regression.into_scalar();
        assert!((actual - expected).abs() < 1e-4, "{actual} vs {expected}");
    }

    #[test]
    fn test_known_focal_value() {
        let device = &NdArrayDevice::default();
        let (anchors, annotations) = single_anchor_setup(device);

        let classification = Tensor::<B, 3>::full([1, 2, 2], 0.5, device);
        let regression = Tensor::<B, 3>::zeros([1, 2, 4], device);
        let loss = FocalLoss::default().forward(classification, regression, anchors, annotations);

        // 1 positive entry with α = 0.25, 3 negative entries with 1 - α = 0.75,
        // all at p = 0.5: (0.25 + 3 * 0.75) * 0.25 * ln 2
        let expected = (0.25 + 3.0 * 0.75) * 0.25 * 2f32.ln();
        let actual = loss.classification.into_scalar();
        assert!((actual - expected).abs() < 1e-4, "{actual} vs {expected}");
    }

    #[test]
    fn test_no_annotations() {
        let device = &NdArrayDevice::default();
        let anchors = Tensor::<B, 3>::from_floats([[[0.0, 0.0, 10.0, 10.0]]], device);
        let annotations = Tensor::<B, 3>::full([2, 3, 5], -1.0, device);

        let classification = Tensor::<B, 3>::full([2, 1, 3], 0.1, device);
        let regression = Tensor::<B, 3>::ones([2, 1, 4], device);

        let loss = FocalLoss::default().forward(classification, regression, anchors, annotations);

        assert_eq!(loss.regression.clone().into_scalar(), 0.0);
        let cls = loss.classification.clone().into_scalar();
        assert!(cls > 0.0);
        assert_eq!(non_finite_count(loss.total()), 0);
    }

    #[test]
    fn test_ignored_band_contributes_nothing() {
        let device = &NdArrayDevice::default();

        // IoU of the anchor with the box is 0.45, between the two thresholds
        let anchors = Tensor::<B, 3>::from_floats([[[0.0, 0.0, 10.0, 10.0]]], device);
        let annotations = Tensor::<B, 3>::from_floats([[[0.0, 0.0, 10.0, 4.5, 0.0]]], device);

        let classification = Tensor::<B, 3>::full([1, 1, 2], 0.7, device);
        let regression = Tensor::<B, 3>::zeros([1, 1, 4], device);

        let loss = FocalLoss::default().forward(classification, regression, anchors, annotations);
        assert_eq!(loss.classification.into_scalar(), 0.0);
        assert_eq!(loss.regression.into_scalar(), 0.0);
    }

    #[test]
    fn test_strip_padding() {
        let device = &NdArrayDevice::default();
        let annotations = Tensor::<B, 2>::from_floats(
            [
                [1.0, 1.0, 2.0, 2.0, 3.0],
                [-1.0, -1.0, -1.0, -1.0, -1.0],
                [5.0, 5.0, 6.0, 6.0, 0.0],
            ],
            device,
        );

        let stripped = strip_padding(annotations).unwrap();
        assert_eq!(stripped.dims(), [2, 5]);

        let padding = Tensor::<B, 2>::full([3, 5], -1.0, device);
        assert!(strip_padding(padding).is_none());
    }
}
