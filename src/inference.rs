use burn::{
    prelude::*,
    tensor::{TensorData, cast::ToElement, s},
};

use crate::{
    boxes::{clip_boxes, decode_boxes},
    nms::nms,
};

/// Final detections of one image, sorted by decreasing score.
#[derive(Debug, Clone)]
pub struct Detections<B: Backend> {
    /// `[D]` best class score of each detection.
    pub scores: Tensor<B, 1>,
    /// `[D]` class index of each detection.
    pub classes: Tensor<B, 1, Int>,
    /// `[D, 4]` boxes in pixel `xyxy`, inside the image.
    pub boxes: Tensor<B, 2>,
}

impl<B: Backend> Detections<B> {
    /// Shapes `[0]`, `[0]` and `[0, 4]`.
    pub fn empty(device: &B::Device) -> Self {
        Self {
            scores: Tensor::from_data(TensorData::new(Vec::<f32>::new(), [0]), device),
            classes: Tensor::from_data(TensorData::new(Vec::<i64>::new(), [0]), device),
            boxes: Tensor::from_data(TensorData::new(Vec::<f32>::new(), [0, 4]), device),
        }
    }

    pub fn len(&self) -> usize {
        self.scores.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turns raw head outputs into detections.
///
/// Regression deltas are applied to the anchors and clipped to the image. Each anchor is
/// scored by its best class, anchors scoring `<= score_threshold` are dropped, and the rest
/// go through NMS at `iou_threshold`.
///
/// Only the first image of the batch is processed.
///
/// # Arguments
/// * `classification` - `[B, N, K]` sigmoid scores.
/// * `regression` - `[B, N, 4]` box deltas.
/// * `anchors` - `[1, N, 4]` anchors in pixel `xyxy`.
/// * `images` - the `[B, C, H, W]` input batch, used for its size.
pub fn postprocess<B: Backend>(
    classification: Tensor<B, 3>,
    regression: Tensor<B, 3>,
    anchors: Tensor<B, 3>,
    images: &Tensor<B, 4>,
    score_threshold: f32,
    iou_threshold: f32,
) -> Detections<B> {
    let device = &classification.device();

    let boxes = clip_boxes(decode_boxes(anchors, regression), images);

    let boxes: Tensor<B, 2> = boxes.slice(s![0..1, .., ..]).squeeze(0);
    let classification: Tensor<B, 2> = classification.slice(s![0..1, .., ..]).squeeze(0);

    let scores: Tensor<B, 1> = classification.clone().max_dim(1).squeeze(1);
    let over_threshold = scores.clone().greater_elem(score_threshold);

    let candidates = over_threshold.clone().int().sum().into_scalar().to_i64();
    log::debug!("{candidates} anchors scored over {score_threshold}");

    if candidates == 0 {
        return Detections::empty(device);
    }

    let index = over_threshold.nonzero()[0].clone();

    let classification = classification.select(0, index.clone());
    let boxes = boxes.select(0, index.clone());
    let scores = scores.select(0, index);

    let keep = nms(boxes.clone(), scores, iou_threshold);

    let (scores, classes) = classification.select(0, keep.clone()).max_dim_with_indices(1);

    Detections {
        scores: scores.squeeze(1),
        classes: classes.squeeze(1),
        boxes: boxes.select(0, keep),
    }
}
