use burn::{
    prelude::Backend,
    tensor::{Int, Tensor, TensorData},
};

/// Greedy non-maximum suppression.
///
/// Boxes are visited from the highest to the lowest score. A box is kept unless its IoU
/// with an already kept box is greater than `iou_threshold`.
///
/// # Arguments
/// * `boxes` - `[N, 4]` boxes in `xyxy` format.
/// * `scores` - `[N]` confidence of each box.
/// * `iou_threshold` - overlap above which the lower scoring box is discarded.
///
/// # Returns
/// Indices into `boxes` of the kept detections, ordered by decreasing score.
pub fn nms<B: Backend>(
    boxes: Tensor<B, 2>,
    scores: Tensor<B, 1>,
    iou_threshold: f32,
) -> Tensor<B, 1, Int> {
    let device = boxes.device();

    let coords: Vec<f32> = boxes.into_data().iter::<f32>().collect();
    let scores: Vec<f32> = scores.into_data().iter::<f32>().collect();

    let keep = nms_indices(&coords, &scores, iou_threshold);
    let count = keep.len();

    Tensor::from_data(TensorData::new(keep, [count]), &device)
}

/// Host side NMS over flattened `xyxy` coordinates, see [`nms`].
pub fn nms_indices(coords: &[f32], scores: &[f32], iou_threshold: f32) -> Vec<i64> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|a, b| scores[*b].total_cmp(&scores[*a]));

    let area = |i: usize| {
        let b = &coords[i * 4..i * 4 + 4];
        (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0)
    };

    let overlap = |i: usize, j: usize| {
        let a = &coords[i * 4..i * 4 + 4];
        let b = &coords[j * 4..j * 4 + 4];

        let w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
        let h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
        let intersection = w * h;
        let union = area(i) + area(j) - intersection;

        if union <= 0.0 { 0.0 } else { intersection / union }
    };

    let mut keep: Vec<usize> = vec![];

    for candidate in order {
        if keep
            .iter()
            .all(|kept| overlap(*kept, candidate) <= iou_threshold)
        {
            keep.push(candidate);
        }
    }

    keep.into_iter().map(|i| i as i64).collect()
}
