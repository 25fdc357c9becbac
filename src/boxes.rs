use burn::{
    prelude::Backend,
    tensor::{Tensor, s},
};

use crate::check_nan;

/// Regression weights applied to `(dx, dy, dw, dh)`. Deltas are the box offsets divided by
/// `(0.1, 0.1, 0.2, 0.2)`, the usual RetinaNet normalisation.
pub const BOX_WEIGHTS: (f32, f32, f32, f32) = (10.0, 10.0, 5.0, 5.0);

/// Computes the Intersection over Union (IoU) between two sets of bounding boxes in `xyxy` format.
///
/// Each box is represented by its `(x1, y1, x2, y2)` coordinates, where `(x1, y1)`
/// is the top-left corner and `(x2, y2)` is the bottom-right corner.
///
/// `IoU = intersection_area / union_area`
///
/// # Arguments
/// * `a` - Tensor of shape `[N, 4]`.
/// * `b` - Tensor of shape `[M, 4]`.
///
/// # Returns
/// * `Tensor<B, 2>` - IoU matrix of shape `[N, M]` where entry `(i, j)` is the overlap of
///   `a[i]` with `b[j]`.
pub fn iou<B: Backend>(a: Tensor<B, 2>, b: Tensor<B, 2>) -> Tensor<B, 2> {
    let [n, _] = a.dims();
    let [m, _] = b.dims();

    let (ax1, ay1, ax2, ay2) = boxes_to_components(a);
    let (bx1, by1, bx2, by2) = boxes_to_components(b);

    // Columns of `a` are spread across M, columns of `b` are transposed and spread across N
    let rows = |t: Tensor<B, 2>| t.repeat_dim(1, m);
    let cols = |t: Tensor<B, 2>| t.reshape([1, m]).repeat_dim(0, n);

    // --- Intersection corners ---
    let x1_max = rows(ax1.clone()).max_pair(cols(bx1.clone()));
    let y1_max = rows(ay1.clone()).max_pair(cols(by1.clone()));
    let x2_min = rows(ax2.clone()).min_pair(cols(bx2.clone()));
    let y2_min = rows(ay2.clone()).min_pair(cols(by2.clone()));

    // --- Areas ---
    let area_a = (ax2 - ax1) * (ay2 - ay1);
    let area_b = (bx2 - bx1) * (by2 - by1);

    // Width = x2_min - x1_max, height = y2_min - y1_max, clamp at 0 to avoid negatives
    let intersection_area = (x2_min - x1_max).clamp_min(0) * (y2_min - y1_max).clamp_min(0);

    let union = rows(area_a) + cols(area_b) - intersection_area.clone();

    intersection_area / union.clamp_min(1e-8)
}

/// Computes the regression targets that move each anchor `d` onto its ground truth box `g`.
///
/// Both inputs are `[N, 4]` in `xyxy` format, the output is `[N, 4]` holding
/// `(tx, ty, tw, th)` scaled by `weights`. Ground truth widths and heights are clamped to a
/// minimum of one pixel so degenerate annotations do not produce `log(0)`.
pub fn encode_boxes<B: Backend>(
    g: Tensor<B, 2>,
    d: Tensor<B, 2>,
    (w1, w2, w3, w4): (f32, f32, f32, f32),
) -> Tensor<B, 2> {
    let (gx, gy, gw, gh) = boxes_to_components(x1y1x2y2_to_cxcywh(g));
    let (px, py, pw, ph) = boxes_to_components(x1y1x2y2_to_cxcywh(d));

    let gw = gw.clamp_min(1.0);
    let gh = gh.clamp_min(1.0);

    //      Gx - Px
    // tx = ───────
    //        Pw

    let tx = (gx - px) / pw.clone() * w1;

    //      Gy - Py
    // ty = ───────
    //        Ph

    let ty = (gy - py) / ph.clone() * w2;

    //          ⎛Gw⎞
    // tw = log ⎜──⎟
    //          ⎝Pw⎠

    let tw = (gw.clone() / pw.clone()).log() * w3;
    check_nan!(tw, gw, pw);

    //          ⎛Gh⎞
    // th = log ⎜──⎟
    //          ⎝Ph⎠

    let th = (gh / ph).log() * w4;

    Tensor::cat(vec![tx, ty, tw, th], 1)
}

/// Applies predicted `(dx, dy, dw, dh)` deltas `p` to anchors `d` (`xyxy`), returning `xyxy`
/// boxes. Inverse of [`encode_boxes`].
pub fn box_generation<B: Backend>(
    p: Tensor<B, 2>,
    d: Tensor<B, 2>,
    (w1, w2, w3, w4): (f32, f32, f32, f32),
) -> Tensor<B, 2> {
    let (center_x, center_y, w, h) = boxes_to_components(x1y1x2y2_to_cxcywh(d));

    let (mut dx, mut dy, mut dw, mut dh) = boxes_to_components(p);

    dx = dx / w1;
    dy = dy / w2;
    dw = dw / w3;
    dh = dh / w4;

    let pcx = dx * w.clone() + center_x;
    let pcy = dy * h.clone() + center_y;
    let pw = dw.exp() * w;
    let ph = dh.exp() * h;

    let cxcywh = Tensor::cat(vec![pcx, pcy, pw, ph], 1);

    cxcywh_to_x1y1x2y2(cxcywh)
}

/// Batched box decoding.
///
/// # Arguments
/// * `anchors` - `[1, N, 4]` or `[B, N, 4]` anchors in pixel `xyxy`.
/// * `deltas` - `[B, N, 4]` regression head output.
///
/// # Returns
/// `[B, N, 4]` decoded boxes in pixel `xyxy`.
pub fn decode_boxes<B: Backend>(anchors: Tensor<B, 3>, deltas: Tensor<B, 3>) -> Tensor<B, 3> {
    let [batch_size, num_anchors, _] = deltas.dims();

    let anchors = if anchors.dims()[0] == 1 && batch_size > 1 {
        anchors.repeat_dim(0, batch_size)
    } else {
        anchors
    };

    let boxes = box_generation(
        deltas.reshape([batch_size * num_anchors, 4]),
        anchors.reshape([batch_size * num_anchors, 4]),
        BOX_WEIGHTS,
    );

    boxes.reshape([batch_size, num_anchors, 4])
}

/// Clamps `[B, N, 4]` `xyxy` boxes to the bounds of the `[B, C, H, W]` image batch.
pub fn clip_boxes<B: Backend>(boxes: Tensor<B, 3>, images: &Tensor<B, 4>) -> Tensor<B, 3> {
    let [_, _, height, width] = images.dims();
    let [batch_size, num_boxes, _] = boxes.dims();

    let (x1, y1, x2, y2) = boxes_to_components(boxes.reshape([batch_size * num_boxes, 4]));

    Tensor::cat(
        vec![
            x1.clamp_min(0.0),
            y1.clamp_min(0.0),
            x2.clamp_max(width as f32),
            y2.clamp_max(height as f32),
        ],
        1,
    )
    .reshape([batch_size, num_boxes, 4])
}

/// Splits `[N, 4]` boxes into their four `[N, 1]` coordinate columns.
pub fn boxes_to_components<B: Backend>(
    boxes: Tensor<B, 2>,
) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
    (
        boxes.clone().slice(s![.., 0]),
        boxes.clone().slice(s![.., 1]),
        boxes.clone().slice(s![.., 2]),
        boxes.slice(s![.., 3]),
    )
}

pub fn cxcywh_to_x1y1x2y2<B: Backend>(a: Tensor<B, 2>) -> Tensor<B, 2> {
    let (cx, cy, w, h) = boxes_to_components(a);

    Tensor::cat(
        vec![
            cx.clone() - w.clone() * 0.5,
            cy.clone() - h.clone() * 0.5,
            cx + w * 0.5,
            cy + h * 0.5,
        ],
        1,
    )
}

pub fn x1y1x2y2_to_cxcywh<B: Backend>(a: Tensor<B, 2>) -> Tensor<B, 2> {
    let (x1, y1, x2, y2) = boxes_to_components(a);

    let w = x2 - x1.clone();
    let h = y2 - y1.clone();
    let cx = x1 + w.clone() * 0.5;
    let cy = y1 + h.clone() * 0.5;

    Tensor::cat(vec![cx, cy, w, h], 1)
}
