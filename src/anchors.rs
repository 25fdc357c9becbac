use burn::{
    prelude::Backend,
    tensor::{Tensor, TensorData},
};

use crate::layers::PyramidLevel;

/// Aspect ratios (`h / w`) of the anchors placed at every feature map cell.
pub const ANCHOR_RATIOS: [f32; 3] = [0.5, 1.0, 2.0];

/// Scale multipliers applied to a level's base anchor size, `2^0`, `2^(1/3)` and `2^(2/3)`.
pub const ANCHOR_SCALES: [f32; 3] = [1.0, 1.259_921, 1.587_401];

/// Anchor box generator for the five pyramid levels.
///
/// Anchors tile each feature map in a convolutional manner: every cell of level `Pn`
/// carries `ratios * scales` boxes centred on the cell, whose base size is `2^(n+2)`
/// pixels. The output ordering is row (y) major, then column (x), then anchor, which is
/// the same ordering the detection heads produce when they flatten their `(H, W, A)`
/// outputs, so anchor `i` lines up with prediction `i`.
#[derive(Debug, Clone)]
pub struct Anchors {
    levels: Vec<PyramidLevel>,
    ratios: Vec<f32>,
    scales: Vec<f32>,
}

impl Default for Anchors {
    fn default() -> Self {
        Self::new(PyramidLevel::as_list(), ANCHOR_RATIOS.to_vec(), ANCHOR_SCALES.to_vec())
    }
}

impl Anchors {
    pub fn new(levels: Vec<PyramidLevel>, ratios: Vec<f32>, scales: Vec<f32>) -> Self {
        Self {
            levels,
            ratios,
            scales,
        }
    }

    /// Number of anchors placed at each feature map cell.
    pub fn num_anchors(&self) -> usize {
        self.ratios.len() * self.scales.len()
    }

    /// Total anchor count for an image of `height` x `width` pixels.
    pub fn count(&self, height: usize, width: usize) -> usize {
        self.levels
            .iter()
            .map(|l| l.feature_size(height) * l.feature_size(width) * self.num_anchors())
            .sum()
    }

    /// `(width, height)` of every anchor of a level, centred at the origin.
    ///
    /// The anchor index is `ratio_index * scales.len() + scale_index`; area is kept fixed
    /// per scale while the ratio redistributes it between width and height.
    pub fn base_shapes(&self, level: &PyramidLevel) -> Vec<(f32, f32)> {
        let base_size = level.anchor_size();
        let mut shapes = Vec::with_capacity(self.num_anchors());

        for ratio in &self.ratios {
            for scale in &self.scales {
                let side = base_size * scale;
                let w = (side * side / ratio).sqrt();
                shapes.push((w, w * ratio));
            }
        }

        shapes
    }

    /// Generates all anchors for the `[B, C, H, W]` image batch.
    ///
    /// # Returns
    /// `[1, N, 4]` anchors in pixel `xyxy`, shared by every image of the batch.
    pub fn forward<B: Backend>(&self, images: &Tensor<B, 4>) -> Tensor<B, 3> {
        let [_, _, height, width] = images.dims();
        let device = images.device();

        let total = self.count(height, width);
        let mut grid_pos: Vec<f32> = Vec::with_capacity(total * 4);

        for level in &self.levels {
            let stride = level.stride() as f32;
            let shapes = self.base_shapes(level);

            for y in 0..level.feature_size(height) {
                let cy = (y as f32 + 0.5) * stride;
                for x in 0..level.feature_size(width) {
                    let cx = (x as f32 + 0.5) * stride;
                    for (w, h) in &shapes {
                        grid_pos.extend([cx - w * 0.5, cy - h * 0.5, cx + w * 0.5, cy + h * 0.5]);
                    }
                }
            }
        }

        Tensor::from_data(TensorData::new(grid_pos, [1, total, 4]), &device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::assert_approx_eq;
    use burn::{
        backend::{NdArray, ndarray::NdArrayDevice},
        tensor::s,
    };

    type B = NdArray<f32>;

    #[test]
    fn test_anchor_count() {
        let device = &NdArrayDevice::default();
        let anchors = Anchors::default();
        assert_eq!(anchors.num_anchors(), 9);

        let images = Tensor::<B, 4>::zeros([1, 3, 512, 512], device);
        let boxes = anchors.forward(&images);

        // (64² + 32² + 16² + 8² + 4²) * 9
        assert_eq!(boxes.dims(), [1, 49104, 4]);
        assert_eq!(anchors.count(512, 512), 49104);
    }

    #[test]
    fn test_anchor_count_non_square() {
        let anchors = Anchors::default();
        // P3 13x7, P4 7x4, P5 4x2, P6 2x1, P7 1x1
        assert_eq!(anchors.count(100, 50), (91 + 28 + 8 + 2 + 1) * 9);
    }

    #[test]
    fn test_base_shapes_keep_area() {
        let anchors = Anchors::default();
        let shapes = anchors.base_shapes(&PyramidLevel::P3);
        assert_eq!(shapes.len(), 9);

        // ratio 1, scale 1 is the plain 32x32 box
        assert_approx_eq(&shapes[3].0, &32.0, 1e-4);
        assert_approx_eq(&shapes[3].1, &32.0, 1e-4);

        // ratio 0.5 halves height relative to width at the same area
        let (w, h) = shapes[0];
        assert_approx_eq(&(w * h), &1024.0, 1e-2);
        assert_approx_eq(&(h / w), &0.5, 1e-5);
    }

    #[test]
    fn test_first_anchor() {
        let device = &NdArrayDevice::default();
        let images = Tensor::<B, 4>::zeros([1, 3, 128, 128], device);
        let boxes = Anchors::default().forward(&images);

        // First P3 cell centred at (4, 4), ratio 0.5 scale 1: w = sqrt(2048), h = w / 2
        let first: Vec<f32> = boxes.slice(s![0, 0, ..]).into_data().iter::<f32>().collect();
        let w = 2048f32.sqrt();
        let h = w * 0.5;
        let expected = [4.0 - w * 0.5, 4.0 - h * 0.5, 4.0 + w * 0.5, 4.0 + h * 0.5];

        for (a, b) in first.iter().zip(expected.iter()) {
            assert_approx_eq(a, b, 1e-3);
        }
    }
}
