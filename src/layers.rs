/// Feature pyramid levels used by the EfficientDet fusion network and detection heads.
///
/// Level `Pn` has a stride of `2^n` relative to the input image, so `P3` is the finest
/// (highest resolution) map and `P7` the coarsest. A pyramid is always ordered from `P3`
/// to `P7` and the position of a map in that ordering is its [`index`](Self::index).
///
/// “EfficientDet: Scalable and Efficient Object Detection”
/// Authors: Mingxing Tan, Ruoming Pang, Quoc V. Le
/// Link (official): https://arxiv.org/abs/1911.09070
///
/// - Tan et al. - Pg 3
///
/// Multi-scale feature fusion aims to aggregate features at different resolutions.
/// Formally, given a list of multi-scale features P_in = (P_l1_in, P_l2_in, ...), where
/// P_li_in represents the feature at level li, our goal is to find a transformation f that
/// can effectively aggregate different features and output a list of new features.
///
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PyramidLevel {
    /// `P3`: backbone C3 projected, stride 8.
    P3,
    /// `P4`: backbone C4 projected, stride 16.
    P4,
    /// `P5`: backbone C5 projected, stride 32.
    P5,
    /// `P6`: strided convolution on C5, stride 64.
    P6,
    /// `P7`: strided convolution on P6, stride 128.
    P7,
}

impl PyramidLevel {
    /// Returns all pyramid levels from finest to coarsest.
    pub fn as_list() -> Vec<PyramidLevel> {
        vec![
            PyramidLevel::P3,
            PyramidLevel::P4,
            PyramidLevel::P5,
            PyramidLevel::P6,
            PyramidLevel::P7,
        ]
    }

    pub fn count() -> usize {
        Self::as_list().len()
    }

    /// Position of the level inside a pyramid (`P3` is 0).
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn from_index(index: usize) -> Option<PyramidLevel> {
        Self::as_list().get(index).copied()
    }

    /// The `n` in `Pn`.
    pub fn level(&self) -> usize {
        self.index() + 3
    }

    /// Downsampling factor of this level relative to the input image.
    pub fn stride(&self) -> usize {
        1 << self.level()
    }

    /// Side length of the scale 1, ratio 1 anchor box at this level.
    pub fn anchor_size(&self) -> f32 {
        (1usize << (self.level() + 2)) as f32
    }

    /// Spatial size of this level's feature map for an input of `size` pixels.
    pub fn feature_size(&self, size: usize) -> usize {
        size.div_ceil(self.stride())
    }
}
