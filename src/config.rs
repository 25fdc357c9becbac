use burn::{config::Config, tensor::backend::Backend};
use thiserror::Error;

use crate::models::efficientdet::EfficientDet;

/// Number of EfficientDet size variants (`d0` .. `d7`).
pub const COEFFICIENT_COUNT: usize = 8;

/// BiFPN channel width per coefficient.
pub const BIFPN_CHANNELS: [usize; COEFFICIENT_COUNT] = [64, 88, 112, 160, 224, 288, 384, 384];

/// Backbone output channels `(C3, C4, C5)` per coefficient. P6 is projected from C5 so it
/// shares the C5 width.
pub const BACKBONE_CHANNELS: [(usize, usize, usize); COEFFICIENT_COUNT] = [
    (40, 80, 192),  // b0
    (40, 80, 192),  // b1
    (48, 88, 208),  // b2
    (48, 96, 232),  // b3
    (56, 112, 272), // b4
    (64, 128, 304), // b5
    (72, 144, 344), // b6
    (80, 160, 384), // b7
];

pub const MAX_BIFPN_REPEATS: usize = 8;

/// Epsilon added to the rectified fusion weight sum before normalising.
pub const FUSION_EPSILON: f32 = 1e-4;

/// Anchors whose best class score does not exceed this value are dropped before NMS.
pub const SCORE_THRESHOLD: f32 = 0.05;

/// IoU above which a lower scoring detection is suppressed.
pub const NMS_IOU_THRESHOLD: f32 = 0.5;

/// Prior foreground probability used to bias the classifier header at initialisation.
pub const CLASSIFIER_PRIOR: f64 = 0.01;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} is not a valid model coefficient, supported coefficients are 0 to 7")]
    InvalidCoefficient(usize),
    #[error("num_classes must be at least 1")]
    NoClasses,
}

/// Architecture dimensions derived from a model coefficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelScale {
    pub coefficient: usize,
    pub channels: usize,
    pub bifpn_repeats: usize,
    pub head_depth: usize,
    pub backbone_channels: (usize, usize, usize),
}

impl ModelScale {
    pub fn from_coefficient(coefficient: usize) -> Result<Self, ConfigError> {
        if coefficient >= COEFFICIENT_COUNT {
            return Err(ConfigError::InvalidCoefficient(coefficient));
        }

        Ok(Self {
            coefficient,
            channels: BIFPN_CHANNELS[coefficient],
            bifpn_repeats: (2 + coefficient).min(MAX_BIFPN_REPEATS),
            head_depth: 3 + coefficient / 3,
            backbone_channels: BACKBONE_CHANNELS[coefficient],
        })
    }
}

/// Construction parameters for [`EfficientDet`].
///
/// Only the coefficient is required, everything else falls back to the usual
/// EfficientDet / RetinaNet defaults.
#[derive(Config, Debug)]
pub struct EfficientDetConfig {
    /// Model size `0..=7`
    pub coefficient: usize,
    #[config(default = 20)]
    pub num_classes: usize,
    #[config(default = 0.25)]
    pub focal_alpha: f32,
    #[config(default = 2.0)]
    pub focal_gamma: f32,
}

impl EfficientDetConfig {
    /// Validates the configuration, no parameters are allocated when this fails.
    pub fn scale(&self) -> Result<ModelScale, ConfigError> {
        if self.num_classes == 0 {
            return Err(ConfigError::NoClasses);
        }

        ModelScale::from_coefficient(self.coefficient)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<EfficientDet<B>, ConfigError> {
        let scale = self.scale()?;
        Ok(EfficientDet::new(device, scale, self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smallest_and_largest_scale() {
        let d0 = ModelScale::from_coefficient(0).unwrap();
        assert_eq!(d0.channels, 64);
        assert_eq!(d0.bifpn_repeats, 2);
        assert_eq!(d0.head_depth, 3);
        assert_eq!(d0.backbone_channels, (40, 80, 192));

        let d7 = ModelScale::from_coefficient(7).unwrap();
        assert_eq!(d7.channels, 384);
        assert_eq!(d7.bifpn_repeats, 8);
        assert_eq!(d7.head_depth, 5);
        assert_eq!(d7.backbone_channels, (80, 160, 384));
    }

    #[test]
    fn test_scale_tables() {
        let repeats: Vec<usize> = (0..COEFFICIENT_COUNT)
            .map(|c| ModelScale::from_coefficient(c).unwrap().bifpn_repeats)
            .collect();
        assert_eq!(repeats, vec![2, 3, 4, 5, 6, 7, 8, 8]);

        let depths: Vec<usize> = (0..COEFFICIENT_COUNT)
            .map(|c| ModelScale::from_coefficient(c).unwrap().head_depth)
            .collect();
        assert_eq!(depths, vec![3, 3, 3, 4, 4, 4, 5, 5]);
    }

    #[test]
    fn test_invalid_coefficient() {
        assert_eq!(
            ModelScale::from_coefficient(8),
            Err(ConfigError::InvalidCoefficient(8))
        );

        let config = EfficientDetConfig::new(12);
        assert_eq!(config.scale(), Err(ConfigError::InvalidCoefficient(12)));
    }

    #[test]
    fn test_no_classes() {
        let config = EfficientDetConfig::new(0).with_num_classes(0);
        assert_eq!(config.scale(), Err(ConfigError::NoClasses));
    }

    #[test]
    fn test_config_defaults() {
        let config = EfficientDetConfig::new(3);
        assert_eq!(config.num_classes, 20);
        assert_eq!(config.focal_alpha, 0.25);
        assert_eq!(config.focal_gamma, 2.0);
    }
}
