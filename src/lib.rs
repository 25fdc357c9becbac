#![recursion_limit = "256"]

pub mod anchors;
pub mod boxes;
pub mod config;
pub mod debug;
pub mod inference;
pub mod layers;
pub mod loss;
pub mod models;
pub mod nms;

pub use config::{ConfigError, EfficientDetConfig, ModelScale};
pub use models::efficientdet::{DetectorInput, DetectorOutput, EfficientDet};
