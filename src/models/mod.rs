pub mod bifpn;
pub mod conv_block;
pub mod efficientdet;
pub mod efficientnet;
pub mod heads;
pub mod topology;
