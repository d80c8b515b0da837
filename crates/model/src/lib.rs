pub mod block;
pub mod config;
pub mod model;
mod pretrained;

pub use block::{Attention, Encoder, EncoderBlock, Mlp};
pub use config::{ViTConfig, KNOWN_MODELS};
pub use model::VisionTransformer;
