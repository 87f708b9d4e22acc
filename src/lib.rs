//! Hierarchical dual-attention vision backbone for candle.
//!
//! A multi-scale feature extractor that alternates windowed spatial
//! attention with linear-complexity channel attention, interleaved with
//! learned downsampling (inter-stage patch re-embedding or in-block query
//! pooling). Produces classification logits, pooled features, or a pyramid
//! of progressively lower-resolution, higher-channel feature maps.

pub mod attention;
pub mod block;
pub mod embed;
pub mod error;
pub mod model;
pub mod window;

pub use attention::AttentionType;
pub use error::ModelError;
pub use model::{
    DaViT, DaViTConfig, Downsample, FeatureSelection, ForwardOpts, Granularity, OutputFormat,
    PoolType, StageDescriptor,
};
