//! Texture payloads and image I/O
//!
//! Pure Rust decoding and BCn encoding using image_dds and image.

mod info;
mod processor;

pub use info::{TextureInfo, CUBE_FACE_COUNT};
pub use processor::{
    estimate_texture_size, CompressionFormat, CompressionQuality, DdsCodec, TextureCodec,
};
