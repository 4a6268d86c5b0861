//! Audio payload handling.

pub mod chunk;

pub use chunk::{AudioChunk, calculate_rms, to_f32};
