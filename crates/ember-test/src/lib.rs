//! Test harness for ember.
//!
//! Provides a headless GPU context with helpers for reading resources back
//! to the host.

pub mod harness;

pub use harness::{checkerboard, compare_images, solid_color, HeadlessContext};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] ember_gpu::GpuError),
    #[error("Readback mismatch: {0}")]
    Mismatch(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, TestError>;
