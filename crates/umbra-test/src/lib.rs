//! Test harness for the Umbra renderer.
//!
//! Runs the full frame loop on the headless backend and reads back what
//! reached the present images.

pub mod harness;

pub use harness::{cube_scene, image_difference, HeadlessRenderer};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] umbra_gpu::GpuError),
    #[error("asset error: {0}")]
    Core(#[from] umbra_core::Error),
    #[error("Image comparison failed: {0}")]
    ImageComparison(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, TestError>;
