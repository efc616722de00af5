//! rollcall-vision — Face detection and descriptor extraction.
//!
//! Wraps the neural models as a black-box capability: given a grayscale
//! frame, return zero or more faces, each with a box, confidence score,
//! landmarks, and a 128-dimensional descriptor. Implausible detections are
//! filtered before anything downstream sees them.

pub mod loader;
pub mod model;
pub mod onnx;

pub use loader::{default_model_dir, ModelPaths, SharedModel};
pub use model::{DetectorConfig, FaceModel, FrameDetector, GrayFrame, ModelError};
pub use onnx::OnnxFaceModel;

/// Convert a decoded image into the grayscale buffer the models consume.
/// Used for still-image enrollment input.
pub fn gray_from_image(img: &image::DynamicImage) -> (Vec<u8>, u32, u32) {
    let gray = img.to_luma8();
    let (width, height) = gray.dimensions();
    (gray.into_raw(), width, height)
}
