//! The face-model capability boundary and the plausibility filter.

use rollcall_core::DetectedFace;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("model load failed: {0}")]
    LoadFailed(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Borrowed view of one grayscale frame, whatever its origin (camera
/// capture or a decoded still image).
#[derive(Debug, Clone, Copy)]
pub struct GrayFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
}

/// The external model capability: one frame in, faces out.
///
/// Implementations must be idempotent per call and leave no state on the
/// caller; repeated calls on the same frame return the same faces.
pub trait FaceModel: Send {
    /// Multi-face: every face in the frame, unfiltered.
    fn detect_all(&mut self, frame: GrayFrame<'_>) -> Result<Vec<DetectedFace>, ModelError>;
}

/// Bounds for discarding degenerate detector output. Lenient on purpose:
/// distant and angled classroom faces must survive, only slivers,
/// noise-sized specks, frame-filling blobs, and low-confidence guesses go.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub min_confidence: f32,
    pub min_aspect_ratio: f32,
    pub max_aspect_ratio: f32,
    /// Area bounds as fractions of the frame area.
    pub min_area_fraction: f32,
    pub max_area_fraction: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.3,
            min_aspect_ratio: 0.25,
            max_aspect_ratio: 4.0,
            min_area_fraction: 0.0001,
            max_area_fraction: 0.9,
        }
    }
}

/// A [`FaceModel`] with the plausibility filter applied on top. This is what
/// the rest of the system calls.
pub struct FrameDetector {
    model: Box<dyn FaceModel>,
    config: DetectorConfig,
}

impl FrameDetector {
    pub fn new(model: Box<dyn FaceModel>, config: DetectorConfig) -> Self {
        Self { model, config }
    }

    /// Detect faces in one frame, dropping implausible ones.
    pub fn detect(&mut self, frame: GrayFrame<'_>) -> Result<Vec<DetectedFace>, ModelError> {
        let frame_area = frame.width as f32 * frame.height as f32;
        let raw = self.model.detect_all(frame)?;
        let total = raw.len();

        let faces: Vec<DetectedFace> = raw
            .into_iter()
            .filter(|f| plausible(f, frame_area, &self.config))
            .collect();

        if faces.len() < total {
            tracing::debug!(kept = faces.len(), dropped = total - faces.len(), "filtered detections");
        }
        Ok(faces)
    }

    /// Single-face mode: the highest-confidence plausible face, if any.
    /// Enrollment capture uses this.
    pub fn detect_one(&mut self, frame: GrayFrame<'_>) -> Result<Option<DetectedFace>, ModelError> {
        let faces = self.detect(frame)?;
        Ok(faces.into_iter().max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        }))
    }
}

fn plausible(face: &DetectedFace, frame_area: f32, cfg: &DetectorConfig) -> bool {
    if face.confidence < cfg.min_confidence {
        return false;
    }
    let aspect = face.rect.aspect_ratio();
    if !(cfg.min_aspect_ratio..=cfg.max_aspect_ratio).contains(&aspect) {
        return false;
    }
    if frame_area <= 0.0 {
        return false;
    }
    let area_frac = face.rect.area() / frame_area;
    (cfg.min_area_fraction..=cfg.max_area_fraction).contains(&area_frac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{FaceDescriptor, Rect};

    struct StubModel {
        faces: Vec<DetectedFace>,
    }

    impl FaceModel for StubModel {
        fn detect_all(&mut self, _frame: GrayFrame<'_>) -> Result<Vec<DetectedFace>, ModelError> {
            Ok(self.faces.clone())
        }
    }

    fn face(w: f32, h: f32, confidence: f32) -> DetectedFace {
        DetectedFace {
            rect: Rect { x: 10.0, y: 10.0, width: w, height: h },
            confidence,
            descriptor: FaceDescriptor::new(vec![0.1; 8]),
            landmarks: None,
        }
    }

    fn detector(faces: Vec<DetectedFace>) -> FrameDetector {
        FrameDetector::new(Box::new(StubModel { faces }), DetectorConfig::default())
    }

    const FRAME: GrayFrame<'_> = GrayFrame { data: &[0u8; 0], width: 640, height: 480 };

    #[test]
    fn test_keeps_ordinary_face() {
        let mut d = detector(vec![face(80.0, 100.0, 0.8)]);
        assert_eq!(d.detect(FRAME).unwrap().len(), 1);
    }

    #[test]
    fn test_drops_low_confidence() {
        let mut d = detector(vec![face(80.0, 100.0, 0.1)]);
        assert!(d.detect(FRAME).unwrap().is_empty());
    }

    #[test]
    fn test_drops_extreme_sliver() {
        // aspect 10:1
        let mut d = detector(vec![face(200.0, 20.0, 0.9)]);
        assert!(d.detect(FRAME).unwrap().is_empty());
    }

    #[test]
    fn test_drops_noise_sized_and_frame_filling() {
        let tiny = face(3.0, 3.0, 0.9); // ~0.003% of frame
        let huge = face(640.0, 470.0, 0.9); // ~98% of frame
        let mut d = detector(vec![tiny, huge]);
        assert!(d.detect(FRAME).unwrap().is_empty());
    }

    #[test]
    fn test_keeps_distant_small_face() {
        // ~18x22 px face in 640x480: small but legitimate
        let mut d = detector(vec![face(18.0, 22.0, 0.45)]);
        assert_eq!(d.detect(FRAME).unwrap().len(), 1);
    }

    #[test]
    fn test_detect_one_prefers_highest_confidence() {
        let mut d = detector(vec![face(80.0, 100.0, 0.5), face(90.0, 110.0, 0.95)]);
        let best = d.detect_one(FRAME).unwrap().unwrap();
        assert!((best.confidence - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_detect_one_none_when_empty() {
        let mut d = detector(vec![]);
        assert!(d.detect_one(FRAME).unwrap().is_none());
    }
}
