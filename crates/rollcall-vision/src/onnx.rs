//! ONNX-backed face model: anchor-free multi-stride detector plus a
//! 128-dimensional descriptor head, both on CPU via ONNX Runtime.

use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_core::{DetectedFace, FaceDescriptor, Landmarks, Point, Rect, DESCRIPTOR_LEN};
use std::path::Path;

use crate::model::{FaceModel, GrayFrame, ModelError};

const DETECT_INPUT_SIZE: usize = 640;
const DETECT_MEAN: f32 = 127.5;
const DETECT_STD: f32 = 128.0;
/// Raw score floor during decode; the configurable plausibility filter
/// applies its own (possibly stricter) confidence bound afterwards.
const DECODE_SCORE_FLOOR: f32 = 0.3;
const NMS_IOU_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

const EMBED_INPUT_SIZE: usize = 112;
const EMBED_MEAN: f32 = 127.5;
const EMBED_STD: f32 = 127.5;
/// Margin around the detected box when cropping for the descriptor head.
const EMBED_CROP_MARGIN: f32 = 1.2;

/// Mapping of letterboxed coordinates back to frame coordinates.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Candidate face before NMS, in frame coordinates.
#[derive(Debug, Clone)]
struct Candidate {
    rect: Rect,
    score: f32,
    landmarks: Landmarks,
}

/// Detector + descriptor sessions. Loaded once per process through
/// [`crate::SharedModel`]; owned by the engine thread during a session.
pub struct OnnxFaceModel {
    detect_session: Session,
    embed_session: Session,
}

impl OnnxFaceModel {
    /// Load both ONNX models. Fails fast if either file is missing.
    pub fn load(detect_path: &Path, embed_path: &Path) -> Result<Self, ModelError> {
        let detect_session = open_session(detect_path)?;
        let embed_session = open_session(embed_path)?;

        tracing::info!(
            detect = %detect_path.display(),
            embed = %embed_path.display(),
            "face models loaded"
        );

        Ok(Self {
            detect_session,
            embed_session,
        })
    }

    fn embed(&mut self, frame: GrayFrame<'_>, rect: &Rect) -> Result<FaceDescriptor, ModelError> {
        let crop = crop_region(rect, frame.width, frame.height);
        let patch = resize_region_bilinear(
            frame.data,
            frame.width as usize,
            frame.height as usize,
            crop,
            EMBED_INPUT_SIZE,
            EMBED_INPUT_SIZE,
        );

        let mut input = Array4::<f32>::zeros((1, 3, EMBED_INPUT_SIZE, EMBED_INPUT_SIZE));
        for y in 0..EMBED_INPUT_SIZE {
            for x in 0..EMBED_INPUT_SIZE {
                let normalized = (patch[y * EMBED_INPUT_SIZE + x] as f32 - EMBED_MEAN) / EMBED_STD;
                input[[0, 0, y, x]] = normalized;
                input[[0, 1, y, x]] = normalized;
                input[[0, 2, y, x]] = normalized;
            }
        }

        let outputs = self
            .embed_session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("descriptor head: {e}")))?;

        if raw.len() != DESCRIPTOR_LEN {
            return Err(ModelError::InferenceFailed(format!(
                "expected {DESCRIPTOR_LEN}-dim descriptor, got {}",
                raw.len()
            )));
        }

        let norm: f32 = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
        let values: Vec<f32> = if norm > 0.0 {
            raw.iter().map(|v| v / norm).collect()
        } else {
            raw.to_vec()
        };

        Ok(FaceDescriptor::new(values))
    }
}

impl FaceModel for OnnxFaceModel {
    fn detect_all(&mut self, frame: GrayFrame<'_>) -> Result<Vec<DetectedFace>, ModelError> {
        let (input, letterbox) = letterbox_tensor(frame);

        let outputs = self
            .detect_session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        if outputs.len() < 9 {
            return Err(ModelError::InferenceFailed(format!(
                "detector needs 9 outputs (3 strides x score/box/landmarks), got {}",
                outputs.len()
            )));
        }

        // Positional ordering: [0-2] scores, [3-5] box offsets, [6-8]
        // landmark offsets, each for strides 8/16/32.
        let mut candidates = Vec::new();
        for (level, &stride) in STRIDES.iter().enumerate() {
            let (_, scores) = outputs[level]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[level + 3]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;
            let (_, points) = outputs[level + 6]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::InferenceFailed(format!("landmarks stride {stride}: {e}")))?;

            decode_level(scores, boxes, points, stride, &letterbox, &mut candidates);
        }

        drop(outputs);

        let kept = suppress_overlaps(candidates, NMS_IOU_THRESHOLD);

        let mut faces = Vec::with_capacity(kept.len());
        for cand in kept {
            let descriptor = self.embed(frame, &cand.rect)?;
            faces.push(DetectedFace {
                rect: cand.rect,
                confidence: cand.score,
                descriptor,
                landmarks: Some(cand.landmarks),
            });
        }

        // Highest confidence first
        faces.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(faces)
    }
}

fn open_session(path: &Path) -> Result<Session, ModelError> {
    if !path.exists() {
        return Err(ModelError::ModelNotFound(path.display().to_string()));
    }
    Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)
        .map_err(|e| ModelError::LoadFailed(format!("{}: {e}", path.display())))
}

/// Letterbox the grayscale frame into the detector's square input tensor.
/// Padding uses the mean value so it normalizes to zero.
fn letterbox_tensor(frame: GrayFrame<'_>) -> (Array4<f32>, Letterbox) {
    let (fw, fh) = (frame.width as usize, frame.height as usize);
    let scale = (DETECT_INPUT_SIZE as f32 / fw as f32).min(DETECT_INPUT_SIZE as f32 / fh as f32);
    let new_w = (fw as f32 * scale).round() as usize;
    let new_h = (fh as f32 * scale).round() as usize;
    let pad_x = (DETECT_INPUT_SIZE - new_w) / 2;
    let pad_y = (DETECT_INPUT_SIZE - new_h) / 2;

    let full = Rect { x: 0.0, y: 0.0, width: fw as f32, height: fh as f32 };
    let resized = resize_region_bilinear(frame.data, fw, fh, full, new_w, new_h);

    let mut tensor = Array4::<f32>::zeros((1, 3, DETECT_INPUT_SIZE, DETECT_INPUT_SIZE));
    for y in 0..DETECT_INPUT_SIZE {
        for x in 0..DETECT_INPUT_SIZE {
            let pixel = if y >= pad_y && y < pad_y + new_h && x >= pad_x && x < pad_x + new_w {
                resized[(y - pad_y) * new_w + (x - pad_x)] as f32
            } else {
                DETECT_MEAN
            };
            let normalized = (pixel - DETECT_MEAN) / DETECT_STD;
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }
    }

    (
        tensor,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// Decode one stride level of anchor-free detector output into candidates
/// in frame coordinates.
fn decode_level(
    scores: &[f32],
    boxes: &[f32],
    points: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    out: &mut Vec<Candidate>,
) {
    let grid = DETECT_INPUT_SIZE / stride;
    let num_anchors = grid * grid * ANCHORS_PER_CELL;

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= DECODE_SCORE_FLOOR {
            continue;
        }

        let cell = idx / ANCHORS_PER_CELL;
        let anchor_x = ((cell % grid) * stride) as f32;
        let anchor_y = ((cell / grid) * stride) as f32;

        let b = idx * 4;
        if b + 3 >= boxes.len() {
            continue;
        }
        let (x1, y1) = letterbox.to_frame(
            anchor_x - boxes[b] * stride as f32,
            anchor_y - boxes[b + 1] * stride as f32,
        );
        let (x2, y2) = letterbox.to_frame(
            anchor_x + boxes[b + 2] * stride as f32,
            anchor_y + boxes[b + 3] * stride as f32,
        );

        // First three landmark points: left eye, right eye, nose.
        let p = idx * 10;
        if p + 5 >= points.len() {
            continue;
        }
        let landmark = |k: usize| {
            let (x, y) = letterbox.to_frame(
                anchor_x + points[p + k * 2] * stride as f32,
                anchor_y + points[p + k * 2 + 1] * stride as f32,
            );
            Point { x, y }
        };

        out.push(Candidate {
            rect: Rect {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
            },
            score,
            landmarks: Landmarks {
                left_eye: landmark(0),
                right_eye: landmark(1),
                nose: landmark(2),
            },
        });
    }
}

/// Greedy non-maximum suppression, highest score first.
fn suppress_overlaps(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut kept: Vec<Candidate> = Vec::new();
    for cand in candidates {
        if kept.iter().all(|k| overlap_ratio(&k.rect, &cand.rect) <= iou_threshold) {
            kept.push(cand);
        }
    }
    kept
}

/// Intersection-over-union of two boxes.
fn overlap_ratio(a: &Rect, b: &Rect) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Square crop around the box center with margin, clamped to the frame.
fn crop_region(rect: &Rect, frame_width: u32, frame_height: u32) -> Rect {
    let side = (rect.width.max(rect.height) * EMBED_CROP_MARGIN)
        .min(frame_width as f32)
        .min(frame_height as f32);
    let center = rect.center();
    let x = (center.x - side / 2.0).clamp(0.0, frame_width as f32 - side);
    let y = (center.y - side / 2.0).clamp(0.0, frame_height as f32 - side);
    Rect { x, y, width: side, height: side }
}

/// Bilinear resample of a source region into a `dst_w` x `dst_h` buffer.
fn resize_region_bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    region: Rect,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut out = vec![0u8; dst_w * dst_h];
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return out;
    }

    let step_x = region.width / dst_w as f32;
    let step_y = region.height / dst_h as f32;

    for y in 0..dst_h {
        let src_y = region.y + (y as f32 + 0.5) * step_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, src_h as i32 - 1) as usize;
        let y1 = (y0 + 1).min(src_h - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..dst_w {
            let src_x = region.x + (x as f32 + 0.5) * step_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, src_w as i32 - 1) as usize;
            let x1 = (x0 + 1).min(src_w - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = src[y0 * src_w + x0] as f32;
            let tr = src[y0 * src_w + x1] as f32;
            let bl = src[y1 * src_w + x0] as f32;
            let br = src[y1 * src_w + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;
            out[y * dst_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: f32, y: f32, w: f32, h: f32) -> Rect {
        Rect { x, y, width: w, height: h }
    }

    fn candidate(x: f32, y: f32, w: f32, h: f32, score: f32) -> Candidate {
        Candidate {
            rect: rect(x, y, w, h),
            score,
            landmarks: Landmarks {
                left_eye: Point { x: 0.0, y: 0.0 },
                right_eye: Point { x: 0.0, y: 0.0 },
                nose: Point { x: 0.0, y: 0.0 },
            },
        }
    }

    #[test]
    fn test_overlap_ratio_identical() {
        let a = rect(0.0, 0.0, 100.0, 100.0);
        assert!((overlap_ratio(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_overlap_ratio_disjoint() {
        let a = rect(0.0, 0.0, 10.0, 10.0);
        let b = rect(50.0, 50.0, 10.0, 10.0);
        assert_eq!(overlap_ratio(&a, &b), 0.0);
    }

    #[test]
    fn test_overlap_ratio_half_shift() {
        let a = rect(0.0, 0.0, 10.0, 10.0);
        let b = rect(5.0, 0.0, 10.0, 10.0);
        assert!((overlap_ratio(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_suppression_keeps_best_of_cluster() {
        let cands = vec![
            candidate(0.0, 0.0, 100.0, 100.0, 0.7),
            candidate(4.0, 4.0, 100.0, 100.0, 0.9),
            candidate(300.0, 300.0, 60.0, 60.0, 0.6),
        ];
        let kept = suppress_overlaps(cands, NMS_IOU_THRESHOLD);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].score - 0.9).abs() < 1e-6);
        assert!((kept[1].score - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_letterbox_round_trip() {
        let lb = Letterbox { scale: 2.0, pad_x: 0.0, pad_y: 140.0 };
        let (x, y) = lb.to_frame(100.0 * 2.0, 50.0 * 2.0 + 140.0);
        assert!((x - 100.0).abs() < 1e-4);
        assert!((y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_crop_region_square_and_clamped() {
        let c = crop_region(&rect(600.0, 440.0, 60.0, 50.0), 640, 480);
        assert_eq!(c.width, c.height);
        assert!(c.x >= 0.0 && c.y >= 0.0);
        assert!(c.x + c.width <= 640.0);
        assert!(c.y + c.height <= 480.0);
    }

    #[test]
    fn test_resize_uniform_stays_uniform() {
        let src = vec![128u8; 64 * 64];
        let out = resize_region_bilinear(
            &src,
            64,
            64,
            rect(0.0, 0.0, 64.0, 64.0),
            EMBED_INPUT_SIZE,
            EMBED_INPUT_SIZE,
        );
        assert!(out.iter().all(|&p| p == 128));
    }

    #[test]
    fn test_resize_region_selects_subwindow() {
        // Left half black, right half white; cropping the right half
        // should come out white.
        let mut src = vec![0u8; 64 * 64];
        for y in 0..64 {
            for x in 32..64 {
                src[y * 64 + x] = 255;
            }
        }
        let out = resize_region_bilinear(&src, 64, 64, rect(33.0, 0.0, 30.0, 64.0), 8, 8);
        assert!(out.iter().all(|&p| p > 250), "expected white subwindow");
    }
}
