use serde::{Deserialize, Serialize};

use crate::descriptor::FaceDescriptor;

/// Axis-aligned rectangle in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn center(&self) -> Point {
        Point {
            x: self.x + self.width / 2.0,
            y: self.y + self.height / 2.0,
        }
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Width-to-height ratio. Zero-height boxes yield infinity, which the
    /// plausibility filter rejects.
    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0.0 {
            f32::INFINITY
        } else {
            self.width / self.height
        }
    }
}

/// A point in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn distance_to(&self, other: Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// The three landmark points the tracker consumes, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Landmarks {
    pub left_eye: Point,
    pub right_eye: Point,
    pub nose: Point,
}

/// One face found in one video frame. Lives for that frame only; the tracker
/// folds it into a [`crate::TrackedFace`] and then discards it.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub rect: Rect,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
    pub descriptor: FaceDescriptor,
    pub landmarks: Option<Landmarks>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_center() {
        let r = Rect { x: 10.0, y: 20.0, width: 40.0, height: 60.0 };
        let c = r.center();
        assert_eq!(c.x, 30.0);
        assert_eq!(c.y, 50.0);
    }

    #[test]
    fn test_aspect_ratio_degenerate() {
        let r = Rect { x: 0.0, y: 0.0, width: 10.0, height: 0.0 };
        assert!(r.aspect_ratio().is_infinite());
    }

    #[test]
    fn test_point_distance() {
        let a = Point { x: 0.0, y: 0.0 };
        let b = Point { x: 3.0, y: 4.0 };
        assert!((a.distance_to(b) - 5.0).abs() < 1e-6);
    }
}
