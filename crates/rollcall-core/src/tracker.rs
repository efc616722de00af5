//! Cross-frame face tracking with box smoothing.
//!
//! Raw per-frame detections jitter and carry no identity. The tracker
//! associates each detection with a previously tracked face by center
//! proximity, keeps a short position history per track, and displays the
//! moving average of that history so boxes neither jump nor flicker.

use std::collections::VecDeque;

use crate::descriptor::FaceDescriptor;
use crate::types::{DetectedFace, Point, Rect};

/// Number of recent positions averaged for the displayed box.
const HISTORY_DEPTH: usize = 5;

/// Fraction of the detected box used for the displayed box.
const BOX_SHRINK: f32 = 0.9;

/// Vertical position of the nose within the displayed box (from the top).
const NOSE_ANCHOR: f32 = 0.3;

/// Fallback nose height within the raw box when no landmarks are available.
const NOSE_ESTIMATE: f32 = 0.4;

/// Label shown for a track not yet matched to an enrolled student.
const DETECTING_LABEL: &str = "Detecting…";

/// A face with a stable identity across consecutive frames.
///
/// Starts with a provisional per-track id; once matched to a student the id
/// rebinds to the student id and the `recognized` flag never clears for the
/// rest of the session.
#[derive(Debug, Clone)]
pub struct TrackedFace {
    pub id: String,
    pub name: String,
    /// Smoothed, landmark-centered display box.
    pub rect: Rect,
    pub nose: Option<Point>,
    pub recognized: bool,
    /// Match quality percentage, 0 until recognized.
    pub accuracy: f32,
    /// Most recent descriptor, re-probed on recognition passes until matched.
    pub descriptor: FaceDescriptor,
    history: VecDeque<Rect>,
}

/// Associates per-frame detections with tracks. One instance per scan
/// session; discarded with the session. Construct through [`Self::new`]:
/// a zero radius factor would disable association entirely.
#[derive(Debug)]
pub struct FaceTracker {
    tracks: Vec<TrackedFace>,
    next_track: u64,
    /// Association radius as a fraction of the detection's smaller dimension.
    radius_factor: f32,
}

impl FaceTracker {
    pub fn new(radius_factor: f32) -> Self {
        Self {
            tracks: Vec::new(),
            next_track: 0,
            radius_factor,
        }
    }

    pub fn tracks(&self) -> &[TrackedFace] {
        &self.tracks
    }

    /// Fold one frame's detections into the track set.
    ///
    /// Tracks not matched by any detection are dropped — continuity requires
    /// being re-detected every processed frame, so zero detections clears
    /// everything and reappearing faces start fresh.
    pub fn update(&mut self, detections: &[DetectedFace]) -> &[TrackedFace] {
        let prev = std::mem::take(&mut self.tracks);
        let mut claimed = vec![false; prev.len()];
        let mut next = Vec::with_capacity(detections.len());

        for det in detections {
            let centered = centered_box(det);
            let center = centered.center();
            let radius = self.radius_factor * det.rect.width.min(det.rect.height);

            let mut best: Option<(usize, f32)> = None;
            for (i, track) in prev.iter().enumerate() {
                if claimed[i] {
                    continue;
                }
                // Associate against the track's latest position, not the
                // smoothed display box: the history average lags a moving
                // face and would drift out of the radius within a few
                // frames of legal motion.
                let d = track
                    .history
                    .back()
                    .map_or(f32::INFINITY, |last| center.distance_to(last.center()));
                if d <= radius && best.map_or(true, |(_, bd)| d < bd) {
                    best = Some((i, d));
                }
            }

            match best {
                Some((i, _)) => {
                    claimed[i] = true;
                    let mut track = prev[i].clone();
                    track.history.push_back(centered);
                    if track.history.len() > HISTORY_DEPTH {
                        track.history.pop_front();
                    }
                    track.rect = mean_rect(&track.history);
                    track.nose = Some(nose_point(det));
                    track.descriptor = det.descriptor.clone();
                    next.push(track);
                }
                None => {
                    let id = format!("track:{}", self.next_track);
                    self.next_track += 1;
                    let mut history = VecDeque::with_capacity(HISTORY_DEPTH);
                    history.push_back(centered);
                    next.push(TrackedFace {
                        id,
                        name: DETECTING_LABEL.to_string(),
                        rect: centered,
                        nose: Some(nose_point(det)),
                        recognized: false,
                        accuracy: 0.0,
                        descriptor: det.descriptor.clone(),
                        history,
                    });
                }
            }
        }

        self.tracks = next;
        &self.tracks
    }

    /// Tracks still awaiting a recognition verdict.
    pub fn unrecognized(&self) -> impl Iterator<Item = &TrackedFace> {
        self.tracks.iter().filter(|t| !t.recognized)
    }

    /// Bind a track to a matched student. Recognition is monotonic: a track
    /// already recognized keeps its original binding.
    pub fn mark_recognized(
        &mut self,
        track_id: &str,
        student_id: &str,
        name: &str,
        accuracy: f32,
    ) -> bool {
        let Some(track) = self.tracks.iter_mut().find(|t| t.id == track_id) else {
            return false;
        };
        if track.recognized {
            return false;
        }
        track.id = student_id.to_string();
        track.name = name.to_string();
        track.recognized = true;
        track.accuracy = accuracy;
        true
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }
}

/// Compute the landmark-centered display box for a detection.
///
/// Centered horizontally on the nose, sized at 90% of the raw box, with the
/// nose 30% from the top edge. Without landmarks the nose is estimated 40%
/// down the raw box.
fn centered_box(det: &DetectedFace) -> Rect {
    let nose = nose_point(det);
    let width = det.rect.width * BOX_SHRINK;
    let height = det.rect.height * BOX_SHRINK;
    Rect {
        x: nose.x - width / 2.0,
        y: nose.y - height * NOSE_ANCHOR,
        width,
        height,
    }
}

fn nose_point(det: &DetectedFace) -> Point {
    match &det.landmarks {
        Some(lm) => lm.nose,
        None => Point {
            x: det.rect.x + det.rect.width / 2.0,
            y: det.rect.y + det.rect.height * NOSE_ESTIMATE,
        },
    }
}

fn mean_rect(history: &VecDeque<Rect>) -> Rect {
    let n = history.len().max(1) as f32;
    let mut acc = Rect { x: 0.0, y: 0.0, width: 0.0, height: 0.0 };
    for r in history {
        acc.x += r.x;
        acc.y += r.y;
        acc.width += r.width;
        acc.height += r.height;
    }
    Rect {
        x: acc.x / n,
        y: acc.y / n,
        width: acc.width / n,
        height: acc.height / n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(x: f32, y: f32, size: f32) -> DetectedFace {
        DetectedFace {
            rect: Rect { x, y, width: size, height: size },
            confidence: 0.9,
            descriptor: FaceDescriptor::new(vec![0.5; 8]),
            landmarks: None,
        }
    }

    #[test]
    fn test_new_detection_creates_provisional_track() {
        let mut tracker = FaceTracker::new(0.5);
        let tracks = tracker.update(&[detection(100.0, 100.0, 80.0)]);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, "track:0");
        assert_eq!(tracks[0].name, "Detecting…");
        assert!(!tracks[0].recognized);
    }

    #[test]
    fn test_identity_stable_under_small_motion() {
        let mut tracker = FaceTracker::new(0.5);
        tracker.update(&[detection(100.0, 100.0, 80.0)]);
        let id = tracker.tracks()[0].id.clone();

        // Moves 20 px/frame — well within 0.5 * 80 = 40 px bound. Runs
        // well past the smoothing window: the trailing display average must
        // never bleed into association.
        for step in 1..=12 {
            let tracks = tracker.update(&[detection(100.0 + 20.0 * step as f32, 100.0, 80.0)]);
            assert_eq!(tracks.len(), 1, "no spurious tracks on step {step}");
            assert_eq!(tracks[0].id, id);
        }
    }

    #[test]
    fn test_large_jump_starts_new_track() {
        let mut tracker = FaceTracker::new(0.5);
        tracker.update(&[detection(100.0, 100.0, 80.0)]);
        let tracks = tracker.update(&[detection(400.0, 400.0, 80.0)]);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, "track:1");
    }

    #[test]
    fn test_unmatched_tracks_dropped() {
        let mut tracker = FaceTracker::new(0.5);
        tracker.update(&[detection(100.0, 100.0, 80.0), detection(400.0, 100.0, 80.0)]);
        assert_eq!(tracker.tracks().len(), 2);

        let tracks = tracker.update(&[detection(102.0, 100.0, 80.0)]);
        assert_eq!(tracks.len(), 1);

        assert!(tracker.update(&[]).is_empty());
    }

    #[test]
    fn test_two_faces_keep_distinct_tracks() {
        let mut tracker = FaceTracker::new(0.5);
        tracker.update(&[detection(100.0, 100.0, 80.0), detection(400.0, 100.0, 80.0)]);
        let ids: Vec<String> = tracker.tracks().iter().map(|t| t.id.clone()).collect();

        let tracks = tracker.update(&[detection(105.0, 100.0, 80.0), detection(395.0, 100.0, 80.0)]);
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].id, ids[0]);
        assert_eq!(tracks[1].id, ids[1]);
    }

    #[test]
    fn test_smoothing_is_mean_of_window() {
        let mut tracker = FaceTracker::new(5.0); // generous radius, keep one track
        let xs = [100.0, 110.0, 120.0, 130.0, 140.0];
        for &x in &xs {
            tracker.update(&[detection(x, 100.0, 80.0)]);
        }
        // Displayed x = mean of the 5 centered boxes. Centered box x for a
        // landmark-free 80 px detection at raw x: (x + 40) - 36 = x + 4.
        let expected: f32 = xs.iter().map(|x| x + 4.0).sum::<f32>() / 5.0;
        let got = tracker.tracks()[0].rect.x;
        assert!((got - expected).abs() < 1e-3, "got {got}, expected {expected}");

        // A 6th position slides the window past the 1st
        tracker.update(&[detection(150.0, 100.0, 80.0)]);
        let expected6: f32 = xs[1..].iter().chain([150.0].iter()).map(|x| x + 4.0).sum::<f32>() / 5.0;
        let got6 = tracker.tracks()[0].rect.x;
        assert!((got6 - expected6).abs() < 1e-3, "got {got6}, expected {expected6}");
    }

    #[test]
    fn test_centered_box_uses_nose_landmark() {
        let mut det = detection(100.0, 100.0, 80.0);
        det.landmarks = Some(crate::types::Landmarks {
            left_eye: Point { x: 120.0, y: 120.0 },
            right_eye: Point { x: 160.0, y: 120.0 },
            nose: Point { x: 140.0, y: 140.0 },
        });
        let b = centered_box(&det);
        assert!((b.width - 72.0).abs() < 1e-4);
        assert!((b.x - (140.0 - 36.0)).abs() < 1e-4);
        // nose sits 30% from the top
        assert!((b.y - (140.0 - 72.0 * 0.3)).abs() < 1e-4);
    }

    #[test]
    fn test_recognition_monotonic() {
        let mut tracker = FaceTracker::new(0.5);
        tracker.update(&[detection(100.0, 100.0, 80.0)]);
        let track_id = tracker.tracks()[0].id.clone();

        assert!(tracker.mark_recognized(&track_id, "s1", "Alice", 82.0));
        assert!(tracker.tracks()[0].recognized);
        assert_eq!(tracker.tracks()[0].id, "s1");
        assert_eq!(tracker.tracks()[0].name, "Alice");

        // A second verdict does not rebind or reset
        assert!(!tracker.mark_recognized("s1", "s2", "Bob", 90.0));
        assert_eq!(tracker.tracks()[0].id, "s1");
        assert_eq!(tracker.tracks()[0].name, "Alice");
        assert!(tracker.tracks()[0].recognized);
    }

    #[test]
    fn test_recognized_state_survives_motion() {
        let mut tracker = FaceTracker::new(0.5);
        tracker.update(&[detection(100.0, 100.0, 80.0)]);
        let track_id = tracker.tracks()[0].id.clone();
        tracker.mark_recognized(&track_id, "s1", "Alice", 82.0);

        let tracks = tracker.update(&[detection(110.0, 105.0, 80.0)]);
        assert_eq!(tracks[0].id, "s1");
        assert!(tracks[0].recognized);
        assert_eq!(tracker.unrecognized().count(), 0);
    }
}
