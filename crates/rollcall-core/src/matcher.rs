//! Nearest-neighbor matching of a probe descriptor against the class gallery.

use serde::{Deserialize, Serialize};

use crate::descriptor::{distance, FaceDescriptor};

/// One enrolled student's reference, derived at scan start from the stored
/// roster. Read-only for the session.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub student_id: String,
    pub name: String,
    pub descriptor: FaceDescriptor,
}

/// An accepted match: the nearest gallery entry, within threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchHit {
    pub student_id: String,
    pub name: String,
    pub distance: f32,
}

/// Linear scan for the nearest gallery entry by Euclidean distance.
///
/// The bound is inclusive: a distance exactly equal to `threshold` is
/// accepted. Ties keep the first entry in gallery order (the scan uses a
/// strict `<` comparison); exact ties do not occur in practice, but the
/// behavior is deliberate rather than undefined. An empty gallery yields
/// `None` — "Unknown", not an error. Entries whose dimension differs from
/// the probe are skipped with a warning.
pub fn find_best_match(
    probe: &FaceDescriptor,
    gallery: &[GalleryEntry],
    threshold: f32,
) -> Option<MatchHit> {
    let mut best: Option<(usize, f32)> = None;

    for (i, entry) in gallery.iter().enumerate() {
        let d = match distance(probe, &entry.descriptor) {
            Ok(d) => d,
            Err(err) => {
                tracing::warn!(
                    student_id = %entry.student_id,
                    error = %err,
                    "skipping gallery entry with incompatible descriptor"
                );
                continue;
            }
        };
        if best.map_or(true, |(_, bd)| d < bd) {
            best = Some((i, d));
        }
    }

    match best {
        Some((i, d)) if d <= threshold => Some(MatchHit {
            student_id: gallery[i].student_id.clone(),
            name: gallery[i].name.clone(),
            distance: d,
        }),
        _ => None,
    }
}

/// Map a match distance to the percentage shown next to a recognized name.
/// Purely cosmetic; clamped to [0, 100].
pub fn accuracy_percent(distance: f32) -> f32 {
    ((1.0 - distance) * 100.0).clamp(0.0, 100.0)
}
