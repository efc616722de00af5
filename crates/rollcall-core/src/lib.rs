//! rollcall-core — Attendance-scan building blocks.
//!
//! Pure algorithms, no I/O: the face descriptor codec, nearest-neighbor
//! gallery matching, cross-frame face tracking with box smoothing, and
//! present/absent roster reconciliation.

pub mod descriptor;
pub mod matcher;
pub mod roster;
pub mod tracker;
pub mod types;

pub use descriptor::{decode, distance, encode, CodecError, FaceDescriptor, DESCRIPTOR_LEN};
pub use matcher::{accuracy_percent, find_best_match, GalleryEntry, MatchHit};
pub use roster::{reconcile, AttendanceOutcome, AttendanceStatus, ManualMark, RosterStudent};
pub use tracker::{FaceTracker, TrackedFace};
pub use types::{DetectedFace, Landmarks, Point, Rect};
