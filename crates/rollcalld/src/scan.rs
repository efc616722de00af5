//! The live attendance scan session.
//!
//! A state machine (`Idle → Scanning → Completing → Persisted`, with
//! `Failed` for error escalation) plus the frame loop that drives it:
//! detection on a subsample of ticks, recognition on a coarser subsample of
//! detection passes, recognized students aggregated into one set from which
//! the present count is always derived.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rollcall_core::{
    accuracy_percent, find_best_match, reconcile, AttendanceOutcome, DetectedFace, FaceTracker,
    GalleryEntry, ManualMark, RosterStudent, TrackedFace,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::engine::{EngineError, EngineHandle};
use crate::store::{AttendanceStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    Idle,
    Scanning,
    /// Loop stopped, camera released, outcome persistence pending or being
    /// retried. Terminal-success is `Persisted`.
    Completing,
    Persisted,
    Failed,
}

impl ScanState {
    fn allows(self, next: ScanState) -> bool {
        matches!(
            (self, next),
            (ScanState::Idle, ScanState::Scanning)
                | (ScanState::Scanning, ScanState::Completing)
                | (ScanState::Scanning, ScanState::Failed)
                | (ScanState::Scanning, ScanState::Idle)
                | (ScanState::Completing, ScanState::Persisted)
                | (ScanState::Completing, ScanState::Idle)
        )
    }
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("illegal scan transition: {from:?} -> {to:?}")]
    IllegalTransition { from: ScanState, to: ScanState },
    #[error("student {0} is not enrolled in this class")]
    UnknownStudent(String),
    #[error("cannot complete: no students marked present")]
    NothingToRecord,
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Loop tunables, copied out of [`crate::config::Config`] at session start.
#[derive(Debug, Clone)]
pub struct ScanTuning {
    pub frame_interval: Duration,
    pub detect_every: u64,
    pub recognize_every: u64,
    pub match_threshold: f32,
    pub max_consecutive_errors: u32,
    pub banner_duration: Duration,
}

impl From<&crate::config::Config> for ScanTuning {
    fn from(cfg: &crate::config::Config) -> Self {
        Self {
            frame_interval: cfg.frame_interval,
            detect_every: cfg.detect_every,
            recognize_every: cfg.recognize_every,
            match_threshold: cfg.match_threshold,
            max_consecutive_errors: cfg.max_consecutive_errors,
            banner_duration: cfg.banner_duration,
        }
    }
}

/// Transient "newly recognized" indicator; auto-clears after its deadline.
#[derive(Debug, Clone)]
struct Banner {
    name: String,
    expires: Instant,
}

/// UI-facing snapshot of one session, serialized over D-Bus.
#[derive(Debug, Serialize)]
pub struct ScanStatus {
    pub state: ScanState,
    pub class_id: String,
    pub present_count: usize,
    pub enrolled_count: usize,
    pub faces: Vec<FaceStatus>,
    pub banner: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FaceStatus {
    pub id: String,
    pub name: String,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub recognized: bool,
    pub accuracy: f32,
}

/// All mutable state of one scan session. Shared between the frame loop and
/// the D-Bus handlers behind one mutex; every loop iteration re-reads it at
/// the top rather than caching across iterations.
pub struct ScanSession {
    pub class_id: String,
    pub date: String,
    state: ScanState,
    roster: Vec<RosterStudent>,
    gallery: Vec<GalleryEntry>,
    tracker: FaceTracker,
    /// Single source of truth for the live present count: automatically
    /// recognized students plus manual "present" marks.
    recognized: HashSet<String>,
    manual: HashMap<String, ManualMark>,
    consecutive_errors: u32,
    ticks: u64,
    detect_passes: u64,
    banner: Option<Banner>,
    cancelled: Arc<AtomicBool>,
}

impl ScanSession {
    pub fn new(
        class_id: String,
        date: String,
        roster: Vec<RosterStudent>,
        gallery: Vec<GalleryEntry>,
        association_radius_factor: f32,
    ) -> Self {
        Self {
            class_id,
            date,
            state: ScanState::Idle,
            roster,
            gallery,
            tracker: FaceTracker::new(association_radius_factor),
            recognized: HashSet::new(),
            manual: HashMap::new(),
            consecutive_errors: 0,
            ticks: 0,
            detect_passes: 0,
            banner: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn transition(&mut self, to: ScanState) -> Result<(), ScanError> {
        if !self.state.allows(to) {
            return Err(ScanError::IllegalTransition { from: self.state, to });
        }
        tracing::info!(class_id = %self.class_id, from = ?self.state, to = ?to, "scan transition");
        self.state = to;
        Ok(())
    }

    pub fn begin(&mut self) -> Result<(), ScanError> {
        self.transition(ScanState::Scanning)
    }

    /// Present count is always the cardinality of the recognized set, never
    /// an independently incremented counter.
    pub fn present_count(&self) -> usize {
        self.recognized.len()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Teacher override. "Present" joins the recognized set, anything else
    /// leaves it; the mark itself is kept separately so completion-time
    /// precedence still sees an explicit "absent" defeat a recognition.
    pub fn mark(&mut self, student_id: &str, mark: ManualMark) -> Result<(), ScanError> {
        if !matches!(self.state, ScanState::Scanning | ScanState::Completing) {
            return Err(ScanError::IllegalTransition {
                from: self.state,
                to: self.state,
            });
        }
        if !self.roster.iter().any(|s| s.id == student_id) {
            return Err(ScanError::UnknownStudent(student_id.to_string()));
        }

        self.manual.insert(student_id.to_string(), mark);
        match mark {
            ManualMark::Present => {
                self.recognized.insert(student_id.to_string());
            }
            ManualMark::Absent | ManualMark::Unset => {
                self.recognized.remove(student_id);
            }
        }
        tracing::debug!(student_id, ?mark, present = self.present_count(), "manual mark");
        Ok(())
    }

    /// Whether the next loop tick should run detection. Also advances the
    /// tick counter.
    fn take_detection_tick(&mut self, detect_every: u64) -> bool {
        let run = self.ticks % detect_every.max(1) == 0;
        self.ticks += 1;
        run
    }

    /// Fold one detection pass into the session. Returns `true` when the
    /// consecutive-error bound has been exceeded and the session is now
    /// `Failed`.
    pub fn process_detection(
        &mut self,
        result: Result<Vec<DetectedFace>, EngineError>,
        tuning: &ScanTuning,
    ) -> bool {
        match result {
            Err(err) => {
                self.consecutive_errors += 1;
                tracing::warn!(
                    error = %err,
                    consecutive = self.consecutive_errors,
                    "detection pass failed; continuing"
                );
                if self.consecutive_errors >= tuning.max_consecutive_errors {
                    tracing::error!(
                        bound = tuning.max_consecutive_errors,
                        "too many consecutive failures; scan failed"
                    );
                    // Bypasses allows(): error escalation is not a caller
                    // request.
                    self.state = ScanState::Failed;
                    return true;
                }
            }
            Ok(faces) => {
                self.consecutive_errors = 0;
                self.detect_passes += 1;
                self.tracker.update(&faces);
                if self.detect_passes % tuning.recognize_every.max(1) == 0 {
                    self.run_recognition(tuning);
                }
            }
        }
        false
    }

    /// Match every not-yet-recognized track against the gallery. Tracks
    /// already recognized are not re-submitted.
    fn run_recognition(&mut self, tuning: &ScanTuning) {
        let probes: Vec<(String, rollcall_core::FaceDescriptor)> = self
            .tracker
            .unrecognized()
            .map(|t| (t.id.clone(), t.descriptor.clone()))
            .collect();

        for (track_id, descriptor) in probes {
            if descriptor.is_blank() {
                continue;
            }
            let Some(hit) = find_best_match(&descriptor, &self.gallery, tuning.match_threshold)
            else {
                continue;
            };

            let accuracy = accuracy_percent(hit.distance);
            self.tracker
                .mark_recognized(&track_id, &hit.student_id, &hit.name, accuracy);

            // One loop iteration: set insert, derived count, and banner
            // move together.
            if self.recognized.insert(hit.student_id.clone()) {
                tracing::info!(
                    student_id = %hit.student_id,
                    name = %hit.name,
                    distance = hit.distance,
                    present = self.present_count(),
                    "student recognized"
                );
                self.banner = Some(Banner {
                    name: hit.name.clone(),
                    expires: Instant::now() + tuning.banner_duration,
                });
            }
        }
    }

    fn expire_banner(&mut self) {
        if let Some(banner) = &self.banner {
            if Instant::now() >= banner.expires {
                self.banner = None;
            }
        }
    }

    /// Final present/absent partition under manual-overrides-win precedence.
    pub fn outcomes(&self) -> Vec<AttendanceOutcome> {
        reconcile(&self.roster, &self.recognized, &self.manual)
    }

    /// Discard all per-scan state: tracks, history, aggregation.
    fn discard(&mut self) {
        self.tracker.clear();
        self.recognized.clear();
        self.manual.clear();
        self.banner = None;
    }

    pub fn status(&self) -> ScanStatus {
        ScanStatus {
            state: self.state,
            class_id: self.class_id.clone(),
            present_count: self.present_count(),
            enrolled_count: self.roster.len(),
            faces: self.tracker.tracks().iter().map(face_status).collect(),
            banner: self.banner.as_ref().map(|b| b.name.clone()),
        }
    }
}

fn face_status(track: &TrackedFace) -> FaceStatus {
    FaceStatus {
        id: track.id.clone(),
        name: track.name.clone(),
        x: track.rect.x,
        y: track.rect.y,
        width: track.rect.width,
        height: track.rect.height,
        recognized: track.recognized,
        accuracy: track.accuracy,
    }
}

/// A running scan: shared session state, the engine owning the camera, and
/// the frame-loop task.
pub struct ScanHandle {
    pub session: Arc<Mutex<ScanSession>>,
    engine: EngineHandle,
    loop_task: JoinHandle<()>,
}

impl ScanHandle {
    /// Start the frame loop for an already-begun session.
    pub fn start(session: ScanSession, engine: EngineHandle, tuning: ScanTuning) -> Self {
        let session = Arc::new(Mutex::new(session));
        let loop_task = spawn_scan_loop(Arc::clone(&session), engine.clone(), tuning);
        Self {
            session,
            engine,
            loop_task,
        }
    }

    /// Finish the scan: stop the loop, release the camera, persist the
    /// outcome set. Retryable — a store failure leaves the session in
    /// `Completing` and a repeat call replaces rather than appends.
    pub async fn complete(&self, store: &AttendanceStore) -> Result<ScanStatus, ScanError> {
        {
            let mut session = self.session.lock().await;
            match session.state() {
                ScanState::Scanning => {
                    if session.present_count() == 0 {
                        return Err(ScanError::NothingToRecord);
                    }
                    session.transition(ScanState::Completing)?;
                }
                // Retry after a failed persist
                ScanState::Completing => {}
                other => {
                    return Err(ScanError::IllegalTransition {
                        from: other,
                        to: ScanState::Completing,
                    })
                }
            }
        }

        // Loop exits on the state change; release the camera regardless.
        self.engine.shutdown().await;

        let (class_id, date, outcomes) = {
            let session = self.session.lock().await;
            (
                session.class_id.clone(),
                session.date.clone(),
                session.outcomes(),
            )
        };

        if let Err(err) = store.replace_attendance(&class_id, &date, &outcomes).await {
            tracing::warn!(error = %err, "attendance persist failed; completion can be retried");
            return Err(ScanError::Store(err));
        }

        let mut session = self.session.lock().await;
        session.transition(ScanState::Persisted)?;
        Ok(session.status())
    }

    /// Abandon the scan: stop the loop, release the camera, discard all
    /// tracked state. In-flight engine results become no-ops.
    pub async fn cancel(&self) {
        {
            let mut session = self.session.lock().await;
            session.cancel_flag().store(true, Ordering::SeqCst);
            let _ = session.transition(ScanState::Idle);
            session.discard();
        }
        self.engine.shutdown().await;
        self.loop_task.abort();
    }
}

/// The frame loop. Iterations are strictly sequential: the next engine call
/// starts only after the previous one resolved (or timed out and was
/// abandoned).
fn spawn_scan_loop(
    session: Arc<Mutex<ScanSession>>,
    engine: EngineHandle,
    tuning: ScanTuning,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tuning.frame_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            // Latest state at the top of every iteration
            let run_detection = {
                let mut s = session.lock().await;
                s.expire_banner();
                if s.is_cancelled() || s.state() != ScanState::Scanning {
                    break;
                }
                s.take_detection_tick(tuning.detect_every)
            };
            if !run_detection {
                continue;
            }

            // Suspension point: no lock held while the engine works.
            let result = engine.detect().await;

            let mut s = session.lock().await;
            if s.is_cancelled() || s.state() != ScanState::Scanning {
                // Stale result after cancellation/completion: no-op.
                break;
            }
            if s.process_detection(result, &tuning) {
                drop(s);
                engine.shutdown().await;
                break;
            }
        }
        tracing::debug!("scan loop exited");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{FaceDescriptor, Landmarks, Point, Rect};

    fn tuning() -> ScanTuning {
        ScanTuning {
            frame_interval: Duration::from_millis(100),
            detect_every: 1,
            recognize_every: 1,
            match_threshold: 0.4,
            max_consecutive_errors: 5,
            banner_duration: Duration::from_secs(2),
        }
    }

    fn session_with_alice() -> ScanSession {
        let descriptor = FaceDescriptor::new(vec![0.1; 128]);
        let mut s = ScanSession::new(
            "c1".into(),
            "2026-03-02".into(),
            vec![
                RosterStudent { id: "s1".into(), name: "Alice".into() },
                RosterStudent { id: "s2".into(), name: "Bob".into() },
            ],
            vec![GalleryEntry {
                student_id: "s1".into(),
                name: "Alice".into(),
                descriptor,
            }],
            0.5,
        );
        s.begin().unwrap();
        s
    }

    fn face_near_alice() -> DetectedFace {
        // distance to Alice's reference: sqrt(128 * 0.0004) ≈ 0.226 < 0.4
        let mut values = vec![0.1; 128];
        for v in values.iter_mut() {
            *v += 0.02;
        }
        DetectedFace {
            rect: Rect { x: 100.0, y: 100.0, width: 80.0, height: 80.0 },
            confidence: 0.9,
            descriptor: FaceDescriptor::new(values),
            landmarks: Some(Landmarks {
                left_eye: Point { x: 120.0, y: 130.0 },
                right_eye: Point { x: 160.0, y: 130.0 },
                nose: Point { x: 140.0, y: 140.0 },
            }),
        }
    }

    #[test]
    fn test_transitions_validated() {
        let mut s = session_with_alice();
        // Scanning -> Persisted is not legal
        assert!(matches!(
            s.transition(ScanState::Persisted),
            Err(ScanError::IllegalTransition { .. })
        ));
        s.transition(ScanState::Completing).unwrap();
        s.transition(ScanState::Persisted).unwrap();
    }

    #[test]
    fn test_recognition_increments_once() {
        let mut s = session_with_alice();
        let t = tuning();

        // Frames 1-3 all show the same face near Alice's reference
        for _ in 0..3 {
            let fatal = s.process_detection(Ok(vec![face_near_alice()]), &t);
            assert!(!fatal);
        }

        assert_eq!(s.present_count(), 1);
        assert!(s.recognized.contains("s1"));
        // The track is bound to the student and not re-submitted
        assert_eq!(s.tracker.unrecognized().count(), 0);
    }

    #[test]
    fn test_recognition_cadence_coarser_than_detection() {
        let mut s = session_with_alice();
        let mut t = tuning();
        t.recognize_every = 4;

        // First three detection passes: tracked but not yet matched
        for _ in 0..3 {
            s.process_detection(Ok(vec![face_near_alice()]), &t);
            assert_eq!(s.present_count(), 0);
        }
        // Fourth pass triggers recognition
        s.process_detection(Ok(vec![face_near_alice()]), &t);
        assert_eq!(s.present_count(), 1);
    }

    #[test]
    fn test_unknown_face_stays_unrecognized() {
        let mut s = session_with_alice();
        let mut face = face_near_alice();
        face.descriptor = FaceDescriptor::new(vec![0.9; 128]);

        s.process_detection(Ok(vec![face]), &tuning());
        assert_eq!(s.present_count(), 0);
        assert_eq!(s.tracker.unrecognized().count(), 1);
    }

    #[test]
    fn test_manual_present_and_revert() {
        let mut s = session_with_alice();
        s.mark("s2", ManualMark::Present).unwrap();
        assert_eq!(s.present_count(), 1);

        // No double count if also recognized later
        s.mark("s2", ManualMark::Present).unwrap();
        assert_eq!(s.present_count(), 1);

        s.mark("s2", ManualMark::Unset).unwrap();
        assert_eq!(s.present_count(), 0);
    }

    #[test]
    fn test_manual_absent_removes_from_count_keeps_label() {
        let mut s = session_with_alice();
        s.process_detection(Ok(vec![face_near_alice()]), &tuning());
        assert_eq!(s.present_count(), 1);

        s.mark("s1", ManualMark::Absent).unwrap();
        assert_eq!(s.present_count(), 0);
        // The live track label is untouched
        assert!(s.tracker.tracks()[0].recognized);
        assert_eq!(s.tracker.tracks()[0].name, "Alice");
    }

    #[test]
    fn test_mark_unknown_student_rejected() {
        let mut s = session_with_alice();
        assert!(matches!(
            s.mark("nobody", ManualMark::Present),
            Err(ScanError::UnknownStudent(_))
        ));
    }

    #[test]
    fn test_outcome_precedence() {
        let mut s = session_with_alice();
        s.process_detection(Ok(vec![face_near_alice()]), &tuning()); // Alice recognized
        s.mark("s1", ManualMark::Absent).unwrap(); // then manually absent

        let outcomes = s.outcomes();
        let alice = outcomes.iter().find(|o| o.student_id == "s1").unwrap();
        let bob = outcomes.iter().find(|o| o.student_id == "s2").unwrap();
        assert_eq!(alice.status, rollcall_core::AttendanceStatus::Absent);
        assert_eq!(bob.status, rollcall_core::AttendanceStatus::Absent);
    }

    #[test]
    fn test_error_escalation_to_failed() {
        let mut s = session_with_alice();
        let t = tuning();

        for i in 1..5 {
            let fatal = s.process_detection(Err(EngineError::Timeout), &t);
            assert!(!fatal, "not yet fatal at {i} errors");
        }
        let fatal = s.process_detection(Err(EngineError::Timeout), &t);
        assert!(fatal);
        assert_eq!(s.state(), ScanState::Failed);
    }

    #[test]
    fn test_single_success_resets_error_count() {
        let mut s = session_with_alice();
        let t = tuning();

        for _ in 0..4 {
            s.process_detection(Err(EngineError::Timeout), &t);
        }
        s.process_detection(Ok(vec![]), &t);
        for _ in 0..4 {
            assert!(!s.process_detection(Err(EngineError::Timeout), &t));
        }
        assert_eq!(s.state(), ScanState::Scanning);
    }

    #[test]
    fn test_detection_tick_cadence() {
        let mut s = session_with_alice();
        let picked: Vec<bool> = (0..6).map(|_| s.take_detection_tick(3)).collect();
        assert_eq!(picked, vec![true, false, false, true, false, false]);
    }

    #[test]
    fn test_cannot_complete_with_zero_present() {
        let s = session_with_alice();
        assert_eq!(s.present_count(), 0);
        // ScanHandle::complete guards on this; the session-level check is
        // the present count itself.
    }
}
