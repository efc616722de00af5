//! Enrollment capture flow.
//!
//! A strictly linear step machine: Info → Position → Capture → Angles →
//! Review → Complete, plus an explicit reset back to Info. Position runs a
//! slow-cadence watcher that auto-advances once the face has been seen on
//! enough consecutive checks; Capture and Angles each take one snapshot,
//! with the Angles snapshot overwriting the first. Nothing touches the
//! database until the teacher confirms at Review.

use std::sync::Arc;
use std::time::Duration;

use rollcall_core::{encode, CodecError, FaceDescriptor};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::engine::{EngineError, EngineHandle};
use crate::store::{AttendanceStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollStep {
    Info,
    Position,
    Capture,
    Angles,
    Review,
    Complete,
}

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("advance not valid at step {0:?}")]
    IllegalStep(EnrollStep),
    #[error("face not yet held steady; keep the student in frame")]
    NotSteady,
    #[error("no face detected; adjust position and retry")]
    NoFaceDetected,
    #[error("no captured descriptor to enroll")]
    MissingCapture,
    #[error("a persist is already in flight")]
    PersistInFlight,
    /// The student row was written but the class link was not. A blind
    /// retry of the whole confirm would duplicate the student.
    #[error("student {student_id} was created but not linked to the class")]
    CreatedButNotEnrolled { student_id: String },
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct EnrollTuning {
    pub position_interval: Duration,
    pub position_stable_count: u32,
}

impl From<&crate::config::Config> for EnrollTuning {
    fn from(cfg: &crate::config::Config) -> Self {
        Self {
            position_interval: cfg.position_interval,
            position_stable_count: cfg.position_stable_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EnrollStatus {
    pub step: EnrollStep,
    pub class_id: String,
    pub student_name: String,
    pub stable_detections: u32,
    pub has_capture: bool,
    pub persist_issued: bool,
}

pub struct EnrollSession {
    pub class_id: String,
    student_name: String,
    step: EnrollStep,
    stable_detections: u32,
    descriptor: Option<FaceDescriptor>,
    persist_issued: bool,
    /// Set when a student row exists but the enrollment link failed.
    orphaned_student: Option<String>,
}

impl EnrollSession {
    pub fn new(class_id: String, student_name: String) -> Self {
        Self {
            class_id,
            student_name,
            step: EnrollStep::Info,
            stable_detections: 0,
            descriptor: None,
            persist_issued: false,
            orphaned_student: None,
        }
    }

    pub fn step(&self) -> EnrollStep {
        self.step
    }

    fn enter(&mut self, step: EnrollStep) {
        tracing::info!(name = %self.student_name, from = ?self.step, to = ?step, "enroll step");
        self.step = step;
    }

    /// Fold one position-watch check into the stability counter. Returns
    /// `true` when the counter reached the bound and the session advanced
    /// to Capture.
    pub fn note_position_check(&mut self, face_seen: bool, needed: u32) -> bool {
        if self.step != EnrollStep::Position {
            return false;
        }
        if face_seen {
            self.stable_detections += 1;
            if self.stable_detections >= needed.max(1) {
                self.enter(EnrollStep::Capture);
                return true;
            }
        } else {
            // Any miss restarts the streak
            self.stable_detections = 0;
        }
        false
    }

    /// Record a snapshot descriptor for the current step. The Angles
    /// snapshot replaces the Capture one (last write wins).
    pub fn apply_snapshot(&mut self, descriptor: FaceDescriptor) -> Result<(), EnrollError> {
        match self.step {
            EnrollStep::Capture => {
                self.descriptor = Some(descriptor);
                self.enter(EnrollStep::Angles);
                Ok(())
            }
            EnrollStep::Angles => {
                self.descriptor = Some(descriptor);
                self.enter(EnrollStep::Review);
                Ok(())
            }
            other => Err(EnrollError::IllegalStep(other)),
        }
    }

    /// Claim the persist slot and produce what the store needs. The slot
    /// stays claimed until [`finish_persist`](Self::finish_persist) reports
    /// the outcome.
    pub fn begin_persist(&mut self) -> Result<(String, String), EnrollError> {
        if self.step != EnrollStep::Review {
            return Err(EnrollError::IllegalStep(self.step));
        }
        if self.persist_issued {
            return Err(EnrollError::PersistInFlight);
        }
        if let Some(student_id) = &self.orphaned_student {
            // Do not create a second student row for the same person
            return Err(EnrollError::CreatedButNotEnrolled {
                student_id: student_id.clone(),
            });
        }
        let descriptor = self
            .descriptor
            .as_ref()
            .ok_or(EnrollError::MissingCapture)?;
        let encoded = encode(descriptor)?;
        self.persist_issued = true;
        Ok((self.student_name.clone(), encoded))
    }

    pub fn finish_persist(&mut self, outcome: PersistOutcome) {
        match outcome {
            PersistOutcome::Done => self.enter(EnrollStep::Complete),
            PersistOutcome::StudentCreationFailed => {
                // Nothing written; a later confirm may retry
                self.persist_issued = false;
            }
            PersistOutcome::LinkFailed { student_id } => {
                tracing::warn!(%student_id, "student created without enrollment link");
                // The persist has resolved, unsuccessfully; the next
                // attempt must see the orphaned student, not a busy slot.
                self.persist_issued = false;
                self.orphaned_student = Some(student_id);
            }
        }
    }

    /// Back to Info with all capture state discarded. "Enroll another"
    /// after Complete goes through here too.
    pub fn reset(&mut self) {
        if let Some(student_id) = &self.orphaned_student {
            tracing::warn!(%student_id, "resetting enrollment that left an unlinked student");
        }
        self.stable_detections = 0;
        self.descriptor = None;
        self.persist_issued = false;
        self.orphaned_student = None;
        self.enter(EnrollStep::Info);
    }

    pub fn status(&self) -> EnrollStatus {
        EnrollStatus {
            step: self.step,
            class_id: self.class_id.clone(),
            student_name: self.student_name.clone(),
            stable_detections: self.stable_detections,
            has_capture: self.descriptor.is_some(),
            persist_issued: self.persist_issued,
        }
    }
}

#[derive(Debug)]
pub enum PersistOutcome {
    Done,
    StudentCreationFailed,
    LinkFailed { student_id: String },
}

/// A running enrollment: shared session plus the engine that owns the
/// camera for snapshots.
pub struct EnrollHandle {
    pub session: Arc<Mutex<EnrollSession>>,
    engine: EngineHandle,
    tuning: EnrollTuning,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl EnrollHandle {
    pub fn new(session: EnrollSession, engine: EngineHandle, tuning: EnrollTuning) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            engine,
            tuning,
            watch_task: Mutex::new(None),
        }
    }

    /// Drive the flow one step forward. Info starts the position watcher;
    /// Capture and Angles take a snapshot; Position refuses until the
    /// watcher has auto-advanced.
    pub async fn advance(&self, store: &AttendanceStore) -> Result<EnrollStatus, EnrollError> {
        let step = self.session.lock().await.step();
        match step {
            EnrollStep::Info => {
                self.session.lock().await.enter(EnrollStep::Position);
                let task = spawn_position_watch(
                    Arc::clone(&self.session),
                    self.engine.clone(),
                    self.tuning.clone(),
                );
                *self.watch_task.lock().await = Some(task);
            }
            EnrollStep::Position => return Err(EnrollError::NotSteady),
            EnrollStep::Capture | EnrollStep::Angles => {
                let face = self.engine.snapshot().await?;
                let mut session = self.session.lock().await;
                match face {
                    Some(face) => session.apply_snapshot(face.descriptor)?,
                    // Soft failure: stay on the step, caller retries
                    None => return Err(EnrollError::NoFaceDetected),
                }
            }
            EnrollStep::Review => {
                confirm(&self.session, store).await?;
            }
            EnrollStep::Complete => return Err(EnrollError::IllegalStep(step)),
        }
        Ok(self.session.lock().await.status())
    }

    pub async fn confirm(&self, store: &AttendanceStore) -> Result<String, EnrollError> {
        confirm(&self.session, store).await
    }

    pub async fn reset(&self) {
        if let Some(task) = self.watch_task.lock().await.take() {
            task.abort();
        }
        self.session.lock().await.reset();
    }

    /// Tear the flow down and release the camera.
    pub async fn cancel(&self) {
        if let Some(task) = self.watch_task.lock().await.take() {
            task.abort();
        }
        self.engine.shutdown().await;
    }

    pub async fn status(&self) -> EnrollStatus {
        self.session.lock().await.status()
    }
}

/// Persist the reviewed capture: student row first, then the class link.
/// A link failure is reported distinctly so the caller never blind-retries
/// into a duplicate student.
pub async fn confirm(
    session: &Arc<Mutex<EnrollSession>>,
    store: &AttendanceStore,
) -> Result<String, EnrollError> {
    let (name, encoded, class_id) = {
        let mut s = session.lock().await;
        let (name, encoded) = s.begin_persist()?;
        (name, encoded, s.class_id.clone())
    };

    let student_id = match store.create_student(&name, Some(encoded)).await {
        Ok(id) => id,
        Err(err) => {
            session
                .lock()
                .await
                .finish_persist(PersistOutcome::StudentCreationFailed);
            return Err(EnrollError::Store(err));
        }
    };

    if let Err(err) = store.create_enrollment(&class_id, &student_id).await {
        tracing::error!(error = %err, %student_id, "enrollment link failed after student creation");
        session
            .lock()
            .await
            .finish_persist(PersistOutcome::LinkFailed {
                student_id: student_id.clone(),
            });
        return Err(EnrollError::CreatedButNotEnrolled { student_id });
    }

    session.lock().await.finish_persist(PersistOutcome::Done);
    tracing::info!(%student_id, name = %name, "student enrolled");
    Ok(student_id)
}

fn spawn_position_watch(
    session: Arc<Mutex<EnrollSession>>,
    engine: EngineHandle,
    tuning: EnrollTuning,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tuning.position_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if session.lock().await.step() != EnrollStep::Position {
                break;
            }

            let face_seen = matches!(engine.snapshot().await, Ok(Some(_)));

            let mut s = session.lock().await;
            if s.step() != EnrollStep::Position {
                break;
            }
            if s.note_position_check(face_seen, tuning.position_stable_count) {
                break;
            }
        }
        tracing::debug!("position watch exited");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> EnrollSession {
        EnrollSession::new("c1".into(), "Alice".into())
    }

    fn descriptor(fill: f32) -> FaceDescriptor {
        FaceDescriptor::new(vec![fill; 128])
    }

    #[test]
    fn test_linear_flow() {
        let mut s = session();
        assert_eq!(s.step(), EnrollStep::Info);

        s.enter(EnrollStep::Position);
        assert!(!s.note_position_check(true, 3));
        assert!(!s.note_position_check(true, 3));
        assert!(s.note_position_check(true, 3));
        assert_eq!(s.step(), EnrollStep::Capture);

        s.apply_snapshot(descriptor(0.1)).unwrap();
        assert_eq!(s.step(), EnrollStep::Angles);
        s.apply_snapshot(descriptor(0.2)).unwrap();
        assert_eq!(s.step(), EnrollStep::Review);
    }

    #[test]
    fn test_position_miss_resets_streak() {
        let mut s = session();
        s.enter(EnrollStep::Position);
        s.note_position_check(true, 3);
        s.note_position_check(true, 3);
        s.note_position_check(false, 3);
        // Streak restarted, two more hits are not enough
        assert!(!s.note_position_check(true, 3));
        assert!(!s.note_position_check(true, 3));
        assert!(s.note_position_check(true, 3));
    }

    #[test]
    fn test_angles_snapshot_overwrites() {
        let mut s = session();
        s.enter(EnrollStep::Capture);
        s.apply_snapshot(descriptor(0.1)).unwrap();
        s.apply_snapshot(descriptor(0.2)).unwrap();
        assert_eq!(s.descriptor.as_ref().unwrap().values()[0], 0.2);
    }

    #[test]
    fn test_snapshot_outside_capture_steps_rejected() {
        let mut s = session();
        assert!(matches!(
            s.apply_snapshot(descriptor(0.1)),
            Err(EnrollError::IllegalStep(EnrollStep::Info))
        ));
    }

    #[test]
    fn test_begin_persist_requires_review_and_capture() {
        let mut s = session();
        assert!(matches!(
            s.begin_persist(),
            Err(EnrollError::IllegalStep(EnrollStep::Info))
        ));

        s.enter(EnrollStep::Review);
        assert!(matches!(s.begin_persist(), Err(EnrollError::MissingCapture)));

        s.descriptor = Some(descriptor(0.1));
        let (name, encoded) = s.begin_persist().unwrap();
        assert_eq!(name, "Alice");
        assert_eq!(encoded.len(), 684);
    }

    #[test]
    fn test_persist_slot_single_issue() {
        let mut s = session();
        s.enter(EnrollStep::Review);
        s.descriptor = Some(descriptor(0.1));
        s.begin_persist().unwrap();
        assert!(matches!(s.begin_persist(), Err(EnrollError::PersistInFlight)));

        // A clean failure frees the slot
        s.finish_persist(PersistOutcome::StudentCreationFailed);
        assert!(s.begin_persist().is_ok());
    }

    #[test]
    fn test_link_failure_blocks_blind_retry() {
        let mut s = session();
        s.enter(EnrollStep::Review);
        s.descriptor = Some(descriptor(0.1));
        s.begin_persist().unwrap();
        s.finish_persist(PersistOutcome::LinkFailed {
            student_id: "s9".into(),
        });
        // The slot is free again; the retry must surface the orphaned
        // student, never the in-flight error.
        assert!(!s.persist_issued);
        for _ in 0..2 {
            assert!(matches!(
                s.begin_persist(),
                Err(EnrollError::CreatedButNotEnrolled { ref student_id }) if student_id == "s9"
            ));
        }
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut s = session();
        s.enter(EnrollStep::Position);
        s.note_position_check(true, 3);
        s.enter(EnrollStep::Review);
        s.descriptor = Some(descriptor(0.1));
        s.reset();
        assert_eq!(s.step(), EnrollStep::Info);
        assert_eq!(s.stable_detections, 0);
        assert!(s.descriptor.is_none());
    }

    #[tokio::test]
    async fn test_confirm_persists_student_and_link() {
        let store = AttendanceStore::open(std::path::Path::new(":memory:"))
            .await
            .unwrap();
        let class_id = store.create_class("Math").await.unwrap();

        let mut s = EnrollSession::new(class_id.clone(), "Alice".into());
        s.enter(EnrollStep::Review);
        s.descriptor = Some(descriptor(0.1));
        let session = Arc::new(Mutex::new(s));

        let student_id = confirm(&session, &store).await.unwrap();
        assert_eq!(session.lock().await.step(), EnrollStep::Complete);

        let roster = store.roster_for_class(&class_id).await.unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].student_id, student_id);
        assert!(roster[0].descriptor.is_some());
    }
}
