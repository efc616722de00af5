use std::sync::Arc;

use tokio::sync::Mutex;
use zbus::interface;

use rollcall_core::ManualMark;
use rollcall_vision::SharedModel;

use crate::config::Config;
use crate::engine::spawn_session_engine;
use crate::enroll::{EnrollHandle, EnrollSession, EnrollTuning};
use crate::scan::{ScanHandle, ScanSession, ScanState, ScanTuning};
use crate::store::{build_gallery, AttendanceStore};

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub store: AttendanceStore,
    pub model: SharedModel,
    pub scan: Option<Arc<ScanHandle>>,
    pub enroll: Option<Arc<EnrollHandle>>,
}

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.classroom.Rollcall1
/// Object path: /org/classroom/Rollcall1
pub struct RollcallService {
    pub state: Arc<Mutex<AppState>>,
}

fn failed(err: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(err.to_string())
}

fn json_reply(value: &impl serde::Serialize) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

fn parse_mark(mark: &str) -> zbus::fdo::Result<ManualMark> {
    match mark {
        "present" => Ok(ManualMark::Present),
        "absent" => Ok(ManualMark::Absent),
        "unset" => Ok(ManualMark::Unset),
        other => Err(zbus::fdo::Error::InvalidArgs(format!(
            "unknown mark '{other}' (expected present|absent|unset)"
        ))),
    }
}

impl RollcallService {
    /// Whether either controller currently owns the camera.
    async fn camera_in_use(state: &AppState) -> bool {
        if let Some(scan) = &state.scan {
            let session = scan.session.lock().await;
            if matches!(
                session.state(),
                ScanState::Scanning | ScanState::Completing
            ) {
                return true;
            }
        }
        state.enroll.is_some()
    }
}

#[interface(name = "org.classroom.Rollcall1")]
impl RollcallService {
    /// Begin a live attendance scan for the given class. Loads models on
    /// first use, acquires the camera, and starts the frame loop.
    async fn start_scan(&self, class_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(class_id, "start_scan requested");

        // Copy what the slow work needs, then release the lock
        let (model, config, store) = {
            let state = self.state.lock().await;
            if Self::camera_in_use(&state).await {
                return Err(failed("camera is in use by another session"));
            }
            (state.model.clone(), state.config.clone(), state.store.clone())
        };

        model.ensure_loaded().await.map_err(failed)?;

        let rows = store.roster_for_class(class_id).await.map_err(failed)?;
        if rows.is_empty() {
            return Err(failed(format!("class {class_id} has no enrolled students")));
        }
        let (roster, gallery) = build_gallery(&rows);

        let engine = spawn_session_engine(
            &config.camera_device,
            model,
            config.call_timeout,
        )
        .map_err(failed)?;

        let date = chrono::Local::now().format("%Y-%m-%d").to_string();
        let mut session = ScanSession::new(
            class_id.to_string(),
            date,
            roster,
            gallery,
            config.association_radius_factor,
        );
        session.begin().map_err(failed)?;

        let handle = Arc::new(ScanHandle::start(
            session,
            engine,
            ScanTuning::from(&config),
        ));

        let mut state = self.state.lock().await;
        if Self::camera_in_use(&state).await {
            // Lost the race to another session; give the camera back
            handle.cancel().await;
            return Err(failed("camera is in use by another session"));
        }
        let status = handle.session.lock().await.status();
        state.scan = Some(handle);
        json_reply(&status)
    }

    /// Current scan status as JSON, or `{"state":"idle"}` with no session.
    async fn scan_status(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        match &state.scan {
            Some(scan) => json_reply(&scan.session.lock().await.status()),
            None => Ok(serde_json::json!({ "state": "idle" }).to_string()),
        }
    }

    /// Manually mark a student: present, absent, or unset.
    async fn mark_student(&self, student_id: &str, mark: &str) -> zbus::fdo::Result<String> {
        let mark = parse_mark(mark)?;
        let scan = self
            .state
            .lock()
            .await
            .scan
            .clone()
            .ok_or_else(|| failed("no active scan"))?;

        let mut session = scan.session.lock().await;
        session.mark(student_id, mark).map_err(failed)?;
        json_reply(&session.status())
    }

    /// Finish the scan and persist the attendance records. Retryable if
    /// the database write fails.
    async fn complete_scan(&self) -> zbus::fdo::Result<String> {
        let (scan, store) = {
            let state = self.state.lock().await;
            let scan = state.scan.clone().ok_or_else(|| failed("no active scan"))?;
            (scan, state.store.clone())
        };

        let status = scan.complete(&store).await.map_err(failed)?;
        self.state.lock().await.scan = None;
        json_reply(&status)
    }

    /// Abandon the scan, discard all tracked state, release the camera.
    async fn cancel_scan(&self) -> zbus::fdo::Result<bool> {
        let scan = {
            let mut state = self.state.lock().await;
            state.scan.take()
        };
        match scan {
            Some(scan) => {
                scan.cancel().await;
                tracing::info!("scan cancelled");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Begin enrolling a new student into the given class.
    async fn start_enrollment(
        &self,
        class_id: &str,
        student_name: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(class_id, student_name, "start_enrollment requested");
        if student_name.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("student name is empty".into()));
        }

        let (model, config) = {
            let state = self.state.lock().await;
            if Self::camera_in_use(&state).await {
                return Err(failed("camera is in use by another session"));
            }
            (state.model.clone(), state.config.clone())
        };

        model.ensure_loaded().await.map_err(failed)?;
        let engine = spawn_session_engine(
            &config.camera_device,
            model,
            config.call_timeout,
        )
        .map_err(failed)?;

        let session = EnrollSession::new(class_id.to_string(), student_name.to_string());
        let handle = Arc::new(EnrollHandle::new(
            session,
            engine,
            EnrollTuning::from(&config),
        ));

        let mut state = self.state.lock().await;
        if Self::camera_in_use(&state).await {
            handle.cancel().await;
            return Err(failed("camera is in use by another session"));
        }
        let status = handle.status().await;
        state.enroll = Some(handle);
        json_reply(&status)
    }

    /// Current enrollment status as JSON, or `{"step":"none"}`.
    async fn enroll_status(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        match &state.enroll {
            Some(enroll) => json_reply(&enroll.status().await),
            None => Ok(serde_json::json!({ "step": "none" }).to_string()),
        }
    }

    /// Drive the enrollment one step forward.
    async fn advance_enrollment(&self) -> zbus::fdo::Result<String> {
        let (enroll, store) = {
            let state = self.state.lock().await;
            let enroll = state
                .enroll
                .clone()
                .ok_or_else(|| failed("no active enrollment"))?;
            (enroll, state.store.clone())
        };
        let status = enroll.advance(&store).await.map_err(failed)?;
        if status.step == crate::enroll::EnrollStep::Complete {
            // Advancing through Review confirmed the capture; the camera
            // has no further use.
            enroll.cancel().await;
            self.state.lock().await.enroll = None;
        }
        json_reply(&status)
    }

    /// Persist the reviewed capture. Returns the new student id and
    /// releases the camera on success.
    async fn confirm_enrollment(&self) -> zbus::fdo::Result<String> {
        let (enroll, store) = {
            let state = self.state.lock().await;
            let enroll = state
                .enroll
                .clone()
                .ok_or_else(|| failed("no active enrollment"))?;
            (enroll, state.store.clone())
        };

        let student_id = enroll.confirm(&store).await.map_err(failed)?;
        enroll.cancel().await; // releases the camera
        self.state.lock().await.enroll = None;
        Ok(student_id)
    }

    /// Restart the current enrollment from the Info step.
    async fn reset_enrollment(&self) -> zbus::fdo::Result<String> {
        let enroll = self
            .state
            .lock()
            .await
            .enroll
            .clone()
            .ok_or_else(|| failed("no active enrollment"))?;
        enroll.reset().await;
        json_reply(&enroll.status().await)
    }

    /// Abandon the enrollment without persisting, release the camera.
    async fn cancel_enrollment(&self) -> zbus::fdo::Result<bool> {
        let enroll = {
            let mut state = self.state.lock().await;
            state.enroll.take()
        };
        match enroll {
            Some(enroll) => {
                enroll.cancel().await;
                tracing::info!("enrollment cancelled");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Create a class, returning its id.
    async fn create_class(&self, name: &str) -> zbus::fdo::Result<String> {
        if name.trim().is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("class name is empty".into()));
        }
        let store = self.state.lock().await.store.clone();
        store.create_class(name).await.map_err(failed)
    }

    /// All classes as a JSON array of {id, name}.
    async fn list_classes(&self) -> zbus::fdo::Result<String> {
        let store = self.state.lock().await.store.clone();
        let classes = store.list_classes().await.map_err(failed)?;
        json_reply(&classes)
    }

    /// Roster for a class as a JSON array of
    /// {student_id, name, has_descriptor}.
    async fn roster(&self, class_id: &str) -> zbus::fdo::Result<String> {
        let store = self.state.lock().await.store.clone();
        let rows = store.roster_for_class(class_id).await.map_err(failed)?;
        let entries: Vec<serde_json::Value> = rows
            .iter()
            .map(|r| {
                serde_json::json!({
                    "student_id": r.student_id,
                    "name": r.name,
                    "has_descriptor": r.descriptor.is_some(),
                })
            })
            .collect();
        json_reply(&entries)
    }

    /// Saved attendance for a class and date (YYYY-MM-DD) as JSON:
    /// the session summary plus per-student records.
    async fn attendance(&self, class_id: &str, date: &str) -> zbus::fdo::Result<String> {
        let store = self.state.lock().await.store.clone();
        let session = store.session_for(class_id, date).await.map_err(failed)?;
        let records = store.attendance_for(class_id, date).await.map_err(failed)?;
        let records: Vec<serde_json::Value> = records
            .iter()
            .map(|(student_id, status)| {
                serde_json::json!({ "student_id": student_id, "status": status })
            })
            .collect();
        Ok(serde_json::json!({
            "session": session,
            "records": records,
        })
        .to_string())
    }

    /// Daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": state.config.camera_device,
            "models_loaded": state.model.detector().is_some(),
            "scan_active": state.scan.is_some(),
            "enroll_active": state.enroll.is_some(),
        })
        .to_string())
    }
}
