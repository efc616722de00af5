//! Capture/inference engine for one scan or enrollment session.
//!
//! The camera and the model run on a dedicated OS thread; controllers talk
//! to it through a clone-safe handle with request-reply channels. Requests
//! are processed strictly one at a time, which gives the session loop its
//! ordering guarantee for free: a second detection can never be in flight
//! while the first is still running.

use std::time::Duration;

use rollcall_core::DetectedFace;
use rollcall_hw::Camera;
use rollcall_vision::{GrayFrame, SharedModel};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] rollcall_hw::CameraError),
    #[error("model error: {0}")]
    Model(#[from] rollcall_vision::ModelError),
    #[error("face models not loaded — await SharedModel::ensure_loaded first")]
    ModelNotLoaded,
    #[error("engine call timed out")]
    Timeout,
    #[error("engine thread exited")]
    ChannelClosed,
    #[error("failed to spawn engine thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

enum EngineRequest {
    /// Capture one frame and run multi-face detection.
    Detect {
        reply: oneshot::Sender<Result<Vec<DetectedFace>, EngineError>>,
    },
    /// Capture one frame and return the single best face, if any.
    /// Enrollment capture uses this.
    Snapshot {
        reply: oneshot::Sender<Result<Option<DetectedFace>, EngineError>>,
    },
    /// Release the camera and exit the thread.
    Shutdown { reply: oneshot::Sender<()> },
}

/// Clone-safe handle to a session's engine thread.
///
/// Every call is bounded by the configured timeout. A timed-out call's
/// eventual result is dropped with the reply channel — it can never mutate
/// session state after the caller has moved on.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    call_timeout: Duration,
}

impl EngineHandle {
    pub async fn detect(&self) -> Result<Vec<DetectedFace>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Detect { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Err(_) => Err(EngineError::Timeout),
            Ok(reply) => reply.map_err(|_| EngineError::ChannelClosed)?,
        }
    }

    pub async fn snapshot(&self) -> Result<Option<DetectedFace>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Err(_) => Err(EngineError::Timeout),
            Ok(reply) => reply.map_err(|_| EngineError::ChannelClosed)?,
        }
    }

    /// Release the camera and stop the thread. Idempotent from the caller's
    /// perspective: a closed channel means the engine is already gone.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(EngineRequest::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = tokio::time::timeout(Duration::from_secs(5), reply_rx).await;
        }
    }
}

/// Acquire the camera and start the engine thread for one session.
///
/// Fails fast if the camera cannot be acquired or the model has not been
/// loaded. The camera stays exclusively owned by the thread until a
/// `Shutdown` request releases it.
pub fn spawn_session_engine(
    camera_device: &str,
    model: SharedModel,
    call_timeout: Duration,
) -> Result<EngineHandle, EngineError> {
    let camera = Camera::open(camera_device)?;
    if model.detector().is_none() {
        camera.release();
        return Err(EngineError::ModelNotLoaded);
    }

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Detect { reply } => {
                        let _ = reply.send(run_detect(&camera, &model));
                    }
                    EngineRequest::Snapshot { reply } => {
                        let _ = reply.send(run_snapshot(&camera, &model));
                    }
                    EngineRequest::Shutdown { reply } => {
                        camera.release();
                        let _ = reply.send(());
                        break;
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx, call_timeout })
}

fn run_detect(camera: &Camera, model: &SharedModel) -> Result<Vec<DetectedFace>, EngineError> {
    let frame = camera.capture_frame()?;
    let detector = model.detector().ok_or(EngineError::ModelNotLoaded)?;
    let mut detector = detector.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let faces = detector.detect(GrayFrame {
        data: &frame.data,
        width: frame.width,
        height: frame.height,
    })?;
    Ok(faces)
}

fn run_snapshot(camera: &Camera, model: &SharedModel) -> Result<Option<DetectedFace>, EngineError> {
    let frame = camera.capture_frame()?;
    let detector = model.detector().ok_or(EngineError::ModelNotLoaded)?;
    let mut detector = detector.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let face = detector.detect_one(GrayFrame {
        data: &frame.data,
        width: frame.width,
        height: frame.height,
    })?;
    Ok(face)
}
