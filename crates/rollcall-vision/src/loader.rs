//! One-shot shared model loading.
//!
//! Model loading is slow (two ONNX sessions) and must happen exactly once
//! per process, no matter how many flows race to trigger it. `SharedModel`
//! is an explicit once-guarded handle: every consumer awaits
//! [`SharedModel::ensure_loaded`], and concurrent calls collapse to a
//! single in-flight load.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::model::{DetectorConfig, FrameDetector, ModelError};
use crate::onnx::OnnxFaceModel;

/// Locations of the two ONNX model files.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detect: PathBuf,
    pub embed: PathBuf,
}

impl ModelPaths {
    pub fn in_dir(dir: &std::path::Path) -> Self {
        Self {
            detect: dir.join("face_detect.onnx"),
            embed: dir.join("face_embed.onnx"),
        }
    }
}

/// Default model directory: `$XDG_DATA_HOME/rollcall/models`, falling back
/// to `~/.local/share/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}

/// Clone-safe handle to the lazily loaded detector.
#[derive(Clone)]
pub struct SharedModel {
    paths: ModelPaths,
    config: DetectorConfig,
    cell: Arc<OnceCell<Mutex<FrameDetector>>>,
}

impl SharedModel {
    pub fn new(paths: ModelPaths, config: DetectorConfig) -> Self {
        Self {
            paths,
            config,
            cell: Arc::new(OnceCell::new()),
        }
    }

    /// Load the models if not yet loaded. Safe to await redundantly from
    /// multiple call sites; may be called speculatively ahead of first use.
    pub async fn ensure_loaded(&self) -> Result<(), ModelError> {
        self.cell
            .get_or_try_init(|| {
                let paths = self.paths.clone();
                let config = self.config.clone();
                async move {
                    tracing::info!(
                        detect = %paths.detect.display(),
                        embed = %paths.embed.display(),
                        "loading face models"
                    );
                    let detector = tokio::task::spawn_blocking(move || {
                        let model = OnnxFaceModel::load(&paths.detect, &paths.embed)?;
                        Ok::<_, ModelError>(FrameDetector::new(Box::new(model), config))
                    })
                    .await
                    .map_err(|e| ModelError::LoadFailed(format!("load task panicked: {e}")))??;
                    Ok(Mutex::new(detector))
                }
            })
            .await
            .map(|_| ())
    }

    /// The loaded detector, or `None` before [`Self::ensure_loaded`] has
    /// succeeded. The engine thread locks it for the duration of one
    /// inference call; calls are strictly sequential so there is no
    /// contention in practice.
    pub fn detector(&self) -> Option<&Mutex<FrameDetector>> {
        self.cell.get()
    }
}
