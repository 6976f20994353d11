//! Model file layout.

use serde::Serialize;
use std::path::{Path, PathBuf};

pub const DETECTOR_MODEL: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL: &str = "w600k_r50.onnx";
pub const SWAPPER_MODEL: &str = "inswapper_128.onnx";
/// The inswapper embedding projection: 512×512 little-endian f32, row-major.
pub const SWAPPER_EMAP: &str = "inswapper_128.emap";

/// Default model directory: `$XDG_DATA_HOME/faceswap/models`, falling back
/// to `~/.local/share/faceswap/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceswap/models")
}

/// Paths of every file the ONNX swap backend loads.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
    pub swapper: PathBuf,
    pub emap: PathBuf,
}

/// Presence of one model file, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub name: &'static str,
    pub path: PathBuf,
    pub present: bool,
}

impl ModelPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join(DETECTOR_MODEL),
            recognizer: dir.join(RECOGNIZER_MODEL),
            swapper: dir.join(SWAPPER_MODEL),
            emap: dir.join(SWAPPER_EMAP),
        }
    }

    pub fn status(&self) -> Vec<ModelStatus> {
        [
            (DETECTOR_MODEL, &self.detector),
            (RECOGNIZER_MODEL, &self.recognizer),
            (SWAPPER_MODEL, &self.swapper),
            (SWAPPER_EMAP, &self.emap),
        ]
        .into_iter()
        .map(|(name, path)| ModelStatus {
            name,
            path: path.clone(),
            present: path.is_file(),
        })
        .collect()
    }

    pub fn all_present(&self) -> bool {
        self.status().iter().all(|s| s.present)
    }
}
