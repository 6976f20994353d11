use faceswap_core::{ModelPaths, SwapperOptions, CPU_DEVICE, DEFAULT_JPEG_QUALITY};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 8501);
const DEFAULT_MAX_UPLOAD_MB: usize = 200;
const MIB: usize = 1024 * 1024;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server listens on (default: 127.0.0.1:8501).
    pub bind_addr: SocketAddr,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Execution device for the swap backend; -1 selects the CPU.
    pub device_id: i32,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
    /// Directory ephemeral upload and result files are created in.
    pub staging_dir: PathBuf,
    /// Maximum request body size in bytes.
    pub max_upload_bytes: usize,
    /// JPEG quality of the swapped result.
    pub jpeg_quality: u8,
}

impl Config {
    /// Load configuration from `FACESWAP_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;

        Self {
            bind_addr: parse_var(lookup, "FACESWAP_BIND_ADDR").unwrap_or_else(|| SocketAddr::from(DEFAULT_BIND_ADDR)),
            model_dir: lookup("FACESWAP_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(faceswap_core::default_model_dir),
            device_id: parse_var(lookup, "FACESWAP_DEVICE_ID").unwrap_or(CPU_DEVICE),
            intra_threads: parse_var(lookup, "FACESWAP_INTRA_THREADS").filter(|&n: &usize| n > 0).unwrap_or(2),
            staging_dir: lookup("FACESWAP_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            max_upload_bytes: parse_var(lookup, "FACESWAP_MAX_UPLOAD_MB")
                .filter(|&mb: &usize| mb > 0)
                .and_then(|mb| mb.checked_mul(MIB))
                .unwrap_or(DEFAULT_MAX_UPLOAD_MB * MIB),
            jpeg_quality: parse_var(lookup, "FACESWAP_JPEG_QUALITY")
                .filter(|q: &u8| (1..=100).contains(q))
                .unwrap_or(DEFAULT_JPEG_QUALITY),
        }
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir)
    }

    pub fn swapper_options(&self) -> SwapperOptions {
        SwapperOptions {
            device_id: self.device_id,
            intra_threads: self.intra_threads,
        }
    }
}

fn parse_var<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}
