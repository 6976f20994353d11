//! faceswap-core: Upload staging, request handling and face swapping.
//!
//! The request handler owns the temp-file lifecycle of one swap request;
//! the swap itself sits behind [`FaceSwapper`], implemented here with
//! SCRFD detection, ArcFace identity embeddings and the inswapper generator,
//! all running via ONNX Runtime on the CPU.

pub mod alignment;
pub mod detector;
pub mod ephemeral;
pub mod models;
pub mod pixels;
pub mod recognizer;
pub mod request;
pub mod swapper;
pub mod types;

pub use ephemeral::{EphemeralFile, StagingArea};
pub use models::{default_model_dir, ModelPaths, ModelStatus};
pub use pixels::{ChannelOrder, PixelBuffer, PixelError, DEFAULT_JPEG_QUALITY};
pub use request::{
    Notice, RequestHandler, RequestOutcome, RequestState, SwapOutput, SwapRequest, DOWNLOAD_FILE_NAME,
    MISSING_INPUT_PROMPT,
};
pub use swapper::{FaceSwapper, LazySwapper, OnnxFaceSwapper, SwapError, SwapperOptions, CPU_DEVICE};
pub use types::{BoundingBox, Embedding, FaceRole, ImageFormat, UploadError, UploadedImage};
