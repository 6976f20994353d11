//! The face swap capability.
//!
//! [`FaceSwapper`] is the only interface the request handler depends on.
//! [`OnnxFaceSwapper`] implements it with the insightface model family:
//! SCRFD to find faces, ArcFace for the source identity and the inswapper
//! generator to re-render each target face with that identity.

use crate::alignment;
use crate::detector::{DetectorError, FaceDetector};
use crate::models::ModelPaths;
use crate::pixels::{ChannelOrder, PixelBuffer, PixelError};
use crate::recognizer::{FaceRecognizer, RecognizerError, ARCFACE_EMBEDDING_DIM};
use crate::types::{BoundingBox, Embedding, FaceRole};
use ndarray::{Array1, Array2, Array4, Axis};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const INSWAPPER_INPUT_SIZE: usize = 128;
const INSWAPPER_STD: f32 = 255.0;

/// Device id selecting CPU execution.
pub const CPU_DEVICE: i32 = -1;

#[derive(Error, Debug)]
pub enum SwapError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("no face detected in {0} image")]
    NoFace(FaceRole),
    #[error("device {0} is not supported; only CPU execution (-1) is available")]
    UnsupportedDevice(i32),
    #[error("emap has {actual} values, expected {expected}")]
    InvalidEmap { expected: usize, actual: usize },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("image: {0}")]
    Pixels(#[from] PixelError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces a composite where the source face replaces the target's.
pub trait FaceSwapper {
    /// Swap the face in `source` onto the face(s) in `target`.
    ///
    /// The result has the target's dimensions; its channel order is whatever
    /// the implementation natively produces and is recorded in the buffer.
    fn swap(&mut self, source: &Path, target: &Path) -> Result<PixelBuffer, SwapError>;

    /// Whether the backend is constructed and ready to serve without a load delay.
    fn is_ready(&self) -> bool {
        true
    }
}

impl<T: FaceSwapper + ?Sized> FaceSwapper for Box<T> {
    fn swap(&mut self, source: &Path, target: &Path) -> Result<PixelBuffer, SwapError> {
        (**self).swap(source, target)
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }
}

/// Builds its backend on first use and reuses it afterwards.
///
/// A failed construction is returned as that call's error; the next call
/// tries again.
pub struct LazySwapper<S, F> {
    init: F,
    inner: Option<S>,
}

impl<S, F> LazySwapper<S, F>
where
    S: FaceSwapper,
    F: FnMut() -> Result<S, SwapError>,
{
    pub fn new(init: F) -> Self {
        Self { init, inner: None }
    }
}

impl<S, F> FaceSwapper for LazySwapper<S, F>
where
    S: FaceSwapper,
    F: FnMut() -> Result<S, SwapError>,
{
    fn swap(&mut self, source: &Path, target: &Path) -> Result<PixelBuffer, SwapError> {
        let swapper = match self.inner.take() {
            Some(s) => s,
            None => {
                tracing::info!("initializing swap backend");
                (self.init)()?
            }
        };
        self.inner.insert(swapper).swap(source, target)
    }

    fn is_ready(&self) -> bool {
        self.inner.is_some()
    }
}

/// Construction parameters fixed for the backend's lifetime.
#[derive(Debug, Clone)]
pub struct SwapperOptions {
    /// `-1` for CPU.
    pub device_id: i32,
    pub intra_threads: usize,
}

impl Default for SwapperOptions {
    fn default() -> Self {
        Self {
            device_id: CPU_DEVICE,
            intra_threads: 2,
        }
    }
}

/// inswapper_128-based swap backend. Works in BGR.
pub struct OnnxFaceSwapper {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    generator: Session,
    emap: Array2<f32>,
}

impl OnnxFaceSwapper {
    pub fn load(paths: &ModelPaths, options: &SwapperOptions) -> Result<Self, SwapError> {
        if options.device_id != CPU_DEVICE {
            return Err(SwapError::UnsupportedDevice(options.device_id));
        }
        for path in [&paths.swapper, &paths.emap] {
            if !path.exists() {
                return Err(SwapError::ModelNotFound(path.display().to_string()));
            }
        }

        let detector = FaceDetector::load(&paths.detector, options.intra_threads)?;
        let recognizer = FaceRecognizer::load(&paths.recognizer, options.intra_threads)?;

        let generator = Session::builder()?
            .with_intra_threads(options.intra_threads)?
            .commit_from_file(&paths.swapper)?;
        tracing::info!(
            path = %paths.swapper.display(),
            inputs = ?generator.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded inswapper model"
        );

        let emap = parse_emap(&std::fs::read(&paths.emap)?)?;

        Ok(Self {
            detector,
            recognizer,
            generator,
            emap,
        })
    }

    /// Project an ArcFace embedding into the generator's latent space.
    fn latent(&self, embedding: &Embedding) -> Array2<f32> {
        let emb = Array1::from_vec(embedding.values.clone());
        let mut latent = emb.dot(&self.emap);
        let norm = latent.dot(&latent).sqrt();
        if norm > 0.0 {
            latent /= norm;
        }
        latent.insert_axis(Axis(0))
    }

    /// Re-render one target face with the source identity and composite it.
    fn swap_face(&mut self, frame: &mut PixelBuffer, face: &BoundingBox, latent: &Array2<f32>) -> Result<(), SwapError> {
        let Some(landmarks) = face.landmarks.as_ref() else {
            tracing::debug!(confidence = face.confidence, "skipping target face without landmarks");
            return Ok(());
        };

        let (crop, matrix) = alignment::align_face(frame, landmarks, INSWAPPER_INPUT_SIZE);
        let blob = crop_to_tensor(&crop);

        let outputs = self.generator.run(ort::inputs![
            "target" => TensorRef::from_array_view(blob.view())?,
            "source" => TensorRef::from_array_view(latent.view())?
        ])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| SwapError::InferenceFailed(format!("generator output: {e}")))?;

        let generated = tensor_to_crop(raw)?;
        alignment::paste_back(frame, &generated, &matrix);
        Ok(())
    }
}

impl FaceSwapper for OnnxFaceSwapper {
    fn swap(&mut self, source: &Path, target: &Path) -> Result<PixelBuffer, SwapError> {
        let source_frame = PixelBuffer::open(source, ChannelOrder::Bgr)?;
        let mut frame = PixelBuffer::open(target, ChannelOrder::Bgr)?;

        let source_face = self
            .detector
            .detect(&source_frame)?
            .into_iter()
            .next()
            .ok_or(SwapError::NoFace(FaceRole::Source))?;
        let embedding = self.recognizer.extract(&source_frame, &source_face)?;
        let latent = self.latent(&embedding);

        let target_faces = self.detector.detect(&frame)?;
        if target_faces.is_empty() {
            return Err(SwapError::NoFace(FaceRole::Target));
        }
        tracing::info!(
            source_confidence = source_face.confidence,
            target_faces = target_faces.len(),
            "swapping faces"
        );

        for face in &target_faces {
            self.swap_face(&mut frame, face, &latent)?;
        }

        Ok(frame)
    }
}

fn parse_emap(bytes: &[u8]) -> Result<Array2<f32>, SwapError> {
    let expected = ARCFACE_EMBEDDING_DIM * ARCFACE_EMBEDDING_DIM;
    if bytes.len() != expected * 4 {
        return Err(SwapError::InvalidEmap {
            expected,
            actual: bytes.len() / 4,
        });
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Array2::from_shape_vec((ARCFACE_EMBEDDING_DIM, ARCFACE_EMBEDDING_DIM), values)
        .map_err(|e| SwapError::InferenceFailed(format!("emap shape: {e}")))
}

/// Aligned crop → 1×3×128×128 RGB tensor scaled to [0, 1].
fn crop_to_tensor(crop: &PixelBuffer) -> Array4<f32> {
    let size = INSWAPPER_INPUT_SIZE;
    let rgb = crop.clone().into_order(ChannelOrder::Rgb);
    let data = rgb.data();
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            for c in 0..3 {
                tensor[[0, c, y, x]] = data[(y * size + x) * 3 + c] as f32 / INSWAPPER_STD;
            }
        }
    }
    tensor
}

/// Generator output (1×3×128×128 RGB in [0, 1]) → BGR crop.
fn tensor_to_crop(raw: &[f32]) -> Result<PixelBuffer, SwapError> {
    let size = INSWAPPER_INPUT_SIZE;
    let plane = size * size;
    if raw.len() != plane * 3 {
        return Err(SwapError::InferenceFailed(format!(
            "expected {} generator values, got {}",
            plane * 3,
            raw.len()
        )));
    }

    let mut data = Vec::with_capacity(plane * 3);
    for i in 0..plane {
        for c in [2, 1, 0] {
            data.push((raw[c * plane + i] * INSWAPPER_STD).round().clamp(0.0, 255.0) as u8);
        }
    }
    Ok(PixelBuffer::new(size as u32, size as u32, ChannelOrder::Bgr, data)?)
}
