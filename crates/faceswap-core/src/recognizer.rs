//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts the 512-dimensional identity embedding of the source face,
//! which the swap generator conditions on.

use crate::alignment;
use crate::pixels::{ChannelOrder, PixelBuffer};
use crate::types::{BoundingBox, Embedding};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, not 128
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (see `faceswap models`)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks to align on")]
    NoLandmarks,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded ArcFace model");

        Ok(Self { session })
    }

    /// Extract the embedding of a detected face.
    ///
    /// The face is aligned to the canonical 112×112 ArcFace position first,
    /// so it must carry landmarks.
    pub fn extract(&mut self, frame: &PixelBuffer, face: &BoundingBox) -> Result<Embedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;

        let (aligned, _) = alignment::align_face(frame, landmarks, ARCFACE_INPUT_SIZE);
        let input = preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::normalized(raw.to_vec()))
    }
}

/// Preprocess a 112×112 aligned crop into a NCHW RGB float tensor.
fn preprocess(aligned: &PixelBuffer) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE;
    let rgb = aligned.clone().into_order(ChannelOrder::Rgb);
    let data = rgb.data();
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for y in 0..size {
        for x in 0..size {
            for c in 0..3 {
                let pixel = data.get((y * size + x) * 3 + c).copied().unwrap_or(0) as f32;
                tensor[[0, c, y, x]] = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crop(bgr: [u8; 3]) -> PixelBuffer {
        let n = ARCFACE_INPUT_SIZE * ARCFACE_INPUT_SIZE;
        let data: Vec<u8> = (0..n).flat_map(|_| bgr).collect();
        PixelBuffer::new(ARCFACE_INPUT_SIZE as u32, ARCFACE_INPUT_SIZE as u32, ChannelOrder::Bgr, data).unwrap()
    }

    #[test]
    fn test_preprocess_output_shape() {
        let tensor = preprocess(&crop([128, 128, 128]));
        assert_eq!(tensor.shape(), &[1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let tensor = preprocess(&crop([128, 128, 128]));
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        let val = tensor[[0, 0, 0, 0]];
        assert!((val - expected).abs() < 1e-6, "got {val}, expected {expected}");
    }

    #[test]
    fn test_preprocess_feeds_rgb_planes_from_bgr() {
        // BGR [0, 0, 255] is red: plane 0 must be +1.0, plane 2 must be -1.0.
        let tensor = preprocess(&crop([0, 0, 255]));
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 5]] + 1.0).abs() < 1e-6);
    }
}
