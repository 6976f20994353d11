//! One request: stage the uploads, swap on demand, hand back a downloadable
//! result, and remove every file the request created before returning.

use crate::ephemeral::{EphemeralFile, StagingArea};
use crate::pixels::{ChannelOrder, PixelBuffer, DEFAULT_JPEG_QUALITY};
use crate::swapper::FaceSwapper;
use crate::types::UploadedImage;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};

/// File name offered for the swapped image.
pub const DOWNLOAD_FILE_NAME: &str = "swapped_result.jpg";

pub const MISSING_INPUT_PROMPT: &str = "Please upload both a source and target image to proceed.";

/// Progress of a request.
///
/// `Idle → AwaitingBothUploads → ReadyToSwap → Swapping → {Success, Failed}`;
/// a request reports the last state it reached and the next one starts at `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Idle,
    AwaitingBothUploads,
    ReadyToSwap,
    Swapping,
    Success,
    Failed,
}

/// A message for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "level", content = "message", rename_all = "lowercase")]
pub enum Notice {
    Info(String),
    Warning(String),
    Error(String),
}

/// The composite, encoded and ready to display or download.
#[derive(Debug, Clone)]
pub struct SwapOutput {
    pub width: u32,
    pub height: u32,
    /// JPEG bytes read back from the output file.
    pub jpeg: Vec<u8>,
    pub file_name: &'static str,
}

#[derive(Debug)]
pub struct RequestOutcome {
    pub state: RequestState,
    pub notices: Vec<Notice>,
    pub output: Option<SwapOutput>,
}

impl RequestOutcome {
    pub fn errors(&self) -> impl Iterator<Item = &str> {
        self.notices.iter().filter_map(|n| match n {
            Notice::Error(m) => Some(m.as_str()),
            _ => None,
        })
    }
}

/// Inputs of one request. `swap_requested` is the user's trigger; without
/// it the uploads are staged and cleaned up but nothing is swapped.
#[derive(Debug, Clone, Copy)]
pub struct SwapRequest<'a> {
    pub source: Option<&'a UploadedImage>,
    pub target: Option<&'a UploadedImage>,
    pub swap_requested: bool,
}

/// Drives the upload → stage → swap → cleanup flow.
#[derive(Debug, Clone)]
pub struct RequestHandler {
    staging: StagingArea,
    jpeg_quality: u8,
}

impl RequestHandler {
    pub fn new(staging: StagingArea) -> Self {
        Self {
            staging,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn handle<S>(&self, swapper: &mut S, request: SwapRequest<'_>) -> RequestOutcome
    where
        S: FaceSwapper + ?Sized,
    {
        let mut notices = Vec::new();
        let mut state = RequestState::Idle;
        transition(&mut state, RequestState::AwaitingBothUploads);

        let (Some(source), Some(target)) = (request.source, request.target) else {
            notices.push(Notice::Info(MISSING_INPUT_PROMPT.to_string()));
            return RequestOutcome {
                state,
                notices,
                output: None,
            };
        };

        transition(&mut state, RequestState::ReadyToSwap);

        let staged = self
            .staging
            .stage(source)
            .and_then(|src| Ok((src, self.staging.stage(target)?)));
        let (source_file, target_file) = match staged {
            Ok(files) => files,
            Err(err) => {
                // Whichever file was written has already been removed by its guard.
                tracing::error!(error = %err, "failed to stage uploads");
                notices.push(Notice::Error(format!("Failed to stage upload: {err}")));
                transition(&mut state, RequestState::Failed);
                return RequestOutcome {
                    state,
                    notices,
                    output: None,
                };
            }
        };

        let mut output = None;
        if request.swap_requested {
            transition(&mut state, RequestState::Swapping);
            match self.swap_and_export(swapper, &source_file, &target_file, &mut notices) {
                Ok(result) => {
                    output = Some(result);
                    transition(&mut state, RequestState::Success);
                }
                Err(message) => {
                    tracing::error!(error = %message, "face swap failed");
                    notices.push(Notice::Error(format!("Face swapping failed: {message}")));
                    transition(&mut state, RequestState::Failed);
                }
            }
        }

        let cleanup_errors: Vec<String> = [source_file.release(), target_file.release()]
            .into_iter()
            .filter_map(Result::err)
            .map(|e| e.to_string())
            .collect();
        if !cleanup_errors.is_empty() {
            let errors = cleanup_errors.join("; ");
            tracing::warn!(%errors, "failed to clean up staged uploads");
            notices.push(Notice::Warning(format!("Failed to clean up temporary files: {errors}")));
        }

        RequestOutcome { state, notices, output }
    }

    /// Swap, convert to the encoder's channel order, and back the download
    /// with a short-lived output file. Errors come back as display text.
    fn swap_and_export<S>(
        &self,
        swapper: &mut S,
        source: &EphemeralFile,
        target: &EphemeralFile,
        notices: &mut Vec<Notice>,
    ) -> Result<SwapOutput, String>
    where
        S: FaceSwapper + ?Sized,
    {
        let swapped = panic::catch_unwind(AssertUnwindSafe(|| swapper.swap(source.path(), target.path())))
            .map_err(|payload| format!("swap backend panicked: {}", panic_message(payload.as_ref())))?
            .map_err(|e| e.to_string())?;

        if swapped.is_empty() {
            return Err("swap backend returned an empty image".to_string());
        }

        let (width, height) = (swapped.width(), swapped.height());
        let rgb: PixelBuffer = swapped.into_order(ChannelOrder::Rgb);
        let jpeg = rgb.encode_jpeg(self.jpeg_quality).map_err(|e| e.to_string())?;

        let result_file = self
            .staging
            .write("result", "jpg", &jpeg)
            .map_err(|e| format!("writing result: {e}"))?;
        let download = read_back(result_file, notices).map_err(|e| format!("reading result: {e}"))?;

        tracing::info!(width, height, bytes = download.len(), "face swap complete");
        Ok(SwapOutput {
            width,
            height,
            jpeg: download,
            file_name: DOWNLOAD_FILE_NAME,
        })
    }
}

/// Read the output file back for download and remove it. Failing to remove
/// it is only a warning; the download is still returned.
fn read_back(result_file: EphemeralFile, notices: &mut Vec<Notice>) -> std::io::Result<Vec<u8>> {
    let download = result_file.read();
    if let Err(err) = result_file.release() {
        tracing::warn!(error = %err, "failed to remove result file");
        notices.push(Notice::Warning(format!("Failed to clean up temporary files: {err}")));
    }
    download
}

fn transition(state: &mut RequestState, next: RequestState) {
    tracing::debug!(from = ?*state, to = ?next, "request state");
    *state = next;
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swapper::SwapError;
    use crate::types::FaceRole;
    use std::fs;
    use std::path::{Path, PathBuf};

    /// Returns the target image in BGR, recording the paths it was given.
    #[derive(Default)]
    struct EchoTarget {
        calls: Vec<(PathBuf, PathBuf)>,
    }

    impl FaceSwapper for EchoTarget {
        fn swap(&mut self, source: &Path, target: &Path) -> Result<PixelBuffer, SwapError> {
            assert!(source.exists() && target.exists(), "inputs must be staged");
            self.calls.push((source.to_path_buf(), target.to_path_buf()));
            Ok(PixelBuffer::open(target, ChannelOrder::Bgr)?)
        }
    }

    struct Failing;

    impl FaceSwapper for Failing {
        fn swap(&mut self, _source: &Path, _target: &Path) -> Result<PixelBuffer, SwapError> {
            Err(SwapError::NoFace(FaceRole::Source))
        }
    }

    struct Panicking;

    impl FaceSwapper for Panicking {
        fn swap(&mut self, _source: &Path, _target: &Path) -> Result<PixelBuffer, SwapError> {
            panic!("model exploded")
        }
    }

    struct Empty;

    impl FaceSwapper for Empty {
        fn swap(&mut self, _source: &Path, _target: &Path) -> Result<PixelBuffer, SwapError> {
            Ok(PixelBuffer::zeroed(0, 0, ChannelOrder::Bgr))
        }
    }

    fn jpeg_upload(role: FaceRole, width: u32, height: u32, rgb: [u8; 3]) -> UploadedImage {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb(rgb));
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Jpeg).unwrap();
        UploadedImage::from_upload(
            role,
            Some(format!("{role}.jpg")),
            Some("image/jpeg"),
            out.into_inner(),
        )
        .unwrap()
    }

    fn entries(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    fn request<'a>(source: Option<&'a UploadedImage>, target: Option<&'a UploadedImage>) -> SwapRequest<'a> {
        SwapRequest {
            source,
            target,
            swap_requested: true,
        }
    }

    #[test]
    fn test_swap_300x300_scenario() {
        let tmp = tempfile::tempdir().unwrap();
        let handler = RequestHandler::new(StagingArea::new(tmp.path()));
        let source = jpeg_upload(FaceRole::Source, 300, 300, [200, 150, 100]);
        let target = jpeg_upload(FaceRole::Target, 300, 300, [20, 40, 220]);
        let mut swapper = EchoTarget::default();

        let outcome = handler.handle(&mut swapper, request(Some(&source), Some(&target)));

        assert_eq!(outcome.state, RequestState::Success);
        assert!(outcome.notices.is_empty(), "{:?}", outcome.notices);
        let output = outcome.output.expect("result");
        assert_eq!((output.width, output.height), (300, 300));
        assert_eq!(output.file_name, "swapped_result.jpg");

        let decoded = image::load_from_memory(&output.jpeg).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (300, 300));
        // Channel order survived the BGR → RGB conversion: target is mostly blue.
        let px = decoded.get_pixel(150, 150);
        assert!(px[2] > 180 && px[0] < 60, "{px:?}");

        assert_eq!(swapper.calls.len(), 1);
        assert!(!swapper.calls[0].0.exists());
        assert!(!swapper.calls[0].1.exists());
        assert_eq!(entries(tmp.path()), 0);
    }

    #[test]
    fn test_missing_target_prompts_without_staging() {
        let tmp = tempfile::tempdir().unwrap();
        let handler = RequestHandler::new(StagingArea::new(tmp.path()));
        let source = jpeg_upload(FaceRole::Source, 32, 32, [1, 2, 3]);
        let mut swapper = EchoTarget::default();

        let outcome = handler.handle(&mut swapper, request(Some(&source), None));

        assert_eq!(outcome.state, RequestState::AwaitingBothUploads);
        assert_eq!(outcome.notices, vec![Notice::Info(MISSING_INPUT_PROMPT.to_string())]);
        assert!(outcome.output.is_none());
        assert!(swapper.calls.is_empty());
        assert_eq!(entries(tmp.path()), 0);
    }

    #[test]
    fn test_missing_both_prompts() {
        let tmp = tempfile::tempdir().unwrap();
        let handler = RequestHandler::new(StagingArea::new(tmp.path()));
        let outcome = handler.handle(&mut EchoTarget::default(), request(None, None));
        assert!(outcome.notices[0] == Notice::Info(MISSING_INPUT_PROMPT.to_string()));
        assert_eq!(entries(tmp.path()), 0);
    }

    #[test]
    fn test_untriggered_request_stages_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let handler = RequestHandler::new(StagingArea::new(tmp.path()));
        let source = jpeg_upload(FaceRole::Source, 16, 16, [1, 2, 3]);
        let target = jpeg_upload(FaceRole::Target, 16, 16, [4, 5, 6]);
        let mut swapper = EchoTarget::default();

        let outcome = handler.handle(
            &mut swapper,
            SwapRequest {
                source: Some(&source),
                target: Some(&target),
                swap_requested: false,
            },
        );

        assert_eq!(outcome.state, RequestState::ReadyToSwap);
        assert!(outcome.output.is_none());
        assert!(swapper.calls.is_empty());
        assert_eq!(entries(tmp.path()), 0);
    }

    #[test]
    fn test_swap_error_is_reported_and_cleaned_up() {
        let tmp = tempfile::tempdir().unwrap();
        let handler = RequestHandler::new(StagingArea::new(tmp.path()));
        let source = jpeg_upload(FaceRole::Source, 16, 16, [1, 2, 3]);
        let target = jpeg_upload(FaceRole::Target, 16, 16, [4, 5, 6]);

        let outcome = handler.handle(&mut Failing, request(Some(&source), Some(&target)));

        assert_eq!(outcome.state, RequestState::Failed);
        let errors: Vec<&str> = outcome.errors().collect();
        assert_eq!(errors, vec!["Face swapping failed: no face detected in source image"]);
        assert!(outcome.output.is_none());
        assert_eq!(entries(tmp.path()), 0);
    }

    #[test]
    fn test_swap_panic_is_caught_and_cleaned_up() {
        let tmp = tempfile::tempdir().unwrap();
        let handler = RequestHandler::new(StagingArea::new(tmp.path()));
        let source = jpeg_upload(FaceRole::Source, 16, 16, [1, 2, 3]);
        let target = jpeg_upload(FaceRole::Target, 16, 16, [4, 5, 6]);

        let outcome = handler.handle(&mut Panicking, request(Some(&source), Some(&target)));

        assert_eq!(outcome.state, RequestState::Failed);
        let error = outcome.errors().next().unwrap().to_string();
        assert!(error.contains("model exploded"), "{error}");
        assert_eq!(entries(tmp.path()), 0);
    }

    #[test]
    fn test_empty_result_is_a_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let handler = RequestHandler::new(StagingArea::new(tmp.path()));
        let source = jpeg_upload(FaceRole::Source, 16, 16, [1, 2, 3]);
        let target = jpeg_upload(FaceRole::Target, 16, 16, [4, 5, 6]);

        let outcome = handler.handle(&mut Empty, request(Some(&source), Some(&target)));

        assert_eq!(outcome.state, RequestState::Failed);
        assert_eq!(entries(tmp.path()), 0);
    }

    #[test]
    fn test_staging_failure_fails_request() {
        let tmp = tempfile::tempdir().unwrap();
        let handler = RequestHandler::new(StagingArea::new(tmp.path().join("gone")));
        let source = jpeg_upload(FaceRole::Source, 16, 16, [1, 2, 3]);
        let target = jpeg_upload(FaceRole::Target, 16, 16, [4, 5, 6]);
        let mut swapper = EchoTarget::default();

        let outcome = handler.handle(&mut swapper, request(Some(&source), Some(&target)));

        assert_eq!(outcome.state, RequestState::Failed);
        assert!(outcome.errors().next().unwrap().starts_with("Failed to stage upload"));
        assert!(swapper.calls.is_empty());
        assert_eq!(entries(tmp.path()), 0);
    }

    /// Deletes the staged source itself and leaves a directory in its place,
    /// so releasing it fails.
    struct Sabotage;

    impl FaceSwapper for Sabotage {
        fn swap(&mut self, source: &Path, target: &Path) -> Result<PixelBuffer, SwapError> {
            let out = PixelBuffer::open(target, ChannelOrder::Bgr)?;
            fs::remove_file(source)?;
            fs::create_dir(source)?;
            Ok(out)
        }
    }

    #[test]
    fn test_cleanup_failure_is_only_a_warning() {
        let tmp = tempfile::tempdir().unwrap();
        let handler = RequestHandler::new(StagingArea::new(tmp.path()));
        let source = jpeg_upload(FaceRole::Source, 16, 16, [1, 2, 3]);
        let target = jpeg_upload(FaceRole::Target, 16, 16, [4, 5, 6]);

        let outcome = handler.handle(&mut Sabotage, request(Some(&source), Some(&target)));

        assert_eq!(outcome.state, RequestState::Success);
        assert!(outcome.output.is_some());
        assert!(matches!(
            outcome.notices.as_slice(),
            [Notice::Warning(m)] if m.starts_with("Failed to clean up temporary files")
        ));
        // Only the directory planted by the backend remains.
        let leftovers: Vec<_> = fs::read_dir(tmp.path()).unwrap().map(|e| e.unwrap().path()).collect();
        assert_eq!(leftovers.len(), 1);
        assert!(leftovers[0].is_dir());
    }

    /// Replaces both staged inputs with directories so neither can be removed.
    struct SabotageBoth;

    impl FaceSwapper for SabotageBoth {
        fn swap(&mut self, source: &Path, target: &Path) -> Result<PixelBuffer, SwapError> {
            let out = PixelBuffer::open(target, ChannelOrder::Bgr)?;
            for path in [source, target] {
                fs::remove_file(path)?;
                fs::create_dir(path)?;
            }
            Ok(out)
        }
    }

    #[test]
    fn test_every_cleanup_failure_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let handler = RequestHandler::new(StagingArea::new(tmp.path()));
        let source = jpeg_upload(FaceRole::Source, 16, 16, [1, 2, 3]);
        let target = jpeg_upload(FaceRole::Target, 16, 16, [4, 5, 6]);

        let outcome = handler.handle(&mut SabotageBoth, request(Some(&source), Some(&target)));

        assert_eq!(outcome.state, RequestState::Success);
        match outcome.notices.as_slice() {
            [Notice::Warning(m)] => {
                assert!(m.starts_with("Failed to clean up temporary files"), "{m}");
                assert_eq!(m.matches("os error").count(), 2, "{m}");
            }
            other => panic!("expected one warning, got {other:?}"),
        }
    }

    #[test]
    fn test_result_cleanup_failure_keeps_download() {
        let tmp = tempfile::tempdir().unwrap();
        let area = StagingArea::new(tmp.path());
        let result_file = area.write("result", "jpg", b"jpeg bytes").unwrap();
        // A directory now sits at the result path; the written bytes stay readable.
        fs::remove_file(result_file.path()).unwrap();
        fs::create_dir(result_file.path()).unwrap();

        let mut notices = Vec::new();
        let download = read_back(result_file, &mut notices).unwrap();

        assert_eq!(download, b"jpeg bytes");
        assert!(matches!(
            notices.as_slice(),
            [Notice::Warning(m)] if m.starts_with("Failed to clean up temporary files")
        ));
    }

    #[test]
    fn test_result_file_is_removed_after_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let area = StagingArea::new(tmp.path());
        let result_file = area.write("result", "jpg", b"jpeg bytes").unwrap();

        let mut notices = Vec::new();
        assert_eq!(read_back(result_file, &mut notices).unwrap(), b"jpeg bytes");
        assert!(notices.is_empty());
        assert_eq!(entries(tmp.path()), 0);
    }

    #[test]
    fn test_jpeg_quality_is_clamped() {
        let handler = RequestHandler::new(StagingArea::system()).with_jpeg_quality(0);
        assert_eq!(handler.jpeg_quality, 1);
    }
}
