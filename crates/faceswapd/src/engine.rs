use faceswap_core::{FaceSwapper, Notice, RequestHandler, RequestOutcome, RequestState, SwapRequest, UploadedImage};
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Boxed swap backend owned by the engine thread.
pub type BoxedSwapper = Box<dyn FaceSwapper + Send>;

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Process {
        source: Option<UploadedImage>,
        target: Option<UploadedImage>,
        swap_requested: bool,
        reply: oneshot::Sender<RequestOutcome>,
    },
    Status {
        reply: oneshot::Sender<bool>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Run one request: stage, swap if requested, clean up.
    pub async fn process(
        &self,
        source: Option<UploadedImage>,
        target: Option<UploadedImage>,
        swap_requested: bool,
    ) -> Result<RequestOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Process {
                source,
                target,
                swap_requested,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Whether the swap backend has been constructed.
    pub async fn swapper_ready(&self) -> Result<bool, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the swap backend for the life of the process and
/// handles one request at a time, in arrival order.
pub fn spawn_engine(mut swapper: BoxedSwapper, handler: RequestHandler) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("faceswap-engine".into())
        .spawn(move || {
            tracing::info!(staging = %handler.staging().dir().display(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                // A panic drops this request's reply; the loop keeps serving.
                let served = panic::catch_unwind(AssertUnwindSafe(|| dispatch(&handler, &mut swapper, req)));
                if served.is_err() {
                    tracing::error!("engine request panicked");
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

fn dispatch(handler: &RequestHandler, swapper: &mut BoxedSwapper, req: EngineRequest) {
    match req {
        EngineRequest::Process {
            source,
            target,
            swap_requested,
            reply,
        } => {
            let request = SwapRequest {
                source: source.as_ref(),
                target: target.as_ref(),
                swap_requested,
            };
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(swapper, request)))
                .unwrap_or_else(|_| {
                    tracing::error!("request handler panicked");
                    RequestOutcome {
                        state: RequestState::Failed,
                        notices: vec![Notice::Error("Face swapping failed: internal error".to_string())],
                        output: None,
                    }
                });
            tracing::debug!(state = ?outcome.state, notices = outcome.notices.len(), "request finished");
            let _ = reply.send(outcome);
        }
        EngineRequest::Status { reply } => {
            let _ = reply.send(swapper.is_ready());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceswap_core::{ChannelOrder, PixelBuffer, StagingArea, SwapError};
    use std::path::Path;

    /// Swaps fine but panics when asked for readiness.
    struct PanicsOnStatus;

    impl FaceSwapper for PanicsOnStatus {
        fn swap(&mut self, _source: &Path, target: &Path) -> Result<PixelBuffer, SwapError> {
            Ok(PixelBuffer::open(target, ChannelOrder::Bgr)?)
        }

        fn is_ready(&self) -> bool {
            panic!("status exploded")
        }
    }

    #[tokio::test]
    async fn test_engine_survives_panicking_request() {
        let staging = tempfile::tempdir().unwrap();
        let handler = RequestHandler::new(StagingArea::new(staging.path()));
        let engine = spawn_engine(Box::new(PanicsOnStatus), handler).unwrap();

        assert!(matches!(engine.swapper_ready().await, Err(EngineError::ChannelClosed)));

        let outcome = engine.process(None, None, true).await.unwrap();
        assert_eq!(outcome.state, RequestState::AwaitingBothUploads);

        // Still answering after a second panic.
        assert!(engine.swapper_ready().await.is_err());
        let outcome = engine.process(None, None, false).await.unwrap();
        assert_eq!(outcome.state, RequestState::AwaitingBothUploads);
    }
}
