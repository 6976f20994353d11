//! HTTP routes: the upload page, a binary swap API and a health probe.

use crate::engine::{EngineError, EngineHandle};
use crate::page::{PageView, Pages, Previews};
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use faceswap_core::{FaceRole, Notice, RequestState, UploadError, UploadedImage};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    engine: EngineHandle,
    pages: Arc<Pages>,
}

impl AppState {
    pub fn new(engine: EngineHandle, pages: Pages) -> Self {
        Self {
            engine,
            pages: Arc::new(pages),
        }
    }
}

#[derive(Error, Debug)]
pub enum WebError {
    #[error("invalid upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("failed to render page: {0}")]
    Render(#[from] minijinja::Error),
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebError::Multipart(e) => e.status(),
            WebError::Engine(_) => StatusCode::SERVICE_UNAVAILABLE,
            WebError::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index).post(submit))
        .route("/api/swap", post(api_swap))
        .route("/healthz", get(healthz))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Parsed form fields of one submission.
#[derive(Default)]
struct Submission {
    source: Option<UploadedImage>,
    target: Option<UploadedImage>,
    swap_requested: bool,
    rejected: Vec<UploadError>,
}

async fn read_submission(mut multipart: Multipart) -> Result<Submission, WebError> {
    let mut submission = Submission::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        let role = match name.as_str() {
            "source" => FaceRole::Source,
            "target" => FaceRole::Target,
            "action" => {
                submission.swap_requested = field.text().await?.trim() == "swap";
                continue;
            }
            _ => {
                tracing::debug!(field = %name, "ignoring unknown form field");
                continue;
            }
        };

        let file_name = field.file_name().filter(|n| !n.is_empty()).map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await?;

        // Browsers send an empty, unnamed part for a file input left blank.
        if bytes.is_empty() && file_name.is_none() {
            continue;
        }

        match UploadedImage::from_upload(role, file_name, content_type.as_deref(), bytes.to_vec()) {
            Ok(image) => match role {
                FaceRole::Source => submission.source = Some(image),
                FaceRole::Target => submission.target = Some(image),
            },
            Err(err) => {
                tracing::info!(error = %err, "upload rejected");
                submission.rejected.push(err);
            }
        }
    }

    Ok(submission)
}

async fn index(State(state): State<AppState>) -> Result<Html<String>, WebError> {
    Ok(Html(state.pages.render(&PageView::landing())?))
}

/// Form post from the page; re-renders the page with the outcome.
async fn submit(State(state): State<AppState>, multipart: Multipart) -> Result<Html<String>, WebError> {
    let submission = read_submission(multipart).await?;

    if !submission.rejected.is_empty() {
        let view = PageView {
            notices: submission
                .rejected
                .iter()
                .map(|e| Notice::Error(e.to_string()))
                .collect(),
            ..PageView::default()
        };
        return Ok(Html(state.pages.render(&view)?));
    }

    let previews = Previews::of(submission.source.as_ref(), submission.target.as_ref());
    let outcome = state
        .engine
        .process(submission.source, submission.target, submission.swap_requested)
        .await?;

    Ok(Html(state.pages.render(&PageView::from_outcome(outcome, previews))?))
}

#[derive(Serialize)]
struct ApiFailure {
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<RequestState>,
    notices: Vec<Notice>,
}

/// Always swaps; answers with the JPEG as an attachment.
async fn api_swap(State(state): State<AppState>, multipart: Multipart) -> Result<Response, WebError> {
    let submission = read_submission(multipart).await?;

    if !submission.rejected.is_empty() {
        let body = ApiFailure {
            state: None,
            notices: submission
                .rejected
                .iter()
                .map(|e| Notice::Error(e.to_string()))
                .collect(),
        };
        return Ok((StatusCode::UNSUPPORTED_MEDIA_TYPE, Json(body)).into_response());
    }

    let outcome = state.engine.process(submission.source, submission.target, true).await?;

    match outcome.output {
        Some(output) => Ok((
            [
                (header::CONTENT_TYPE, "image/jpeg".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", output.file_name),
                ),
            ],
            output.jpeg,
        )
            .into_response()),
        None => {
            let status = match outcome.state {
                RequestState::AwaitingBothUploads => StatusCode::BAD_REQUEST,
                _ => StatusCode::UNPROCESSABLE_ENTITY,
            };
            let body = ApiFailure {
                state: Some(outcome.state),
                notices: outcome.notices,
            };
            Ok((status, Json(body)).into_response())
        }
    }
}

async fn healthz(State(state): State<AppState>) -> Result<Json<serde_json::Value>, WebError> {
    let ready = state.engine.swapper_ready().await?;
    Ok(Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "swapper_ready": ready,
    })))
}
