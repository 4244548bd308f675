//! HTTP API: enrollment upload, operator view and health.

use crate::engine::EngineHandle;
use crate::enroll::{self, EnrollError, EnrollOutcome, StatusBody, UploadRequest};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use image::GrayImage;
use rollcall_core::{Gesture, GridLayout};
use rollcall_store::SqliteStore;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    /// `None` when the database could not be opened at startup.
    pub store: Option<SqliteStore>,
    pub gestures: mpsc::Sender<Gesture>,
    pub view: watch::Receiver<Option<Arc<GrayImage>>>,
    pub layout: GridLayout,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/upload", post(upload))
        .route("/view", get(view))
        .route("/view/select", post(select))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn upload(
    State(state): State<AppState>,
    payload: Result<Json<UploadRequest>, JsonRejection>,
) -> Result<Json<StatusBody>, EnrollError> {
    // A body that is not JSON at all is reported like an empty one.
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "upload body rejected");
            UploadRequest::default()
        }
    };
    let enrollment = request.validate()?;
    let store = state.store.as_ref().ok_or(EnrollError::StoreUnavailable)?;

    let message = match enroll::enroll(&state.engine, store, enrollment).await? {
        EnrollOutcome::Enrolled => "enrolled",
        EnrollOutcome::AlreadyEnrolled => "already enrolled",
    };
    Ok(Json(StatusBody {
        status: "success".to_string(),
        message: message.to_string(),
    }))
}

/// Either a cell index or a point on the mosaic.
#[derive(Debug, Deserialize)]
struct SelectRequest {
    cell: Option<usize>,
    x: Option<u32>,
    y: Option<u32>,
}

async fn select(State(state): State<AppState>, payload: Result<Json<SelectRequest>, JsonRejection>) -> Response {
    let Ok(Json(request)) = payload else {
        return error(StatusCode::BAD_REQUEST, "expected {\"cell\"} or {\"x\", \"y\"}");
    };
    let cell = match request {
        SelectRequest { cell: Some(cell), .. } => Some(cell),
        SelectRequest { x: Some(x), y: Some(y), .. } => state.layout.cell_at(x, y),
        _ => return error(StatusCode::BAD_REQUEST, "expected {\"cell\"} or {\"x\", \"y\"}"),
    };

    let gesture = Gesture::Select { cell, at: Instant::now() };
    match state.gestures.try_send(gesture) {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({ "status": "queued", "cell": cell }))).into_response(),
        Err(mpsc::error::TrySendError::Full(_)) => error(StatusCode::TOO_MANY_REQUESTS, "too many pending gestures"),
        Err(mpsc::error::TrySendError::Closed(_)) => error(StatusCode::SERVICE_UNAVAILABLE, "monitor is not running"),
    }
}

/// The latest rendered mosaic as PNG.
async fn view(State(state): State<AppState>) -> Response {
    let Some(frame) = state.view.borrow().clone() else {
        return error(StatusCode::SERVICE_UNAVAILABLE, "no frame rendered yet");
    };
    match enroll::encode_png(&frame) {
        Ok(png) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "could not encode view");
            error(StatusCode::INTERNAL_SERVER_ERROR, "could not encode view")
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "store": state.store.is_some(),
        "cameras": state.layout.cameras,
    }))
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "status": "error", "message": message }))).into_response()
}
