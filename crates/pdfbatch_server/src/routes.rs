use std::io;
use std::path::PathBuf;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use engine_logging::{engine_info, engine_warn};
use futures_util::StreamExt;
use pdfbatch_engine::{progress_feed, FeedEvent};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;

use crate::error::ApiError;
use crate::AppState;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/downloader/process", post(process))
        .route("/downloader/progress/{progress_id}", get(progress))
        .route("/downloader/download/{download_id}", get(download))
        .route("/downloader/cleanup", post(cleanup))
        .route("/downloader/batch/prepare", post(prepare))
        .route("/downloader/batch/merge", post(merge))
        .route("/downloader/batch/{session_id}/auto", post(auto_run))
        .route("/downloader/batch/{session_id}/{batch_number}", post(download_batch))
        .route("/downloader/sessions", get(list_sessions))
        .route("/downloader/sessions/{session_id}/reload", post(reload))
        .with_state(state)
}

#[derive(Serialize)]
struct Success<T> {
    success: bool,
    #[serde(flatten)]
    body: T,
}

fn success<T: Serialize>(body: T) -> Json<Success<T>> {
    Json(Success {
        success: true,
        body,
    })
}

#[derive(Debug, Deserialize)]
struct ProcessRequest {
    #[serde(default)]
    urls: Vec<String>,
}

async fn process(
    State(state): State<AppState>,
    Json(request): Json<ProcessRequest>,
) -> Result<Json<Success<Value>>, ApiError> {
    let progress_id = state.orchestrator.start_download(&request.urls)?;
    let total = state
        .orchestrator
        .progress()
        .get(&progress_id)
        .map(|record| record.total)
        .unwrap_or_default();
    engine_info!("Accepted one-shot download {} ({} urls)", progress_id, total);
    Ok(success(json!({ "progress_id": progress_id, "total": total })))
}

/// Server-sent progress snapshots until a terminal status.
async fn progress(
    State(state): State<AppState>,
    Path(progress_id): Path<String>,
) -> impl IntoResponse {
    let feed = progress_feed(
        state.orchestrator.progress().clone(),
        progress_id,
        state.progress_interval,
    );
    let events = feed.map(|event| match event {
        FeedEvent::Snapshot(record) => Event::default().json_data(record),
        FeedEvent::Heartbeat => Ok(Event::default().comment("heartbeat")),
        FeedEvent::NotFound => Event::default().json_data(json!({ "status": "not_found" })),
    });
    (
        [(header::CACHE_CONTROL, "no-cache"), (X_ACCEL_BUFFERING, "no")],
        Sse::new(events),
    )
}

/// Deletes a single-use archive once its response body is dropped.
struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.0) {
            if err.kind() != io::ErrorKind::NotFound {
                engine_warn!("Could not remove served archive {:?}: {}", self.0, err);
            }
        }
    }
}

async fn download(State(state): State<AppState>, Path(download_id): Path<String>) -> Response {
    let Some(artifact) = state.orchestrator.artifacts().checkout(&download_id) else {
        return (StatusCode::NOT_FOUND, "file not found").into_response();
    };
    let file = match tokio::fs::File::open(&artifact.path).await {
        Ok(file) => file,
        Err(err) => {
            engine_warn!("Archive {:?} for {} unavailable: {}", artifact.path, download_id, err);
            return (StatusCode::NOT_FOUND, "file not found").into_response();
        }
    };

    let cleanup = (!artifact.retain).then(|| RemoveOnDrop(artifact.path.clone()));
    let body = ReaderStream::new(file).map(move |chunk: io::Result<Bytes>| {
        let _cleanup = &cleanup;
        chunk
    });
    let headers = [
        (header::CONTENT_TYPE, "application/zip".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", artifact.filename),
        ),
    ];
    (headers, Body::from_stream(body)).into_response()
}

async fn cleanup(State(state): State<AppState>) -> Result<Json<Success<Value>>, ApiError> {
    let report = state.orchestrator.cleanup(state.cleanup_max_age)?;
    Ok(success(json!({
        "cleaned_count": report.temp_entries,
        "progress_records": report.progress_records,
        "task_failures": report.task_failures,
    })))
}

#[derive(Debug, Deserialize)]
struct PrepareRequest {
    #[serde(default)]
    urls: Vec<String>,
    batch_size: Option<usize>,
}

async fn prepare(
    State(state): State<AppState>,
    Json(request): Json<PrepareRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let descriptor = state
        .orchestrator
        .prepare(&request.urls, request.batch_size)?;
    Ok(success(descriptor.summary()))
}

async fn download_batch(
    State(state): State<AppState>,
    Path((session_id, batch_number)): Path<(String, usize)>,
) -> Result<Json<Success<Value>>, ApiError> {
    let progress_id = state
        .orchestrator
        .download_batch(&session_id, batch_number)?;
    Ok(success(json!({
        "progress_id": progress_id,
        "session_id": session_id,
        "batch_number": batch_number,
    })))
}

async fn auto_run(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Success<Value>>, ApiError> {
    let progress_id = state.orchestrator.auto_run(&session_id)?;
    Ok(success(json!({
        "progress_id": progress_id,
        "session_id": session_id,
    })))
}

async fn list_sessions(State(state): State<AppState>) -> Result<Json<Success<Value>>, ApiError> {
    let sessions = state.orchestrator.list_sessions()?;
    Ok(success(json!({ "sessions": sessions })))
}

async fn reload(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let descriptor = state.orchestrator.reload(&session_id)?;
    Ok(success(descriptor.summary()))
}

#[derive(Debug, Deserialize)]
struct MergeRequest {
    session_id: String,
    #[serde(default)]
    download_ids: Vec<String>,
}

async fn merge(
    State(state): State<AppState>,
    Json(request): Json<MergeRequest>,
) -> Result<Json<Success<Value>>, ApiError> {
    let merged = state
        .orchestrator
        .merge(&request.session_id, &request.download_ids)
        .await?;
    Ok(success(json!({
        "download_id": merged.download_id,
        "filename": merged.filename,
        "total_files": merged.total_files,
    })))
}
