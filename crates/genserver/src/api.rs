use std::{convert::Infallible, time::Instant};

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderValue, StatusCode, Uri},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    batch::BatchOutcome,
    error::{AppResult, GenError},
    history::{HistoryRecord, HistoryStats, RecordKind, SaveOutcome, SaveReport},
    model::{AspectRatio, BatchProgress, CreateTaskParams, GeneratedImage, GenerationRequest},
    state::AppState,
    tasks::TaskView,
    validation::{is_video_credential_well_formed, GenerateParams},
};

const BODY_LIMIT_BYTES: usize = 500 * 1024 * 1024;

const ROUTES: &[&str] = &[
    "GET /health",
    "POST /generate",
    "POST /api/image/batch",
    "POST /api/image/batch/stream",
    "POST /api/video/generate",
    "GET /api/video/status/{task_id}",
    "DELETE /api/video/tasks/{task_id}",
    "POST /api/video/verify-key",
    "GET|POST|DELETE /api/history",
    "DELETE /api/history/{id}",
    "GET /api/history/stats",
];

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate_single))
        .route("/api/image/batch", post(generate_batch))
        .route("/api/image/batch/stream", post(generate_batch_stream))
        .route("/api/video/generate", post(create_video_task))
        .route("/api/video/status/{task_id}", get(video_status))
        .route("/api/video/tasks/{task_id}", delete(delete_video_task))
        .route("/api/video/verify-key", post(verify_video_key))
        .route(
            "/api/history",
            get(list_history).post(save_history).delete(clear_history),
        )
        .route("/api/history/stats", get(history_stats))
        .route("/api/history/{id}", delete(delete_history))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .layer(TraceLayer::new_for_http());

    match state.config.cors_origin.parse::<HeaderValue>() {
        Ok(origin) => {
            app = app.layer(
                CorsLayer::new()
                    .allow_origin(origin)
                    .allow_methods(tower_http::cors::Any)
                    .allow_headers(tower_http::cors::Any),
            );
        }
        Err(_) => {
            tracing::warn!(origin = %state.config.cors_origin, "invalid CORS_ORIGIN; CORS disabled");
        }
    }

    app.with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let ratios: Vec<&str> = AspectRatio::ALL.iter().map(|r| r.as_str()).collect();
    Json(serde_json::json!({
        "ok": true,
        "service": "genserver",
        "version": env!("CARGO_PKG_VERSION"),
        "config": {
            "maxReferenceImages": state.config.limits.max_reference_images,
            "minPromptLength": state.config.limits.min_prompt_length,
            "maxBatchSize": state.config.max_batch_size,
            "batchConcurrency": state.config.batch_concurrency,
            "supportedAspectRatios": ratios,
        },
        "activeTasks": state.tracker.len(),
    }))
}

async fn not_found(uri: Uri) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "ok": false,
            "error": "route not found",
            "path": uri.path(),
            "availableRoutes": ROUTES,
        })),
    )
        .into_response()
}

fn elapsed(start: Instant) -> String {
    format!("{:.2}s", start.elapsed().as_secs_f64())
}

async fn generate_single(
    State(state): State<AppState>,
    Json(params): Json<GenerateParams>,
) -> AppResult<Json<serde_json::Value>> {
    let start = Instant::now();
    let request = params.validate(&state.config.limits)?;
    let images = state.orchestrator.generator().invoke(&request).await?;

    Ok(Json(serde_json::json!({
        "ok": true,
        "data": images,
        "duration": elapsed(start),
        "metadata": request_metadata(&request, 1),
    })))
}

fn request_metadata(request: &GenerationRequest, count: usize) -> serde_json::Value {
    serde_json::json!({
        "prompt": request.prompt,
        "numImages": count,
        "numReferenceImages": request.reference_images.len(),
        "aspectRatio": request.aspect_ratio,
        "imageSize": request.image_size,
        "temperature": request.temperature,
    })
}

fn default_count() -> usize {
    1
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest {
    #[serde(flatten)]
    params: GenerateParams,
    #[serde(default = "default_count", alias = "count")]
    num_images: usize,
    #[serde(default)]
    save_history: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UnitFailure {
    reason: &'static str,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finish_code: Option<String>,
}

impl From<&GenError> for UnitFailure {
    fn from(err: &GenError) -> Self {
        Self {
            reason: err.reason(),
            error: err.to_string(),
            hint: err.hint(),
            finish_code: err.finish_code().map(str::to_string),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchResponse {
    ok: bool,
    batch_id: String,
    data: Vec<GeneratedImage>,
    progress: BatchProgress,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    snapshots: Vec<BatchProgress>,
    failures: Vec<UnitFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    history: Option<SaveReport>,
    duration: String,
    metadata: serde_json::Value,
}

/// Persist a settled batch (unless opted out) and shape the response.
async fn finish_batch(
    state: &AppState,
    request: &GenerationRequest,
    count: usize,
    save: bool,
    outcome: BatchOutcome,
    start: Instant,
) -> BatchResponse {
    let metadata = request_metadata(request, count);
    let history = if save {
        let id = state.history.next_id().await;
        let record = HistoryRecord {
            id,
            timestamp: id,
            kind: RecordKind::Image,
            prompt: request.prompt.clone(),
            images: outcome.images.clone(),
            video_url: None,
            params: metadata.clone(),
        };
        Some(state.history.save(&record).await.report())
    } else {
        None
    };

    BatchResponse {
        ok: true,
        batch_id: outcome.batch_id.to_string(),
        data: outcome.images,
        progress: outcome.progress,
        snapshots: Vec::new(),
        failures: outcome.failures.iter().map(UnitFailure::from).collect(),
        history,
        duration: elapsed(start),
        metadata,
    }
}

async fn generate_batch(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> AppResult<Json<BatchResponse>> {
    let start = Instant::now();
    let request = req.params.validate(&state.config.limits)?;
    let count = req.num_images;

    let mut snapshots = Vec::new();
    let outcome = state
        .orchestrator
        .generate_batch(request.clone(), count, |p| snapshots.push(p))
        .await?;

    let save = req.save_history.unwrap_or(true);
    let mut response = finish_batch(&state, &request, count, save, outcome, start).await;
    response.snapshots = snapshots;
    Ok(Json(response))
}

fn sse_event(name: &str, data: &impl Serialize) -> Event {
    Event::default()
        .event(name)
        .json_data(data)
        .unwrap_or_else(|_| Event::default().event("error").data("serialization failed"))
}

/// Same as [`generate_batch`], but emits a `progress` event per settled unit
/// followed by a final `done` or `error` event.
async fn generate_batch_stream(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let request = req.params.validate(&state.config.limits)?;
    let count = req.num_images;
    if count == 0 || count > state.config.max_batch_size {
        return Err(GenError::validation(format!(
            "batch size must be between 1 and {}",
            state.config.max_batch_size
        ))
        .into());
    }
    let save = req.save_history.unwrap_or(true);

    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    tokio::spawn(async move {
        let start = Instant::now();
        let progress_tx = tx.clone();
        let result = state
            .orchestrator
            .generate_batch(request.clone(), count, move |p| {
                let _ = progress_tx.send(sse_event("progress", &p));
            })
            .await;

        let last = match result {
            Ok(outcome) => {
                let response = finish_batch(&state, &request, count, save, outcome, start).await;
                sse_event("done", &response)
            }
            Err(err) => sse_event("error", &UnitFailure::from(&err)),
        };
        let _ = tx.send(last);
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok::<_, Infallible>(event), rx))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn create_video_task(
    State(state): State<AppState>,
    Json(params): Json<CreateTaskParams>,
) -> AppResult<Json<serde_json::Value>> {
    let task_id = state.tracker.create_task(&params).await?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "taskId": task_id,
        "status": "processing",
        "message": "video generation task created",
    })))
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    view: TaskView,
    #[serde(skip_serializing_if = "Option::is_none")]
    history: Option<SaveReport>,
}

async fn video_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Json<StatusResponse>> {
    let polled = state.tracker.poll_status(&task_id).await?;

    let history = if polled.just_completed {
        let id = state.history.next_id().await;
        let record = HistoryRecord {
            id,
            timestamp: id,
            kind: RecordKind::Video,
            prompt: polled.prompt.clone(),
            images: Vec::new(),
            video_url: polled.view.result_url.clone(),
            params: serde_json::json!({ "model": polled.model, "taskId": task_id }),
        };
        Some(state.history.save(&record).await.report())
    } else {
        None
    };

    Ok(Json(StatusResponse {
        view: polled.view,
        history,
    }))
}

async fn delete_video_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    if !state.tracker.remove(&task_id) {
        return Err(GenError::NotFound(task_id).into());
    }
    tracing::info!(%task_id, "video task deleted by client");
    Ok(Json(serde_json::json!({ "ok": true, "taskId": task_id })))
}

#[derive(Deserialize)]
struct VerifyKeyRequest {
    #[serde(rename = "apiKey", default)]
    credential: Option<String>,
}

async fn verify_video_key(Json(req): Json<VerifyKeyRequest>) -> AppResult<Json<serde_json::Value>> {
    let credential = req
        .credential
        .filter(|c| !c.is_empty())
        .ok_or_else(|| GenError::validation("API key is required"))?;

    let valid = is_video_credential_well_formed(&credential);
    let message = if valid {
        "API key format looks valid"
    } else {
        "API key format is invalid"
    };
    Ok(Json(serde_json::json!({ "valid": valid, "message": message })))
}

async fn list_history(State(state): State<AppState>) -> AppResult<Json<Vec<HistoryRecord>>> {
    Ok(Json(state.history.get_all().await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewHistoryRecord {
    kind: RecordKind,
    prompt: String,
    #[serde(default)]
    images: Vec<GeneratedImage>,
    #[serde(default)]
    video_url: Option<String>,
    #[serde(default)]
    params: serde_json::Value,
}

async fn save_history(
    State(state): State<AppState>,
    Json(req): Json<NewHistoryRecord>,
) -> Response {
    let id = state.history.next_id().await;
    let record = HistoryRecord {
        id,
        timestamp: id,
        kind: req.kind,
        prompt: req.prompt,
        images: req.images,
        video_url: req.video_url,
        params: req.params,
    };

    let outcome = state.history.save(&record).await;
    let status = match &outcome {
        SaveOutcome::Saved { .. } => StatusCode::OK,
        SaveOutcome::Failed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::INSUFFICIENT_STORAGE,
    };
    let mut body = serde_json::to_value(outcome.report()).unwrap_or_default();
    body["id"] = id.into();
    (status, Json(body)).into_response()
}

async fn delete_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<Json<serde_json::Value>> {
    let deleted = state.history.delete_one(id).await?;
    Ok(Json(serde_json::json!({ "ok": true, "deleted": deleted })))
}

async fn clear_history(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let removed = state.history.clear_all().await?;
    tracing::info!(removed, "history cleared");
    Ok(Json(serde_json::json!({ "ok": true, "removed": removed })))
}

async fn history_stats(State(state): State<AppState>) -> AppResult<Json<HistoryStats>> {
    Ok(Json(state.history.stats().await?))
}
