use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use common_http_errors::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::accounting::AccountingRecord;
use crate::app_state::AppState;
use crate::principal::Principal;
use crate::queue::Job;
use crate::rate_limiter::BucketParams;
use crate::sse::UsageSniffer;

const STREAM_FORWARD_BUFFER: usize = 64;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    pub max_tokens: Option<i64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub stop: Option<Value>,
}

pub async fn list_models() -> Json<Value> {
    Json(serde_json::json!({
        "object": "list",
        "data": [{"id": "default", "object": "model"}],
    }))
}

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatCompletionRequest>,
) -> Response {
    match handle_chat_completions(state, headers, body).await {
        Ok(resp) => resp,
        Err(err) => err.into_response(),
    }
}

async fn handle_chat_completions(
    state: AppState,
    headers: HeaderMap,
    body: ChatCompletionRequest,
) -> ApiResult<Response> {
    let principal = resolve_principal(&state, &headers).await?;

    let bucket = BucketParams {
        rps: state.config.rate_limit_rps_default,
        burst: state.config.rate_limit_burst_default,
    };
    let allowed = state.rate_limiter.allow(&principal.key_id.to_string(), bucket).await;
    state.metrics.record_rate_check(&principal.key_id.to_string(), allowed);
    if !allowed {
        state.metrics.record_admission("rate_limited");
        return Err(ApiError::TooManyRequests {
            code: "rate_limited",
            trace_id: None,
            message: Some("Rate limit exceeded".into()),
        });
    }

    state.quota_guard.check(principal.organization_id).await?;

    let model = body.model.clone();
    let stream_requested = body.stream;
    let request_value = serde_json::to_value(&body).map_err(|err| ApiError::internal(err, None))?;

    let started = Instant::now();

    if stream_requested {
        let (job, chunk_rx) = Job::new_stream("/v1/chat/completions", request_value.clone(), principal.clone());
        state.queue.offer(job).map_err(|err| {
            state.metrics.record_admission("queue_full");
            err
        })?;
        state.metrics.record_admission("accepted");

        let sse_body = spawn_stream_forward(state, principal, model, request_value, started, chunk_rx);
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/event-stream")
            .header("cache-control", "no-cache")
            .header("connection", "keep-alive")
            .header("x-accel-buffering", "no")
            .body(sse_body)
            .map_err(|err| ApiError::internal(err, None))?);
    }

    let (job, result_rx) = Job::new_unary("/v1/chat/completions", request_value.clone(), principal.clone());
    state.queue.offer(job).map_err(|err| {
        state.metrics.record_admission("queue_full");
        err
    })?;
    state.metrics.record_admission("accepted");

    let outcome = tokio::time::timeout(state.config.unary_timeout, result_rx).await;
    let latency_ms = started.elapsed().as_millis() as i64;

    let outcome = match outcome {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => {
            return Err(ApiError::internal("dispatcher dropped job result channel", None));
        }
        Err(_) => {
            return Err(ApiError::GatewayTimeout { trace_id: None });
        }
    };

    match outcome {
        Ok(value) => {
            state.accounting.record(AccountingRecord {
                key_id: principal.key_id,
                organization_id: Some(principal.organization_id),
                owner_type: Some(principal.owner_type),
                owner_id: Some(principal.owner_id),
                user_id: principal.user_id,
                endpoint: "/v1/chat/completions".into(),
                model,
                request_body: request_value,
                response_body: Some(value.clone()),
                status_code: 200,
                error_message: None,
                latency_ms,
            }).await;
            Ok(Json(value).into_response())
        }
        Err(job_error) => {
            state.metrics.record_upstream_error(job_error.status_code);
            let message = job_error.message.clone();
            let status_code = job_error.status_code as i32;
            state.accounting.record(AccountingRecord {
                key_id: principal.key_id,
                organization_id: Some(principal.organization_id),
                owner_type: Some(principal.owner_type),
                owner_id: Some(principal.owner_id),
                user_id: principal.user_id,
                endpoint: "/v1/chat/completions".into(),
                model,
                request_body: request_value,
                response_body: None,
                status_code,
                error_message: Some(message),
                latency_ms,
            }).await;
            Err(job_error.into_api_error())
        }
    }
}

async fn resolve_principal(state: &AppState, headers: &HeaderMap) -> ApiResult<Principal> {
    let token = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    state.credential_store.resolve(token).await
}

/// Forwards dispatcher-produced SSE chunks to the client while sniffing the
/// trailing `usage` frame, recording accounting once the upstream stream
/// ends (mirrors the original's best-effort `finally` block: streamed
/// requests are billed on latency and sniffed usage, not a full response
/// body).
fn spawn_stream_forward(
    state: AppState,
    principal: Principal,
    model: Option<String>,
    request_value: Value,
    started: Instant,
    mut chunk_rx: mpsc::Receiver<Bytes>,
) -> Body {
    let (out_tx, out_rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(STREAM_FORWARD_BUFFER);

    tokio::spawn(async move {
        let mut sniffer = UsageSniffer::new();
        while let Some(chunk) = chunk_rx.recv().await {
            sniffer.feed(&chunk);
            if out_tx.send(Ok(chunk)).await.is_err() {
                break; // client disconnected
            }
        }

        let latency_ms = started.elapsed().as_millis() as i64;
        let usage_frame = sniffer.into_response_body();
        state
            .accounting
            .record(AccountingRecord {
                key_id: principal.key_id,
                organization_id: Some(principal.organization_id),
                owner_type: Some(principal.owner_type),
                owner_id: Some(principal.owner_id),
                user_id: principal.user_id,
                endpoint: "/v1/chat/completions".into(),
                model,
                request_body: request_value,
                response_body: usage_frame,
                status_code: 200,
                error_message: None,
                latency_ms,
            })
            .await;
    });

    Body::from_stream(ReceiverStream::new(out_rx))
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(resp) => resp,
        Err(err) => {
            warn!(?err, "failed to render metrics");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("metrics unavailable"))
                .expect("failed to build metrics error response")
        }
    }
}
