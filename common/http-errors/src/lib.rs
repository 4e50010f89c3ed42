use axum::{
    body::Body,
    extract::Request,
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use once_cell::sync::Lazy;
use prometheus::{IntCounterVec, IntGauge, Opts, Registry};
use serde::Serialize;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Mutex;
use uuid::Uuid;

/// Maximum number of distinct error codes tracked before the cardinality
/// guard collapses further codes into `"other"`.
const MAX_ERROR_CODES: usize = 40;

#[derive(Serialize, Debug)]
struct ErrorBody {
    detail: String,
}

/// The gateway's error taxonomy. Every variant maps to exactly one HTTP
/// status and one `X-Error-Code` label.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized { trace_id: Option<Uuid> },
    Forbidden { trace_id: Option<Uuid> },
    ForbiddenMissingRole { role: &'static str, trace_id: Option<Uuid> },
    TooManyRequests { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    BadRequest { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    Conflict { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    NotFound { code: &'static str, trace_id: Option<Uuid> },
    GatewayTimeout { trace_id: Option<Uuid> },
    BadGateway { trace_id: Option<Uuid>, message: Option<String> },
    /// Status propagated verbatim from the upstream inference server.
    Upstream { status: u16, trace_id: Option<Uuid>, message: Option<String> },
    ServiceUnavailable { trace_id: Option<Uuid>, message: Option<String> },
    Internal { trace_id: Option<Uuid>, message: Option<String> },
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(e: E, trace_id: Option<Uuid>) -> Self {
        Self::Internal { trace_id, message: Some(e.to_string()) }
    }

    pub fn bad_request(code: &'static str, trace_id: Option<Uuid>) -> Self {
        Self::BadRequest { code, trace_id, message: None }
    }

    fn parts(&self) -> (StatusCode, String, String) {
        match self {
            ApiError::Unauthorized { .. } => (
                StatusCode::UNAUTHORIZED,
                "unauthorized".into(),
                "Invalid or missing credential".into(),
            ),
            ApiError::Forbidden { .. } => {
                (StatusCode::FORBIDDEN, "forbidden".into(), "Forbidden".into())
            }
            ApiError::ForbiddenMissingRole { .. } => (
                StatusCode::FORBIDDEN,
                "missing_role".into(),
                "Missing required role".into(),
            ),
            ApiError::TooManyRequests { code, message, .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                code.to_string(),
                message.clone().unwrap_or_else(|| "Rate limit exceeded".into()),
            ),
            ApiError::BadRequest { code, message, .. } => (
                StatusCode::BAD_REQUEST,
                code.to_string(),
                message.clone().unwrap_or_else(|| "Bad request".into()),
            ),
            ApiError::Conflict { code, message, .. } => (
                StatusCode::CONFLICT,
                code.to_string(),
                message.clone().unwrap_or_else(|| "Conflict".into()),
            ),
            ApiError::NotFound { code, .. } => {
                (StatusCode::NOT_FOUND, code.to_string(), "Not found".into())
            }
            ApiError::GatewayTimeout { .. } => (
                StatusCode::GATEWAY_TIMEOUT,
                "gateway_timeout".into(),
                "Upstream timeout".into(),
            ),
            ApiError::BadGateway { message, .. } => (
                StatusCode::BAD_GATEWAY,
                "bad_gateway".into(),
                message.clone().unwrap_or_else(|| "Upstream call failed".into()),
            ),
            ApiError::Upstream { status, message, .. } => {
                let code = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
                (
                    code,
                    "upstream_error".into(),
                    message.clone().unwrap_or_else(|| "Upstream error".into()),
                )
            }
            ApiError::ServiceUnavailable { message, .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "queue_full".into(),
                message.clone().unwrap_or_else(|| "Service unavailable".into()),
            ),
            ApiError::Internal { message, .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error".into(),
                message.clone().unwrap_or_else(|| "Internal error".into()),
            ),
        }
    }

    fn trace_id(&self) -> Option<Uuid> {
        match self {
            ApiError::Unauthorized { trace_id }
            | ApiError::Forbidden { trace_id }
            | ApiError::ForbiddenMissingRole { trace_id, .. }
            | ApiError::TooManyRequests { trace_id, .. }
            | ApiError::BadRequest { trace_id, .. }
            | ApiError::Conflict { trace_id, .. }
            | ApiError::NotFound { trace_id, .. }
            | ApiError::GatewayTimeout { trace_id }
            | ApiError::BadGateway { trace_id, .. }
            | ApiError::Upstream { trace_id, .. }
            | ApiError::ServiceUnavailable { trace_id, .. }
            | ApiError::Internal { trace_id, .. } => *trace_id,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, detail) = self.parts();
        let trace_id = self.trace_id();
        let mut resp = (status, Json(ErrorBody { detail })).into_response();
        if let Ok(val) = HeaderValue::from_str(&error_code) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        if let Some(trace) = trace_id {
            if let Ok(val) = HeaderValue::from_str(&trace.to_string()) {
                resp.headers_mut().insert("X-Trace-Id", val);
            }
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Process-wide registry backing [`http_error_metrics_layer`]. The registry
/// is global so every service binary shares one label space; each binary
/// registers it into its own `prometheus::Registry` at startup via
/// [`register_http_error_metrics`] so it rides along on the existing
/// `/metrics` scrape.
static HTTP_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("http_errors_total", "Count of HTTP error responses emitted (status >= 400)"),
        &["service", "code", "status"],
    )
    .expect("valid http_errors_total metric")
});

static DISTINCT_ERROR_CODES_GAUGE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("http_error_codes_distinct", "Distinct error codes observed (capped)")
        .expect("valid http_error_codes_distinct metric")
});

static ERROR_CODE_OVERFLOW_TOTAL: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "http_error_codes_overflow_total",
        "Count of error-code observations collapsed into 'other' once the cardinality guard is hit",
    )
    .expect("valid http_error_codes_overflow_total metric")
});

static SEEN_ERROR_CODES: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Registers the shared HTTP-error metrics into a service's own registry.
/// Call once at startup, the same way a service registers its other metric
/// families.
pub fn register_http_error_metrics(registry: &Registry) -> prometheus::Result<()> {
    registry.register(Box::new(HTTP_ERRORS_TOTAL.clone()))?;
    registry.register(Box::new(DISTINCT_ERROR_CODES_GAUGE.clone()))?;
    registry.register(Box::new(ERROR_CODE_OVERFLOW_TOTAL.clone()))?;
    Ok(())
}

/// Records one observation of an error code, collapsing beyond
/// [`MAX_ERROR_CODES`] distinct codes to bound label cardinality.
fn record_error_code(service: &str, code: &str, status: u16) {
    let label_code = {
        let mut seen = SEEN_ERROR_CODES.lock().expect("error code set poisoned");
        if seen.contains(code) {
            code.to_string()
        } else if seen.len() < MAX_ERROR_CODES {
            seen.insert(code.to_string());
            DISTINCT_ERROR_CODES_GAUGE.set(seen.len() as i64);
            code.to_string()
        } else {
            ERROR_CODE_OVERFLOW_TOTAL.inc();
            "other".to_string()
        }
    };
    HTTP_ERRORS_TOTAL
        .with_label_values(&[service, &label_code, &status.to_string()])
        .inc();
}

/// Axum middleware that increments `http_errors_total{service,code,status}`
/// for every response with `status >= 400`, reading the code back off the
/// `X-Error-Code` header set by [`ApiError::into_response`]. Generalizes the
/// per-service inline error-metrics middleware into one shared layer so
/// every binary doesn't hand-roll its own label bookkeeping.
pub fn http_error_metrics_layer(
    service: &'static str,
) -> impl Fn(Request<Body>, Next) -> Pin<Box<dyn std::future::Future<Output = Response> + Send>> + Clone {
    move |req: Request<Body>, next: Next| {
        Box::pin(async move {
            let resp = next.run(req).await;
            let status = resp.status();
            if status.as_u16() >= 400 {
                let code = resp
                    .headers()
                    .get("X-Error-Code")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown")
                    .to_string();
                record_error_code(service, &code, status.as_u16());
            }
            resp
        })
    }
}

/// Test-only helpers exercising the cardinality guard without routing a full
/// axum app through it.
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use super::*;

    pub fn simulate_error_code(code: &str) {
        record_error_code("test-svc", code, 400);
    }

    pub fn distinct_gauge() -> i64 {
        DISTINCT_ERROR_CODES_GAUGE.get()
    }

    pub fn overflow_count() -> i64 {
        ERROR_CODE_OVERFLOW_TOTAL.get()
    }
}
