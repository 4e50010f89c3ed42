use axum::body::to_bytes;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use common_http_errors::ApiError;

#[tokio::test]
async fn api_error_bad_request_shape() {
    let err = ApiError::BadRequest {
        code: "invalid_model",
        trace_id: None,
        message: Some("Unknown model".into()),
    };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let header = resp.headers().get("X-Error-Code").unwrap();
    assert_eq!(header, "invalid_model");
    let bytes = to_bytes(resp.into_body(), 1024).await.unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(body.contains("\"detail\":\"Unknown model\""));
}

#[tokio::test]
async fn api_error_internal_shape() {
    let err = ApiError::Internal { trace_id: None, message: Some("dispatcher panicked".into()) };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let header = resp.headers().get("X-Error-Code").unwrap();
    assert_eq!(header, "internal_error");
    let bytes = to_bytes(resp.into_body(), 1024).await.unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(body.contains("\"detail\":\"dispatcher panicked\""));
}

#[tokio::test]
async fn api_error_service_unavailable_shape() {
    let err = ApiError::ServiceUnavailable { trace_id: None, message: Some("queue is full".into()) };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let header = resp.headers().get("X-Error-Code").unwrap();
    assert_eq!(header, "queue_full");
    let bytes = to_bytes(resp.into_body(), 1024).await.unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(body.contains("\"detail\":\"queue is full\""));
}

#[tokio::test]
async fn api_error_too_many_requests_shape() {
    let err = ApiError::TooManyRequests {
        code: "rate_limited",
        trace_id: None,
        message: Some("too many requests".into()),
    };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "rate_limited");
}

#[tokio::test]
async fn api_error_upstream_shape_propagates_status() {
    let err = ApiError::Upstream { status: 422, trace_id: None, message: Some("bad prompt".into()) };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "upstream_error");
}
