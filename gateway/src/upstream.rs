use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;

use crate::queue::JobError;

/// Typed upstream failure, carrying enough to classify the response back
/// into the taxonomy's `Upstream status` bucket.
#[derive(Debug, Clone)]
pub struct UpstreamHttpError {
    pub status_code: u16,
    pub message: String,
}

/// Thin client over the OpenAI-compatible upstream inference server.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self { http: reqwest::Client::new(), base_url: base_url.into(), timeout }
    }

    /// Unary chat completion. The `stream` key is stripped from the body
    /// before forwarding, matching the original client's behavior of never
    /// trusting the caller's own streaming flag on this code path.
    pub async fn chat_completions(&self, mut body: Value) -> Result<Value, JobError> {
        strip_stream_flag(&mut body);
        let resp = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| JobError { status_code: 502, message: format!("request error: {err}") })?;

        if resp.status().as_u16() >= 400 {
            let status = resp.status().as_u16();
            let message = extract_error_message(resp).await;
            return Err(JobError { status_code: status, message });
        }

        resp.json::<Value>().await.map_err(|err| JobError {
            status_code: 502,
            message: format!("invalid upstream response: {err}"),
        })
    }

    /// Streaming chat completion. On success, returns the raw byte stream
    /// exactly as the upstream frames it (no read timeout, since the caller
    /// enforces liveness via client disconnect / shutdown). On an upstream
    /// error status, returns a single terminal SSE error frame instead of a
    /// stream.
    pub async fn stream_chat_completions(&self, mut body: Value) -> StreamOutcome {
        body["stream"] = Value::Bool(true);
        let resp = match self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => return StreamOutcome::Error(sse_error_frame(502, &err.to_string())),
        };

        if resp.status().as_u16() >= 400 {
            let status = resp.status().as_u16();
            let message = extract_error_message(resp).await;
            return StreamOutcome::Error(sse_error_frame(status, &message));
        }

        StreamOutcome::Ok(resp.bytes_stream().boxed())
    }
}

pub enum StreamOutcome {
    Ok(BoxStream<'static, reqwest::Result<Bytes>>),
    Error(Bytes),
}

fn strip_stream_flag(body: &mut Value) {
    if let Value::Object(map) = body {
        map.remove("stream");
    }
}

async fn extract_error_message(resp: reqwest::Response) -> String {
    match resp.json::<Value>().await {
        Ok(parsed) => parsed
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| "upstream error".to_string()),
        Err(_) => "upstream error".to_string(),
    }
}

pub fn sse_error_frame(status: u16, message: &str) -> Bytes {
    let payload = serde_json::json!({ "status": status, "message": message });
    Bytes::from(format!("event: error\ndata: {payload}\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn unary_success_returns_parsed_json() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .json_body(serde_json::json!({"choices": [], "usage": {"total_tokens": 3}}));
        });
        let client = UpstreamClient::new(server.base_url(), Duration::from_secs(5));
        let result = client.chat_completions(serde_json::json!({"model": "m"})).await.unwrap();
        assert_eq!(result["usage"]["total_tokens"], 3);
    }

    #[tokio::test]
    async fn unary_error_status_parses_message() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(500).json_body(serde_json::json!({"error": {"message": "boom"}}));
        });
        let client = UpstreamClient::new(server.base_url(), Duration::from_secs(5));
        let err = client.chat_completions(serde_json::json!({"model": "m"})).await.unwrap_err();
        assert_eq!(err.status_code, 500);
        assert_eq!(err.message, "boom");
    }

    #[tokio::test]
    async fn stream_error_status_yields_terminal_frame() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(429).json_body(serde_json::json!({"error": {"message": "slow down"}}));
        });
        let client = UpstreamClient::new(server.base_url(), Duration::from_secs(5));
        match client.stream_chat_completions(serde_json::json!({"model": "m"})).await {
            StreamOutcome::Error(bytes) => {
                let text = String::from_utf8(bytes.to_vec()).unwrap();
                assert!(text.starts_with("event: error\n"));
                assert!(text.contains("slow down"));
            }
            StreamOutcome::Ok(_) => panic!("expected error outcome"),
        }
    }
}
