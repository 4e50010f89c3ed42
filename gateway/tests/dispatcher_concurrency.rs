use gateway::dispatcher::Dispatcher;
use gateway::metrics::GatewayMetrics;
use gateway::principal::{OwnerType, Principal};
use gateway::queue::{Job, JobQueue};
use gateway::upstream::UpstreamClient;
use httpmock::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn test_principal() -> Principal {
    Principal {
        key_id: Uuid::new_v4(),
        organization_id: Uuid::new_v4(),
        owner_type: OwnerType::User,
        owner_id: Uuid::new_v4(),
        user_id: None,
        role: "member".into(),
    }
}

/// Two jobs submitted back to back complete close together rather than one
/// waiting out the other's full upstream latency, proving the dispatcher
/// runs upstream calls for distinct jobs concurrently up to its semaphore
/// bound rather than serializing them behind a single worker.
#[tokio::test]
async fn concurrent_jobs_are_dispatched_in_parallel() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/chat/completions");
        then.status(200)
            .delay(Duration::from_millis(300))
            .json_body(serde_json::json!({"choices": [], "usage": {"total_tokens": 1}}));
    });

    let upstream = UpstreamClient::new(server.base_url(), Duration::from_secs(5));
    let metrics = Arc::new(GatewayMetrics::new().unwrap());
    let (queue, receiver) = JobQueue::bounded(8, metrics.clone());
    let dispatcher = Dispatcher::new(receiver, upstream, 4, metrics);
    let handle = dispatcher.spawn();

    let started = std::time::Instant::now();
    let mut receivers = Vec::new();
    for _ in 0..4 {
        let (job, rx) = Job::new_unary(
            "/v1/chat/completions",
            serde_json::json!({"model": "m"}),
            test_principal(),
        );
        queue.offer(job).unwrap();
        receivers.push(rx);
    }
    for rx in receivers {
        rx.await.unwrap().unwrap();
    }
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_millis(900),
        "expected concurrent dispatch well under 4x the per-job delay, took {elapsed:?}"
    );
    handle.shutdown().await;
}
