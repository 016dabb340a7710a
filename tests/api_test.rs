//! HTTP trigger endpoint tests against a live server on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use mailpump::api::handlers::{ErrorResponse, HealthResponse, ProcessResponse};
use mailpump::api::{self, AppState};
use mailpump::engine::{FetchStrategy, Pipeline, PipelineConfig};
use mailpump::model::Status;
use mailpump::ratelimit::Unlimited;
use mailpump::store::MemoryStore;
use tokio::net::TcpListener;

struct TestServer {
    base: String,
    state: Arc<AppState>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.state.shutdown.cancel();
    }
}

async fn spawn_server(store: Arc<MemoryStore>, run_timeout: Option<Duration>) -> TestServer {
    let config = PipelineConfig {
        strategy: FetchStrategy::Streaming,
        batch_size: 10,
        worker_count: 4,
        queue_capacity: 8,
        send_delay: Duration::ZERO,
        lease_timeout: None,
    };
    let pipeline = Pipeline::new(store, Arc::new(Unlimited), config);
    let state = Arc::new(AppState::new(pipeline, run_timeout));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(api::serve(listener, state.clone()));

    TestServer {
        base: format!("http://{addr}"),
        state,
    }
}

#[tokio::test]
async fn process_reports_processed_count() {
    let store = Arc::new(MemoryStore::with_pending(15));
    let server = spawn_server(store.clone(), None).await;

    let resp = reqwest::get(format!("{}/process", server.base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: ProcessResponse = resp.json().await.unwrap();

    assert_eq!(body.status, "emails processed");
    assert_eq!(body.count, 15);
    assert!(body.message.is_none());
    assert_eq!(store.count_with_status(Status::Sent), 15);
}

#[tokio::test]
async fn process_accepts_post_and_empty_backlog() {
    let store = Arc::new(MemoryStore::new());
    let server = spawn_server(store, None).await;

    let client = reqwest::Client::new();
    for _ in 0..2 {
        let resp = client
            .post(format!("{}/process", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "emails processed");
        assert_eq!(body["count"], 0);
        assert!(body.get("message").is_none());
    }
}

#[tokio::test]
async fn failure_before_dispatch_is_a_client_error() {
    let store = Arc::new(MemoryStore::with_pending(5));
    store.fail_fetches_from(1);
    let server = spawn_server(store, None).await;

    let resp = reqwest::get(format!("{}/process", server.base)).await.unwrap();
    assert_eq!(resp.status(), 400);
    let body: ErrorResponse = resp.json().await.unwrap();
    assert_eq!(body.error, "internal");
    assert!(body.message.contains("injected fetch failure"));
}

#[tokio::test]
async fn failure_after_dispatch_reports_partial_count() {
    let store = Arc::new(MemoryStore::with_pending(25));
    store.fail_fetches_from(2);
    let server = spawn_server(store, None).await;

    let resp = reqwest::get(format!("{}/process", server.base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: ProcessResponse = resp.json().await.unwrap();
    assert_eq!(body.status, "emails partially processed");
    assert_eq!(body.count, 10);
    assert!(body.message.is_some());
}

#[tokio::test]
async fn health_reports_ok() {
    let server = spawn_server(Arc::new(MemoryStore::new()), None).await;

    let resp = reqwest::get(format!("{}/healthz", server.base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: HealthResponse = resp.json().await.unwrap();
    assert_eq!(body.status, "ok");
}

#[tokio::test]
async fn unknown_route_is_not_found() {
    let server = spawn_server(Arc::new(MemoryStore::new()), None).await;

    let resp = reqwest::get(format!("{}/nope", server.base)).await.unwrap();
    assert_eq!(resp.status(), 404);
}
