mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{test_settings, MockEngine, MockLauncher};
use scan_relay::server::{self, router, AppState};
use scan_relay::store::MemorySessionStore;
use scan_relay::{ClientPool, JobMonitor};

fn app_with(launcher: Arc<MockLauncher>) -> Router {
    let settings = test_settings();
    let pool = Arc::new(ClientPool::new(launcher, settings.ports));
    let sessions = Arc::new(MemorySessionStore::new());
    let monitor = JobMonitor::new(pool, sessions.clone(), settings);
    router(AppState::new(monitor, sessions))
}

fn app() -> Router {
    app_with(MockLauncher::new(MockEngine::new()))
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn start_spider(app: &Router) -> Value {
    let resp = app
        .clone()
        .oneshot(post_json(
            "/api/scans",
            json!({ "url": "http://t/", "scan": { "mode": "spider" } }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    json_body(resp).await
}

#[tokio::test]
async fn start_creates_a_running_session() {
    let app = app();
    let started = start_spider(&app).await;
    assert_eq!(started["mode"], "spider");
    assert_eq!(started["job_id"], "1");

    let session = started["session"].as_str().unwrap();
    let resp = app
        .clone()
        .oneshot(
            Request::get(format!("/api/sessions/{session}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["session"]["status"]["state"], "running");
    assert_eq!(body["session"]["url"], "http://t/");
    assert_eq!(body["full_results"], json!([]));
}

#[tokio::test]
async fn invalid_url_is_rejected() {
    for url in ["not a url", "ftp://t/"] {
        let resp = app()
            .oneshot(post_json(
                "/api/scans",
                json!({ "url": url, "scan": { "mode": "spider" } }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn failed_start_is_a_bad_gateway() {
    let app = app_with(MockLauncher::failing(MockEngine::new()));
    let resp = app
        .oneshot(post_json(
            "/api/scans",
            json!({ "url": "http://t/", "scan": { "mode": "browser_crawl" } }),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn events_stream_starts_with_latest_status() {
    let app = app();
    let started = start_spider(&app).await;
    let uri = format!(
        "/api/scans/{}/{}/events",
        started["client_id"].as_str().unwrap(),
        started["job_id"].as_str().unwrap()
    );
    let resp = app
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/event-stream");

    let mut body = resp.into_body();
    let frame = body.frame().await.unwrap().unwrap();
    let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
    assert!(text.contains("event: status"));
    assert!(text.contains(r#""kind":"progress""#));
    assert!(text.contains(r#""percent":0"#));
}

#[tokio::test]
async fn unknown_jobs_are_not_found() {
    let app = app();
    let client = scan_relay::types::ClientId::new();
    for (method, path) in [
        ("GET", "events"),
        ("POST", "stop"),
        ("GET", "results"),
    ] {
        let req = Request::builder()
            .method(method)
            .uri(format!("/api/scans/{client}/1/{path}"))
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{method} {path}");
    }

    let resp = app
        .oneshot(
            Request::get("/api/scans/not-a-uuid/1/events")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn results_and_stop_for_running_job() {
    let app = app();
    let started = start_spider(&app).await;
    let base = format!(
        "/api/scans/{}/{}",
        started["client_id"].as_str().unwrap(),
        started["job_id"].as_str().unwrap()
    );

    let resp = app
        .clone()
        .oneshot(
            Request::get(format!("{base}/results?offset=1"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await, json!(["http://t/b", "http://t/c"]));

    let resp = app
        .clone()
        .oneshot(Request::post(format!("{base}/stop")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn shutdown_closes_event_streams_and_releases_clients() {
    let settings = test_settings();
    let pool = Arc::new(ClientPool::new(
        MockLauncher::new(MockEngine::new()),
        settings.ports,
    ));
    let sessions = Arc::new(MemorySessionStore::new());
    let monitor = JobMonitor::new(pool.clone(), sessions.clone(), settings);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let served = tokio::spawn(server::serve(
        listener,
        AppState::new(monitor.clone(), sessions),
        async move {
            let _ = stop_rx.await;
        },
    ));

    let http = reqwest::Client::new();
    let started: Value = http
        .post(format!("http://{addr}/api/scans"))
        .json(&json!({ "url": "http://t/", "scan": { "mode": "spider" } }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let mut events = http
        .get(format!(
            "http://{addr}/api/scans/{}/{}/events",
            started["client_id"].as_str().unwrap(),
            started["job_id"].as_str().unwrap()
        ))
        .send()
        .await
        .unwrap();
    let first = events.chunk().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&first).contains("event: status"));
    assert_eq!(pool.live_clients().await.len(), 1);

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(10), served)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();

    // the open stream ends instead of holding the server up
    let rest = tokio::time::timeout(Duration::from_secs(5), async {
        while let Ok(Some(_)) = events.chunk().await {}
    })
    .await;
    assert!(rest.is_ok());
    assert!(monitor.active_jobs().is_empty());
    assert!(pool.live_clients().await.is_empty());
}
