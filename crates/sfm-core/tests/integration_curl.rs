//! Integration tests: the curl transport against a local HTTP server.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::http_server::{self, HttpRequest, HttpResponse};
use sfm_core::error::TransportError;
use sfm_core::{
    BackoffPolicy, FetchError, FetchOptions, FetchService, Request, SecurityPolicy,
    ServiceConfig, UploadOptions, UploadRequest,
};

fn curl_service() -> FetchService {
    FetchService::with_curl(ServiceConfig {
        security: SecurityPolicy {
            allow_localhost: true,
            ..SecurityPolicy::default()
        },
        logger: None,
        ..ServiceConfig::default()
    })
}

fn quick_policy(max_retries: u32) -> BackoffPolicy {
    BackoffPolicy {
        base_delay: Duration::from_millis(10),
        ..common::flat_policy(max_retries)
    }
}

#[tokio::test]
async fn get_returns_status_headers_and_body() {
    let base = http_server::start(|req| {
        assert_eq!(req.method, "GET");
        HttpResponse::ok("hello").header("X-Served-By", "test")
    });
    let resp = curl_service()
        .fetch(Request::get(&format!("{base}/greeting")).unwrap(), FetchOptions::new())
        .wait()
        .await
        .unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"hello");
    assert_eq!(resp.headers.get("x-served-by"), Some("test"));
    assert_eq!(resp.attempts, 1);
}

#[tokio::test]
async fn post_body_and_headers_reach_the_server() {
    let seen: Arc<Mutex<Option<HttpRequest>>> = Arc::new(Mutex::new(None));
    let s = Arc::clone(&seen);
    let base = http_server::start(move |req| {
        *s.lock().unwrap() = Some(req.clone());
        HttpResponse::new(201).body(req.body.clone())
    });
    let request = Request::post(&format!("{base}/items"), "name=widget")
        .unwrap()
        .with_header("Content-Type", "application/x-www-form-urlencoded");
    let resp = curl_service()
        .fetch(request, FetchOptions::new())
        .wait()
        .await
        .unwrap();
    assert_eq!(resp.status, 201);
    assert_eq!(resp.body, b"name=widget");

    let req = seen.lock().unwrap().clone().unwrap();
    assert_eq!(req.method, "POST");
    assert_eq!(req.path, "/items");
    assert_eq!(
        req.header("content-type"),
        Some("application/x-www-form-urlencoded")
    );
}

#[tokio::test]
async fn unavailable_is_retried() {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = Arc::clone(&hits);
    let base = http_server::start(move |_| {
        if h.fetch_add(1, Ordering::SeqCst) == 0 {
            HttpResponse::new(503)
        } else {
            HttpResponse::ok("recovered")
        }
    });
    let resp = curl_service()
        .fetch(
            Request::get(&format!("{base}/flaky")).unwrap(),
            FetchOptions::new().retry_policy(quick_policy(3)),
        )
        .wait()
        .await
        .unwrap();
    assert_eq!(resp.body, b"recovered");
    assert_eq!(resp.attempts, 2);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn redirect_is_followed_by_the_service() {
    let base = http_server::start(|req| match req.path.as_str() {
        "/old" => HttpResponse::new(302).header("Location", "/new"),
        "/new" => HttpResponse::ok("moved"),
        _ => HttpResponse::new(404),
    });
    let resp = curl_service()
        .fetch(Request::get(&format!("{base}/old")).unwrap(), FetchOptions::new())
        .wait()
        .await
        .unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"moved");
    assert_eq!(resp.url.path(), "/new");
}

#[tokio::test]
async fn body_is_streamed_to_the_destination() {
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let served = payload.clone();
    let base = http_server::start(move |_| HttpResponse::ok(served.clone()));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("download.bin");

    let resp = curl_service()
        .fetch(
            Request::get(&format!("{base}/blob")).unwrap(),
            FetchOptions::new().destination(&path),
        )
        .wait()
        .await
        .unwrap();
    assert!(resp.body.is_empty());
    assert_eq!(std::fs::read(&path).unwrap(), payload);
}

#[tokio::test]
async fn slow_server_times_out() {
    let base = http_server::start(|_| HttpResponse::ok("late").delayed(Duration::from_secs(2)));
    let err = curl_service()
        .fetch(
            Request::get(&format!("{base}/slow")).unwrap(),
            FetchOptions::new()
                .timeout(Duration::from_millis(200))
                .without_retries(),
        )
        .wait()
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Transport(TransportError::Timeout)));
}

#[tokio::test]
async fn plain_http_to_localhost_needs_permission() {
    let base = http_server::start(|_| HttpResponse::ok("never"));
    let svc = FetchService::with_curl(ServiceConfig {
        logger: None,
        ..ServiceConfig::default()
    });
    let err = svc
        .fetch(Request::get(&format!("{base}/")).unwrap(), FetchOptions::new())
        .wait()
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::InsecureRequest { .. }));
}

#[tokio::test]
async fn chunked_upload_over_curl() {
    let received = Arc::new(Mutex::new(Vec::<u8>::new()));
    let r = Arc::clone(&received);
    let base = http_server::start(move |req| match (req.method.as_str(), req.path.as_str()) {
        ("POST", "/upload") => HttpResponse::new(200)
            .header("Location", "/session/7")
            .header("X-Upload-Id", "u-7"),
        ("PUT", "/session/7") => {
            let mut held = r.lock().unwrap();
            held.extend_from_slice(&req.body);
            let total: Option<usize> = req
                .header("content-range")
                .and_then(|v| v.rsplit_once('/'))
                .and_then(|(_, t)| t.parse().ok());
            if total == Some(held.len()) {
                HttpResponse::new(201).body("stored")
            } else {
                HttpResponse::new(308).header("Range", format!("bytes=0-{}", held.len() - 1))
            }
        }
        _ => HttpResponse::new(404),
    });

    let data: Vec<u8> = b"0123456789".to_vec();
    let handle = curl_service().begin_upload(
        UploadRequest::new(&format!("{base}/upload"), data.clone()).unwrap(),
        UploadOptions::new().chunk_size(4),
    );
    let resp = handle.wait().await.unwrap();
    assert_eq!(resp.status, 201);
    assert_eq!(resp.body, b"stored");
    assert_eq!(*received.lock().unwrap(), data);
}
