//! Integration tests: chunked resumable uploads against an in-process upload server.

mod common;

use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sfm_core::error::TransportError;
use sfm_core::fetch::StaticAuthorization;
use sfm_core::transport::{RecordedRequest, ScriptedReply, ScriptedResponse, ScriptedTransport};
use sfm_core::upload::{UploadEvent, UploadPhase};
use sfm_core::{
    FetchError, FetchService, UploadBody, UploadLocation, UploadOptions, UploadRequest,
};

const ENDPOINT: &str = "https://up.test/upload";
const SESSION_URL: &str = "https://up.test/session/1";

/// What the server does with a particular chunk PUT (1-based count of data chunks).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Fault {
    /// Keep the first `n` bytes of the chunk, then drop the connection.
    PersistThenDrop(usize),
    /// Drop the connection without keeping anything.
    Drop,
}

#[derive(Default)]
struct UploadServer {
    received: Vec<u8>,
    chunk_puts: usize,
    faults: Vec<(usize, Fault)>,
    /// Every chunk PUT fails without persisting.
    always_drop: bool,
    /// Status for status queries instead of the usual answer.
    query_status: Option<u16>,
    /// Range reported by status queries instead of the received length.
    query_range: Option<String>,
    negotiations: usize,
}

impl UploadServer {
    fn range_reply(&self) -> ScriptedReply {
        let mut resp = ScriptedResponse::new(308);
        if let Some(range) = &self.query_range {
            resp = resp.with_header("Range", range.clone());
        } else if !self.received.is_empty() {
            resp = resp.with_header("Range", format!("bytes=0-{}", self.received.len() - 1));
        }
        resp.into()
    }

    fn complete(&self) -> ScriptedReply {
        ScriptedResponse::new(201).with_body("done").into()
    }

    fn handle(&mut self, req: &RecordedRequest) -> ScriptedReply {
        match (req.method.as_str(), req.url.path()) {
            ("POST", "/upload") => {
                self.negotiations += 1;
                ScriptedResponse::new(200)
                    .with_header("Location", "/session/1")
                    .with_header("X-Upload-Id", "up-1")
                    .into()
            }
            ("PUT", "/session/1") => {
                let range = req.headers.get("content-range").unwrap_or_default().to_string();
                let content_range = range.trim_start_matches("bytes ");
                let (span, total) = content_range.split_once('/').unwrap();
                let total: Option<usize> = total.parse().ok();
                if span == "*" {
                    if let Some(status) = self.query_status {
                        return ScriptedReply::status(status);
                    }
                    return match total {
                        Some(t) if t == self.received.len() && self.query_range.is_none() => {
                            self.complete()
                        }
                        _ => self.range_reply(),
                    };
                }
                self.chunk_puts += 1;
                if self.always_drop {
                    return ScriptedReply::Fail(TransportError::Connection("reset".into()));
                }
                let (start, _) = span.split_once('-').unwrap();
                let start: usize = start.parse().unwrap();
                let fault = self
                    .faults
                    .iter()
                    .find(|(n, _)| *n == self.chunk_puts)
                    .map(|(_, f)| *f);
                let keep = match fault {
                    Some(Fault::PersistThenDrop(n)) => n.min(req.body.len()),
                    Some(Fault::Drop) => 0,
                    None => req.body.len(),
                };
                // Overlapping bytes the server already holds are ignored.
                let skip = self.received.len().saturating_sub(start).min(keep);
                self.received.extend_from_slice(&req.body[skip..keep]);
                if fault.is_some() {
                    return ScriptedReply::Fail(TransportError::Connection("reset".into()));
                }
                match total {
                    Some(t) if t == self.received.len() => self.complete(),
                    _ => self.range_reply(),
                }
            }
            _ => ScriptedReply::status(404),
        }
    }
}

fn server(state: UploadServer) -> (ScriptedTransport, Arc<Mutex<UploadServer>>) {
    let state = Arc::new(Mutex::new(state));
    let s = Arc::clone(&state);
    let transport = ScriptedTransport::new(move |req| s.lock().unwrap().handle(req));
    (transport, state)
}

fn content_ranges(transport: &ScriptedTransport) -> Vec<String> {
    transport
        .requests()
        .iter()
        .filter(|r| r.method == "PUT")
        .map(|r| r.headers.get("content-range").unwrap_or_default().to_string())
        .collect()
}

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'a' + (i % 26) as u8).collect()
}

fn options(events: &common::EventLog<UploadEvent>) -> UploadOptions {
    UploadOptions::new()
        .chunk_size(4)
        .retry_policy(common::flat_policy(3))
        .observer(events.sink())
        .jitter_seed(1)
}

fn location() -> UploadLocation {
    UploadLocation {
        upload_id: "up-1".into(),
        url: SESSION_URL.parse().unwrap(),
    }
}

fn start(svc: &FetchService, request: UploadRequest, options: UploadOptions) -> sfm_core::UploadHandle {
    svc.begin_upload(request, options)
}

#[tokio::test(start_paused = true)]
async fn chunked_upload_sends_each_chunk_once() {
    let (transport, state) = server(UploadServer::default());
    let svc = common::service(&transport, common::test_config());
    let events = common::EventLog::new();
    let data = body(10);

    let request = UploadRequest::new(ENDPOINT, data.clone())
        .unwrap()
        .with_content_type("application/octet-stream");
    let handle = start(&svc, request, options(&events));
    let resp = handle.wait().await.unwrap();
    assert_eq!(resp.status, 201);
    assert_eq!(resp.body, b"done");

    let requests = transport.requests();
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].headers.get("x-upload-content-length"), Some("10"));
    assert_eq!(
        requests[0].headers.get("x-upload-content-type"),
        Some("application/octet-stream")
    );
    assert_eq!(
        content_ranges(&transport),
        ["bytes 0-3/10", "bytes 4-7/10", "bytes 8-9/10"]
    );
    assert_eq!(state.lock().unwrap().received, data);

    assert_eq!(
        events.take(),
        vec![
            UploadEvent::LocationObtained(location()),
            UploadEvent::ChunkStarted { offset: 0, len: 4 },
            UploadEvent::ChunkCompleted { confirmed: 4 },
            UploadEvent::ChunkStarted { offset: 4, len: 4 },
            UploadEvent::ChunkCompleted { confirmed: 8 },
            UploadEvent::ChunkStarted { offset: 8, len: 2 },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn failed_chunk_is_reconciled_before_sending_again() {
    let (transport, state) = server(UploadServer {
        faults: vec![(2, Fault::PersistThenDrop(4))],
        ..UploadServer::default()
    });
    let svc = common::service(&transport, common::test_config());
    let events = common::EventLog::new();
    let data = body(12);

    let handle = start(
        &svc,
        UploadRequest::new(ENDPOINT, data.clone()).unwrap(),
        options(&events),
    );
    let resp = handle.wait().await.unwrap();
    assert_eq!(resp.status, 201);

    // The server kept chunk two, so the query says 8 and chunk three goes next.
    assert_eq!(
        content_ranges(&transport),
        ["bytes 0-3/12", "bytes 4-7/12", "bytes */12", "bytes 8-11/12"]
    );
    let last = transport.requests().pop().unwrap();
    assert_eq!(last.body, data[8..12]);
    assert_eq!(state.lock().unwrap().received, data);

    let events = events.take();
    assert!(events.contains(&UploadEvent::RetryScheduled {
        failure: 1,
        delay: Duration::from_secs(1)
    }));
    assert!(events.contains(&UploadEvent::StatusQueried { offset: 8 }));
}

#[tokio::test(start_paused = true)]
async fn partially_persisted_chunk_resumes_mid_chunk() {
    let (transport, state) = server(UploadServer {
        faults: vec![(2, Fault::PersistThenDrop(2))],
        ..UploadServer::default()
    });
    let svc = common::service(&transport, common::test_config());
    let events = common::EventLog::new();
    let data = body(12);

    let handle = start(
        &svc,
        UploadRequest::new(ENDPOINT, data.clone()).unwrap(),
        options(&events),
    );
    handle.wait().await.unwrap();
    assert_eq!(
        content_ranges(&transport),
        [
            "bytes 0-3/12",
            "bytes 4-7/12",
            "bytes */12",
            "bytes 6-9/12",
            "bytes 10-11/12"
        ]
    );
    assert_eq!(state.lock().unwrap().received, data);
}

#[tokio::test(start_paused = true)]
async fn lost_chunk_is_sent_again() {
    let (transport, state) = server(UploadServer {
        faults: vec![(1, Fault::Drop)],
        ..UploadServer::default()
    });
    let svc = common::service(&transport, common::test_config());
    let events = common::EventLog::new();
    let data = body(6);

    let handle = start(
        &svc,
        UploadRequest::new(ENDPOINT, data.clone()).unwrap(),
        options(&events),
    );
    handle.wait().await.unwrap();
    assert_eq!(
        content_ranges(&transport),
        ["bytes 0-3/6", "bytes */6", "bytes 0-3/6", "bytes 4-5/6"]
    );
    assert_eq!(state.lock().unwrap().received, data);
    assert!(events.take().contains(&UploadEvent::StatusQueried { offset: 0 }));
}

#[tokio::test]
async fn streamed_upload_finishes_with_an_empty_chunk() {
    let (transport, state) = server(UploadServer::default());
    let svc = common::service(&transport, common::test_config());
    let events = common::EventLog::new();
    let data = body(10);

    let request = UploadRequest::new(
        ENDPOINT,
        UploadBody::Stream(Box::new(Cursor::new(data.clone()))),
    )
    .unwrap();
    let handle = start(&svc, request, options(&events));
    let resp = handle.wait().await.unwrap();
    assert_eq!(resp.status, 201);

    let requests = transport.requests();
    assert_eq!(requests[0].headers.get("x-upload-content-length"), Some("*"));
    assert_eq!(
        content_ranges(&transport),
        ["bytes 0-3/*", "bytes 4-7/*", "bytes 8-9/*", "bytes */10"]
    );
    assert!(requests.last().unwrap().body.is_empty());
    assert_eq!(state.lock().unwrap().received, data);
    assert!(events
        .take()
        .contains(&UploadEvent::ChunkStarted { offset: 10, len: 0 }));
}

#[tokio::test]
async fn file_body_is_read_in_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.bin");
    let data = body(9);
    std::fs::write(&path, &data).unwrap();

    let (transport, state) = server(UploadServer::default());
    let svc = common::service(&transport, common::test_config());
    let events = common::EventLog::new();
    let handle = start(&svc, UploadRequest::new(ENDPOINT, path).unwrap(), options(&events));
    handle.wait().await.unwrap();
    assert_eq!(
        content_ranges(&transport),
        ["bytes 0-3/9", "bytes 4-7/9", "bytes 8-8/9"]
    );
    assert_eq!(state.lock().unwrap().received, data);
}

#[tokio::test(start_paused = true)]
async fn failed_status_query_is_a_reconciliation_error() {
    let (transport, _) = server(UploadServer {
        faults: vec![(1, Fault::Drop)],
        query_status: Some(404),
        ..UploadServer::default()
    });
    let svc = common::service(&transport, common::test_config());
    let events = common::EventLog::new();

    let handle = start(&svc, UploadRequest::new(ENDPOINT, body(8)).unwrap(), options(&events));
    let err = handle.wait().await.unwrap_err();
    match err {
        FetchError::UploadReconciliation(inner) => assert_eq!(inner.status(), Some(404)),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn server_offset_beyond_sent_bytes_is_a_reconciliation_error() {
    let (transport, _) = server(UploadServer {
        faults: vec![(1, Fault::Drop)],
        query_range: Some("bytes=0-99".into()),
        ..UploadServer::default()
    });
    let svc = common::service(&transport, common::test_config());
    let events = common::EventLog::new();

    let handle = start(&svc, UploadRequest::new(ENDPOINT, body(8)).unwrap(), options(&events));
    let err = handle.wait().await.unwrap_err();
    match err {
        FetchError::UploadReconciliation(inner) => assert!(matches!(
            *inner,
            FetchError::UploadOffsetMismatch { server: 100, sent: 4 }
        )),
        other => panic!("unexpected {other:?}"),
    }
    // Nothing else was sent after the bad answer.
    assert_eq!(content_ranges(&transport), ["bytes 0-3/8", "bytes */8"]);
}

#[tokio::test(start_paused = true)]
async fn chunks_that_never_land_exhaust_the_retry_budget() {
    let (transport, _) = server(UploadServer {
        always_drop: true,
        ..UploadServer::default()
    });
    let svc = common::service(&transport, common::test_config());
    let events = common::EventLog::new();

    let handle = start(
        &svc,
        UploadRequest::new(ENDPOINT, body(8)).unwrap(),
        options(&events).retry_policy(common::flat_policy(2)),
    );
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, FetchError::RetriesExhausted { attempts: 3, .. }));
    let data_puts = content_ranges(&transport)
        .iter()
        .filter(|r| !r.starts_with("bytes */"))
        .count();
    assert_eq!(data_puts, 3);
}

#[tokio::test(start_paused = true)]
async fn cancel_aborts_the_chunk_without_a_status_query() {
    let transport = ScriptedTransport::new(|req| {
        if req.method == "POST" {
            ScriptedResponse::new(200)
                .with_header("Location", SESSION_URL)
                .into()
        } else {
            ScriptedReply::Hang
        }
    });
    let svc = common::service(&transport, common::test_config());
    let events = common::EventLog::new();

    let handle = start(&svc, UploadRequest::new(ENDPOINT, body(8)).unwrap(), options(&events));
    common::settle().await;
    assert_eq!(handle.state().phase, UploadPhase::Uploading);
    assert_eq!(handle.location().unwrap().url.as_str(), SESSION_URL);

    handle.cancel();
    let token = handle.cancel_token();
    let state_before = handle.state();
    let err = handle.wait().await.unwrap_err();
    assert!(err.is_cancelled());
    assert!(token.is_cancelled());
    assert_eq!(state_before.bytes_sent, 4);
    assert_eq!(content_ranges(&transport), ["bytes 0-3/8"]);
}

#[tokio::test(start_paused = true)]
async fn resume_starts_with_a_status_query() {
    let data = body(12);
    let (transport, state) = server(UploadServer {
        received: data[..6].to_vec(),
        ..UploadServer::default()
    });
    let svc = common::service(&transport, common::test_config());
    let events = common::EventLog::new();

    let request = UploadRequest::new(ENDPOINT, data.clone())
        .unwrap()
        .resume_from(location());
    let handle = start(&svc, request, options(&events));
    assert_eq!(handle.location(), Some(location()));
    handle.wait().await.unwrap();

    assert_eq!(state.lock().unwrap().negotiations, 0);
    assert_eq!(
        content_ranges(&transport),
        ["bytes */12", "bytes 6-9/12", "bytes 10-11/12"]
    );
    assert_eq!(state.lock().unwrap().received, data);
    assert_eq!(events.take()[0], UploadEvent::StatusQueried { offset: 6 });
}

#[tokio::test(start_paused = true)]
async fn resume_of_a_finished_upload_returns_the_final_response() {
    let data = body(4);
    let (transport, _) = server(UploadServer {
        received: data.clone(),
        ..UploadServer::default()
    });
    let svc = common::service(&transport, common::test_config());
    let events = common::EventLog::new();

    let request = UploadRequest::new(ENDPOINT, data).unwrap().resume_from(location());
    let resp = start(&svc, request, options(&events)).wait().await.unwrap();
    assert_eq!(resp.status, 201);
    assert_eq!(content_ranges(&transport), ["bytes */4"]);
}

#[tokio::test(start_paused = true)]
async fn metadata_is_sent_as_json_on_negotiation() {
    let (transport, _) = server(UploadServer::default());
    let svc = common::service(&transport, common::test_config());
    let events = common::EventLog::new();

    let request = UploadRequest::new(ENDPOINT, body(3))
        .unwrap()
        .with_metadata(serde_json::json!({ "name": "notes.txt" }))
        .with_header("X-Trace", "t-1");
    start(&svc, request, options(&events)).wait().await.unwrap();

    let requests = transport.requests();
    let post = &requests[0];
    assert_eq!(post.headers.get("content-type"), Some("application/json"));
    let sent: serde_json::Value = serde_json::from_slice(&post.body).unwrap();
    assert_eq!(sent["name"], "notes.txt");
    assert!(requests.iter().all(|r| r.headers.get("x-trace") == Some("t-1")));
}

#[tokio::test(start_paused = true)]
async fn authorizer_signs_negotiation_chunks_and_queries() {
    let (transport, _state) = server(UploadServer {
        faults: vec![(1, Fault::Drop)],
        ..UploadServer::default()
    });
    let svc = common::service(&transport, common::test_config());
    let events = common::EventLog::new();
    let options = options(&events).authorizer(Arc::new(StaticAuthorization("Bearer up".into())));

    start(&svc, UploadRequest::new(ENDPOINT, body(8)).unwrap(), options)
        .wait()
        .await
        .unwrap();

    let requests = transport.requests();
    assert!(requests.len() >= 4);
    assert!(requests
        .iter()
        .all(|r| r.headers.get("Authorization") == Some("Bearer up")));
}
