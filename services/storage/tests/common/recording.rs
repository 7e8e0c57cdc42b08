//! Minimal B2 stand-in that records the order and overlap of part uploads.
//! httpmock counts hits but cannot tell in which order they arrived.

use axum::{
    extract::{DefaultBodyLimit, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default, Clone)]
pub struct PartLog {
    /// Part numbers in arrival order
    pub arrivals: Vec<u32>,
    /// (part number, body length) in completion order
    pub completed: Vec<(u32, usize)>,
    pub max_in_flight: usize,
    /// Parts completed when finish was called
    pub completed_at_finish: Option<usize>,
    in_flight: usize,
}

#[derive(Clone)]
struct Recorder {
    base_url: String,
    session_part_size: u64,
    part_delay: Duration,
    log: Arc<Mutex<PartLog>>,
}

pub struct RecordingServer {
    pub base_url: String,
    log: Arc<Mutex<PartLog>>,
}

impl RecordingServer {
    pub async fn start(session_part_size: u64, part_delay: Duration) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind recording server");
        let base_url = format!("http://{}", listener.local_addr().expect("local addr"));
        let log = Arc::new(Mutex::new(PartLog::default()));

        let recorder = Recorder {
            base_url: base_url.clone(),
            session_part_size,
            part_delay,
            log: log.clone(),
        };

        let router = Router::new()
            .route("/b2api/v2/b2_authorize_account", get(authorize))
            .route("/b2api/v2/b2_start_large_file", post(start_large_file))
            .route("/b2api/v2/b2_get_upload_part_url", post(get_upload_part_url))
            .route("/b2api/v2/b2_finish_large_file", post(finish_large_file))
            .route("/upload/part", post(upload_part))
            .layer(DefaultBodyLimit::disable())
            .with_state(recorder);

        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Self { base_url, log }
    }

    pub fn auth_url(&self) -> String {
        format!("{}/b2api/v2", self.base_url)
    }

    pub fn log(&self) -> PartLog {
        self.log.lock().expect("part log").clone()
    }
}

async fn authorize(State(recorder): State<Recorder>) -> Json<Value> {
    Json(json!({
        "accountId": "acct-1",
        "apiUrl": recorder.base_url,
        "downloadUrl": format!("{}/download", recorder.base_url),
        "authorizationToken": "acct-token",
        "recommendedPartSize": recorder.session_part_size,
    }))
}

async fn start_large_file() -> Json<Value> {
    Json(json!({ "fileId": "4_zrecorded" }))
}

async fn get_upload_part_url(State(recorder): State<Recorder>) -> Json<Value> {
    Json(json!({
        "fileId": "4_zrecorded",
        "uploadUrl": format!("{}/upload/part", recorder.base_url),
        "authorizationToken": "part-token",
    }))
}

async fn upload_part(
    State(recorder): State<Recorder>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let part_number: u32 = headers
        .get("x-bz-part-number")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    {
        let mut log = recorder.log.lock().expect("part log");
        log.arrivals.push(part_number);
        log.in_flight += 1;
        log.max_in_flight = log.max_in_flight.max(log.in_flight);
    }

    tokio::time::sleep(recorder.part_delay).await;

    {
        let mut log = recorder.log.lock().expect("part log");
        log.in_flight -= 1;
        log.completed.push((part_number, body.len()));
    }

    Json(json!({ "partNumber": part_number, "contentLength": body.len() }))
}

async fn finish_large_file(State(recorder): State<Recorder>) -> Json<Value> {
    let mut log = recorder.log.lock().expect("part log");
    log.completed_at_finish = Some(log.completed.len());
    Json(json!({ "fileId": "4_zrecorded", "action": "upload" }))
}
