//! Purpose: In-process fake of the hosted platform for integration tests.
//! Exports: `FakePlatform`, `RealtimePeer`, `API_KEY`.
//! Role: Serves the record, storage and function HTTP surfaces on loopback; a separate
//! Role: blocking websocket peer plays the realtime server.
//! Invariants: Every HTTP route rejects requests without the expected `apikey` and bearer token.
//! Invariants: Each fixture owns its runtime/thread; dropping it shuts the fixture down.
#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tungstenite::{Message, WebSocket};

pub const API_KEY: &str = "anon-test-key";

#[derive(Default)]
pub struct PlatformState {
    pub rows: Vec<Value>,
    pub next_id: i64,
    pub objects: HashMap<String, StoredBlob>,
}

#[derive(Clone, Debug)]
pub struct StoredBlob {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

type Shared = Arc<Mutex<PlatformState>>;

pub struct FakePlatform {
    pub base_url: String,
    state: Shared,
    _runtime: tokio::runtime::Runtime,
}

impl FakePlatform {
    pub fn start() -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("runtime");
        let state: Shared = Arc::new(Mutex::new(PlatformState::default()));
        let app = Router::new()
            .route(
                "/rest/v1/books",
                post(insert_rows)
                    .get(select_rows)
                    .patch(update_rows)
                    .delete(delete_rows),
            )
            .route(
                "/storage/v1/object/:bucket/*key",
                post(upload_object).get(download_object),
            )
            .route("/functions/v1/:name", post(call_function))
            .with_state(Arc::clone(&state));
        let listener = runtime
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .expect("bind fake platform");
        let addr = listener.local_addr().expect("local addr");
        runtime.spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            base_url: format!("http://{addr}"),
            state,
            _runtime: runtime,
        }
    }

    pub fn state(&self) -> MutexGuard<'_, PlatformState> {
        lock(&self.state)
    }

    /// Inserts a row as another client (or an older schema) would have written it.
    pub fn seed_row(&self, mut row: Value) -> i64 {
        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;
        row["id"] = json!(id);
        state.rows.push(row);
        id
    }
}

fn lock(state: &Shared) -> MutexGuard<'_, PlatformState> {
    state.lock().unwrap_or_else(|poison| poison.into_inner())
}

fn authorized(headers: &HeaderMap) -> bool {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    header("apikey") == Some(API_KEY)
        && header("authorization") == Some(format!("Bearer {API_KEY}").as_str())
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "message": "Invalid API key" })),
    )
        .into_response()
}

fn row_id(query: &HashMap<String, String>) -> Option<i64> {
    query.get("id")?.strip_prefix("eq.")?.parse().ok()
}

async fn insert_rows(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(rows): Json<Vec<Value>>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let mut state = lock(&state);
    let mut created = Vec::new();
    for mut row in rows {
        if row.get("count").and_then(Value::as_u64).unwrap_or(0) > 1000 {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "code": "23514",
                    "message": "new row for relation \"books\" violates check constraint \"books_count_check\"",
                })),
            )
                .into_response();
        }
        state.next_id += 1;
        row["id"] = json!(state.next_id);
        row["created_at"] = json!("2024-01-01T00:00:00Z");
        created.push(row.clone());
        state.rows.push(row);
    }
    let represent = headers
        .get("prefer")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("return=representation"));
    if represent {
        (StatusCode::CREATED, Json(Value::Array(created))).into_response()
    } else {
        StatusCode::CREATED.into_response()
    }
}

async fn select_rows(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    if query.get("select").map(String::as_str) != Some("*") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "expected select=*" })),
        )
            .into_response();
    }
    Json(Value::Array(lock(&state).rows.clone())).into_response()
}

async fn update_rows(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(patch): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    if patch.get("id").is_some() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "id must not be patched" })),
        )
            .into_response();
    }
    let Some(id) = row_id(&query) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let mut state = lock(&state);
    for row in state.rows.iter_mut() {
        if row.get("id").and_then(Value::as_i64) == Some(id) {
            if let (Some(target), Some(fields)) = (row.as_object_mut(), patch.as_object()) {
                for (key, value) in fields {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn delete_rows(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let Some(id) = row_id(&query) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    lock(&state)
        .rows
        .retain(|row| row.get("id").and_then(Value::as_i64) != Some(id));
    StatusCode::NO_CONTENT.into_response()
}

async fn upload_object(
    State(state): State<Shared>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let upsert = headers
        .get("x-upsert")
        .and_then(|value| value.to_str().ok())
        == Some("true");
    let content_type = headers
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let full_path = format!("{bucket}/{key}");
    let mut state = lock(&state);
    if !upsert && state.objects.contains_key(&full_path) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "statusCode": "409", "error": "Duplicate", "message": "The resource already exists" })),
        )
            .into_response();
    }
    state.objects.insert(
        full_path.clone(),
        StoredBlob {
            bytes: body.to_vec(),
            content_type,
        },
    );
    Json(json!({ "Key": full_path })).into_response()
}

async fn download_object(
    State(state): State<Shared>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    match lock(&state).objects.get(&format!("{bucket}/{key}")) {
        Some(blob) => (
            [(axum::http::header::CONTENT_TYPE, blob.content_type.clone())],
            blob.bytes.clone(),
        )
            .into_response(),
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "statusCode": "404", "error": "not_found", "message": "Object not found" })),
        )
            .into_response(),
    }
}

async fn call_function(
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    match name.as_str() {
        "hello-world" => {
            let who = body.get("name").and_then(Value::as_str).unwrap_or("there");
            Json(json!({ "message": format!("Hello {who}!") })).into_response()
        }
        "plain" => "plain text reply".into_response(),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "function crashed" })),
        )
            .into_response(),
    }
}

/// Blocking Phoenix-channel peer accepting a single websocket client.
pub struct RealtimePeer {
    pub url: String,
    push: Sender<Value>,
    frames: Receiver<Value>,
    worker: Option<JoinHandle<()>>,
}

/// How the peer answers the channel join.
#[derive(Clone, Copy)]
pub enum JoinReply {
    Accept,
    Reject,
}

impl RealtimePeer {
    pub fn start(reply: JoinReply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind realtime peer");
        let addr = listener.local_addr().expect("local addr");
        let (push, pushed) = mpsc::channel::<Value>();
        let (seen, frames) = mpsc::channel::<Value>();
        let worker = thread::spawn(move || {
            let Some(stream) = accept_within(&listener, Duration::from_secs(10)) else {
                return;
            };
            let Ok(mut socket) = tungstenite::accept(stream) else {
                return;
            };
            run_peer(&mut socket, reply, &pushed, &seen);
        });
        Self {
            url: format!("ws://{addr}/realtime/v1/websocket"),
            push,
            frames,
            worker: Some(worker),
        }
    }

    /// Queues a raw server frame; it is sent once the channel has joined.
    pub fn push(&self, frame: Value) {
        let _ = self.push.send(frame);
    }

    /// Next client frame the peer received, if any arrives within `timeout`.
    pub fn next_frame(&self, timeout: Duration) -> Option<Value> {
        self.frames.recv_timeout(timeout).ok()
    }

    /// Waits for a client frame with the given event name, skipping others.
    pub fn wait_for_event(&self, event: &str, timeout: Duration) -> Option<Value> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(std::time::Instant::now())?;
            let frame = self.next_frame(remaining)?;
            if frame.get("event").and_then(Value::as_str) == Some(event) {
                return Some(frame);
            }
        }
    }
}

impl Drop for RealtimePeer {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Bounded accept so a peer nobody connects to still lets its owner drop.
fn accept_within(listener: &TcpListener, timeout: Duration) -> Option<TcpStream> {
    listener.set_nonblocking(true).ok()?;
    let deadline = std::time::Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).ok()?;
                return Some(stream);
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    && std::time::Instant::now() < deadline =>
            {
                thread::sleep(Duration::from_millis(10));
            }
            Err(_) => return None,
        }
    }
}

fn run_peer(
    socket: &mut WebSocket<TcpStream>,
    reply: JoinReply,
    pushed: &Receiver<Value>,
    seen: &Sender<Value>,
) {
    let _ = socket
        .get_ref()
        .set_read_timeout(Some(Duration::from_millis(50)));
    let mut joined_topic: Option<String> = None;
    loop {
        if joined_topic.is_some() {
            while let Ok(frame) = pushed.try_recv() {
                if socket.send(Message::Text(frame.to_string())).is_err() {
                    return;
                }
            }
        }
        let text = match socket.read() {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return,
            Ok(_) => continue,
            Err(tungstenite::Error::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(_) => return,
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let event = frame.get("event").and_then(Value::as_str).unwrap_or_default().to_string();
        let topic = frame.get("topic").and_then(Value::as_str).unwrap_or_default().to_string();
        if event == "phx_join" {
            let payload = match reply {
                JoinReply::Accept => json!({ "status": "ok", "response": { "postgres_changes": [] } }),
                JoinReply::Reject => json!({ "status": "error", "response": { "reason": "unauthorized table" } }),
            };
            let answer = json!({
                "topic": topic,
                "event": "phx_reply",
                "payload": payload,
                "ref": frame.get("ref").cloned().unwrap_or(Value::Null),
            });
            if socket.send(Message::Text(answer.to_string())).is_err() {
                return;
            }
            if matches!(reply, JoinReply::Accept) {
                joined_topic = Some(topic);
            }
        }
        let _ = seen.send(frame);
        if event == "phx_leave" {
            let _ = socket.close(None);
            let _ = socket.flush();
            return;
        }
    }
}

/// A `postgres_changes` frame as the platform sends it for `books`.
pub fn change_frame(kind: &str) -> Value {
    json!({
        "topic": "realtime:table:books",
        "event": "postgres_changes",
        "payload": {
            "ids": [1],
            "data": {
                "schema": "public",
                "table": "books",
                "type": kind,
                "commit_timestamp": "2024-01-01T00:00:00Z",
                "columns": [],
                "errors": null,
            }
        },
        "ref": null,
    })
}
