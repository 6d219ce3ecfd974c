//! Purpose: Realtime change feed over the platform's Phoenix-channel websocket.
//! Exports: `RealtimeFeed`.
//! Role: `ChangeFeed` implementation; one socket and one reader thread per subscription.
//! Invariants: `subscribe` returns only after the channel join is acknowledged.
//! Invariants: Callbacks run on the reader thread, never on the subscribing thread.
//! Invariants: Releasing a subscription sends `phx_leave`, closes the socket and joins the thread.
//! Notes: Delivery is at-least-once at best; a dropped socket ends the feed without reconnecting.
#![allow(clippy::result_large_err)]

use super::config::RemoteConfig;
use super::store::{ApiResult, ChangeCallback, ChangeFeed};
use super::subscription::Subscription;
use crate::core::error::{Error, ErrorKind};
use crate::core::event::{ChangeEvent, ChangeOp, ChangeScope};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::ErrorKind as IoErrorKind;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};
use url::Url;

const PROTOCOL_VSN: &str = "1.0.0";
const POLL_INTERVAL: Duration = Duration::from_millis(200);

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug)]
pub struct RealtimeFeed {
    config: RemoteConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_ref: Option<String>,
}

#[derive(Deserialize)]
struct PostgresChange {
    schema: String,
    table: String,
    #[serde(rename = "type", alias = "eventType")]
    kind: String,
    #[serde(default)]
    commit_timestamp: Option<String>,
}

enum JoinOutcome {
    Joined,
    Rejected(String),
}

/// Reader-thread state for one channel.
struct Channel {
    socket: Socket,
    topic: String,
    scope: ChangeScope,
    callback: ChangeCallback,
    stop: Arc<AtomicBool>,
    heartbeat: Duration,
    next_ref: u64,
}

impl RealtimeFeed {
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }

    pub fn endpoint(&self) -> ApiResult<Url> {
        realtime_url(&self.config)
    }
}

impl ChangeFeed for RealtimeFeed {
    fn subscribe(&self, scope: &ChangeScope, callback: ChangeCallback) -> ApiResult<Subscription> {
        let id = NEXT_SUBSCRIPTION.fetch_add(1, Ordering::SeqCst);
        let endpoint = self.endpoint()?;
        let topic = format!("realtime:{}", scope.topic());

        let (mut socket, _response) = tungstenite::connect(endpoint.as_str()).map_err(|err| {
            Error::new(ErrorKind::Transport)
                .with_message("failed to open realtime socket")
                .with_target(scope.table.clone())
                .with_source(err)
        })?;
        set_read_timeout(&socket, Some(POLL_INTERVAL)).map_err(|err| {
            Error::new(ErrorKind::Transport)
                .with_message("failed to configure realtime socket")
                .with_source(err)
        })?;

        let join = join_message(&topic, scope, &self.config.api_key, "1");
        send_message(&mut socket, &join)?;
        let early = match await_join(&mut socket, &topic, scope, "1", self.config.timeout)? {
            (JoinOutcome::Joined, early) => early,
            (JoinOutcome::Rejected(reason), _) => {
                let _ = socket.close(None);
                return Err(Error::new(ErrorKind::Transport)
                    .with_message(format!("realtime join rejected: {reason}"))
                    .with_target(scope.table.clone()));
            }
        };
        tracing::debug!(subscription = id, topic = %topic, "realtime channel joined");

        let stop = Arc::new(AtomicBool::new(false));
        let mut channel = Channel {
            socket,
            topic,
            scope: scope.clone(),
            callback,
            stop: Arc::clone(&stop),
            heartbeat: self.config.heartbeat,
            next_ref: 2,
        };
        let worker = thread::Builder::new()
            .name(format!("bookshelf-realtime-{id}"))
            .spawn(move || {
                for event in &early {
                    (channel.callback)(event);
                }
                channel.run();
            })
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to spawn realtime reader")
                    .with_source(err)
            })?;

        Ok(Subscription::new(id, scope.clone(), move || {
            stop.store(true, Ordering::SeqCst);
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }))
    }
}

impl Channel {
    fn run(&mut self) {
        let mut last_heartbeat = Instant::now();
        loop {
            if self.stop.load(Ordering::SeqCst) {
                self.leave();
                return;
            }
            if last_heartbeat.elapsed() >= self.heartbeat {
                let heartbeat = heartbeat_message(&self.take_ref());
                if let Err(err) = send_message(&mut self.socket, &heartbeat) {
                    tracing::warn!(topic = %self.topic, error = %err, "realtime heartbeat failed");
                    return;
                }
                last_heartbeat = Instant::now();
            }
            match self.socket.read() {
                Ok(Message::Text(text)) => {
                    if !self.handle_text(&text) {
                        return;
                    }
                }
                Ok(Message::Close(_)) => {
                    tracing::warn!(topic = %self.topic, "realtime socket closed by remote");
                    return;
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(err))
                    if matches!(err.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut) => {}
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return;
                }
                Err(err) => {
                    tracing::warn!(topic = %self.topic, error = %err, "realtime read failed");
                    return;
                }
            }
        }
    }

    /// Returns false when the channel should stop.
    fn handle_text(&mut self, text: &str) -> bool {
        let message: PhoenixMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(topic = %self.topic, error = %err, "ignoring malformed realtime frame");
                return true;
            }
        };
        if message.topic != self.topic {
            return true;
        }
        match message.event.as_str() {
            "phx_error" | "phx_close" => {
                tracing::warn!(topic = %self.topic, event = %message.event, "realtime channel ended");
                false
            }
            _ => {
                if let Some(event) = decode_change(&message) {
                    if self.scope.matches(&event) {
                        (self.callback)(&event);
                    }
                }
                true
            }
        }
    }

    fn leave(&mut self) {
        let leave = PhoenixMessage {
            topic: self.topic.clone(),
            event: "phx_leave".to_string(),
            payload: json!({}),
            reference: Some(self.take_ref()),
            join_ref: Some("1".to_string()),
        };
        let _ = send_message(&mut self.socket, &leave);
        let _ = self.socket.close(None);
        let _ = self.socket.flush();
    }

    fn take_ref(&mut self) -> String {
        let reference = self.next_ref.to_string();
        self.next_ref += 1;
        reference
    }
}

/// `{ws-base}/realtime/v1/websocket?apikey=..&vsn=1.0.0`, or the configured override.
fn realtime_url(config: &RemoteConfig) -> ApiResult<Url> {
    let mut url = match &config.realtime_url {
        Some(url) => url.clone(),
        None => {
            let mut url = config.url.clone();
            let scheme = if config.url.scheme() == "https" {
                "wss"
            } else {
                "ws"
            };
            url.set_scheme(scheme).map_err(|_| {
                Error::new(ErrorKind::Usage).with_message("failed to derive realtime url scheme")
            })?;
            url.set_path("/realtime/v1/websocket");
            url
        }
    };
    url.set_query(None);
    url.query_pairs_mut()
        .append_pair("apikey", &config.api_key)
        .append_pair("vsn", PROTOCOL_VSN);
    Ok(url)
}

fn join_message(topic: &str, scope: &ChangeScope, api_key: &str, reference: &str) -> PhoenixMessage {
    PhoenixMessage {
        topic: topic.to_string(),
        event: "phx_join".to_string(),
        payload: json!({
            "config": {
                "broadcast": { "ack": false, "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": scope.filter.as_wire(),
                    "schema": scope.schema,
                    "table": scope.table,
                }],
                "private": false,
            },
            "access_token": api_key,
        }),
        reference: Some(reference.to_string()),
        join_ref: Some(reference.to_string()),
    }
}

fn heartbeat_message(reference: &str) -> PhoenixMessage {
    PhoenixMessage {
        topic: "phoenix".to_string(),
        event: "heartbeat".to_string(),
        payload: json!({}),
        reference: Some(reference.to_string()),
        join_ref: None,
    }
}

/// Accepts both the `postgres_changes` envelope and the legacy per-operation events.
fn decode_change(message: &PhoenixMessage) -> Option<ChangeEvent> {
    let data = if message.event == "postgres_changes" {
        message.payload.get("data")?.clone()
    } else if ChangeOp::from_wire(&message.event).is_some() {
        message.payload.clone()
    } else {
        return None;
    };
    let change: PostgresChange = serde_json::from_value(data).ok()?;
    let op = ChangeOp::from_wire(&change.kind)?;
    let mut event = ChangeEvent::new(op, change.schema, change.table);
    if let Some(timestamp) = change.commit_timestamp {
        event = event.with_commit_timestamp(timestamp);
    }
    Some(event)
}

fn join_reply(message: &PhoenixMessage, topic: &str, reference: &str) -> Option<JoinOutcome> {
    if message.event != "phx_reply"
        || message.topic != topic
        || message.reference.as_deref() != Some(reference)
    {
        return None;
    }
    match message.payload.get("status").and_then(Value::as_str) {
        Some("ok") => Some(JoinOutcome::Joined),
        _ => {
            let reason = message
                .payload
                .pointer("/response/reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown reason")
                .to_string();
            Some(JoinOutcome::Rejected(reason))
        }
    }
}

/// Waits for the join reply; changes that race ahead of it are returned for replay.
fn await_join(
    socket: &mut Socket,
    topic: &str,
    scope: &ChangeScope,
    reference: &str,
    timeout: Duration,
) -> ApiResult<(JoinOutcome, Vec<ChangeEvent>)> {
    let deadline = Instant::now() + timeout;
    let mut early = Vec::new();
    loop {
        if Instant::now() >= deadline {
            return Err(Error::new(ErrorKind::Transport)
                .with_message("timed out waiting for realtime join")
                .with_target(scope.table.clone()));
        }
        let text = match socket.read() {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                return Err(Error::new(ErrorKind::Transport)
                    .with_message("realtime socket closed during join")
                    .with_target(scope.table.clone()));
            }
            Ok(_) => continue,
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(err) => {
                return Err(Error::new(ErrorKind::Transport)
                    .with_message("realtime socket failed during join")
                    .with_target(scope.table.clone())
                    .with_source(err));
            }
        };
        let Ok(message) = serde_json::from_str::<PhoenixMessage>(&text) else {
            continue;
        };
        if let Some(outcome) = join_reply(&message, topic, reference) {
            return Ok((outcome, early));
        }
        if message.topic == topic {
            if let Some(event) = decode_change(&message) {
                if scope.matches(&event) {
                    early.push(event);
                }
            }
        }
    }
}

fn send_message(socket: &mut Socket, message: &PhoenixMessage) -> ApiResult<()> {
    let text = serde_json::to_string(message).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode realtime message")
            .with_source(err)
    })?;
    socket.send(Message::Text(text)).map_err(|err| {
        Error::new(ErrorKind::Transport)
            .with_message("failed to send realtime message")
            .with_source(err)
    })
}

fn set_read_timeout(socket: &Socket, timeout: Option<Duration>) -> std::io::Result<()> {
    match socket.get_ref() {
        MaybeTlsStream::Plain(stream) => stream.set_read_timeout(timeout),
        MaybeTlsStream::Rustls(stream) => stream.sock.set_read_timeout(timeout),
        _ => Ok(()),
    }
}
