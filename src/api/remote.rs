//! Purpose: HTTP client for the hosted platform's record, storage and function APIs.
//! Exports: `RemoteClient`, `RemoteRecordStore`, `RemoteBlobStore`.
//! Role: Blocking `ureq` transport behind the store traits; one agent shared by all stores.
//! Invariants: Every request carries `apikey` and a bearer token from `RemoteConfig`.
//! Invariants: Non-2xx responses become `Transport` unless the endpoint distinguishes `NotFound`
//! Invariants: or the remote reports a constraint violation (`Validation`).
//! Invariants: Failures are logged here and returned unchanged; nothing is retried.
#![allow(clippy::result_large_err)]

use super::config::RemoteConfig;
use super::realtime::RealtimeFeed;
use super::store::{ApiResult, BlobStore, FunctionInvoker, RecordStore, StoredObject};
use super::urls::{build_url, object_segments, public_object_url};
use crate::core::book::{Book, BookId, NewBook};
use crate::core::error::{Error, ErrorKind};
use bytes::Bytes;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::io::Read;
use std::sync::Arc;
use url::Url;

/// PostgREST error codes that mean the row itself was unacceptable.
const VALIDATION_CODES: &[&str] = &["23502", "23514", "22P02", "22003", "PGRST204"];

#[derive(Clone)]
pub struct RemoteClient {
    inner: Arc<RemoteClientInner>,
}

struct RemoteClientInner {
    config: RemoteConfig,
    agent: ureq::Agent,
}

#[derive(Clone)]
pub struct RemoteRecordStore {
    client: RemoteClient,
}

#[derive(Clone)]
pub struct RemoteBlobStore {
    client: RemoteClient,
}

#[derive(Deserialize, Default)]
struct RemoteError {
    code: Option<String>,
    message: Option<String>,
    error: Option<String>,
    #[serde(rename = "statusCode")]
    status_code: Option<Value>,
}

#[derive(Deserialize)]
struct UploadEnvelope {
    #[serde(rename = "Key")]
    key: Option<String>,
}

enum Body<'a> {
    Empty,
    Json(String),
    Bytes(&'a [u8]),
}

impl RemoteClient {
    pub fn new(config: RemoteConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Self {
            inner: Arc::new(RemoteClientInner { config, agent }),
        }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.inner.config
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.config.url
    }

    pub fn records(&self) -> RemoteRecordStore {
        RemoteRecordStore {
            client: self.clone(),
        }
    }

    pub fn blobs(&self) -> RemoteBlobStore {
        RemoteBlobStore {
            client: self.clone(),
        }
    }

    pub fn realtime(&self) -> RealtimeFeed {
        RealtimeFeed::new(self.inner.config.clone())
    }

    fn request(&self, method: &str, url: &Url) -> ureq::Request {
        let key = &self.inner.config.api_key;
        self.inner
            .agent
            .request(method, url.as_str())
            .set("apikey", key)
            .set("Authorization", &format!("Bearer {key}"))
    }

    /// Sends the request and maps every failure into the crate taxonomy.
    /// `not_found_distinct` marks endpoints whose 404 means "object absent".
    fn send(
        &self,
        request: ureq::Request,
        body: Body<'_>,
        target: &str,
        not_found_distinct: bool,
    ) -> ApiResult<ureq::Response> {
        let response = match body {
            Body::Empty => request.call(),
            Body::Json(payload) => request
                .set("Content-Type", "application/json")
                .send_string(&payload),
            Body::Bytes(bytes) => request.send_bytes(bytes),
        };
        match response {
            Ok(resp) => Ok(resp),
            Err(ureq::Error::Status(code, resp)) => {
                Err(parse_error_response(code, resp, not_found_distinct).with_target(target))
            }
            Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::Transport)
                .with_message("request failed")
                .with_target(target)
                .with_source(err)),
        }
    }
}

impl FunctionInvoker for RemoteClient {
    fn invoke(&self, name: &str, body: &Value) -> ApiResult<Value> {
        let url = build_url(self.base_url(), &["functions", "v1", name])?;
        let request = self.request("POST", &url).set("Accept", "application/json");
        let result = self
            .send(request, Body::Json(encode_json(body)?), name, false)
            .and_then(read_function_response);
        match &result {
            Ok(_) => tracing::debug!(function = name, "function invoked"),
            Err(err) => tracing::error!(function = name, error = %err, "function call failed"),
        }
        result
    }
}

impl RemoteRecordStore {
    fn table(&self) -> &str {
        &self.client.config().table
    }

    fn table_url(&self) -> ApiResult<Url> {
        build_url(self.client.base_url(), &["rest", "v1", self.table()])
    }

    fn row_url(&self, id: &BookId) -> ApiResult<Url> {
        let mut url = self.table_url()?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{id}"));
        Ok(url)
    }

    fn run<T>(&self, op: &str, call: impl FnOnce() -> ApiResult<T>) -> ApiResult<T> {
        call().inspect_err(|err| {
            tracing::error!(table = self.table(), op, error = %err, "record store call failed");
        })
    }
}

impl RecordStore for RemoteRecordStore {
    fn create(&self, book: &NewBook) -> ApiResult<Book> {
        self.run("create", || {
            book.validate()?;
            let url = self.table_url()?;
            let request = self
                .client
                .request("POST", &url)
                .set("Accept", "application/json")
                .set("Prefer", "return=representation");
            let payload = encode_json(&[book])?;
            let response = self
                .client
                .send(request, Body::Json(payload), self.table(), false)?;
            let rows: Vec<Book> = read_json_response(response)?;
            let created = rows.into_iter().next().ok_or_else(|| {
                Error::new(ErrorKind::Internal)
                    .with_message("insert returned no rows")
                    .with_target(self.table().to_string())
            })?;
            tracing::debug!(table = self.table(), id = %created.id, "created book");
            Ok(created)
        })
    }

    fn list(&self) -> ApiResult<Vec<Book>> {
        self.run("list", || {
            let mut url = self.table_url()?;
            url.query_pairs_mut().append_pair("select", "*");
            let request = self
                .client
                .request("GET", &url)
                .set("Accept", "application/json");
            let response = self.client.send(request, Body::Empty, self.table(), false)?;
            let rows: Vec<Book> = read_json_response(response)?;
            tracing::debug!(table = self.table(), rows = rows.len(), "listed books");
            Ok(rows)
        })
    }

    fn update(&self, book: &Book) -> ApiResult<Book> {
        self.run("update", || {
            book.validate()?;
            let url = self.row_url(&book.id)?;
            let request = self
                .client
                .request("PATCH", &url)
                .set("Prefer", "return=minimal");
            let payload = encode_json(&book.fields())?;
            self.client
                .send(request, Body::Json(payload), self.table(), false)?;
            tracing::debug!(table = self.table(), id = %book.id, "updated book");
            Ok(book.clone())
        })
    }

    fn delete(&self, id: &BookId) -> ApiResult<()> {
        self.run("delete", || {
            let url = self.row_url(id)?;
            let request = self
                .client
                .request("DELETE", &url)
                .set("Prefer", "return=minimal");
            self.client.send(request, Body::Empty, self.table(), false)?;
            tracing::debug!(table = self.table(), id = %id, "deleted book");
            Ok(())
        })
    }
}

impl RemoteBlobStore {
    fn bucket(&self) -> &str {
        &self.client.config().bucket
    }

    fn object_url(&self, path: &str) -> ApiResult<Url> {
        let mut segments = vec!["storage", "v1", "object", self.bucket()];
        segments.extend(object_segments(path)?);
        build_url(self.client.base_url(), &segments)
    }
}

impl BlobStore for RemoteBlobStore {
    fn upload(
        &self,
        path: &str,
        content: &[u8],
        content_type: Option<&str>,
    ) -> ApiResult<StoredObject> {
        let url = self.object_url(path)?;
        let upsert = if self.client.config().upsert {
            "true"
        } else {
            "false"
        };
        let request = self
            .client
            .request("POST", &url)
            .set(
                "Content-Type",
                content_type.unwrap_or("application/octet-stream"),
            )
            .set("Cache-Control", "max-age=3600")
            .set("x-upsert", upsert);
        let result = self
            .client
            .send(request, Body::Bytes(content), path, false)
            .and_then(read_json_response::<UploadEnvelope>);
        match result {
            Ok(envelope) => {
                let full_path = envelope
                    .key
                    .unwrap_or_else(|| format!("{}/{path}", self.bucket()));
                tracing::debug!(bucket = self.bucket(), path, bytes = content.len(), "uploaded object");
                Ok(StoredObject {
                    path: path.to_string(),
                    full_path,
                })
            }
            Err(err) => {
                tracing::error!(bucket = self.bucket(), path, error = %err, "upload failed");
                Err(err)
            }
        }
    }

    fn public_url(&self, path: &str) -> ApiResult<Url> {
        public_object_url(self.client.base_url(), self.bucket(), path)
    }

    fn download(&self, path: &str) -> ApiResult<Bytes> {
        let url = self.object_url(path)?;
        let request = self.client.request("GET", &url);
        let result = self
            .client
            .send(request, Body::Empty, path, true)
            .and_then(|response| {
                let mut out = Vec::new();
                response.into_reader().read_to_end(&mut out).map_err(|err| {
                    Error::new(ErrorKind::Transport)
                        .with_message("failed to read object body")
                        .with_target(path.to_string())
                        .with_source(err)
                })?;
                Ok(Bytes::from(out))
            });
        match &result {
            Ok(bytes) => tracing::debug!(bucket = self.bucket(), path, bytes = bytes.len(), "downloaded object"),
            Err(err) => tracing::error!(bucket = self.bucket(), path, error = %err, "download failed"),
        }
        result
    }
}

fn encode_json<T: serde::Serialize + ?Sized>(value: &T) -> ApiResult<String> {
    serde_json::to_string(value).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode request json")
            .with_source(err)
    })
}

fn read_json_response<R>(response: ureq::Response) -> ApiResult<R>
where
    R: DeserializeOwned,
{
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::Transport)
            .with_message("failed to read response body")
            .with_source(err)
    })?;
    serde_json::from_str(&body).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("invalid response json")
            .with_source(err)
    })
}

/// Functions may answer with any content type; non-JSON bodies come back as a string.
fn read_function_response(response: ureq::Response) -> ApiResult<Value> {
    let is_json = response.content_type().contains("json");
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::Transport)
            .with_message("failed to read response body")
            .with_source(err)
    })?;
    if body.is_empty() {
        return Ok(Value::Null);
    }
    if is_json {
        serde_json::from_str(&body).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("invalid response json")
                .with_source(err)
        })
    } else {
        Ok(Value::String(body))
    }
}

fn parse_error_response(status: u16, response: ureq::Response, not_found_distinct: bool) -> Error {
    let body = response.into_string().unwrap_or_default();
    let remote = serde_json::from_str::<RemoteError>(&body).unwrap_or_default();
    let kind = error_kind_from_response(status, &remote, not_found_distinct);
    let message = remote
        .message
        .or(remote.error)
        .unwrap_or_else(|| format!("remote error status {status}"));
    Error::new(kind).with_message(message).with_status(status)
}

fn error_kind_from_response(status: u16, remote: &RemoteError, not_found_distinct: bool) -> ErrorKind {
    if not_found_distinct && is_not_found(status, remote) {
        return ErrorKind::NotFound;
    }
    if let Some(code) = remote.code.as_deref() {
        if VALIDATION_CODES.contains(&code) {
            return ErrorKind::Validation;
        }
    }
    ErrorKind::Transport
}

/// Storage reports a missing object either as a plain 404 or as a 400 whose
/// body carries `statusCode: "404"` / `error: "not_found"`.
fn is_not_found(status: u16, remote: &RemoteError) -> bool {
    if status == 404 {
        return true;
    }
    let embedded = match &remote.status_code {
        Some(Value::String(code)) => code == "404",
        Some(Value::Number(code)) => code.as_u64() == Some(404),
        _ => false,
    };
    embedded || remote.error.as_deref() == Some("not_found")
}
