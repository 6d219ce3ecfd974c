//! Purpose: In-process backend implementing every store seam against shared memory.
//! Exports: `LocalBackend`.
//! Role: Stand-in platform for tests, demos and offline development; clones share state.
//! Invariants: Identifiers are assigned from a monotonically increasing counter and never reused.
//! Invariants: `list` returns insertion order; update/delete of a missing id is a no-op.
//! Invariants: Every committed mutation is announced to matching listeners on their own threads.
#![allow(clippy::result_large_err)]

use super::config::{DEFAULT_BUCKET, DEFAULT_TABLE};
use super::store::{
    ApiResult, BlobStore, ChangeCallback, ChangeFeed, FunctionInvoker, RecordStore, StoredObject,
};
use super::subscription::Subscription;
use super::urls::{normalize_base_url, object_segments, public_object_url};
use crate::core::book::{Book, BookId, NewBook};
use crate::core::error::{Error, ErrorKind};
use crate::core::event::{ChangeEvent, ChangeOp, ChangeScope};
use bytes::Bytes;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use url::Url;

const LOCAL_PUBLIC_BASE: &str = "http://localhost:54321";

type FunctionHandler = Arc<dyn Fn(&Value) -> ApiResult<Value> + Send + Sync>;

#[derive(Clone)]
pub struct LocalBackend {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    schema: String,
    table: String,
    bucket: String,
    public_base: Url,
    state: Mutex<LocalState>,
    listeners: Mutex<HashMap<u64, Listener>>,
    functions: Mutex<HashMap<String, FunctionHandler>>,
    next_listener: AtomicU64,
}

#[derive(Default)]
struct LocalState {
    books: Vec<Book>,
    next_id: i64,
    objects: BTreeMap<String, Bytes>,
}

struct Listener {
    scope: ChangeScope,
    sender: Sender<ChangeEvent>,
    worker: Option<JoinHandle<()>>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::with_names(DEFAULT_TABLE, DEFAULT_BUCKET)
    }

    pub fn with_names(table: impl Into<String>, bucket: impl Into<String>) -> Self {
        let public_base = normalize_base_url(LOCAL_PUBLIC_BASE).expect("local public base url");
        Self {
            inner: Arc::new(LocalInner {
                schema: ChangeScope::DEFAULT_SCHEMA.to_string(),
                table: table.into(),
                bucket: bucket.into(),
                public_base,
                state: Mutex::new(LocalState {
                    next_id: 1,
                    ..LocalState::default()
                }),
                listeners: Mutex::new(HashMap::new()),
                functions: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    pub fn table(&self) -> &str {
        &self.inner.table
    }

    pub fn bucket(&self) -> &str {
        &self.inner.bucket
    }

    pub fn scope(&self) -> ChangeScope {
        ChangeScope::table(self.inner.table.clone()).with_schema(self.inner.schema.clone())
    }

    /// Registers an in-process function served by `FunctionInvoker::invoke`.
    pub fn register_function<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Value) -> ApiResult<Value> + Send + Sync + 'static,
    {
        lock(&self.inner.functions).insert(name.into(), Arc::new(handler));
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    fn announce(&self, op: ChangeOp) {
        let mut event = ChangeEvent::new(op, self.inner.schema.clone(), self.inner.table.clone());
        if let Ok(timestamp) = OffsetDateTime::now_utc().format(&Rfc3339) {
            event = event.with_commit_timestamp(timestamp);
        }
        let listeners = lock(&self.inner.listeners);
        for (id, listener) in listeners.iter() {
            if listener.scope.matches(&event) && listener.sender.send(event.clone()).is_err() {
                tracing::warn!(subscription = id, "listener worker is gone; dropping event");
            }
        }
    }

    fn log_failure(&self, op: &str, err: &Error) {
        tracing::warn!(table = %self.inner.table, op, error = %err, "local backend call failed");
    }

    fn release_listener(inner: &LocalInner, id: u64) {
        let listener = lock(&inner.listeners).remove(&id);
        let Some(mut listener) = listener else {
            return;
        };
        drop(listener.sender);
        if let Some(worker) = listener.worker.take() {
            // A callback that drops its own subscription must not join itself.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for LocalBackend {
    fn create(&self, book: &NewBook) -> ApiResult<Book> {
        book.validate()
            .inspect_err(|err| self.log_failure("create", err))?;
        let created = {
            let mut state = lock(&self.inner.state);
            let id = BookId::Int(state.next_id);
            state.next_id += 1;
            let created = Book::from_new(id, book.clone());
            state.books.push(created.clone());
            created
        };
        tracing::debug!(table = %self.inner.table, id = %created.id, "created book");
        self.announce(ChangeOp::Insert);
        Ok(created)
    }

    fn list(&self) -> ApiResult<Vec<Book>> {
        Ok(lock(&self.inner.state).books.clone())
    }

    fn update(&self, book: &Book) -> ApiResult<Book> {
        book.validate()
            .inspect_err(|err| self.log_failure("update", err))?;
        let found = {
            let mut state = lock(&self.inner.state);
            match state.books.iter_mut().find(|existing| existing.id == book.id) {
                Some(existing) => {
                    *existing = book.clone();
                    true
                }
                None => false,
            }
        };
        if found {
            self.announce(ChangeOp::Update);
        } else {
            tracing::debug!(table = %self.inner.table, id = %book.id, "update matched no rows");
        }
        Ok(book.clone())
    }

    fn delete(&self, id: &BookId) -> ApiResult<()> {
        let removed = {
            let mut state = lock(&self.inner.state);
            let before = state.books.len();
            state.books.retain(|existing| &existing.id != id);
            before != state.books.len()
        };
        if removed {
            self.announce(ChangeOp::Delete);
        }
        Ok(())
    }
}

impl BlobStore for LocalBackend {
    fn upload(
        &self,
        path: &str,
        content: &[u8],
        _content_type: Option<&str>,
    ) -> ApiResult<StoredObject> {
        object_segments(path).inspect_err(|err| self.log_failure("upload", err))?;
        lock(&self.inner.state)
            .objects
            .insert(path.to_string(), Bytes::copy_from_slice(content));
        Ok(StoredObject {
            path: path.to_string(),
            full_path: format!("{}/{path}", self.inner.bucket),
        })
    }

    fn public_url(&self, path: &str) -> ApiResult<Url> {
        public_object_url(&self.inner.public_base, &self.inner.bucket, path)
    }

    fn download(&self, path: &str) -> ApiResult<Bytes> {
        object_segments(path).inspect_err(|err| self.log_failure("download", err))?;
        lock(&self.inner.state)
            .objects
            .get(path)
            .cloned()
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound)
                    .with_message("object not found")
                    .with_target(path.to_string())
            })
            .inspect_err(|err| self.log_failure("download", err))
    }
}

impl ChangeFeed for LocalBackend {
    fn subscribe(&self, scope: &ChangeScope, callback: ChangeCallback) -> ApiResult<Subscription> {
        let id = self.inner.next_listener.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::channel::<ChangeEvent>();
        let worker = thread::Builder::new()
            .name(format!("bookshelf-feed-{id}"))
            .spawn(move || {
                while let Ok(event) = receiver.recv() {
                    callback(&event);
                }
            })
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to spawn feed worker")
                    .with_source(err)
            })?;
        lock(&self.inner.listeners).insert(
            id,
            Listener {
                scope: scope.clone(),
                sender,
                worker: Some(worker),
            },
        );
        tracing::debug!(subscription = id, table = %scope.table, "subscribed");

        let inner = Arc::clone(&self.inner);
        Ok(Subscription::new(id, scope.clone(), move || {
            LocalBackend::release_listener(&inner, id);
        }))
    }
}

impl FunctionInvoker for LocalBackend {
    fn invoke(&self, name: &str, body: &Value) -> ApiResult<Value> {
        let handler = lock(&self.inner.functions).get(name).cloned();
        let result = match handler {
            Some(handler) => handler(body),
            None => Err(Error::new(ErrorKind::NotFound)
                .with_message("function is not registered")
                .with_target(name.to_string())),
        };
        result.inspect_err(|err| self.log_failure("invoke", err))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}
