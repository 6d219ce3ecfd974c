//! Purpose: Declare the backend seams every consumer programs against.
//! Exports: `RecordStore`, `BlobStore`, `ChangeFeed`, `FunctionInvoker`, `StoredObject`, `ChangeCallback`.
//! Role: Interface boundary; `LocalBackend` and `RemoteClient` are the shipped implementations.
//! Invariants: Implementations never cache; every call observes current remote state.
//! Invariants: Mutations are last-writer-wins; no versioning or optimistic concurrency.
#![allow(clippy::result_large_err)]

use super::subscription::Subscription;
use crate::core::book::{Book, BookId, NewBook};
use crate::core::error::Error;
use crate::core::event::{ChangeEvent, ChangeScope};
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use url::Url;

pub type ApiResult<T> = Result<T, Error>;

/// Callback invoked for each matching change. It may run more than once per
/// mutation and out of order, so it should only trigger idempotent work.
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// CRUD over a single named collection of books.
pub trait RecordStore: Send + Sync {
    /// Persists a new record; the store assigns the identifier.
    fn create(&self, book: &NewBook) -> ApiResult<Book>;

    /// All records in store-defined order.
    fn list(&self) -> ApiResult<Vec<Book>>;

    /// Overwrites the mutable fields of the record with `book.id`.
    /// Succeeds without effect when no such record exists.
    fn update(&self, book: &Book) -> ApiResult<Book>;

    /// Removes the record; succeeds without effect when it is absent.
    fn delete(&self, id: &BookId) -> ApiResult<()>;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredObject {
    /// Key inside the bucket, as passed to `upload`.
    pub path: String,
    /// `bucket/path`.
    pub full_path: String,
}

pub trait BlobStore: Send + Sync {
    /// Stores `content` at `path`. An existing object at the same path is replaced.
    fn upload(&self, path: &str, content: &[u8], content_type: Option<&str>)
    -> ApiResult<StoredObject>;

    /// Derives the public URL for `path` without contacting the store.
    fn public_url(&self, path: &str) -> ApiResult<Url>;

    fn download(&self, path: &str) -> ApiResult<Bytes>;
}

pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self, scope: &ChangeScope, callback: ChangeCallback) -> ApiResult<Subscription>;
}

pub trait FunctionInvoker: Send + Sync {
    fn invoke(&self, name: &str, body: &Value) -> ApiResult<Value>;
}
