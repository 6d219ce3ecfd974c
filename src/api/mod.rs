//! Purpose: Define the public Rust API boundary for bookshelf.
//! Exports: Store traits, backends (`LocalBackend`, `RemoteClient`), config, and core types.
//! Role: The only path consumers use; internal helpers stay private.
//! Invariants: Consumers depend on the traits, never on a concrete backend type.
//! Invariants: Additive-only surface.

mod config;
mod local;
mod realtime;
mod remote;
mod store;
mod subscription;
#[cfg(test)]
mod test_log;
mod urls;

pub use crate::core::book::{Book, BookForm, BookId, NewBook};
pub use crate::core::error::{Error, ErrorKind, to_exit_code};
pub use crate::core::event::{ChangeEvent, ChangeOp, ChangeScope, EventFilter};
pub use config::{
    DEFAULT_BUCKET, DEFAULT_FOLDER, DEFAULT_FUNCTION, DEFAULT_TABLE, RemoteConfig,
};
pub use local::LocalBackend;
pub use realtime::RealtimeFeed;
pub use remote::{RemoteBlobStore, RemoteClient, RemoteRecordStore};
pub use store::{
    ApiResult, BlobStore, ChangeCallback, ChangeFeed, FunctionInvoker, RecordStore, StoredObject,
};
pub use subscription::Subscription;
pub use urls::object_segments;
