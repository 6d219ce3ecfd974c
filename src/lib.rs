//! Purpose: Library crate behind the `bookshelf` CLI: a CRUD-with-realtime-sync data layer.
//! Exports: `api` (stores, feeds, backends), `controller` (view reconciliation), `core`.
//! Role: Consumers build against `api` traits; the CLI and HTTP route are thin callers.
//! Invariants: No process-wide client state; every store is constructed and injected.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod controller;
pub mod core;
