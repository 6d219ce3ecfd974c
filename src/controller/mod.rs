//! Purpose: View controllers that keep UI-facing state in sync with the backing stores.
//! Exports: `BooksController`, `UploadController`, their view snapshots, and notices.
//! Role: Presentation-agnostic; the CLI `watch` loop and tests drive them directly.
//! Invariants: Controllers only talk to stores through the `api` traits.
//! Invariants: View snapshots are clones; holding one never blocks a refresh.

mod books;
mod notice;
mod upload;

pub use books::{BooksController, BooksView};
pub use notice::{Notice, NoticeKind, notice_json};
pub use upload::{UploadController, UploadView, UploadedFile};
