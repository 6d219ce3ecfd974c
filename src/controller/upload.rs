//! Purpose: Upload view controller: push local files to a blob store and track their public URLs.
//! Exports: `UploadController`, `UploadView`, `UploadedFile`.
//! Role: Binds a `BlobStore` to the list of files uploaded in this session.
//! Invariants: A file is listed only after its upload succeeded, in upload order.
//! Invariants: The public URL of a listed file is derived locally, never fetched.
//! Invariants: At most one upload is in flight per controller.
#![allow(clippy::result_large_err)]

use super::notice::{Notice, NoticeKind, visible};
use crate::api::{ApiResult, BlobStore, Error, ErrorKind};
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use time::OffsetDateTime;

pub const DEFAULT_ERROR_TTL: Duration = Duration::from_secs(3);
pub const DEFAULT_COPIED_TTL: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UploadedFile {
    /// Session-local identifier; unrelated to the storage key.
    pub id: String,
    pub name: String,
    pub path: String,
    pub url: String,
    copied_until: Option<Instant>,
}

impl UploadedFile {
    /// True while the "copied" indicator for this file should be shown.
    pub fn is_copied(&self) -> bool {
        self.copied_until
            .is_some_and(|until| Instant::now() < until)
    }
}

#[derive(Clone, Debug, Default)]
pub struct UploadView {
    pub files: Vec<UploadedFile>,
    pub uploading: bool,
    notice: Option<Notice>,
}

impl UploadView {
    pub fn error_message(&self) -> Option<&str> {
        visible(&self.notice, NoticeKind::Error)
    }

    pub fn success_message(&self) -> Option<&str> {
        visible(&self.notice, NoticeKind::Success)
    }
}

pub struct UploadController {
    blobs: Arc<dyn BlobStore>,
    folder: String,
    error_ttl: Duration,
    copied_ttl: Duration,
    view: Mutex<UploadView>,
}

impl UploadController {
    pub fn new(blobs: Arc<dyn BlobStore>, folder: impl Into<String>) -> Self {
        Self {
            blobs,
            folder: folder.into().trim_matches('/').to_string(),
            error_ttl: DEFAULT_ERROR_TTL,
            copied_ttl: DEFAULT_COPIED_TTL,
            view: Mutex::new(UploadView::default()),
        }
    }

    pub fn with_error_ttl(mut self, ttl: Duration) -> Self {
        self.error_ttl = ttl;
        self
    }

    pub fn with_copied_ttl(mut self, ttl: Duration) -> Self {
        self.copied_ttl = ttl;
        self
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn view(&self) -> UploadView {
        self.lock().clone()
    }

    /// Storage key for a file name: `folder/name`, or just `name` with an empty folder.
    pub fn object_path(&self, file_name: &str) -> String {
        if self.folder.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{file_name}", self.folder)
        }
    }

    /// Uploads `content` under the configured folder and lists the result.
    pub fn upload(&self, file_name: &str, content: &[u8]) -> ApiResult<UploadedFile> {
        {
            let mut view = self.lock();
            if view.uploading {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("an upload is already in progress")
                    .with_target(file_name.to_string()));
            }
            view.uploading = true;
            view.notice = None;
        }
        let result = self.upload_inner(file_name, content);
        let mut view = self.lock();
        view.uploading = false;
        match &result {
            Ok(file) => {
                view.notice = Some(Notice::success(format!("uploaded {}", file.name)));
                view.files.push(file.clone());
            }
            Err(err) => {
                tracing::warn!(file = file_name, error = %err, "upload failed");
                let message = format!(
                    "upload failed: {}",
                    err.message().unwrap_or("unexpected error")
                );
                view.notice = Some(Notice::error(message, self.error_ttl));
            }
        }
        result
    }

    fn upload_inner(&self, file_name: &str, content: &[u8]) -> ApiResult<UploadedFile> {
        if file_name.trim().is_empty() || file_name.contains('/') {
            return Err(Error::new(ErrorKind::Validation)
                .with_message("file name must be a single non-empty path segment")
                .with_target(file_name.to_string()));
        }
        let path = self.object_path(file_name);
        let content_type = content_type_for(file_name);
        let stored = self.blobs.upload(&path, content, Some(content_type.as_str()))?;
        let url = self.blobs.public_url(&stored.path)?;
        tracing::info!(path = %stored.path, bytes = content.len(), "uploaded file");
        Ok(UploadedFile {
            id: local_id(),
            name: file_name.to_string(),
            path: stored.path,
            url: url.to_string(),
            copied_until: None,
        })
    }

    /// Flags a listed file as copied and returns its URL for the clipboard.
    pub fn mark_copied(&self, id: &str) -> Option<String> {
        let until = Instant::now() + self.copied_ttl;
        let mut view = self.lock();
        let file = view.files.iter_mut().find(|file| file.id == id)?;
        file.copied_until = Some(until);
        Some(file.url.clone())
    }

    pub fn download(&self, path: &str) -> ApiResult<Bytes> {
        self.blobs.download(path).inspect_err(|err| {
            tracing::warn!(path, error = %err, "download failed");
            let message = format!(
                "download failed: {}",
                err.message().unwrap_or("unexpected error")
            );
            self.lock().notice = Some(Notice::error(message, self.error_ttl));
        })
    }

    fn lock(&self) -> MutexGuard<'_, UploadView> {
        self.view.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

fn content_type_for(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

fn local_id() -> String {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    let mut suffix = [0u8; 4];
    if getrandom::fill(&mut suffix).is_err() {
        return millis.to_string();
    }
    let hex: String = suffix.iter().map(|byte| format!("{byte:02x}")).collect();
    format!("{millis}-{hex}")
}
