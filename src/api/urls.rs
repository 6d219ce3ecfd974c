//! Purpose: URL and object-key helpers shared by the local and remote backends.
//! Exports: `normalize_base_url`, `build_url`, `object_segments`, `public_object_url`.
//! Role: Deterministic path derivation; no I/O.
//! Invariants: Base URLs are http(s) with an empty path; segments are percent-encoded by `url`.
//! Invariants: Object keys are relative, slash-separated, and free of empty or dot segments.
#![allow(clippy::result_large_err)]

use super::store::ApiResult;
use crate::core::error::{Error, ErrorKind};
use url::Url;

pub fn normalize_base_url(raw: &str) -> ApiResult<Url> {
    let mut url = Url::parse(raw.trim()).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid remote base url")
            .with_source(err)
    })?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("remote base url must use http or https scheme"));
    }
    if url.host_str().is_none() {
        return Err(Error::new(ErrorKind::Usage).with_message("remote base url must include a host"));
    }
    if url.path() != "/" && !url.path().is_empty() {
        return Err(
            Error::new(ErrorKind::Usage).with_message("remote base url must not include a path")
        );
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

pub fn build_url(base_url: &Url, segments: &[&str]) -> ApiResult<Url> {
    let mut url = base_url.clone();
    {
        let mut path = url.path_segments_mut().map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("remote base url cannot be a base")
        })?;
        path.clear();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

/// Splits an object key into URL segments, rejecting keys that could escape the bucket.
pub fn object_segments(path: &str) -> ApiResult<Vec<&str>> {
    let invalid = |reason: &str| {
        Error::new(ErrorKind::Validation)
            .with_message(format!("invalid object path: {reason}"))
            .with_target(path.to_string())
    };
    if path.is_empty() {
        return Err(invalid("path is empty"));
    }
    if path.starts_with('/') {
        return Err(invalid("path must be relative"));
    }
    let segments: Vec<&str> = path.split('/').collect();
    for segment in &segments {
        if segment.is_empty() {
            return Err(invalid("empty path segment"));
        }
        if *segment == "." || *segment == ".." {
            return Err(invalid("dot segments are not allowed"));
        }
    }
    Ok(segments)
}

/// `{base}/storage/v1/object/public/{bucket}/{path}`.
pub fn public_object_url(base_url: &Url, bucket: &str, path: &str) -> ApiResult<Url> {
    let mut segments = vec!["storage", "v1", "object", "public", bucket];
    segments.extend(object_segments(path)?);
    build_url(base_url, &segments)
}
