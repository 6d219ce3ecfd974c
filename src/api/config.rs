//! Purpose: Connection settings for the hosted platform.
//! Exports: `RemoteConfig`.
//! Role: Explicitly constructed value handed to `RemoteClient`; no globals, no embedded secrets.
//! Invariants: `url` is a normalized http(s) base; `api_key` is non-empty.
//! Invariants: Names (table, bucket, function) default to the catalog deployment.
#![allow(clippy::result_large_err)]

use super::store::ApiResult;
use super::urls::normalize_base_url;
use crate::core::error::{Error, ErrorKind};
use crate::core::event::ChangeScope;
use std::time::Duration;
use url::Url;

pub const DEFAULT_TABLE: &str = "books";
pub const DEFAULT_BUCKET: &str = "supabase-bucket";
pub const DEFAULT_FOLDER: &str = "public";
pub const DEFAULT_FUNCTION: &str = "hello-world";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(25);

#[derive(Clone, Debug)]
pub struct RemoteConfig {
    pub url: Url,
    pub api_key: String,
    pub schema: String,
    pub table: String,
    pub bucket: String,
    pub folder: String,
    pub function: String,
    /// Bound on every HTTP call; also bounds the realtime join handshake.
    pub timeout: Duration,
    /// Send `x-upsert: true` on upload so the last write wins.
    pub upsert: bool,
    /// Websocket endpoint override; derived from `url` when absent.
    pub realtime_url: Option<Url>,
    pub heartbeat: Duration,
}

impl RemoteConfig {
    pub fn new(url: &str, api_key: impl Into<String>) -> ApiResult<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("api key must not be empty"));
        }
        Ok(Self {
            url: normalize_base_url(url)?,
            api_key,
            schema: ChangeScope::DEFAULT_SCHEMA.to_string(),
            table: DEFAULT_TABLE.to_string(),
            bucket: DEFAULT_BUCKET.to_string(),
            folder: DEFAULT_FOLDER.to_string(),
            function: DEFAULT_FUNCTION.to_string(),
            timeout: DEFAULT_TIMEOUT,
            upsert: true,
            realtime_url: None,
            heartbeat: DEFAULT_HEARTBEAT,
        })
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    pub fn with_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = folder.into();
        self
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = function.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_realtime_url(mut self, raw: &str) -> ApiResult<Self> {
        let url = Url::parse(raw.trim()).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid realtime url")
                .with_source(err)
        })?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(
                Error::new(ErrorKind::Usage).with_message("realtime url must use ws or wss scheme")
            );
        }
        self.realtime_url = Some(url);
        Ok(self)
    }

    /// Change scope covering every operation on the configured table.
    pub fn scope(&self) -> ChangeScope {
        ChangeScope::table(self.table.clone()).with_schema(self.schema.clone())
    }
}
