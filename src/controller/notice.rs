//! Purpose: Transient user-facing notices (errors, confirmations) with optional expiry.
//! Exports: `Notice`, `NoticeKind`, `notice_json`.
//! Role: Shared by controllers; the CLI renders them as JSON on stderr.
//! Invariants: An expired notice is invisible; expiry is checked against a caller-supplied instant.
//! Invariants: JSON schema is additive-only.
use serde_json::{Map, Value, json};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NoticeKind {
    Error,
    Success,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
    expires_at: Option<Instant>,
}

impl Notice {
    /// An error that clears itself after `ttl`.
    pub fn error(message: impl Into<String>, ttl: Duration) -> Self {
        Self {
            kind: NoticeKind::Error,
            message: message.into(),
            expires_at: Some(Instant::now() + ttl),
        }
    }

    /// A confirmation that stays until replaced.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Success,
            message: message.into(),
            expires_at: None,
        }
    }

    pub fn is_visible_at(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|expires_at| now < expires_at)
    }
}

/// The notice in `slot` if it has the wanted kind and has not expired.
pub(crate) fn visible(slot: &Option<Notice>, kind: NoticeKind) -> Option<&str> {
    slot.as_ref()
        .filter(|notice| notice.kind == kind && notice.is_visible_at(Instant::now()))
        .map(|notice| notice.message.as_str())
}

pub fn notice_json(notice: &Notice, source: &str) -> Value {
    let kind = match notice.kind {
        NoticeKind::Error => "error",
        NoticeKind::Success => "success",
    };
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(kind));
    inner.insert("source".to_string(), json!(source));
    inner.insert("message".to_string(), json!(notice.message));

    let mut outer = Map::new();
    outer.insert("notice".to_string(), Value::Object(inner));
    Value::Object(outer)
}

#[cfg(test)]
mod tests {
    use super::{Notice, NoticeKind, notice_json, visible};
    use std::time::{Duration, Instant};

    #[test]
    fn error_notice_expires() {
        let notice = Notice::error("save failed", Duration::from_secs(3));
        let now = Instant::now();
        assert!(notice.is_visible_at(now));
        assert!(!notice.is_visible_at(now + Duration::from_secs(4)));
    }

    #[test]
    fn zero_ttl_error_is_never_visible() {
        let slot = Some(Notice::error("gone", Duration::ZERO));
        assert_eq!(visible(&slot, NoticeKind::Error), None);
    }

    #[test]
    fn visible_filters_by_kind() {
        let slot = Some(Notice::success("uploaded a.txt"));
        assert_eq!(visible(&slot, NoticeKind::Success), Some("uploaded a.txt"));
        assert_eq!(visible(&slot, NoticeKind::Error), None);
    }

    #[test]
    fn notice_json_has_required_fields() {
        let value = notice_json(&Notice::success("uploaded a.txt"), "upload");
        let obj = value
            .get("notice")
            .and_then(|v| v.as_object())
            .expect("notice object");
        assert_eq!(obj.get("kind").and_then(|v| v.as_str()), Some("success"));
        assert_eq!(obj.get("source").and_then(|v| v.as_str()), Some("upload"));
        assert_eq!(
            obj.get("message").and_then(|v| v.as_str()),
            Some("uploaded a.txt")
        );
    }
}
