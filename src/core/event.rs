//! Purpose: Model change notifications and the scope a subscriber listens on.
//! Exports: `ChangeOp`, `ChangeEvent`, `ChangeScope`, `EventFilter`.
//! Role: Backend-neutral event vocabulary shared by the in-memory and realtime feeds.
//! Invariants: Events are advisory; they never carry authoritative row state.
//! Invariants: Scope matching is a pure function of (schema, table, operation).
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_wire(self) -> &'static str {
        match self {
            ChangeOp::Insert => "INSERT",
            ChangeOp::Update => "UPDATE",
            ChangeOp::Delete => "DELETE",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeOp::Insert),
            "UPDATE" => Some(ChangeOp::Update),
            "DELETE" => Some(ChangeOp::Delete),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub schema: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<String>,
}

impl ChangeEvent {
    pub fn new(op: ChangeOp, schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            op,
            schema: schema.into(),
            table: table.into(),
            commit_timestamp: None,
        }
    }

    pub fn with_commit_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.commit_timestamp = Some(timestamp.into());
        self
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EventFilter {
    #[default]
    All,
    Only(ChangeOp),
}

impl EventFilter {
    pub fn as_wire(self) -> &'static str {
        match self {
            EventFilter::All => "*",
            EventFilter::Only(op) => op.as_wire(),
        }
    }

    pub fn accepts(self, op: ChangeOp) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(wanted) => wanted == op,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChangeScope {
    pub schema: String,
    pub table: String,
    pub filter: EventFilter,
}

impl ChangeScope {
    pub const DEFAULT_SCHEMA: &'static str = "public";

    pub fn table(table: impl Into<String>) -> Self {
        Self {
            schema: Self::DEFAULT_SCHEMA.to_string(),
            table: table.into(),
            filter: EventFilter::All,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn only(mut self, op: ChangeOp) -> Self {
        self.filter = EventFilter::Only(op);
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.schema == event.schema && self.table == event.table && self.filter.accepts(event.op)
    }

    /// Channel topic name, e.g. `table:books`.
    pub fn topic(&self) -> String {
        format!("table:{}", self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::{ChangeEvent, ChangeOp, ChangeScope, EventFilter};

    #[test]
    fn wildcard_scope_matches_every_operation_on_its_table() {
        let scope = ChangeScope::table("books");
        for op in [ChangeOp::Insert, ChangeOp::Update, ChangeOp::Delete] {
            assert!(scope.matches(&ChangeEvent::new(op, "public", "books")));
        }
        assert!(!scope.matches(&ChangeEvent::new(ChangeOp::Insert, "public", "authors")));
        assert!(!scope.matches(&ChangeEvent::new(ChangeOp::Insert, "audit", "books")));
    }

    #[test]
    fn single_operation_filter() {
        let scope = ChangeScope::table("books").only(ChangeOp::Delete);
        assert_eq!(scope.filter, EventFilter::Only(ChangeOp::Delete));
        assert!(scope.matches(&ChangeEvent::new(ChangeOp::Delete, "public", "books")));
        assert!(!scope.matches(&ChangeEvent::new(ChangeOp::Update, "public", "books")));
    }

    #[test]
    fn wire_names() {
        assert_eq!(EventFilter::All.as_wire(), "*");
        assert_eq!(ChangeOp::from_wire("delete"), Some(ChangeOp::Delete));
        assert_eq!(ChangeOp::from_wire("TRUNCATE"), None);
        assert_eq!(ChangeScope::table("books").topic(), "table:books");
    }
}
