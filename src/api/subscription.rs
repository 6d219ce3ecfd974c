//! Purpose: Owned handle for a live change-feed subscription.
//! Exports: `Subscription`.
//! Role: Scoped resource; the remote listener slot lives exactly as long as the handle.
//! Invariants: Release runs at most once, on `unsubscribe` or on drop, whichever comes first.
//! Invariants: Releasing one handle never affects other subscriptions to the same scope.

use crate::core::event::ChangeScope;
use std::fmt;

type Release = Box<dyn FnOnce() + Send>;

pub struct Subscription {
    id: u64,
    scope: ChangeScope,
    release: Option<Release>,
}

impl Subscription {
    pub fn new(id: u64, scope: ChangeScope, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            scope,
            release: Some(Box::new(release)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn scope(&self) -> &ChangeScope {
        &self.scope
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            tracing::debug!(subscription = self.id, table = %self.scope.table, "unsubscribed");
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}
