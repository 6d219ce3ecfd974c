//! Purpose: Count warn and error events emitted while a closure runs.
//! Exports: `failures_logged`.
//! Role: Test-only helper for asserting that store failures are logged before they return.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

struct FailureCounter(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for FailureCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() <= Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Runs `call` on this thread and returns its output with the number of warn/error events.
pub(crate) fn failures_logged<T>(call: impl FnOnce() -> T) -> (T, usize) {
    let count = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(FailureCounter(Arc::clone(&count)));
    let output = tracing::subscriber::with_default(subscriber, call);
    (output, count.load(Ordering::SeqCst))
}
