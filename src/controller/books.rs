//! Purpose: Books view controller: initial load, change-feed driven refresh, and mutations.
//! Exports: `BooksController`, `BooksView`.
//! Role: Binds a `RecordStore` and a `ChangeFeed` to in-memory view state.
//! Invariants: A refresh replaces `books` wholesale; a failed call never overwrites it.
//! Invariants: A list fetched before a newer one was applied is discarded.
//! Invariants: The subscription is released on `unmount` and on drop.
//! Notes: Mutations re-fetch directly and again when the feed echoes; both converge.
#![allow(clippy::result_large_err)]

use super::notice::{Notice, NoticeKind, visible};
use crate::api::{
    ApiResult, Book, BookForm, BookId, ChangeEvent, ChangeFeed, ChangeScope, Error, NewBook,
    RecordStore, Subscription,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const DEFAULT_ERROR_TTL: Duration = Duration::from_secs(3);

type RenderFn = Box<dyn Fn(&BooksView) + Send + Sync>;

#[derive(Clone, Debug, Default)]
pub struct BooksView {
    pub books: Vec<Book>,
    pub loading: bool,
    /// Book currently loaded into the edit form, if any.
    pub editing: Option<BookId>,
    /// Number of successful refreshes applied.
    pub refreshes: u64,
    notice: Option<Notice>,
    applied_ticket: u64,
}

impl BooksView {
    pub fn error_message(&self) -> Option<&str> {
        visible(&self.notice, NoticeKind::Error)
    }
}

pub struct BooksController {
    store: Arc<dyn RecordStore>,
    feed: Arc<dyn ChangeFeed>,
    scope: ChangeScope,
    shared: Arc<Shared>,
    subscription: Option<Subscription>,
}

struct Shared {
    view: Mutex<BooksView>,
    tickets: AtomicU64,
    error_ttl: Duration,
    render: Option<RenderFn>,
}

impl BooksController {
    pub fn new(store: Arc<dyn RecordStore>, feed: Arc<dyn ChangeFeed>, scope: ChangeScope) -> Self {
        Self {
            store,
            feed,
            scope,
            shared: Arc::new(Shared {
                view: Mutex::new(BooksView::default()),
                tickets: AtomicU64::new(0),
                error_ttl: DEFAULT_ERROR_TTL,
                render: None,
            }),
            subscription: None,
        }
    }

    /// Called with a snapshot after every view change. Must be set before `mount`.
    pub fn with_render<F>(mut self, render: F) -> Self
    where
        F: Fn(&BooksView) + Send + Sync + 'static,
    {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.render = Some(Box::new(render)),
            None => tracing::warn!("render hook ignored: controller is already mounted"),
        }
        self
    }

    pub fn with_error_ttl(mut self, ttl: Duration) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.error_ttl = ttl,
            None => tracing::warn!("error ttl ignored: controller is already mounted"),
        }
        self
    }

    pub fn is_mounted(&self) -> bool {
        self.subscription.is_some()
    }

    /// Loads the initial list, then subscribes so every change triggers a re-fetch.
    /// A failed initial load is recorded in the view; only a failed subscribe is returned.
    pub fn mount(&mut self) -> ApiResult<()> {
        if self.subscription.is_some() {
            return Ok(());
        }
        self.shared.lock().loading = true;
        let _ = self.shared.refresh(self.store.as_ref());

        let store = Arc::clone(&self.store);
        let shared = Arc::clone(&self.shared);
        let subscription = self
            .feed
            .subscribe(
                &self.scope,
                Arc::new(move |event: &ChangeEvent| {
                    tracing::debug!(op = ?event.op, table = %event.table, "change received; refreshing");
                    let _ = shared.refresh(store.as_ref());
                }),
            )
            .inspect_err(|err| self.shared.fail("subscribe", err))?;
        self.subscription = Some(subscription);
        Ok(())
    }

    pub fn unmount(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }

    pub fn refresh(&self) -> ApiResult<()> {
        self.shared.refresh(self.store.as_ref())
    }

    pub fn view(&self) -> BooksView {
        self.shared.lock().clone()
    }

    pub fn books(&self) -> Vec<Book> {
        self.shared.lock().books.clone()
    }

    pub fn create(&self, book: &NewBook) -> ApiResult<Book> {
        let created = self
            .store
            .create(book)
            .inspect_err(|err| self.shared.fail("create", err))?;
        let _ = self.refresh();
        Ok(created)
    }

    pub fn update(&self, book: &Book) -> ApiResult<Book> {
        let updated = self
            .store
            .update(book)
            .inspect_err(|err| self.shared.fail("update", err))?;
        let _ = self.refresh();
        Ok(updated)
    }

    pub fn delete(&self, id: &BookId) -> ApiResult<()> {
        self.store
            .delete(id)
            .inspect_err(|err| self.shared.fail("delete", err))?;
        let _ = self.refresh();
        Ok(())
    }

    /// Loads a listed book into the edit form.
    pub fn edit(&self, id: &BookId) -> Option<BookForm> {
        let mut view = self.shared.lock();
        let form = view.books.iter().find(|book| &book.id == id).map(BookForm::from)?;
        view.editing = Some(id.clone());
        Some(form)
    }

    pub fn cancel_edit(&self) {
        self.shared.lock().editing = None;
    }

    /// Updates the book being edited, or creates a new one when nothing is being edited.
    pub fn submit(&self, form: &BookForm) -> ApiResult<Book> {
        let fields = form
            .parse()
            .inspect_err(|err| self.shared.fail("save", err))?;
        let editing = self.shared.lock().editing.clone();
        let saved = match editing {
            Some(id) => self.update(&Book::from_new(id, fields))?,
            None => self.create(&fields)?,
        };
        self.cancel_edit();
        Ok(saved)
    }
}

impl Drop for BooksController {
    fn drop(&mut self) {
        self.unmount();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BooksView> {
        self.view.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn refresh(&self, store: &dyn RecordStore) -> ApiResult<()> {
        let ticket = self.tickets.fetch_add(1, Ordering::SeqCst) + 1;
        let books = store.list().inspect_err(|err| self.fail("refresh", err))?;
        let snapshot = {
            let mut view = self.lock();
            if ticket < view.applied_ticket {
                tracing::debug!(ticket, applied = view.applied_ticket, "discarding stale list");
                return Ok(());
            }
            view.applied_ticket = ticket;
            view.books = books;
            view.loading = false;
            view.refreshes += 1;
            view.clone()
        };
        self.render(&snapshot);
        Ok(())
    }

    fn fail(&self, action: &str, err: &Error) {
        tracing::warn!(action, error = %err, "books operation failed");
        let message = format!("{action} failed: {}", err.message().unwrap_or("unexpected error"));
        let snapshot = {
            let mut view = self.lock();
            view.loading = false;
            view.notice = Some(Notice::error(message, self.error_ttl));
            view.clone()
        };
        self.render(&snapshot);
    }

    fn render(&self, view: &BooksView) {
        if let Some(render) = &self.render {
            render(view);
        }
    }
}
