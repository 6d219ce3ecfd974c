//! Purpose: Catalog scenarios against the in-process backend.
//! Exports: None (integration test module).
//! Role: Validate CRUD, storage, change delivery and controller lifecycle without I/O.
//! Invariants: Every wait is bounded.

use bookshelf::api::{
    BlobStore, Book, BookId, ChangeEvent, ChangeFeed, ChangeOp, ChangeScope, ErrorKind,
    FunctionInvoker, LocalBackend, NewBook, RecordStore,
};
use bookshelf::controller::{BooksController, UploadController};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(2);

fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn dune_scenario() {
    let backend = LocalBackend::new();
    let dune = NewBook::new("Dune", "Herbert").with_count(3);
    let created = backend.create(&dune).expect("create");

    let listed = backend.list().expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].fields(), dune);
    assert_eq!(listed[0].count, 3);

    let mut changed = created.clone();
    changed.count = 5;
    backend.update(&changed).expect("update");
    let listed = backend.list().expect("list");
    assert_eq!(listed, vec![changed]);
    assert_eq!(listed[0].id, created.id);

    backend.delete(&created.id).expect("delete");
    assert!(backend.list().expect("list").is_empty());
}

#[test]
fn deleting_missing_id_changes_nothing() {
    let backend = LocalBackend::new();
    let kept = backend.create(&NewBook::new("Emma", "Austen")).expect("create");
    backend.delete(&BookId::Int(404)).expect("missing delete");
    backend.delete(&BookId::from("not-an-id")).expect("missing text delete");
    assert_eq!(backend.list().expect("list"), vec![kept]);
}

#[test]
fn invalid_books_are_rejected_before_storage() {
    let backend = LocalBackend::new();
    let err = backend
        .create(&NewBook::new("Dune", "   "))
        .expect_err("blank author");
    assert_eq!(err.kind(), ErrorKind::Validation);

    let created = backend.create(&NewBook::new("Dune", "Herbert")).expect("create");
    let blank = Book::from_new(created.id.clone(), NewBook::new("", "Herbert"));
    let err = backend.update(&blank).expect_err("blank name");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(backend.list().expect("list"), vec![created]);
}

#[test]
fn upload_scenario() {
    let backend = LocalBackend::new();
    let stored = backend
        .upload("public/a.txt", b"hello", Some("text/plain"))
        .expect("upload");
    let url = backend.public_url(&stored.path).expect("url");
    assert!(url.as_str().contains("a.txt"));
    assert_eq!(&backend.download(&stored.path).expect("download")[..], b"hello");
}

#[test]
fn independent_delete_reaches_subscriber() {
    let backend = LocalBackend::new();
    let doomed = backend.create(&NewBook::new("Dune", "Herbert")).expect("create");

    let (tx, rx) = mpsc::channel::<ChangeEvent>();
    let tx = Mutex::new(tx);
    let subscription = backend
        .subscribe(
            &backend.scope(),
            Arc::new(move |event: &ChangeEvent| {
                let _ = tx
                    .lock()
                    .unwrap_or_else(|poison| poison.into_inner())
                    .send(event.clone());
            }),
        )
        .expect("subscribe");

    // A second handle plays the other client.
    let other = backend.clone();
    other.delete(&doomed.id).expect("delete");

    let event = rx.recv_timeout(WAIT).expect("callback fired");
    assert_eq!(event.op, ChangeOp::Delete);
    assert!(event.commit_timestamp.is_some());
    assert!(backend.list().expect("list").iter().all(|book| book.id != doomed.id));
    subscription.unsubscribe();
    assert_eq!(backend.listener_count(), 0);
}

#[test]
fn callbacks_fire_at_least_once_per_mutation() {
    let backend = LocalBackend::new();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let _subscription = backend
        .subscribe(
            &backend.scope(),
            Arc::new(move |_: &ChangeEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .expect("subscribe");

    let book = backend.create(&NewBook::new("A", "a")).expect("create");
    backend.update(&book).expect("update");
    backend.delete(&book.id).expect("delete");
    assert!(wait_until(|| fired.load(Ordering::SeqCst) >= 3));
}

#[test]
fn other_tables_do_not_reach_subscriber() {
    let backend = LocalBackend::with_names("books", "supabase-bucket");
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let _subscription = backend
        .subscribe(
            &ChangeScope::table("authors"),
            Arc::new(move |_: &ChangeEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .expect("subscribe");
    backend.create(&NewBook::new("A", "a")).expect("create");
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn unsubscribing_one_handle_keeps_the_other() {
    let backend = LocalBackend::new();
    let first = backend
        .subscribe(&backend.scope(), Arc::new(|_: &ChangeEvent| {}))
        .expect("first");
    let second = backend
        .subscribe(&backend.scope(), Arc::new(|_: &ChangeEvent| {}))
        .expect("second");
    assert_ne!(first.id(), second.id());
    drop(first);
    assert_eq!(backend.listener_count(), 1);
    drop(second);
    assert_eq!(backend.listener_count(), 0);
}

#[test]
fn controller_lifecycle_tracks_external_changes() {
    let backend = LocalBackend::new();
    backend.create(&NewBook::new("Dune", "Herbert")).expect("seed");
    let store: Arc<dyn RecordStore> = Arc::new(backend.clone());
    let feed: Arc<dyn ChangeFeed> = Arc::new(backend.clone());
    let mut books = BooksController::new(store, feed, backend.scope());

    books.mount().expect("mount");
    assert_eq!(books.books().len(), 1);

    backend.create(&NewBook::new("Emma", "Austen")).expect("other client");
    assert!(wait_until(|| books.books().len() == 2));

    let first = books.books()[0].id.clone();
    books.delete(&first).expect("delete");
    assert_eq!(books.books().len(), 1);

    books.unmount();
    assert_eq!(backend.listener_count(), 0);
    backend.create(&NewBook::new("Persuasion", "Austen")).expect("after unmount");
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(books.books().len(), 1);
}

#[test]
fn upload_controller_lists_uploaded_file() {
    let backend = LocalBackend::new();
    let blobs: Arc<dyn BlobStore> = Arc::new(backend.clone());
    let uploads = UploadController::new(blobs, "public");
    let file = uploads.upload("a.txt", b"hello").expect("upload");
    assert!(file.url.contains("a.txt"));
    assert_eq!(&uploads.download(&file.path).expect("download")[..], b"hello");
}

#[test]
fn registered_function_is_invoked() {
    let backend = LocalBackend::new();
    backend.register_function("hello-world", |body: &Value| {
        let name = body.get("name").and_then(Value::as_str).unwrap_or("there");
        Ok(json!({ "message": format!("Hello {name}!") }))
    });
    let reply = backend
        .invoke("hello-world", &json!({ "name": "JavaScript" }))
        .expect("invoke");
    assert_eq!(reply["message"], "Hello JavaScript!");
    let err = backend.invoke("missing", &json!({})).expect_err("unknown");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
