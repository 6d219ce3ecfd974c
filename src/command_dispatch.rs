//! Purpose: Hold top-level CLI command dispatch for `bookshelf`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Every command talks to the platform only through the `api` traits and controllers.
//! Invariants: `books watch` releases its subscription before returning.

use super::*;
use bookshelf::api::{BlobStore, BookForm, BookId, ChangeFeed, FunctionInvoker, RecordStore};
use bookshelf::controller::{BooksController, BooksView, UploadController};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const WATCH_POLL: Duration = Duration::from_millis(100);

pub(super) fn dispatch_command(command: Command, remote: &RemoteArgs) -> Result<RunOutcome, Error> {
    match command {
        Command::Books { command } => dispatch_books(command, remote),
        Command::File { command } => dispatch_file(command, remote),
        Command::Function {
            command: FunctionCommand::Invoke { name, data },
        } => {
            let body = parse_inline_json(&data)?;
            let client = remote.client()?;
            let reply = client.invoke(&name, &body)?;
            emit_json(reply);
            Ok(RunOutcome::ok())
        }
        Command::Serve(args) => {
            let config = serve_config_from_args(args)?;
            let invoker: Arc<dyn FunctionInvoker> = Arc::new(remote.client()?);
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to start runtime")
                        .with_source(err)
                })?;
            runtime.block_on(serve::serve(config, invoker))?;
            Ok(RunOutcome::ok())
        }
    }
}

fn dispatch_books(command: BooksCommand, remote: &RemoteArgs) -> Result<RunOutcome, Error> {
    let client = remote.client()?;
    let records = client.records();
    match command {
        BooksCommand::List => {
            let books = records.list()?;
            emit_json(json!({ "books": books }));
        }
        BooksCommand::Add(fields) => {
            let book = records.create(&book_form(fields).parse()?)?;
            emit_json(json!({ "book": book }));
        }
        BooksCommand::Update { id, fields } => {
            let id: BookId = id.parse()?;
            let book = bookshelf::api::Book::from_new(id, book_form(fields).parse()?);
            let book = records.update(&book)?;
            emit_json(json!({ "book": book }));
        }
        BooksCommand::Delete { id } => {
            let id: BookId = id.parse()?;
            records.delete(&id)?;
            emit_json(json!({ "deleted": id }));
        }
        BooksCommand::Watch { max_renders } => {
            let store: Arc<dyn RecordStore> = Arc::new(records);
            let feed: Arc<dyn ChangeFeed> = Arc::new(client.realtime());
            watch_books(store, feed, client.config().scope(), max_renders)?;
        }
    }
    Ok(RunOutcome::ok())
}

fn book_form(fields: BookFields) -> BookForm {
    BookForm {
        name: fields.name,
        author: fields.author,
        introduction: fields.introduction,
        count: fields.count,
    }
}

fn watch_books(
    store: Arc<dyn RecordStore>,
    feed: Arc<dyn ChangeFeed>,
    scope: bookshelf::api::ChangeScope,
    max_renders: Option<u64>,
) -> Result<(), Error> {
    let stop = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&stop)).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to install signal handler")
                .with_source(err)
        })?;
    }

    let renders = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&renders);
    let mut controller = BooksController::new(store, feed, scope).with_render(move |view| {
        emit_json_line(&view_json(view));
        counter.fetch_add(1, Ordering::SeqCst);
    });
    controller.mount()?;
    tracing::info!("watching books; press Ctrl-C to stop");

    while !stop.load(Ordering::SeqCst) {
        if max_renders.is_some_and(|max| renders.load(Ordering::SeqCst) >= max) {
            break;
        }
        std::thread::sleep(WATCH_POLL);
    }
    controller.unmount();
    Ok(())
}

fn view_json(view: &BooksView) -> Value {
    let mut value = json!({
        "books": view.books,
        "loading": view.loading,
        "refreshes": view.refreshes,
    });
    if let (Some(message), Some(map)) = (view.error_message(), value.as_object_mut()) {
        map.insert("error".to_string(), json!(message));
    }
    value
}

fn dispatch_file(command: FileCommand, remote: &RemoteArgs) -> Result<RunOutcome, Error> {
    let client = remote.client()?;
    let blobs: Arc<dyn BlobStore> = Arc::new(client.blobs());
    match command {
        FileCommand::Upload { path, name } => {
            let name = match name {
                Some(name) => name,
                None => path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        Error::new(ErrorKind::Usage)
                            .with_message("cannot derive an object name from the path")
                            .with_target(path.display().to_string())
                    })?,
            };
            let content = std::fs::read(&path).map_err(|err| {
                Error::new(ErrorKind::Usage)
                    .with_message("failed to read file")
                    .with_target(path.display().to_string())
                    .with_source(err)
            })?;
            let uploads = UploadController::new(blobs, client.config().folder.clone());
            let file = uploads.upload(&name, &content)?;
            if let Some(message) = uploads.view().success_message() {
                emit_notice(&Notice::success(message), "upload");
            }
            emit_json(json!({
                "file": {
                    "id": file.id,
                    "name": file.name,
                    "path": file.path,
                    "url": file.url,
                }
            }));
        }
        FileCommand::Url { key } => {
            let url = blobs.public_url(&key)?;
            emit_json(json!({ "path": key, "url": url.as_str() }));
        }
        FileCommand::Download { key, output } => {
            let bytes = blobs.download(&key)?;
            match output {
                Some(output) => {
                    std::fs::write(&output, &bytes).map_err(|err| {
                        Error::new(ErrorKind::Internal)
                            .with_message("failed to write output file")
                            .with_target(output.display().to_string())
                            .with_source(err)
                    })?;
                    emit_json(json!({
                        "path": key,
                        "bytes": bytes.len(),
                        "output": output.display().to_string(),
                    }));
                }
                None => {
                    let mut stdout = io::stdout().lock();
                    stdout
                        .write_all(&bytes)
                        .and_then(|()| stdout.flush())
                        .map_err(|err| {
                            Error::new(ErrorKind::Internal)
                                .with_message("failed to write to stdout")
                                .with_source(err)
                        })?;
                }
            }
        }
    }
    Ok(RunOutcome::ok())
}
