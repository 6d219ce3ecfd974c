//! Purpose: `bookshelf` CLI entry point: argument parsing, bootstrap, and output envelopes.
//! Role: Binary crate root; parses args, builds the remote client, delegates to `command_dispatch`.
//! Invariants: Successful commands emit JSON on stdout (one value, or one line per render).
//! Invariants: Errors are emitted on stderr; JSON when stderr is not a terminal.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: The remote URL and API key only ever come from flags or the environment.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;
mod serve;

use bookshelf::api::{DEFAULT_FUNCTION, Error, ErrorKind, RemoteClient, RemoteConfig, to_exit_code};
use bookshelf::controller::{Notice, notice_json};

const DEFAULT_FUNCTION_BODY: &str = r#"{"name":"JavaScript"}"#;

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Internal)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage).with_message(clap_error_summary(&err)));
            }
        },
    };

    init_tracing();
    let remote = RemoteArgs {
        url: cli.url,
        api_key: cli.api_key,
        timeout_ms: cli.timeout_ms,
    };
    command_dispatch::dispatch_command(cli.command, &remote)
}

#[derive(Parser)]
#[command(
    name = "bookshelf",
    version,
    about = "Book catalog, file uploads and edge functions on a hosted backend",
    after_help = r#"EXAMPLES
  $ export BOOKSHELF_URL=https://<project>.supabase.co BOOKSHELF_API_KEY=<anon key>
  $ bookshelf books add --name Dune --author Herbert --count 3
  $ bookshelf books watch              # one JSON line per refresh
  $ bookshelf file upload ./a.txt
  $ bookshelf function invoke hello-world --data '{"name":"Rust"}'
  $ bookshelf serve --bind 127.0.0.1:3000"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(long, global = true, env = "BOOKSHELF_URL", help = "Project base URL")]
    url: Option<String>,
    #[arg(
        long,
        global = true,
        env = "BOOKSHELF_API_KEY",
        hide_env_values = true,
        help = "Project API key"
    )]
    api_key: Option<String>,
    #[arg(
        long,
        global = true,
        default_value_t = 30_000,
        help = "Per-request timeout in milliseconds"
    )]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage the books collection.
    Books {
        #[command(subcommand)]
        command: BooksCommand,
    },
    /// Upload, locate and fetch stored files.
    File {
        #[command(subcommand)]
        command: FileCommand,
    },
    /// Call server-side functions.
    Function {
        #[command(subcommand)]
        command: FunctionCommand,
    },
    /// Run the local HTTP route that proxies the edge function.
    Serve(ServeArgs),
}

#[derive(Subcommand)]
enum BooksCommand {
    /// Print every book as JSON.
    List,
    /// Create a book.
    Add(BookFields),
    /// Overwrite the fields of an existing book.
    Update {
        #[arg(help = "Identifier of the book to update")]
        id: String,
        #[command(flatten)]
        fields: BookFields,
    },
    /// Delete a book; deleting a missing id succeeds.
    Delete {
        #[arg(help = "Identifier of the book to delete")]
        id: String,
    },
    /// Print the list on every change until interrupted.
    Watch {
        #[arg(long, help = "Exit after this many renders")]
        max_renders: Option<u64>,
    },
}

#[derive(Args)]
struct BookFields {
    #[arg(long)]
    name: String,
    #[arg(long)]
    author: String,
    #[arg(long, default_value = "")]
    introduction: String,
    #[arg(long, default_value = "", help = "Non-negative integer; empty means 0")]
    count: String,
}

#[derive(Subcommand)]
enum FileCommand {
    /// Upload a local file under the public folder.
    Upload {
        #[arg(value_hint = ValueHint::FilePath)]
        path: PathBuf,
        #[arg(long, help = "Object name (default: the file name)")]
        name: Option<String>,
    },
    /// Print the public URL of a stored object without contacting the store.
    Url {
        #[arg(help = "Object key inside the bucket, e.g. public/a.txt")]
        key: String,
    },
    /// Download a stored object to a file or stdout.
    Download {
        key: String,
        #[arg(long, short, value_hint = ValueHint::FilePath)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum FunctionCommand {
    /// Invoke a function with a JSON body and print its JSON reply.
    Invoke {
        #[arg(default_value = DEFAULT_FUNCTION)]
        name: String,
        #[arg(long, default_value = DEFAULT_FUNCTION_BODY, help = "JSON request body")]
        data: String,
    },
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind: String,
    #[arg(long, help = "Allow binding to a non-loopback address")]
    allow_non_loopback: bool,
    #[arg(long, default_value = DEFAULT_FUNCTION)]
    function: String,
    #[arg(long, default_value = DEFAULT_FUNCTION_BODY, help = "Body sent on GET")]
    function_body: String,
    #[arg(long = "cors-origin", help = "Allowed CORS origin (repeatable)")]
    cors_origins: Vec<String>,
    #[arg(long, default_value_t = 1024 * 1024)]
    max_body_bytes: u64,
}

struct RemoteArgs {
    url: Option<String>,
    api_key: Option<String>,
    timeout_ms: u64,
}

impl RemoteArgs {
    fn client(&self) -> Result<RemoteClient, Error> {
        let url = self.url.as_deref().ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message("missing project url; pass --url or set BOOKSHELF_URL")
        })?;
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message("missing api key; pass --api-key or set BOOKSHELF_API_KEY")
        })?;
        if self.timeout_ms == 0 {
            return Err(Error::new(ErrorKind::Usage).with_message("--timeout-ms must be positive"));
        }
        let config = RemoteConfig::new(url, api_key)?
            .with_timeout(Duration::from_millis(self.timeout_ms));
        Ok(RemoteClient::new(config))
    }
}

fn serve_config_from_args(args: ServeArgs) -> Result<serve::ServeConfig, Error> {
    let bind: SocketAddr = args.bind.parse().map_err(|_| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid bind address")
            .with_target(args.bind.clone())
    })?;
    Ok(serve::ServeConfig {
        bind,
        allow_non_loopback: args.allow_non_loopback,
        function: args.function,
        function_body: parse_inline_json(&args.function_body)?,
        cors_origins: args.cors_origins,
        max_body_bytes: args.max_body_bytes,
    })
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn parse_inline_json(data: &str) -> Result<Value, Error> {
    serde_json::from_str(data).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid json")
            .with_source(err)
    })
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

/// One compact JSON value per line; flushed so pipes see each render immediately.
fn emit_json_line(value: &Value) {
    let json = serde_json::to_string(value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{json}");
    let _ = stdout.flush();
}

fn emit_notice(notice: &Notice, source: &str) {
    if io::stderr().is_terminal() {
        eprintln!("notice: {}", notice.message);
        return;
    }
    let json = serde_json::to_string(&notice_json(notice, source)).unwrap_or_else(|_| {
        "{\"notice\":{\"kind\":\"error\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::Validation => "invalid input".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Transport => "request failed".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(target) = err.target() {
        inner.insert("target".to_string(), json!(target));
    }
    if let Some(status) = err.status() {
        inner.insert("status".to_string(), json!(status));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(target) = err.target() {
        lines.push(format!("target: {target}"));
    }
    if let Some(status) = err.status() {
        lines.push(format!("status: {status}"));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}
