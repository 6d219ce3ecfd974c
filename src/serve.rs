//! Purpose: Provide the local HTTP route that proxies the hosted edge function.
//! Exports: `ServeConfig`, `serve`, `router`.
//! Role: Axum-based loopback server; the function call itself runs on the blocking pool.
//! Invariants: Failures never leak upstream detail: 500 with a fixed error body.
//! Invariants: Loopback-only unless explicitly allowed.
//! Notes: GET sends the configured default body; POST forwards its body when it is JSON
//! and falls back to the default body otherwise.

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{Value, json};
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use bookshelf::api::{Error, ErrorKind, FunctionInvoker};

const EDGE_FUNCTION_FAILED: &str = "Failed to call edge function";

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub allow_non_loopback: bool,
    pub function: String,
    pub function_body: Value,
    pub cors_origins: Vec<String>,
    pub max_body_bytes: u64,
}

struct AppState {
    invoker: Arc<dyn FunctionInvoker>,
    function: String,
    function_body: Value,
}

pub async fn serve(config: ServeConfig, invoker: Arc<dyn FunctionInvoker>) -> Result<(), Error> {
    let app = router(&config, invoker)?;

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Transport)
                .with_message("failed to bind server")
                .with_target(config.bind.to_string())
                .with_source(err)
        })?;
    tracing::info!(bind = %config.bind, function = %config.function, "serving /api/edge-function");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Transport)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Transport)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Internal).with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

/// Builds the application after validating `config`.
pub fn router(config: &ServeConfig, invoker: Arc<dyn FunctionInvoker>) -> Result<Router, Error> {
    validate_config(config)?;
    let max_body_bytes: usize = config
        .max_body_bytes
        .try_into()
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("--max-body-bytes is too large"))?;

    let state = Arc::new(AppState {
        invoker,
        function: config.function.clone(),
        function_body: config.function_body.clone(),
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/edge-function", get(call_default).post(call_with_body))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http());
    let app = match cors_layer(&config.cors_origins)? {
        Some(cors) => app.layer(cors),
        None => app,
    };
    Ok(app.with_state(state))
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires --allow-non-loopback")
            .with_target(config.bind.to_string()));
    }
    if config.max_body_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes must be greater than zero"));
    }
    if config.function.trim().is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("--function must not be empty"));
    }
    Ok(())
}

fn cors_layer(origins: &[String]) -> Result<Option<CorsLayer>, Error> {
    if origins.is_empty() {
        return Ok(None);
    }
    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|err| {
                Error::new(ErrorKind::Usage)
                    .with_message("invalid --cors-origin")
                    .with_target(origin.clone())
                    .with_source(err)
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any),
    ))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

async fn healthz() -> Response {
    Json(json!({ "ok": true })).into_response()
}

async fn call_default(State(state): State<Arc<AppState>>) -> Response {
    let body = state.function_body.clone();
    invoke(state, body).await
}

async fn call_with_body(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    if body.iter().all(u8::is_ascii_whitespace) {
        let body = state.function_body.clone();
        return invoke(state, body).await;
    }
    match serde_json::from_slice::<Value>(&body) {
        Ok(body) => invoke(state, body).await,
        Err(err) => {
            tracing::debug!(error = %err, "request body is not json; sending default body");
            let body = state.function_body.clone();
            invoke(state, body).await
        }
    }
}

async fn invoke(state: Arc<AppState>, body: Value) -> Response {
    let call_state = Arc::clone(&state);
    let result = tokio::task::spawn_blocking(move || {
        call_state.invoker.invoke(&call_state.function, &body)
    })
    .await;
    match result {
        Ok(Ok(reply)) => Json(reply).into_response(),
        Ok(Err(err)) => {
            tracing::error!(function = %state.function, error = %err, "edge function call failed");
            edge_function_failed()
        }
        Err(err) => {
            tracing::error!(function = %state.function, error = %err, "edge function task failed");
            edge_function_failed()
        }
    }
}

fn edge_function_failed() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": EDGE_FUNCTION_FAILED })),
    )
        .into_response()
}
