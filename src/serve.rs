//! Purpose: Provide the HTTP server for the blockflight export service.
//! Exports: `ServeConfig`, `serve`, `init_tracing`.
//! Role: Axum-based loopback server wrapping `ExportService` plus background maintenance.
//! Invariants: A fetch scans the whole table before the first body byte is sent.
//! Invariants: Fetch bodies are Arrow IPC streams; failures before streaming are JSON envelopes.
//! Invariants: Loopback-only unless explicitly allowed.

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Duration;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use blockflight::api::{
    ARROW_STREAM_CONTENT_TYPE, Error, ErrorKind, ExportService, IpcEncoder, SamplingRatio,
};
use blockflight::core::maintenance::{EngineConfig, Maintenance};
use blockflight::core::table::DataTable;
use blockflight::core::txn::TransactionManager;
use blockflight::order_line::{self, LoadConfig};

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub allow_non_loopback: bool,
    pub max_body_bytes: u64,
    pub max_concurrent_fetches: usize,
    pub initial_ratio: f64,
    pub seed: Option<u64>,
    pub engine: EngineConfig,
    pub fixture: LoadConfig,
    pub delivery_rounds: usize,
}

#[derive(Clone)]
struct AppState {
    service: Arc<ExportService>,
    fetch_semaphore: Arc<Semaphore>,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let max_body_bytes: usize = config
        .max_body_bytes
        .try_into()
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("--max-body-bytes is too large"))?;

    let (table, maintenance) = open_engine(&config)?;
    let service = match config.seed {
        Some(seed) => ExportService::with_seed(table, seed),
        None => ExportService::from_entropy(table)?,
    };
    service.set_policy(config.initial_ratio)?;

    let state = Arc::new(AppState {
        service: Arc::new(service),
        fetch_semaphore: Arc::new(Semaphore::new(config.max_concurrent_fetches)),
    });

    let app = router(state, max_body_bytes);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    tracing::info!(bind = %config.bind, "serving");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    let outcome = tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                }),
                Err(_) => Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out")),
            }
        }
    };

    let _ = tokio::task::spawn_blocking(move || maintenance.shutdown()).await;
    outcome
}

fn router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v0/policy", post(set_policy).get(get_policy))
        .route("/v0/fetch", get(fetch))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Loads the fixture, starts GC and compaction, then runs delivery passes so
// some blocks are rewritten after startup.
fn open_engine(config: &ServeConfig) -> Result<(Arc<DataTable>, Maintenance), Error> {
    let manager = TransactionManager::new();
    let layout = order_line::layout(config.engine.slots_per_block)?;
    let table = Arc::new(DataTable::new(order_line::TABLE_NAME, layout, manager.clone()));
    order_line::load(&table, &config.fixture)?;
    let maintenance = Maintenance::start(&config.engine, &manager, vec![Arc::clone(&table)])?;
    for round in 0..config.delivery_rounds {
        order_line::deliver_oldest(&table, 1_700_000_000 + round as u64)?;
    }
    Ok((table, maintenance))
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
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if config.max_body_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-body-bytes must be greater than zero")
            .with_hint("Use a positive value like 65536."));
    }

    if config.max_concurrent_fetches == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-fetch-concurrency must be greater than zero")
            .with_hint("Use a positive value like 4."));
    }

    SamplingRatio::new(config.initial_ratio).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("--ratio: {}", err.message().unwrap_or("invalid ratio")))
            .with_hint("Use a value between 0 and 1.")
    })?;

    config.engine.validate()?;

    if config.fixture.warehouses == 0 || config.fixture.districts_per_warehouse == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("fixture needs at least one warehouse and district"));
    }

    Ok(())
}

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
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
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
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

#[derive(Debug, Deserialize)]
struct PolicyRequest {
    ratio: Value,
}

async fn healthz() -> Response {
    json_response(json!({ "ok": true }))
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    block: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    slot: Option<u32>,
}

async fn get_policy(State(state): State<Arc<AppState>>) -> Response {
    json_response(json!({ "ratio": state.service.policy().get() }))
}

async fn set_policy(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PolicyRequest>,
) -> Response {
    let result = match &payload.ratio {
        Value::Number(number) => match number.as_f64() {
            Some(ratio) => state.service.set_policy(ratio),
            None => Err(invalid_policy_value()),
        },
        Value::String(text) => state.service.set_policy_str(text),
        _ => Err(invalid_policy_value()),
    };
    match result {
        Ok(ratio) => json_response(json!({ "ratio": ratio.get() })),
        Err(err) => error_response(err),
    }
}

fn invalid_policy_value() -> Error {
    Error::new(ErrorKind::InvalidPolicy)
        .with_message("ratio must be a number or numeric string")
        .with_hint("Send {\"ratio\": 0.25}.")
}

async fn fetch(State(state): State<Arc<AppState>>) -> Response {
    let permit = match state.fetch_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            return error_response(
                Error::new(ErrorKind::Busy)
                    .with_message("too many concurrent fetch requests")
                    .with_hint("Try again later or raise --max-fetch-concurrency."),
            );
        }
    };

    let service = Arc::clone(&state.service);
    let stream = match tokio::task::spawn_blocking(move || service.fetch()).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => return error_response(err),
        Err(err) => {
            return error_response(
                Error::new(ErrorKind::Internal)
                    .with_message("fetch task failed")
                    .with_source(err),
            );
        }
    };
    let summary = stream.summary();

    let (tx, rx) = mpsc::channel::<Result<Bytes, Error>>(16);
    tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let mut encoder = IpcEncoder::new();
        for event in stream {
            let chunk = encoder.encode(event).map(Bytes::from);
            let failed = chunk.is_err();
            if tx.blocking_send(chunk).is_err() || failed {
                break;
            }
        }
    });

    let stream = ReceiverStream::new(rx)
        .map(|result| result.map_err(|err| std::io::Error::other(err.to_string())));

    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        "content-type",
        HeaderValue::from_static(ARROW_STREAM_CONTENT_TYPE),
    );
    headers.insert("blockflight-version", HeaderValue::from_static("0"));
    headers.insert("blockflight-rows", HeaderValue::from(summary.rows));
    headers.insert("blockflight-blocks", HeaderValue::from(summary.blocks));
    response
}

fn json_response(payload: Value) -> Response {
    let mut response = Json(payload).into_response();
    response
        .headers_mut()
        .insert("blockflight-version", HeaderValue::from_static("0"));
    response
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Usage | ErrorKind::InvalidPolicy => StatusCode::BAD_REQUEST,
        ErrorKind::Busy => StatusCode::LOCKED,
        ErrorKind::WriteConflict => StatusCode::CONFLICT,
        ErrorKind::Internal
        | ErrorKind::Visibility
        | ErrorKind::ColumnAppend
        | ErrorKind::SchemaMismatch
        | ErrorKind::Corrupt
        | ErrorKind::Io => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: Error) -> Response {
    let status = status_for(err.kind());
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: err.kind().as_str().to_string(),
            message: err.message().unwrap_or("error").to_string(),
            hint: err.hint().map(str::to_string),
            block: err.block(),
            slot: err.slot(),
        },
    };
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert("blockflight-version", HeaderValue::from_static("0"));
    response
}
