//! Purpose: Blocking HTTP client for a running blockflight server.
//! Exports: `ExportClient`, `RemoteBatchStream`.
//! Role: Mirrors `ExportService` over the v0 HTTP surface.
//! Invariants: Fetch bodies are Arrow IPC streams; error bodies are JSON envelopes.
//! Invariants: Remote error kinds map back onto local `ErrorKind`s.
#![allow(clippy::result_large_err)]

use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::error::ArrowError;
use arrow::ipc::reader::StreamReader;
use arrow::record_batch::RecordBatch;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::core::error::{Error, ErrorKind};

type ApiResult<T> = Result<T, Error>;

pub const ARROW_STREAM_CONTENT_TYPE: &str = "application/vnd.apache.arrow.stream";

#[derive(Clone)]
pub struct ExportClient {
    inner: Arc<ExportClientInner>,
}

struct ExportClientInner {
    base_url: Url,
    agent: ureq::Agent,
}

/// Batches decoded from one fetch response, in server order.
pub struct RemoteBatchStream {
    schema: SchemaRef,
    batches: Option<Box<dyn Iterator<Item = Result<RecordBatch, ArrowError>>>>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: RemoteError,
}

#[derive(Deserialize)]
struct RemoteError {
    kind: String,
    message: Option<String>,
    hint: Option<String>,
    block: Option<u64>,
    slot: Option<u32>,
}

#[derive(Serialize)]
struct PolicyRequest {
    ratio: Value,
}

#[derive(Deserialize)]
struct PolicyResponse {
    ratio: f64,
}

impl ExportClient {
    pub fn new(base_url: impl Into<String>) -> ApiResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let agent = ureq::AgentBuilder::new().build();
        Ok(Self {
            inner: Arc::new(ExportClientInner { base_url, agent }),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    pub fn health(&self) -> ApiResult<()> {
        let url = build_url(&self.inner.base_url, &["healthz"])?;
        self.call(self.inner.agent.get(url.as_str()).set("Accept", "application/json"))
            .map(|_| ())
    }

    /// Sets the server's sampling ratio and returns the value it stored.
    pub fn set_policy(&self, ratio: f64) -> ApiResult<f64> {
        self.post_policy(Value::from(ratio))
    }

    /// Sends the ratio as text; the server parses and validates it.
    pub fn set_policy_str(&self, ratio: &str) -> ApiResult<f64> {
        self.post_policy(Value::from(ratio))
    }

    pub fn fetch(&self) -> ApiResult<RemoteBatchStream> {
        let url = build_url(&self.inner.base_url, &["v0", "fetch"])?;
        let response = self.call(
            self.inner
                .agent
                .get(url.as_str())
                .set("Accept", ARROW_STREAM_CONTENT_TYPE),
        )?;
        let reader = StreamReader::try_new(response.into_reader(), None).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("fetch response is not an arrow ipc stream")
                .with_source(err)
        })?;
        Ok(RemoteBatchStream {
            schema: reader.schema(),
            batches: Some(Box::new(reader)),
        })
    }

    fn post_policy(&self, ratio: Value) -> ApiResult<f64> {
        let url = build_url(&self.inner.base_url, &["v0", "policy"])?;
        let payload = serde_json::to_string(&PolicyRequest { ratio }).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode request json")
                .with_source(err)
        })?;
        let response = self.inner
            .agent
            .post(url.as_str())
            .set("Accept", "application/json")
            .set("Content-Type", "application/json")
            .send_string(&payload);
        let response = map_response(response)?;
        let body: PolicyResponse = read_json_response(response)?;
        Ok(body.ratio)
    }

    fn call(&self, request: ureq::Request) -> ApiResult<ureq::Response> {
        map_response(request.call())
    }
}

impl RemoteBatchStream {
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Next batch, or `None` once the end-of-stream marker has been read.
    pub fn next_batch(&mut self) -> ApiResult<Option<RecordBatch>> {
        let Some(batches) = self.batches.as_mut() else {
            return Ok(None);
        };
        match batches.next() {
            Some(Ok(batch)) => Ok(Some(batch)),
            Some(Err(err)) => {
                self.batches = None;
                Err(Error::new(ErrorKind::Io)
                    .with_message("failed to read arrow ipc stream")
                    .with_source(err))
            }
            None => {
                self.batches = None;
                Ok(None)
            }
        }
    }

    pub fn collect_batches(mut self) -> ApiResult<Vec<RecordBatch>> {
        let mut batches = Vec::new();
        while let Some(batch) = self.next_batch()? {
            batches.push(batch);
        }
        Ok(batches)
    }
}

fn map_response(response: Result<ureq::Response, ureq::Error>) -> ApiResult<ureq::Response> {
    match response {
        Ok(resp) => Ok(resp),
        Err(ureq::Error::Status(code, resp)) => Err(parse_error_response(code, resp)),
        Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::Io)
            .with_message("request failed")
            .with_source(err)),
    }
}

fn normalize_base_url(raw: String) -> ApiResult<Url> {
    let mut url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid server url")
            .with_source(err)
    })?;
    if url.scheme() != "http" {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("server url must use the http scheme"));
    }
    if url.path() != "/" && !url.path().is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("server url must not include a path"));
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn build_url(base_url: &Url, segments: &[&str]) -> ApiResult<Url> {
    let mut url = base_url.clone();
    {
        let mut path = url.path_segments_mut().map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("server url cannot be a base")
        })?;
        path.clear();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

fn read_json_response<R>(response: ureq::Response) -> ApiResult<R>
where
    R: DeserializeOwned,
{
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read response body")
            .with_source(err)
    })?;
    serde_json::from_str(&body).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("invalid response json")
            .with_source(err)
    })
}

fn parse_error_response(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    parse_error_body(status, &body)
}

fn parse_error_body(status: u16, body: &str) -> Error {
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) {
        return error_from_remote(envelope.error);
    }
    let kind = error_kind_from_status(status);
    Error::new(kind).with_message(format!("remote error status {status}"))
}

fn error_from_remote(remote: RemoteError) -> Error {
    let kind = ErrorKind::parse(&remote.kind).unwrap_or(ErrorKind::Internal);
    let mut err = Error::new(kind);
    if let Some(message) = remote.message {
        err = err.with_message(message);
    }
    if let Some(hint) = remote.hint {
        err = err.with_hint(hint);
    }
    if let Some(block) = remote.block {
        err = err.with_block(block);
    }
    if let Some(slot) = remote.slot {
        err = err.with_slot(slot);
    }
    err
}

fn error_kind_from_status(status: u16) -> ErrorKind {
    match status {
        400 | 413 => ErrorKind::Usage,
        409 => ErrorKind::WriteConflict,
        423 => ErrorKind::Busy,
        500..=599 => ErrorKind::Internal,
        _ => ErrorKind::Io,
    }
}
