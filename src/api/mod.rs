//! Purpose: Public service surface: the export service and its HTTP client.
//! Exports: `ExportService`, `ExportClient`, `RemoteBatchStream`, error types.
//! Role: What the binary and external callers use; storage internals stay in `core`.
//! Invariants: Errors crossing this boundary are `core::error::Error` values.

mod remote;
mod service;

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::export::{BatchStream, ExportSummary, IpcEncoder, SamplingRatio, StreamEvent};
pub use remote::{ARROW_STREAM_CONTENT_TYPE, ExportClient, RemoteBatchStream};
pub use service::ExportService;
