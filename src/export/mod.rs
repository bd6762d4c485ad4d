//! Purpose: Per-block export pipeline from live blocks to an ordered batch stream.
//! Exports: policy, materializer, passthrough, assembler, exporter, stream.
//! Role: Read-only consumer of the core block store.
//! Invariants: Export never changes a block's state or contents.
pub mod assemble;
pub mod exporter;
pub mod materialize;
pub mod passthrough;
pub mod policy;
pub mod stream;

pub use assemble::{LogicalTable, assemble};
pub use exporter::{ExportRun, ExportSummary, export_table};
pub use materialize::materialize;
pub use passthrough::passthrough;
pub use policy::{ExportPolicy, SamplingRatio, Sampler, ScanPath, classify};
pub use stream::{BatchStream, IpcEncoder, StreamEvent};
