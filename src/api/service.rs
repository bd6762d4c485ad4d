//! Purpose: The two remote-call operations: set the sampling policy, fetch the table.
//! Exports: `ExportService`.
//! Role: Transport-independent service behind the HTTP server.
//! Invariants: `set_policy` never touches table data; `fetch` never mutates it.
//! Invariants: Every `fetch` is an independent full scan under the policy current at its start.

use std::sync::Arc;

use crate::core::error::Error;
use crate::core::table::DataTable;
use crate::export::exporter::export_table;
use crate::export::policy::{ExportPolicy, SamplingRatio, Sampler};
use crate::export::stream::BatchStream;

#[derive(Debug)]
pub struct ExportService {
    table: Arc<DataTable>,
    policy: ExportPolicy,
}

impl ExportService {
    pub fn new(table: Arc<DataTable>, ratio: SamplingRatio, sampler: Sampler) -> Self {
        Self {
            table,
            policy: ExportPolicy::new(ratio, sampler),
        }
    }

    /// Service with an entropy-seeded sampler and ratio 0.
    pub fn from_entropy(table: Arc<DataTable>) -> Result<Self, Error> {
        Ok(Self::new(table, SamplingRatio::NEVER, Sampler::from_entropy()?))
    }

    pub fn with_seed(table: Arc<DataTable>, seed: u64) -> Self {
        Self::new(table, SamplingRatio::NEVER, Sampler::seeded(seed))
    }

    pub fn table(&self) -> &Arc<DataTable> {
        &self.table
    }

    pub fn policy(&self) -> SamplingRatio {
        self.policy.ratio()
    }

    pub fn set_policy(&self, ratio: f64) -> Result<SamplingRatio, Error> {
        let ratio = SamplingRatio::new(ratio)?;
        self.policy.set_ratio(ratio);
        tracing::info!(ratio = ratio.get(), "sampling ratio updated");
        Ok(ratio)
    }

    pub fn set_policy_str(&self, ratio: &str) -> Result<SamplingRatio, Error> {
        let ratio = SamplingRatio::parse(ratio)?;
        self.policy.set_ratio(ratio);
        tracing::info!(ratio = ratio.get(), "sampling ratio updated");
        Ok(ratio)
    }

    /// Scans the whole table; request selectors are not interpreted.
    pub fn fetch(&self) -> Result<BatchStream, Error> {
        let (table, summary) = export_table(&self.table, &self.policy)?;
        Ok(BatchStream::new(table, summary))
    }
}
