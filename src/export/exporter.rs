//! Purpose: Drive one full-table export: classify, materialize or pass through, assemble.
//! Exports: `ExportRun`, `ExportSummary`, `export_table`, `PROGRESS_EVERY`.
//! Role: Per-request scan state; nothing here outlives a single export.
//! Invariants: Chunk n is built from block n of the enumeration taken at run start.
//! Invariants: Each block is leased while its chunk is built, so the compactor
//! cannot change its representation underneath the scan.

use std::sync::Arc;

use arrow::record_batch::RecordBatch;

use crate::core::block::Block;
use crate::core::error::Error;
use crate::core::row::RowView;
use crate::core::table::DataTable;
use crate::export::assemble::{LogicalTable, assemble};
use crate::export::materialize::materialize;
use crate::export::passthrough::passthrough;
use crate::export::policy::{ExportPolicy, SamplingRatio, Sampler, ScanPath, classify};

pub const PROGRESS_EVERY: usize = 500;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ExportSummary {
    pub blocks: usize,
    pub row_path_blocks: usize,
    pub column_path_blocks: usize,
    pub rows: usize,
    pub bytes: usize,
}

/// Scan state for one export. The sampling ratio is fixed when the run
/// starts; policy changes apply to later runs.
pub struct ExportRun<'a> {
    table: &'a DataTable,
    ratio: SamplingRatio,
    sampler: &'a Sampler,
    row: RowView,
    summary: ExportSummary,
}

impl<'a> ExportRun<'a> {
    pub fn new(table: &'a DataTable, policy: &'a ExportPolicy) -> Self {
        Self {
            table,
            ratio: policy.ratio(),
            sampler: policy.sampler(),
            row: RowView::new(Arc::clone(table.layout())),
            summary: ExportSummary::default(),
        }
    }

    pub fn ratio(&self) -> SamplingRatio {
        self.ratio
    }

    /// Builds the chunk for one block.
    pub fn scan_block(&mut self, block: &Arc<Block>) -> Result<RecordBatch, Error> {
        let _lease = block.lease();
        let chunk = match classify(block.snapshot(), self.ratio, self.sampler) {
            ScanPath::Row => {
                self.summary.row_path_blocks += 1;
                materialize(self.table, block, &mut self.row)?
            }
            ScanPath::Column(frozen) => {
                self.summary.column_path_blocks += 1;
                passthrough(&frozen, &self.table.layout().schema())
                    .map_err(|err| err.with_block(block.id().0))?
            }
        };
        self.summary.blocks += 1;
        self.summary.rows += chunk.num_rows();
        Ok(chunk)
    }

    /// Scans every block in enumeration order and assembles the result.
    pub fn run(mut self) -> Result<(LogicalTable, ExportSummary), Error> {
        let blocks = self.table.blocks();
        let mut chunks = Vec::with_capacity(blocks.len());
        for (index, block) in blocks.iter().enumerate() {
            chunks.push(self.scan_block(block)?);
            if (index + 1) % PROGRESS_EVERY == 0 {
                tracing::debug!(
                    table = self.table.name(),
                    blocks = index + 1,
                    total = blocks.len(),
                    "export progress"
                );
            }
        }
        let table = assemble(self.table.layout().schema(), chunks)?;
        self.summary.bytes = table.byte_size();
        tracing::info!(
            table = self.table.name(),
            ratio = self.ratio.get(),
            blocks = self.summary.blocks,
            row_path = self.summary.row_path_blocks,
            column_path = self.summary.column_path_blocks,
            rows = self.summary.rows,
            bytes = self.summary.bytes,
            "export assembled"
        );
        Ok((table, self.summary))
    }
}

pub fn export_table(
    table: &DataTable,
    policy: &ExportPolicy,
) -> Result<(LogicalTable, ExportSummary), Error> {
    ExportRun::new(table, policy).run()
}
