// Columnar passthrough: frozen buffers become a chunk without touching rows.
use arrow::datatypes::SchemaRef;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use std::sync::Arc;

use crate::core::block::FrozenColumns;
use crate::core::error::{Error, ErrorKind};

/// Wraps a frozen block's arrays as a chunk under the export schema. No
/// transaction is taken.
pub fn passthrough(frozen: &FrozenColumns, schema: &SchemaRef) -> Result<RecordBatch, Error> {
    if frozen.schema().as_ref() != schema.as_ref() {
        return Err(Error::new(ErrorKind::SchemaMismatch)
            .with_message("frozen block schema differs from the export schema"));
    }
    let options = RecordBatchOptions::new().with_row_count(Some(frozen.num_rows()));
    RecordBatch::try_new_with_options(Arc::clone(schema), frozen.columns().to_vec(), &options)
        .map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("frozen buffers do not form a valid chunk")
                .with_source(err)
        })
}
