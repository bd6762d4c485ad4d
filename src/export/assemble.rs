// Table assembler: ordered chunks under one schema, with byte accounting.
use arrow::array::{Array, ArrayData};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use crate::core::error::{Error, ErrorKind};

/// Ordered concatenation of per-block chunks. Chunks are never merged,
/// reordered, or deduplicated.
#[derive(Clone, Debug)]
pub struct LogicalTable {
    schema: SchemaRef,
    chunks: Vec<RecordBatch>,
}

impl LogicalTable {
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn chunks(&self) -> &[RecordBatch] {
        &self.chunks
    }

    pub fn into_chunks(self) -> Vec<RecordBatch> {
        self.chunks
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn num_rows(&self) -> usize {
        self.chunks.iter().map(RecordBatch::num_rows).sum()
    }

    /// Bytes held by every data and validity buffer of every chunk.
    pub fn byte_size(&self) -> usize {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.columns())
            .map(|column| data_bytes(&column.to_data()))
            .sum()
    }
}

fn data_bytes(data: &ArrayData) -> usize {
    let buffers: usize = data.buffers().iter().map(|buffer| buffer.len()).sum();
    let validity = data.nulls().map_or(0, |nulls| nulls.buffer().len());
    let children: usize = data.child_data().iter().map(data_bytes).sum();
    buffers + validity + children
}

/// Keeps chunks in the given order. The table takes the first chunk's schema;
/// `schema` applies only when there are no chunks.
pub fn assemble(schema: SchemaRef, chunks: Vec<RecordBatch>) -> Result<LogicalTable, Error> {
    let schema = chunks.first().map_or(schema, RecordBatch::schema);
    if let Some(index) = chunks.iter().position(|chunk| chunk.schema() != schema) {
        return Err(Error::new(ErrorKind::SchemaMismatch)
            .with_message(format!("chunk {index} schema differs from the first chunk's schema")));
    }
    Ok(LogicalTable { schema, chunks })
}

#[cfg(test)]
mod tests {
    use super::assemble;
    use crate::core::error::ErrorKind;
    use arrow::array::{ArrayRef, UInt32Array, UInt64Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::sync::Arc;

    fn schema(data_type: DataType) -> Arc<Schema> {
        Arc::new(Schema::new(vec![Field::new("v", data_type, true)]))
    }

    fn chunk(values: Vec<u32>) -> RecordBatch {
        let column: ArrayRef = Arc::new(UInt32Array::from(values));
        RecordBatch::try_new(schema(DataType::UInt32), vec![column]).expect("chunk")
    }

    #[test]
    fn keeps_order_and_counts_rows() {
        let table = assemble(
            schema(DataType::UInt32),
            vec![chunk(vec![1, 2]), chunk(vec![]), chunk(vec![3])],
        )
        .expect("assemble");
        assert_eq!(table.num_chunks(), 3);
        assert_eq!(table.num_rows(), 3);
        assert_eq!(table.chunks()[1].num_rows(), 0);
        assert_eq!(table.byte_size(), 12);
    }

    #[test]
    fn zero_chunks_use_expected_schema() {
        let table = assemble(schema(DataType::UInt32), Vec::new()).expect("assemble");
        assert_eq!(table.num_rows(), 0);
        assert_eq!(table.schema().field(0).data_type(), &DataType::UInt32);
    }

    #[test]
    fn mismatched_chunk_is_rejected() {
        let other: ArrayRef = Arc::new(UInt64Array::from(vec![1u64]));
        let odd = RecordBatch::try_new(schema(DataType::UInt64), vec![other]).expect("chunk");
        let err = assemble(schema(DataType::UInt32), vec![chunk(vec![1]), odd])
            .expect_err("mismatch");
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    }

    #[test]
    fn first_chunk_schema_wins_over_expected() {
        let table = assemble(schema(DataType::UInt64), vec![chunk(vec![1]), chunk(vec![2, 3])])
            .expect("uniform chunks");
        assert_eq!(table.schema().field(0).data_type(), &DataType::UInt32);
        assert_eq!(table.num_rows(), 3);
    }
}
