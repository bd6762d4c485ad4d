//! Purpose: Present an assembled table as a single-pass batch stream.
//! Exports: `StreamEvent`, `BatchStream`, `IpcEncoder`.
//! Role: Boundary between the export pipeline and any transport.
//! Invariants: Events arrive as one `Schema`, then one `Batch` per block in
//! enumeration order, then one `End`; after `End` the stream yields nothing.
//! Invariants: `IpcEncoder` turns each event into the matching Arrow IPC stream bytes.

use std::collections::VecDeque;

use arrow::datatypes::SchemaRef;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;

use crate::core::error::{Error, ErrorKind};
use crate::export::assemble::LogicalTable;
use crate::export::exporter::ExportSummary;

#[derive(Clone, Debug)]
pub enum StreamEvent {
    Schema(SchemaRef),
    Batch(RecordBatch),
    End,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Schema,
    Batches,
    Done,
}

#[derive(Debug)]
pub struct BatchStream {
    schema: SchemaRef,
    batches: VecDeque<RecordBatch>,
    summary: ExportSummary,
    phase: Phase,
}

impl BatchStream {
    pub fn new(table: LogicalTable, summary: ExportSummary) -> Self {
        let schema = table.schema().clone();
        Self {
            schema,
            batches: table.into_chunks().into(),
            summary,
            phase: Phase::Schema,
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn summary(&self) -> ExportSummary {
        self.summary
    }

    /// Batches not yet yielded.
    pub fn remaining(&self) -> usize {
        self.batches.len()
    }
}

impl Iterator for BatchStream {
    type Item = StreamEvent;

    fn next(&mut self) -> Option<StreamEvent> {
        match self.phase {
            Phase::Schema => {
                self.phase = Phase::Batches;
                Some(StreamEvent::Schema(self.schema.clone()))
            }
            Phase::Batches => match self.batches.pop_front() {
                Some(batch) => Some(StreamEvent::Batch(batch)),
                None => {
                    self.phase = Phase::Done;
                    Some(StreamEvent::End)
                }
            },
            Phase::Done => None,
        }
    }
}

/// Incremental Arrow IPC stream encoder fed one event at a time.
#[derive(Default)]
pub struct IpcEncoder {
    writer: Option<StreamWriter<Vec<u8>>>,
}

impl IpcEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes for one event. `Schema` must come first and `End` last.
    pub fn encode(&mut self, event: StreamEvent) -> Result<Vec<u8>, Error> {
        match event {
            StreamEvent::Schema(schema) => {
                if self.writer.is_some() {
                    return Err(Error::new(ErrorKind::Internal).with_message("schema already written"));
                }
                let writer = self.writer.insert(
                    StreamWriter::try_new(Vec::new(), &schema).map_err(ipc_error)?,
                );
                Ok(std::mem::take(writer.get_mut()))
            }
            StreamEvent::Batch(batch) => {
                let writer = self.writer_mut()?;
                writer.write(&batch).map_err(ipc_error)?;
                Ok(std::mem::take(writer.get_mut()))
            }
            StreamEvent::End => {
                let writer = self.writer_mut()?;
                writer.finish().map_err(ipc_error)?;
                Ok(std::mem::take(writer.get_mut()))
            }
        }
    }

    fn writer_mut(&mut self) -> Result<&mut StreamWriter<Vec<u8>>, Error> {
        self.writer
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("schema not yet written"))
    }
}

fn ipc_error(err: arrow::error::ArrowError) -> Error {
    Error::new(ErrorKind::Internal)
        .with_message("failed to encode arrow ipc stream")
        .with_source(err)
}

#[cfg(test)]
mod tests {
    use super::{BatchStream, IpcEncoder, StreamEvent};
    use crate::export::assemble::assemble;
    use crate::export::exporter::ExportSummary;
    use arrow::array::{ArrayRef, UInt8Array};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::ipc::reader::StreamReader;
    use arrow::record_batch::RecordBatch;
    use std::sync::Arc;

    fn stream() -> BatchStream {
        let schema = Arc::new(Schema::new(vec![Field::new("q", DataType::UInt8, true)]));
        let chunks = [vec![1u8, 2], vec![], vec![3]]
            .into_iter()
            .map(|values| {
                let column: ArrayRef = Arc::new(UInt8Array::from(values));
                RecordBatch::try_new(Arc::clone(&schema), vec![column]).expect("chunk")
            })
            .collect();
        let table = assemble(schema, chunks).expect("assemble");
        BatchStream::new(table, ExportSummary::default())
    }

    #[test]
    fn events_follow_schema_batches_end() {
        let events: Vec<StreamEvent> = stream().collect();
        assert_eq!(events.len(), 5);
        assert!(matches!(events[0], StreamEvent::Schema(_)));
        assert!(matches!(&events[2], StreamEvent::Batch(batch) if batch.num_rows() == 0));
        assert!(matches!(events[4], StreamEvent::End));
    }

    #[test]
    fn stream_is_single_pass() {
        let mut stream = stream();
        for _ in stream.by_ref() {}
        assert!(stream.next().is_none());
        assert_eq!(stream.remaining(), 0);
    }

    #[test]
    fn encoded_events_decode_as_ipc_stream() {
        let mut encoder = IpcEncoder::new();
        let mut bytes = Vec::new();
        for event in stream() {
            bytes.extend(encoder.encode(event).expect("encode"));
        }
        let reader = StreamReader::try_new(std::io::Cursor::new(bytes), None).expect("reader");
        let rows: Vec<usize> = reader
            .map(|batch| batch.expect("batch").num_rows())
            .collect();
        assert_eq!(rows, vec![2, 0, 1]);
    }

    #[test]
    fn batch_before_schema_is_rejected() {
        let mut encoder = IpcEncoder::new();
        assert!(encoder.encode(StreamEvent::End).is_err());
    }
}
