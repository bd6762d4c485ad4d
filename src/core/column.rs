// Per-column Arrow builders fed from raw row-view fields.
use std::sync::Arc;

use arrow::array::{
    ArrayBuilder, ArrayRef, Float64Builder, Int32Builder, Int64Builder, StringBuilder,
    UInt8Builder, UInt16Builder, UInt32Builder, UInt64Builder,
};

use crate::core::error::{Error, ErrorKind};
use crate::core::layout::{BlockLayout, ColumnType};
use crate::core::row::RowView;

// Arrow's Utf8 arrays use i32 offsets.
const MAX_UTF8_BYTES: usize = i32::MAX as usize;

/// Accumulator for one output column. Finishing consumes the builder, so a
/// builder can never be reused for a second chunk.
#[derive(Debug)]
pub enum ColumnBuilder {
    UInt8(UInt8Builder),
    UInt16(UInt16Builder),
    UInt32(UInt32Builder),
    UInt64(UInt64Builder),
    Int32(Int32Builder),
    Int64(Int64Builder),
    Float64(Float64Builder),
    Utf8 { builder: StringBuilder, bytes: usize },
}

impl ColumnBuilder {
    pub fn new(column_type: ColumnType) -> Self {
        match column_type {
            ColumnType::UInt8 => ColumnBuilder::UInt8(UInt8Builder::new()),
            ColumnType::UInt16 => ColumnBuilder::UInt16(UInt16Builder::new()),
            ColumnType::UInt32 => ColumnBuilder::UInt32(UInt32Builder::new()),
            ColumnType::UInt64 => ColumnBuilder::UInt64(UInt64Builder::new()),
            ColumnType::Int32 => ColumnBuilder::Int32(Int32Builder::new()),
            ColumnType::Int64 => ColumnBuilder::Int64(Int64Builder::new()),
            ColumnType::Float64 => ColumnBuilder::Float64(Float64Builder::new()),
            ColumnType::Utf8 => ColumnBuilder::Utf8 {
                builder: StringBuilder::new(),
                bytes: 0,
            },
        }
    }

    pub fn append_null(&mut self) {
        match self {
            ColumnBuilder::UInt8(b) => b.append_null(),
            ColumnBuilder::UInt16(b) => b.append_null(),
            ColumnBuilder::UInt32(b) => b.append_null(),
            ColumnBuilder::UInt64(b) => b.append_null(),
            ColumnBuilder::Int32(b) => b.append_null(),
            ColumnBuilder::Int64(b) => b.append_null(),
            ColumnBuilder::Float64(b) => b.append_null(),
            ColumnBuilder::Utf8 { builder, .. } => builder.append_null(),
        }
    }

    /// Reinterprets little-endian fixed-width bytes as the column's native
    /// type, or copies a varlen payload.
    pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        match self {
            ColumnBuilder::UInt8(b) => b.append_value(u8::from_le_bytes(fixed(bytes)?)),
            ColumnBuilder::UInt16(b) => b.append_value(u16::from_le_bytes(fixed(bytes)?)),
            ColumnBuilder::UInt32(b) => b.append_value(u32::from_le_bytes(fixed(bytes)?)),
            ColumnBuilder::UInt64(b) => b.append_value(u64::from_le_bytes(fixed(bytes)?)),
            ColumnBuilder::Int32(b) => b.append_value(i32::from_le_bytes(fixed(bytes)?)),
            ColumnBuilder::Int64(b) => b.append_value(i64::from_le_bytes(fixed(bytes)?)),
            ColumnBuilder::Float64(b) => b.append_value(f64::from_le_bytes(fixed(bytes)?)),
            ColumnBuilder::Utf8 { builder, bytes: total } => {
                let text = std::str::from_utf8(bytes).map_err(|err| {
                    Error::new(ErrorKind::ColumnAppend)
                        .with_message("varlen payload is not valid utf-8")
                        .with_source(err)
                })?;
                let next = *total + text.len();
                if next > MAX_UTF8_BYTES {
                    return Err(Error::new(ErrorKind::ColumnAppend)
                        .with_message("utf8 column exceeds 32-bit offset range"));
                }
                *total = next;
                builder.append_value(text);
            }
        }
        Ok(())
    }

    pub fn append_field(&mut self, field: Option<&[u8]>) -> Result<(), Error> {
        match field {
            None => {
                self.append_null();
                Ok(())
            }
            Some(bytes) => self.append_bytes(bytes),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnBuilder::UInt8(b) => b.len(),
            ColumnBuilder::UInt16(b) => b.len(),
            ColumnBuilder::UInt32(b) => b.len(),
            ColumnBuilder::UInt64(b) => b.len(),
            ColumnBuilder::Int32(b) => b.len(),
            ColumnBuilder::Int64(b) => b.len(),
            ColumnBuilder::Float64(b) => b.len(),
            ColumnBuilder::Utf8 { builder, .. } => builder.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn finish(self) -> ArrayRef {
        match self {
            ColumnBuilder::UInt8(mut b) => Arc::new(b.finish()),
            ColumnBuilder::UInt16(mut b) => Arc::new(b.finish()),
            ColumnBuilder::UInt32(mut b) => Arc::new(b.finish()),
            ColumnBuilder::UInt64(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Int32(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Int64(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Float64(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Utf8 { mut builder, .. } => Arc::new(builder.finish()),
        }
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], Error> {
    bytes.try_into().map_err(|_| {
        Error::new(ErrorKind::ColumnAppend)
            .with_message(format!("expected {N} field bytes, found {}", bytes.len()))
    })
}

/// One builder per layout column, in layout order.
#[derive(Debug)]
pub struct RowBuilders {
    builders: Vec<ColumnBuilder>,
}

impl RowBuilders {
    pub fn new(layout: &BlockLayout) -> Self {
        let builders = layout
            .columns()
            .iter()
            .map(|column| ColumnBuilder::new(column.column_type))
            .collect();
        Self { builders }
    }

    /// Appends every field of the bound row. On error some columns may have
    /// taken the row and others not, so the builders must be discarded.
    pub fn append_row(&mut self, row: &RowView) -> Result<(), Error> {
        for (column, builder) in self.builders.iter_mut().enumerate() {
            builder.append_field(row.field(column)?)?;
        }
        Ok(())
    }

    pub fn finish(self) -> Vec<ArrayRef> {
        self.builders.into_iter().map(ColumnBuilder::finish).collect()
    }
}
