// Block layout: column ordering, fixed-width offsets, and the export schema.
use std::collections::HashSet;
use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use crate::core::error::{Error, ErrorKind};

pub const MAX_COLUMNS: usize = 1024;
pub const MAX_SLOTS_PER_BLOCK: u32 = 1 << 20;
pub const VARLEN_ENTRY_LEN: usize = 8;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ColumnType {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int32,
    Int64,
    Float64,
    Utf8,
}

impl ColumnType {
    /// Bytes occupied in the fixed region of a row image.
    pub fn width(self) -> usize {
        match self {
            ColumnType::UInt8 => 1,
            ColumnType::UInt16 => 2,
            ColumnType::UInt32 | ColumnType::Int32 => 4,
            ColumnType::UInt64 | ColumnType::Int64 | ColumnType::Float64 => 8,
            ColumnType::Utf8 => VARLEN_ENTRY_LEN,
        }
    }

    pub fn is_varlen(self) -> bool {
        matches!(self, ColumnType::Utf8)
    }

    pub fn data_type(self) -> DataType {
        match self {
            ColumnType::UInt8 => DataType::UInt8,
            ColumnType::UInt16 => DataType::UInt16,
            ColumnType::UInt32 => DataType::UInt32,
            ColumnType::UInt64 => DataType::UInt64,
            ColumnType::Int32 => DataType::Int32,
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Utf8 => DataType::Utf8,
        }
    }

    // Variable-length columns sort ahead of every fixed-width column.
    fn sort_rank(self) -> usize {
        if self.is_varlen() { usize::MAX } else { self.width() }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Physical description of every block in a table.
///
/// Columns are stored widest first (variable-length, then 8/4/2/1 bytes),
/// stable within equal widths. The same order is the export column order, so
/// rows materialized from slots and frozen columnar buffers line up without
/// any reordering. A row image is `[null bitmap][fixed fields][varlen bytes]`.
#[derive(Debug)]
pub struct BlockLayout {
    columns: Vec<ColumnDef>,
    offsets: Vec<usize>,
    bitmap_len: usize,
    fixed_len: usize,
    num_slots: u32,
    schema: SchemaRef,
}

impl BlockLayout {
    pub fn new(columns: Vec<ColumnDef>, num_slots: u32) -> Result<Self, Error> {
        if columns.is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("layout needs at least one column"));
        }
        if columns.len() > MAX_COLUMNS {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("layout exceeds {MAX_COLUMNS} columns")));
        }
        if num_slots == 0 || num_slots > MAX_SLOTS_PER_BLOCK {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("slots per block out of range")
                .with_hint(format!("Use a value between 1 and {MAX_SLOTS_PER_BLOCK}.")));
        }
        let mut seen = HashSet::new();
        for column in &columns {
            if column.name.is_empty() {
                return Err(Error::new(ErrorKind::Usage).with_message("column name is empty"));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("duplicate column name: {}", column.name)));
            }
        }

        let mut columns = columns;
        columns.sort_by(|a, b| b.column_type.sort_rank().cmp(&a.column_type.sort_rank()));

        let bitmap_len = columns.len().div_ceil(8);
        let mut offsets = Vec::with_capacity(columns.len());
        let mut cursor = bitmap_len;
        for column in &columns {
            offsets.push(cursor);
            cursor += column.column_type.width();
        }

        let fields: Vec<Field> = columns
            .iter()
            .map(|column| Field::new(&column.name, column.column_type.data_type(), column.nullable))
            .collect();

        Ok(Self {
            columns,
            offsets,
            bitmap_len,
            fixed_len: cursor,
            num_slots,
            schema: Arc::new(Schema::new(fields)),
        })
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_slots(&self) -> u32 {
        self.num_slots
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    pub fn offset(&self, column: usize) -> usize {
        self.offsets[column]
    }

    pub fn bitmap_len(&self) -> usize {
        self.bitmap_len
    }

    pub fn fixed_len(&self) -> usize {
        self.fixed_len
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }
}
