// Row images and the reusable row view used to read them field by field.
use std::sync::Arc;

use crate::core::error::{Error, ErrorKind};
use crate::core::layout::{BlockLayout, ColumnType, VARLEN_ENTRY_LEN};

#[derive(Clone, Debug, PartialEq)]
pub enum Datum {
    Null,
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    /// Raw varlen payload; the engine stores it without checking the encoding.
    Bytes(Vec<u8>),
}

/// Immutable encoded row, shared by every version chain entry that points at it.
#[derive(Debug, PartialEq, Eq)]
pub struct RowImage {
    bytes: Box<[u8]>,
}

impl RowImage {
    /// Encodes `values` given in layout column order.
    pub fn encode(layout: &BlockLayout, values: &[Datum]) -> Result<Self, Error> {
        if values.len() != layout.num_columns() {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "row has {} values, layout has {} columns",
                values.len(),
                layout.num_columns()
            )));
        }

        let mut bytes = vec![0u8; layout.fixed_len()];
        let mut varlen = Vec::new();
        for (index, (column, value)) in layout.columns().iter().zip(values).enumerate() {
            let offset = layout.offset(index);
            let fixed: Option<Vec<u8>> = match (column.column_type, value) {
                (_, Datum::Null) => {
                    if !column.nullable {
                        return Err(Error::new(ErrorKind::Usage)
                            .with_message(format!("column {} is not nullable", column.name)));
                    }
                    None
                }
                (ColumnType::UInt8, Datum::UInt8(v)) => Some(v.to_le_bytes().to_vec()),
                (ColumnType::UInt16, Datum::UInt16(v)) => Some(v.to_le_bytes().to_vec()),
                (ColumnType::UInt32, Datum::UInt32(v)) => Some(v.to_le_bytes().to_vec()),
                (ColumnType::UInt64, Datum::UInt64(v)) => Some(v.to_le_bytes().to_vec()),
                (ColumnType::Int32, Datum::Int32(v)) => Some(v.to_le_bytes().to_vec()),
                (ColumnType::Int64, Datum::Int64(v)) => Some(v.to_le_bytes().to_vec()),
                (ColumnType::Float64, Datum::Float64(v)) => Some(v.to_le_bytes().to_vec()),
                (ColumnType::Utf8, Datum::Utf8(text)) => {
                    Some(varlen_entry(&mut varlen, layout.fixed_len(), text.as_bytes())?)
                }
                (ColumnType::Utf8, Datum::Bytes(raw)) => {
                    Some(varlen_entry(&mut varlen, layout.fixed_len(), raw)?)
                }
                (expected, other) => {
                    return Err(Error::new(ErrorKind::Usage).with_message(format!(
                        "column {} expects {expected:?}, got {other:?}",
                        column.name
                    )));
                }
            };
            if let Some(field) = fixed {
                bytes[index / 8] |= 1 << (index % 8);
                bytes[offset..offset + field.len()].copy_from_slice(&field);
            }
        }
        bytes.extend_from_slice(&varlen);
        Ok(Self {
            bytes: bytes.into_boxed_slice(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

fn varlen_entry(varlen: &mut Vec<u8>, fixed_len: usize, payload: &[u8]) -> Result<Vec<u8>, Error> {
    let start = u32::try_from(fixed_len + varlen.len())
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("row image too large"))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("varlen payload too large"))?;
    varlen.extend_from_slice(payload);
    let mut entry = Vec::with_capacity(VARLEN_ENTRY_LEN);
    entry.extend_from_slice(&start.to_le_bytes());
    entry.extend_from_slice(&len.to_le_bytes());
    Ok(entry)
}

/// Schema-shaped cursor over one row image.
///
/// The buffer is allocated once and refilled for every slot a scan visits, so
/// a view must not be shared between concurrent scans. Field offsets come from
/// the layout, which validated them when it was built.
#[derive(Debug)]
pub struct RowView {
    layout: Arc<BlockLayout>,
    buf: Vec<u8>,
    bound: bool,
}

impl RowView {
    pub fn new(layout: Arc<BlockLayout>) -> Self {
        let buf = Vec::with_capacity(layout.fixed_len() * 2);
        Self {
            layout,
            buf,
            bound: false,
        }
    }

    pub fn layout(&self) -> &Arc<BlockLayout> {
        &self.layout
    }

    pub(crate) fn fill(&mut self, image: &RowImage) {
        self.buf.clear();
        self.buf.extend_from_slice(image.as_bytes());
        self.bound = true;
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
        self.bound = false;
    }

    /// Raw field bytes, or `None` when the field is null. Fixed-width fields
    /// return exactly `width` bytes; varlen fields return their payload.
    pub fn field(&self, column: usize) -> Result<Option<&[u8]>, Error> {
        if !self.bound {
            return Err(Error::new(ErrorKind::Internal).with_message("row view is not bound"));
        }
        let Some(def) = self.layout.columns().get(column) else {
            return Err(Error::new(ErrorKind::Internal)
                .with_message(format!("column index {column} out of range")));
        };
        if self.buf[column / 8] & (1 << (column % 8)) == 0 {
            return Ok(None);
        }
        let offset = self.layout.offset(column);
        let fixed = &self.buf[offset..offset + def.column_type.width()];
        if !def.column_type.is_varlen() {
            return Ok(Some(fixed));
        }
        let start = read_u32(fixed, 0) as usize;
        let len = read_u32(fixed, 4) as usize;
        match self.buf.get(start..start + len) {
            Some(payload) => Ok(Some(payload)),
            None => Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("varlen entry for {} out of bounds", def.name))),
        }
    }

    pub fn datum(&self, column: usize) -> Result<Datum, Error> {
        let Some(bytes) = self.field(column)? else {
            return Ok(Datum::Null);
        };
        let column_type = self.layout.columns()[column].column_type;
        let datum = match column_type {
            ColumnType::UInt8 => Datum::UInt8(bytes[0]),
            ColumnType::UInt16 => Datum::UInt16(u16::from_le_bytes([bytes[0], bytes[1]])),
            ColumnType::UInt32 => Datum::UInt32(read_u32(bytes, 0)),
            ColumnType::UInt64 => Datum::UInt64(u64::from_le_bytes(read_8(bytes))),
            ColumnType::Int32 => Datum::Int32(read_u32(bytes, 0) as i32),
            ColumnType::Int64 => Datum::Int64(i64::from_le_bytes(read_8(bytes))),
            ColumnType::Float64 => Datum::Float64(f64::from_le_bytes(read_8(bytes))),
            ColumnType::Utf8 => match std::str::from_utf8(bytes) {
                Ok(text) => Datum::Utf8(text.to_string()),
                Err(_) => Datum::Bytes(bytes.to_vec()),
            },
        };
        Ok(datum)
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

fn read_8(buf: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[..8]);
    out
}
