// Copyright ⓒ 2024-2025 Peter Morgan <peter.james.morgan@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Record encoding
//!
//! Walks the table schema applying the coercion rule of each declared type to
//! the matching record value. A record either encodes completely or not at
//! all: the first mismatch is returned as [`Error::TypeCoercion`] naming the
//! dotted field path.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};

use crate::{
    Error, Field, FieldType, NUMERIC_PRECISION, NUMERIC_SCALE, Record, Result, TableSchema, Value,
};

/// A wire value
///
/// NUMERIC is unscaled at [`NUMERIC_SCALE`], TIMESTAMP is microseconds since
/// the UNIX epoch in UTC.
#[derive(Clone, Debug, PartialEq)]
pub enum Cell {
    Int64(i64),
    Float64(f64),
    Numeric(i128),
    String(String),
    Bool(bool),
    Bytes(Bytes),
    Timestamp(i64),
    Struct(Vec<Cell>),
    Repeated(Vec<Cell>),
}

impl Cell {
    /// Approximate size of this cell on the wire
    pub fn encoded_size(&self) -> usize {
        match self {
            Self::Bool(_) => 1,
            Self::Int64(_) | Self::Float64(_) | Self::Timestamp(_) => 8,
            Self::Numeric(_) => 16,
            Self::String(value) => value.len(),
            Self::Bytes(value) => value.len(),
            Self::Struct(cells) => cells.iter().map(Cell::encoded_size).sum(),
            Self::Repeated(cells) => 4 + cells.iter().map(Cell::encoded_size).sum::<usize>(),
        }
    }
}

/// A record in wire form, one cell per top level schema field
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedRow {
    cells: Vec<Cell>,
    encoded_size: usize,
}

impl EncodedRow {
    pub fn new(cells: Vec<Cell>) -> Self {
        let encoded_size = cells.iter().map(Cell::encoded_size).sum();

        Self {
            cells,
            encoded_size,
        }
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn encoded_size(&self) -> usize {
        self.encoded_size
    }
}

/// Encode records against a table schema
#[derive(Clone, Debug)]
pub struct Encoder {
    schema: Arc<TableSchema>,
}

impl Encoder {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema: Arc::new(schema),
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    #[instrument(skip_all)]
    pub fn encode(&self, record: &Record) -> Result<EncodedRow> {
        encode_fields("", self.schema.fields(), record)
            .map(EncodedRow::new)
            .inspect(|row| debug!(encoded_size = row.encoded_size()))
            .inspect_err(|err| warn!(?err, ?record))
    }
}

fn append_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_owned()
    } else {
        format!("{path}.{name}")
    }
}

fn expected(field: &Field) -> String {
    if field.is_repeated() {
        format!("ARRAY<{}>", field.field_type())
    } else {
        field.field_type().to_string()
    }
}

fn encode_fields(path: &str, fields: &[Field], record: &Record) -> Result<Vec<Cell>> {
    if let Some((name, value)) = record
        .iter()
        .find(|(name, _)| !fields.iter().any(|field| field.name() == name.as_str()))
    {
        return Err(Error::coercion(append_path(path, name), "no such field", value.type_name()));
    }

    fields
        .iter()
        .map(|field| {
            let path = append_path(path, field.name());

            record
                .get(field.name())
                .ok_or_else(|| Error::coercion(&path, expected(field), "MISSING"))
                .and_then(|value| encode_field(&path, field, value))
        })
        .collect()
}

fn encode_field(path: &str, field: &Field, value: &Value) -> Result<Cell> {
    if field.is_repeated() {
        let Value::Repeated(values) = value else {
            return Err(Error::coercion(path, expected(field), value.type_name()));
        };

        values
            .iter()
            .enumerate()
            .map(|(index, value)| encode_value(&format!("{path}[{index}]"), field, value))
            .collect::<Result<Vec<_>>>()
            .map(Cell::Repeated)
    } else {
        encode_value(path, field, value)
    }
}

fn encode_value(path: &str, field: &Field, value: &Value) -> Result<Cell> {
    match (field.field_type(), value) {
        (FieldType::Int64, Value::Int64(value)) => Ok(Cell::Int64(*value)),
        (FieldType::Float64, Value::Float64(value)) => Ok(Cell::Float64(*value)),
        (FieldType::Numeric, Value::Numeric(value)) => numeric(path, value).map(Cell::Numeric),
        (FieldType::String, Value::String(value)) => Ok(Cell::String(value.clone())),
        (FieldType::Bool, Value::Bool(value)) => Ok(Cell::Bool(*value)),
        (FieldType::Bytes, Value::Bytes(value)) => Ok(Cell::Bytes(value.clone())),

        (FieldType::Timestamp, Value::Timestamp(value)) => {
            timestamp(path, value).map(Cell::Timestamp)
        }

        (FieldType::Struct, Value::Struct(record)) => {
            encode_fields(path, field.fields(), record).map(Cell::Struct)
        }

        (field_type, value) => {
            Err(Error::coercion(path, field_type.to_string(), value.type_name()))
        }
    }
}

/// Unscaled value at the fixed NUMERIC scale
fn numeric(path: &str, value: &Decimal) -> Result<i128> {
    let value = value.normalize();
    let scale = i8::try_from(value.scale()).unwrap_or(i8::MAX);

    if scale > NUMERIC_SCALE {
        return Err(Error::coercion(
            path,
            format!("NUMERIC({NUMERIC_PRECISION}, {NUMERIC_SCALE})"),
            format!("NUMERIC with scale {scale}"),
        ));
    }

    let bound = 10i128.pow(u32::from(NUMERIC_PRECISION));

    10i128
        .checked_pow(u32::try_from(NUMERIC_SCALE - scale)?)
        .and_then(|factor| value.mantissa().checked_mul(factor))
        .filter(|unscaled| unscaled.abs() < bound)
        .ok_or_else(|| {
            Error::coercion(
                path,
                format!("NUMERIC({NUMERIC_PRECISION}, {NUMERIC_SCALE})"),
                format!("NUMERIC {value} out of range"),
            )
        })
}

/// Microseconds since the UNIX epoch
fn timestamp(path: &str, value: &DateTime<Utc>) -> Result<i64> {
    if value.timestamp_subsec_nanos() % 1_000 != 0 {
        return Err(Error::coercion(path, "TIMESTAMP(microseconds)", "TIMESTAMP(nanoseconds)"));
    }

    Ok(value.timestamp_micros())
}
