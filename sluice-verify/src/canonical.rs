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

//! Canonical, order independent rows
//!
//! Both sides of a verification are reduced to the same form: fields sorted
//! by name, timestamps as UTC instants, decimals normalized, floats ordered
//! by total order. Timestamps read back without a timezone are taken as UTC.

use std::fmt::{self, Display, Formatter};

use arrow::{
    array::{Array, ArrayRef, AsArray},
    datatypes::{
        DataType, Decimal128Type, Float64Type, Int64Type, TimeUnit, TimestampMicrosecondType,
        TimestampMillisecondType, TimestampNanosecondType, TimestampSecondType,
    },
    record_batch::RecordBatch,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use rust_decimal::Decimal;
use sluice_schema::{Record, Value};
use tracing::debug;

use crate::{Error, Result};

/// A comparable field value
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Canonical {
    Null,
    Int64(i64),
    Float64(OrderedFloat<f64>),
    Numeric(Decimal),
    String(String),
    Bool(bool),
    Bytes(Bytes),
    Timestamp(DateTime<Utc>),
    Struct(Vec<(String, Canonical)>),
    Array(Vec<Canonical>),
}

impl From<&Value> for Canonical {
    fn from(value: &Value) -> Self {
        match value {
            Value::Int64(value) => Self::Int64(*value),
            Value::Float64(value) => Self::Float64(OrderedFloat(*value)),
            Value::Numeric(value) => Self::Numeric(value.normalize()),
            Value::String(value) => Self::String(value.clone()),
            Value::Bool(value) => Self::Bool(*value),
            Value::Bytes(value) => Self::Bytes(value.clone()),
            Value::Timestamp(value) => Self::Timestamp(*value),
            Value::Struct(record) => Self::Struct(fields(record)),
            Value::Repeated(values) => Self::Array(values.iter().map(Self::from).collect()),
        }
    }
}

fn fields(record: &Record) -> Vec<(String, Canonical)> {
    record
        .iter()
        .map(|(name, value)| (name.clone(), Canonical::from(value)))
        .collect()
}

impl Display for Canonical {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Int64(value) => write!(f, "{value}"),
            Self::Float64(value) => write!(f, "{value}"),
            Self::Numeric(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value:?}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Bytes(value) => write!(f, "{value:?}"),
            Self::Timestamp(value) => write!(f, "{}", value.to_rfc3339()),
            Self::Struct(fields) => write_struct(f, fields),

            Self::Array(values) => {
                f.write_str("[")?;

                for (index, value) in values.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }

                    write!(f, "{value}")?;
                }

                f.write_str("]")
            }
        }
    }
}

fn write_struct(f: &mut Formatter<'_>, fields: &[(String, Canonical)]) -> fmt::Result {
    f.write_str("{")?;

    for (index, (name, value)) in fields.iter().enumerate() {
        if index > 0 {
            f.write_str(", ")?;
        }

        write!(f, "{name}: {value}")?;
    }

    f.write_str("}")
}

/// A row reduced for equality comparison
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VerificationRecord(Vec<(String, Canonical)>);

impl VerificationRecord {
    pub fn fields(&self) -> &[(String, Canonical)] {
        &self.0
    }

    pub fn get(&self, name: &str) -> Option<&Canonical> {
        self.0
            .iter()
            .find_map(|(field, value)| (field == name).then_some(value))
    }

    /// Every row of a batch returned by the store
    pub fn from_batch(batch: &RecordBatch) -> Result<Vec<Self>> {
        debug!(rows = batch.num_rows(), columns = batch.num_columns());

        let schema = batch.schema();

        (0..batch.num_rows())
            .map(|row| {
                let mut fields = schema
                    .fields()
                    .iter()
                    .zip(batch.columns())
                    .map(|(field, column)| {
                        canonical(column, row).map(|value| (field.name().to_owned(), value))
                    })
                    .collect::<Result<Vec<_>>>()?;

                fields.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(Self(fields))
            })
            .collect()
    }
}

impl From<&Record> for VerificationRecord {
    fn from(record: &Record) -> Self {
        Self(fields(record))
    }
}

impl From<Record> for VerificationRecord {
    fn from(record: Record) -> Self {
        Self::from(&record)
    }
}

impl Display for VerificationRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write_struct(f, &self.0)
    }
}

fn timestamp(unit: &TimeUnit, value: i64) -> Result<DateTime<Utc>> {
    match unit {
        TimeUnit::Second => DateTime::from_timestamp(value, 0),
        TimeUnit::Millisecond => DateTime::from_timestamp_millis(value),
        TimeUnit::Microsecond => DateTime::from_timestamp_micros(value),
        TimeUnit::Nanosecond => Some(DateTime::from_timestamp_nanos(value)),
    }
    .ok_or(Error::Message(format!("timestamp out of range: {value} {unit:?}")))
}

fn decimal(mut unscaled: i128, scale: i8) -> Result<Decimal> {
    let mut scale =
        u32::try_from(scale).map_err(|_| Error::UnsupportedType(DataType::Decimal128(38, scale)))?;

    while scale > 0 && unscaled % 10 == 0 {
        unscaled /= 10;
        scale -= 1;
    }

    Decimal::try_from_i128_with_scale(unscaled, scale)
        .map(|decimal| decimal.normalize())
        .map_err(Into::into)
}

fn canonical(array: &ArrayRef, row: usize) -> Result<Canonical> {
    if array.is_null(row) {
        return Ok(Canonical::Null);
    }

    match array.data_type() {
        DataType::Int64 => Ok(Canonical::Int64(array.as_primitive::<Int64Type>().value(row))),

        DataType::Float64 => {
            Ok(Canonical::Float64(OrderedFloat(array.as_primitive::<Float64Type>().value(row))))
        }

        DataType::Decimal128(_, scale) => {
            decimal(array.as_primitive::<Decimal128Type>().value(row), *scale)
                .map(Canonical::Numeric)
        }

        DataType::Utf8 => Ok(Canonical::String(array.as_string::<i32>().value(row).to_owned())),

        DataType::LargeUtf8 => {
            Ok(Canonical::String(array.as_string::<i64>().value(row).to_owned()))
        }

        DataType::Boolean => Ok(Canonical::Bool(array.as_boolean().value(row))),

        DataType::Binary => {
            Ok(Canonical::Bytes(Bytes::copy_from_slice(array.as_binary::<i32>().value(row))))
        }

        DataType::LargeBinary => {
            Ok(Canonical::Bytes(Bytes::copy_from_slice(array.as_binary::<i64>().value(row))))
        }

        DataType::Timestamp(unit, _) => {
            let value = match unit {
                TimeUnit::Second => array.as_primitive::<TimestampSecondType>().value(row),
                TimeUnit::Millisecond => {
                    array.as_primitive::<TimestampMillisecondType>().value(row)
                }
                TimeUnit::Microsecond => {
                    array.as_primitive::<TimestampMicrosecondType>().value(row)
                }
                TimeUnit::Nanosecond => array.as_primitive::<TimestampNanosecondType>().value(row),
            };

            timestamp(unit, value).map(Canonical::Timestamp)
        }

        DataType::Struct(_) => {
            let array = array.as_struct();

            let mut fields = array
                .column_names()
                .into_iter()
                .zip(array.columns())
                .map(|(name, column)| canonical(column, row).map(|value| (name.to_owned(), value)))
                .collect::<Result<Vec<_>>>()?;

            fields.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(Canonical::Struct(fields))
        }

        DataType::List(_) => elements(&array.as_list::<i32>().value(row)),

        DataType::LargeList(_) => elements(&array.as_list::<i64>().value(row)),

        unsupported => Err(Error::UnsupportedType(unsupported.clone())),
    }
}

fn elements(values: &ArrayRef) -> Result<Canonical> {
    (0..values.len())
        .map(|index| canonical(values, index))
        .collect::<Result<Vec<_>>>()
        .map(Canonical::Array)
}
