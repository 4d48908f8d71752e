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

//! Typed records

use std::collections::{BTreeMap, btree_map};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::{Error, FieldType, Result};

/// A typed value of a record field
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int64(i64),
    Float64(f64),
    Numeric(Decimal),
    String(String),
    Bool(bool),
    Bytes(Bytes),
    Timestamp(DateTime<Utc>),
    Struct(Record),
    Repeated(Vec<Value>),
}

impl Value {
    /// An instant from seconds and sub-second microseconds since the UNIX epoch
    pub fn timestamp(seconds: i64, micros: u32) -> Result<Self> {
        if micros >= 1_000_000 {
            return Err(Error::Message(format!("sub-second micros out of range: {micros}")));
        }

        DateTime::from_timestamp(seconds, micros * 1_000)
            .map(Self::Timestamp)
            .ok_or(Error::Message(format!("timestamp out of range: {seconds}s {micros}us")))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int64(_) => "INT64",
            Self::Float64(_) => "FLOAT64",
            Self::Numeric(_) => "NUMERIC",
            Self::String(_) => "STRING",
            Self::Bool(_) => "BOOL",
            Self::Bytes(_) => "BYTES",
            Self::Timestamp(_) => "TIMESTAMP",
            Self::Struct(_) => "STRUCT",
            Self::Repeated(_) => "ARRAY",
        }
    }

    /// The field type of this value, sequences have none
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Self::Int64(_) => Some(FieldType::Int64),
            Self::Float64(_) => Some(FieldType::Float64),
            Self::Numeric(_) => Some(FieldType::Numeric),
            Self::String(_) => Some(FieldType::String),
            Self::Bool(_) => Some(FieldType::Bool),
            Self::Bytes(_) => Some(FieldType::Bytes),
            Self::Timestamp(_) => Some(FieldType::Timestamp),
            Self::Struct(_) => Some(FieldType::Struct),
            Self::Repeated(_) => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int64(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<Decimal> for Value {
    fn from(value: Decimal) -> Self {
        Self::Numeric(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<&'static [u8]> for Value {
    fn from(value: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(value))
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Record> for Value {
    fn from(value: Record) -> Self {
        Self::Struct(value)
    }
}

impl From<Builder> for Value {
    fn from(value: Builder) -> Self {
        Self::Struct(value.build())
    }
}

impl<T> From<Vec<T>> for Value
where
    T: Into<Value>,
{
    fn from(values: Vec<T>) -> Self {
        Self::Repeated(values.into_iter().map(Into::into).collect())
    }
}

/// A mapping of field name to value
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.fields.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Record
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

impl IntoIterator for Record {
    type Item = (String, Value);
    type IntoIter = btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl<'a> IntoIterator for &'a Record {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

#[derive(Clone, Debug, Default)]
pub struct Builder {
    fields: BTreeMap<String, Value>,
}

impl Builder {
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        _ = self.fields.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Record {
        Record {
            fields: self.fields,
        }
    }
}

impl From<Builder> for Record {
    fn from(builder: Builder) -> Self {
        builder.build()
    }
}
