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

//! Schema
//!
//! Schema includes the following:
//! - Normalization of compact (`name:TYPE,...`) and nested tree table schema descriptors
//! - A typed [`Record`] model of possibly nested, repeated values
//! - Encoding of records into the wire rows accepted by the streaming write protocol

use std::{
    fmt::{self, Display, Formatter},
    io,
    num::TryFromIntError,
    result,
};

use arrow::error::ArrowError;
use tracing_subscriber::filter::ParseError;

pub mod batch;
pub mod encode;
pub mod schema;
pub mod value;

pub use encode::{Cell, EncodedRow, Encoder};
pub use schema::{Field, FieldType, Mode, TableSchema};
pub use value::{Record, Value};

pub(crate) const ARROW_LIST_FIELD_NAME: &str = "element";

/// Precision of the store's NUMERIC type
pub const NUMERIC_PRECISION: u8 = 38;

/// Fixed scale of the store's NUMERIC type
///
/// Every NUMERIC value is transmitted unscaled at this scale, a value that
/// needs more fractional digits cannot be represented exactly.
pub const NUMERIC_SCALE: i8 = 9;

/// Reasons a schema descriptor is rejected
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SchemaParseError {
    ChildrenOnScalar { field: String },
    DuplicateField { field: String },
    EmptyField,
    EmptySequence { field: String },
    EmptyStruct { field: String },
    Malformed(String),
    MissingName,
    MissingType { field: String },
    NestedSequence { field: String },
    UnknownMode { field: String, token: String },
    UnknownType { field: String, token: String },
}

/// Error
#[derive(thiserror::Error, Debug)]
pub enum Error {
    Arrow(#[from] ArrowError),

    Downcast,

    Io(#[from] io::Error),

    Message(String),

    ParseFilter(#[from] ParseError),

    SchemaParse(SchemaParseError),

    SerdeJson(#[from] serde_json::Error),

    TryFromInt(#[from] TryFromIntError),

    TypeCoercion {
        field: String,
        expected: String,
        actual: String,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<SchemaParseError> for Error {
    fn from(value: SchemaParseError) -> Self {
        Self::SchemaParse(value)
    }
}

impl Error {
    pub(crate) fn coercion(
        field: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::TypeCoercion {
            field: field.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn is_schema_parse(&self) -> bool {
        matches!(self, Self::SchemaParse(_))
    }

    pub fn is_type_coercion(&self) -> bool {
        matches!(self, Self::TypeCoercion { .. })
    }
}

pub type Result<T, E = Error> = result::Result<T, E>;
