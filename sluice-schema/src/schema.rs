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

//! Table schema
//!
//! Both descriptor forms accepted by the store normalize into a single
//! [`TableSchema`] forest of [`Field`]s:
//!
//! - compact: `"int:INTEGER,float:FLOAT,str:STRING"`
//! - tree: `{"fields": [{"name": "s", "type": "STRUCT", "mode": "REPEATED", "fields": [...]}]}`

use std::{
    collections::BTreeSet,
    fmt::{self, Display, Formatter},
    result,
    str::FromStr,
};

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, instrument};

use crate::{Error, Record, Result, SchemaParseError, Value};

/// The declared type of a field
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum FieldType {
    Int64,
    Float64,
    Numeric,
    String,
    Bool,
    Bytes,
    Timestamp,
    Struct,
}

impl FieldType {
    pub fn is_struct(&self) -> bool {
        matches!(self, Self::Struct)
    }
}

impl AsRef<str> for FieldType {
    fn as_ref(&self) -> &str {
        match self {
            Self::Int64 => "INT64",
            Self::Float64 => "FLOAT64",
            Self::Numeric => "NUMERIC",
            Self::String => "STRING",
            Self::Bool => "BOOL",
            Self::Bytes => "BYTES",
            Self::Timestamp => "TIMESTAMP",
            Self::Struct => "STRUCT",
        }
    }
}

impl Display for FieldType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INTEGER" | "INT64" => Ok(Self::Int64),
            "FLOAT" | "FLOAT64" => Ok(Self::Float64),
            "NUMERIC" | "DECIMAL" => Ok(Self::Numeric),
            "STRING" => Ok(Self::String),
            "BOOLEAN" | "BOOL" => Ok(Self::Bool),
            "BYTES" => Ok(Self::Bytes),
            "TIMESTAMP" => Ok(Self::Timestamp),
            "STRUCT" | "RECORD" => Ok(Self::Struct),
            _otherwise => Err(s.to_owned()),
        }
    }
}

/// Field mode
///
/// `NULLABLE` is accepted from descriptors, but null values are not
/// modelled so such fields are written as [`Mode::Required`].
#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Mode {
    #[default]
    Required,
    Repeated,
}

impl Mode {
    pub fn is_repeated(&self) -> bool {
        matches!(self, Self::Repeated)
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Required => f.write_str("REQUIRED"),
            Self::Repeated => f.write_str("REPEATED"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REQUIRED" | "NULLABLE" => Ok(Self::Required),
            "REPEATED" => Ok(Self::Repeated),
            _otherwise => Err(s.to_owned()),
        }
    }
}

/// A named, typed field of a table schema
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Field {
    name: String,
    field_type: FieldType,
    mode: Mode,
    fields: Vec<Field>,
}

impl Field {
    /// A required scalar field
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: Mode::Required,
            fields: vec![],
        }
    }

    /// A struct field with the given children
    pub fn new_struct(name: impl Into<String>, fields: impl IntoIterator<Item = Field>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Struct,
            mode: Mode::Required,
            fields: fields.into_iter().collect(),
        }
    }

    pub fn repeated(self) -> Self {
        Self {
            mode: Mode::Repeated,
            ..self
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn is_repeated(&self) -> bool {
        self.mode.is_repeated()
    }

    fn validate(&self) -> Result<(), SchemaParseError> {
        if self.name.is_empty() {
            return Err(SchemaParseError::MissingName);
        }

        match (self.field_type.is_struct(), self.fields.is_empty()) {
            (true, true) => Err(SchemaParseError::EmptyStruct {
                field: self.name.clone(),
            }),

            (false, false) => Err(SchemaParseError::ChildrenOnScalar {
                field: self.name.clone(),
            }),

            (true, false) => {
                unique(&self.fields).and_then(|()| self.fields.iter().try_for_each(Field::validate))
            }

            (false, true) => Ok(()),
        }
    }
}

fn unique(fields: &[Field]) -> Result<(), SchemaParseError> {
    let mut names = BTreeSet::new();

    fields.iter().try_for_each(|field| {
        if names.insert(field.name()) {
            Ok(())
        } else {
            Err(SchemaParseError::DuplicateField {
                field: field.name().to_owned(),
            })
        }
    })
}

/// The canonical schema of a destination table
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TableSchema {
    fields: Vec<Field>,
}

impl TableSchema {
    pub fn new(fields: impl IntoIterator<Item = Field>) -> Result<Self> {
        let schema = Self {
            fields: fields.into_iter().collect(),
        };

        unique(&schema.fields)
            .and_then(|()| schema.fields.iter().try_for_each(Field::validate))
            .map(|()| schema)
            .map_err(Into::into)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Infer a schema from a sample record
    ///
    /// Fields are taken in name order, repeated fields take the type of their
    /// first element.
    #[instrument(ret)]
    pub fn infer(record: &Record) -> Result<Self> {
        fn infer_field(name: &str, value: &Value) -> Result<Field> {
            match value {
                Value::Repeated(values) => values
                    .first()
                    .ok_or(Error::SchemaParse(SchemaParseError::EmptySequence {
                        field: name.to_owned(),
                    }))
                    .and_then(|first| match first {
                        Value::Repeated(_) => {
                            Err(Error::SchemaParse(SchemaParseError::NestedSequence {
                                field: name.to_owned(),
                            }))
                        }

                        element => infer_field(name, element),
                    })
                    .map(Field::repeated),

                Value::Struct(record) => record
                    .iter()
                    .map(|(name, value)| infer_field(name, value))
                    .collect::<Result<Vec<_>>>()
                    .map(|fields| Field::new_struct(name, fields)),

                scalar => scalar
                    .field_type()
                    .map(|field_type| Field::new(name, field_type))
                    .ok_or(Error::Message(format!("no scalar type for: {name}"))),
            }
        }

        record
            .iter()
            .map(|(name, value)| infer_field(name, value))
            .collect::<Result<Vec<_>>>()
            .and_then(Self::new)
    }
}

impl FromStr for TableSchema {
    type Err = Error;

    /// Parse the compact `name:TYPE,name:TYPE` form
    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        debug!(s);

        s.split(',')
            .map(|entry| {
                let entry = entry.trim();

                if entry.is_empty() {
                    return Err(SchemaParseError::EmptyField);
                }

                let Some((name, token)) = entry.split_once(':') else {
                    return Err(SchemaParseError::Malformed(entry.to_owned()));
                };

                let name = name.trim();

                if name.is_empty() {
                    return Err(SchemaParseError::MissingName);
                }

                match token.parse::<FieldType>() {
                    Ok(FieldType::Struct) => Err(SchemaParseError::EmptyStruct {
                        field: name.to_owned(),
                    }),

                    Ok(field_type) => Ok(Field::new(name, field_type)),

                    Err(token) => Err(SchemaParseError::UnknownType {
                        field: name.to_owned(),
                        token,
                    }),
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
            .and_then(Self::new)
    }
}

#[derive(Clone, Debug, Deserialize)]
struct FieldDescriptor {
    name: Option<String>,

    #[serde(rename = "type")]
    field_type: Option<String>,

    mode: Option<String>,

    #[serde(default)]
    fields: Vec<FieldDescriptor>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum TreeDescriptor {
    Table { fields: Vec<FieldDescriptor> },
    Fields(Vec<FieldDescriptor>),
}

impl TryFrom<FieldDescriptor> for Field {
    type Error = SchemaParseError;

    fn try_from(descriptor: FieldDescriptor) -> Result<Self, Self::Error> {
        let name = descriptor
            .name
            .map(|name| name.trim().to_owned())
            .filter(|name| !name.is_empty())
            .ok_or(SchemaParseError::MissingName)?;

        let field_type = descriptor
            .field_type
            .ok_or_else(|| SchemaParseError::MissingType {
                field: name.clone(),
            })
            .and_then(|token| {
                token
                    .parse::<FieldType>()
                    .map_err(|token| SchemaParseError::UnknownType {
                        field: name.clone(),
                        token,
                    })
            })?;

        let mode = descriptor
            .mode
            .map_or(Ok(Mode::default()), |token| {
                token
                    .parse::<Mode>()
                    .map_err(|token| SchemaParseError::UnknownMode {
                        field: name.clone(),
                        token,
                    })
            })?;

        let fields = descriptor
            .fields
            .into_iter()
            .map(Field::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name,
            field_type,
            mode,
            fields,
        })
    }
}

impl TryFrom<&JsonValue> for TableSchema {
    type Error = Error;

    /// Parse the nested tree form
    fn try_from(value: &JsonValue) -> Result<Self, Self::Error> {
        debug!(%value);

        let fields = match TreeDescriptor::deserialize(value)
            .map_err(|err| SchemaParseError::Malformed(err.to_string()))?
        {
            TreeDescriptor::Table { fields } | TreeDescriptor::Fields(fields) => fields,
        };

        fields
            .into_iter()
            .map(Field::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
            .and_then(Self::new)
    }
}

impl TryFrom<Bytes> for TableSchema {
    type Error = Error;

    fn try_from(encoded: Bytes) -> Result<Self, Self::Error> {
        serde_json::from_slice::<JsonValue>(&encoded[..])
            .map_err(|err| Error::SchemaParse(SchemaParseError::Malformed(err.to_string())))
            .and_then(|value| Self::try_from(&value))
    }
}

/// A schema descriptor in either of its surface forms
#[derive(Clone, Debug, PartialEq)]
pub enum Descriptor {
    Compact(String),
    Tree(JsonValue),
}

impl From<&str> for Descriptor {
    fn from(value: &str) -> Self {
        Self::Compact(value.to_owned())
    }
}

impl From<String> for Descriptor {
    fn from(value: String) -> Self {
        Self::Compact(value)
    }
}

impl From<JsonValue> for Descriptor {
    fn from(value: JsonValue) -> Self {
        Self::Tree(value)
    }
}

impl TryFrom<Descriptor> for TableSchema {
    type Error = Error;

    fn try_from(descriptor: Descriptor) -> Result<Self, Self::Error> {
        match descriptor {
            Descriptor::Compact(compact) => compact.parse(),
            Descriptor::Tree(ref tree) => Self::try_from(tree),
        }
    }
}

/// Normalize either descriptor form into a table schema
pub fn parse(descriptor: impl Into<Descriptor>) -> Result<TableSchema> {
    TableSchema::try_from(descriptor.into())
}
