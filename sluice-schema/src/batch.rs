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

//! Arrow record batches of encoded rows

use std::sync::Arc;

use arrow::{
    array::{
        ArrayRef, BinaryBuilder, BooleanBuilder, Decimal128Builder, Float64Builder, Int64Builder,
        ListArray, StringBuilder, StructArray, TimestampMicrosecondBuilder,
    },
    buffer::OffsetBuffer,
    datatypes::{
        DataType, Field as ArrowField, FieldRef, Fields, Schema as ArrowSchema, SchemaRef, TimeUnit,
    },
    record_batch::RecordBatch,
};
use tracing::{debug, error, instrument};

use crate::{
    ARROW_LIST_FIELD_NAME, Cell, EncodedRow, Error, Field, FieldType, NUMERIC_PRECISION,
    NUMERIC_SCALE, Result, TableSchema,
};

const NULLABLE: bool = false;

/// Timezone attached to every TIMESTAMP column
pub const TIMESTAMP_TZ: &str = "UTC";

fn scalar_data_type(field_type: FieldType, fields: &[Field]) -> DataType {
    match field_type {
        FieldType::Int64 => DataType::Int64,
        FieldType::Float64 => DataType::Float64,
        FieldType::Numeric => DataType::Decimal128(NUMERIC_PRECISION, NUMERIC_SCALE),
        FieldType::String => DataType::Utf8,
        FieldType::Bool => DataType::Boolean,
        FieldType::Bytes => DataType::Binary,
        FieldType::Timestamp => {
            DataType::Timestamp(TimeUnit::Microsecond, Some(TIMESTAMP_TZ.into()))
        }
        FieldType::Struct => DataType::Struct(struct_fields(fields)),
    }
}

fn struct_fields(fields: &[Field]) -> Fields {
    fields.iter().map(arrow_field).collect()
}

fn element_field(field: &Field) -> FieldRef {
    Arc::new(ArrowField::new(
        ARROW_LIST_FIELD_NAME,
        scalar_data_type(field.field_type(), field.fields()),
        NULLABLE,
    ))
}

fn data_type(field: &Field) -> DataType {
    if field.is_repeated() {
        DataType::List(element_field(field))
    } else {
        scalar_data_type(field.field_type(), field.fields())
    }
}

fn arrow_field(field: &Field) -> ArrowField {
    ArrowField::new(field.name(), data_type(field), NULLABLE)
}

impl TableSchema {
    /// The Arrow schema used on the wire for this table
    pub fn as_arrow(&self) -> SchemaRef {
        Arc::new(ArrowSchema::new(
            self.fields().iter().map(arrow_field).collect::<Fields>(),
        ))
    }
}

fn mismatch(path: &str, expected: FieldType, cell: &Cell) -> Error {
    error!(path, %expected, ?cell);
    Error::coercion(path, expected.to_string(), format!("{cell:?}"))
}

fn scalar_array(path: &str, field: &Field, cells: &[&Cell]) -> Result<ArrayRef> {
    debug!(path, field_type = %field.field_type(), cells = cells.len());

    macro_rules! build {
        ($builder:expr, $variant:ident, $value:ident => $append:expr) => {{
            let mut builder = $builder;

            for cell in cells {
                match cell {
                    Cell::$variant($value) => builder.append_value($append),
                    otherwise => return Err(mismatch(path, field.field_type(), otherwise)),
                }
            }

            Ok(Arc::new(builder.finish()) as ArrayRef)
        }};
    }

    match field.field_type() {
        FieldType::Int64 => {
            build!(Int64Builder::with_capacity(cells.len()), Int64, value => *value)
        }

        FieldType::Float64 => {
            build!(Float64Builder::with_capacity(cells.len()), Float64, value => *value)
        }

        FieldType::Numeric => build!(
            Decimal128Builder::with_capacity(cells.len())
                .with_precision_and_scale(NUMERIC_PRECISION, NUMERIC_SCALE)?,
            Numeric,
            value => *value
        ),

        FieldType::String => build!(StringBuilder::new(), String, value => value),

        FieldType::Bool => {
            build!(BooleanBuilder::with_capacity(cells.len()), Bool, value => *value)
        }

        FieldType::Bytes => build!(BinaryBuilder::new(), Bytes, value => &value[..]),

        FieldType::Timestamp => build!(
            TimestampMicrosecondBuilder::with_capacity(cells.len()).with_timezone(TIMESTAMP_TZ),
            Timestamp,
            value => *value
        ),

        FieldType::Struct => {
            let mut columns = vec![Vec::with_capacity(cells.len()); field.fields().len()];

            for cell in cells {
                match cell {
                    Cell::Struct(children) if children.len() == columns.len() => {
                        for (column, child) in columns.iter_mut().zip(children) {
                            column.push(child);
                        }
                    }

                    otherwise => return Err(mismatch(path, field.field_type(), otherwise)),
                }
            }

            field
                .fields()
                .iter()
                .zip(columns)
                .map(|(child, column)| {
                    array(&format!("{path}.{}", child.name()), child, &column[..])
                })
                .collect::<Result<Vec<_>>>()
                .and_then(|arrays| {
                    StructArray::try_new(struct_fields(field.fields()), arrays, None)
                        .map_err(Into::into)
                })
                .map(|array| Arc::new(array) as ArrayRef)
        }
    }
}

fn array(path: &str, field: &Field, cells: &[&Cell]) -> Result<ArrayRef> {
    if !field.is_repeated() {
        return scalar_array(path, field, cells);
    }

    let mut lengths = Vec::with_capacity(cells.len());
    let mut elements = vec![];

    for cell in cells {
        match cell {
            Cell::Repeated(values) => {
                lengths.push(values.len());
                elements.extend(values);
            }

            otherwise => return Err(mismatch(path, field.field_type(), otherwise)),
        }
    }

    scalar_array(path, field, &elements[..])
        .and_then(|values| {
            ListArray::try_new(
                element_field(field),
                OffsetBuffer::from_lengths(lengths),
                values,
                None,
            )
            .map_err(Into::into)
        })
        .map(|array| Arc::new(array) as ArrayRef)
}

/// Convert encoded rows into a record batch with the table's Arrow schema
#[instrument(skip_all, fields(rows = rows.len()))]
pub fn record_batch(schema: &TableSchema, rows: &[EncodedRow]) -> Result<RecordBatch> {
    let mut columns = vec![Vec::with_capacity(rows.len()); schema.len()];

    for row in rows {
        if row.cells().len() != schema.len() {
            return Err(Error::Message(format!(
                "row has {} cells, schema has {} fields",
                row.cells().len(),
                schema.len()
            )));
        }

        for (column, cell) in columns.iter_mut().zip(row.cells()) {
            column.push(cell);
        }
    }

    schema
        .fields()
        .iter()
        .zip(columns)
        .map(|(field, column)| array(field.name(), field, &column[..]))
        .collect::<Result<Vec<_>>>()
        .and_then(|arrays| RecordBatch::try_new(schema.as_arrow(), arrays).map_err(Into::into))
        .inspect(|batch| debug!(rows = batch.num_rows(), columns = batch.num_columns()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Encoder, Record, Value, schema::parse, tests::init_tracing};
    use arrow::{
        array::{Array, AsArray, Int64Array},
        datatypes::{Decimal128Type, Int64Type, TimestampMicrosecondType},
        util::pretty::pretty_format_batches,
    };
    use pretty_assertions::assert_eq;
    use rust_decimal::Decimal;
    use serde_json::json;

    #[test]
    fn arrow_schema_of_nested_table() -> Result<()> {
        let _guard = init_tracing()?;

        let schema = parse(json!({"fields": [
            {"name": "xs", "type": "INTEGER", "mode": "REPEATED"},
            {"name": "s", "type": "STRUCT", "fields": [
                {"name": "n", "type": "NUMERIC"},
                {"name": "t", "type": "TIMESTAMP"}
            ]}
        ]}))?;

        let arrow = schema.as_arrow();

        assert_eq!(
            &DataType::List(Arc::new(ArrowField::new("element", DataType::Int64, false))),
            arrow.field(0).data_type()
        );

        assert_eq!(
            &DataType::Struct(Fields::from(vec![
                ArrowField::new("n", DataType::Decimal128(38, 9), false),
                ArrowField::new(
                    "t",
                    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                    false
                ),
            ])),
            arrow.field(1).data_type()
        );

        Ok(())
    }

    #[test]
    fn batch_of_scalars() -> Result<()> {
        let _guard = init_tracing()?;

        let schema = parse("int:INTEGER,numeric:NUMERIC,timestamp:TIMESTAMP")?;
        let encoder = Encoder::new(schema.clone());

        let rows = (1..=3)
            .map(|i| {
                Value::timestamp(i * 1000, u32::try_from(i * 100)?).and_then(|timestamp| {
                    encoder.encode(
                        &Record::builder()
                            .field("int", i)
                            .field("numeric", Decimal::new(i * 111, 2))
                            .field("timestamp", timestamp)
                            .build(),
                    )
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let batch = record_batch(&schema, &rows[..])?;
        debug!(batch = %pretty_format_batches(&[batch.clone()])?);

        assert_eq!(3, batch.num_rows());

        assert_eq!(
            &Int64Array::from(vec![1, 2, 3]),
            batch.column(0).as_primitive::<Int64Type>()
        );

        assert_eq!(
            vec![
                Some(1_110_000_000),
                Some(2_220_000_000),
                Some(3_330_000_000),
            ],
            batch
                .column(1)
                .as_primitive::<Decimal128Type>()
                .iter()
                .collect::<Vec<_>>()
        );

        assert_eq!(
            vec![
                Some(1_000_000_100),
                Some(2_000_000_200),
                Some(3_000_000_300),
            ],
            batch
                .column(2)
                .as_primitive::<TimestampMicrosecondType>()
                .iter()
                .collect::<Vec<_>>()
        );

        Ok(())
    }

    #[test]
    fn batch_of_nested_rows() -> Result<()> {
        let _guard = init_tracing()?;

        let schema = parse(json!({"fields": [
            {"name": "xs", "type": "INTEGER", "mode": "REPEATED"},
            {"name": "ss", "type": "STRUCT", "mode": "REPEATED", "fields": [
                {"name": "b", "type": "BYTES"}
            ]}
        ]}))?;

        let encoder = Encoder::new(schema.clone());

        let rows = [
            Record::builder()
                .field("xs", vec![1i64, 2, 3])
                .field(
                    "ss",
                    vec![
                        Record::builder().field("b", &b"a"[..]).build(),
                        Record::builder().field("b", &b"aa"[..]).build(),
                    ],
                )
                .build(),
            Record::builder()
                .field("xs", Vec::<i64>::new())
                .field("ss", vec![Record::builder().field("b", &b"z"[..]).build()])
                .build(),
        ]
        .iter()
        .map(|record| encoder.encode(record))
        .collect::<Result<Vec<_>>>()?;

        let batch = record_batch(&schema, &rows[..])?;

        let xs = batch.column(0).as_list::<i32>();
        assert_eq!(
            &Int64Array::from(vec![1, 2, 3]),
            xs.value(0).as_primitive::<Int64Type>()
        );
        assert_eq!(0, xs.value(1).len());

        let ss = batch.column(1).as_list::<i32>().value(0);
        assert_eq!(2, ss.len());
        assert_eq!(
            &b"aa"[..],
            ss.as_struct().column(0).as_binary::<i32>().value(1)
        );

        Ok(())
    }

    #[test]
    fn row_of_wrong_shape() -> Result<()> {
        let _guard = init_tracing()?;

        let schema = parse("a:INTEGER,b:STRING")?;

        assert!(record_batch(&schema, &[EncodedRow::new(vec![Cell::Int64(1)])]).is_err());

        assert!(matches!(
            record_batch(
                &schema,
                &[EncodedRow::new(vec![Cell::Int64(1), Cell::Bool(true)])]
            ),
            Err(Error::TypeCoercion { field, .. }) if field == "b"
        ));

        Ok(())
    }
}
