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

use std::{str::FromStr, time::Duration};

use arrow::datatypes::DataType;
use bytes::Bytes;
use common::{init_tracing, table_id};
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use serde_json::json;
use sluice_schema::{Field, FieldType, Record, TableSchema, Value, schema::parse};
use sluice_verify::{Canonical, Error, Result, VerificationRecord, Verifier};
use sluice_write::{
    Client, Code, Commit, Config, ReadQuery, TableId,
    memory::{Fault, Memory},
};
use tracing::debug;

pub mod common;

fn config() -> Config {
    Config::default().with_backoff(Duration::from_millis(1), Duration::from_millis(10))
}

fn scalar_schema() -> Result<TableSchema> {
    parse(
        "int:INTEGER,float:FLOAT,numeric:NUMERIC,str:STRING,\
         bool:BOOLEAN,bytes:BYTES,timestamp:TIMESTAMP",
    )
    .map_err(Into::into)
}

fn scalar_records() -> Result<Vec<Record>> {
    [
        (1, 0.1, 111, "a", true, &b"a"[..]),
        (2, 0.2, 222, "b", false, &b"b"[..]),
        (3, 0.3, 333, "c", true, &b"c"[..]),
        (4, 0.4, 444, "d", false, &b"d"[..]),
    ]
    .into_iter()
    .map(|(int, float, numeric, str, bool, bytes)| {
        Ok::<_, Error>(
            Record::builder()
                .field("int", int)
                .field("float", float)
                .field("numeric", Decimal::new(numeric, 2))
                .field("str", str)
                .field("bool", bool)
                .field("bytes", Bytes::copy_from_slice(bytes))
                .field(
                    "timestamp",
                    Value::timestamp(1_700_000_000 + i64::from(int), 123_456)?,
                )
                .build(),
        )
    })
    .collect()
}

fn nested_schema() -> Result<TableSchema> {
    parse(json!({
        "fields": [
            {"name": "repeated_int", "type": "INTEGER", "mode": "REPEATED"},
            {
                "name": "struct",
                "type": "STRUCT",
                "fields": [
                    {"name": "nested_int", "type": "INTEGER"},
                    {"name": "nested_str", "type": "STRING"}
                ]
            },
            {
                "name": "repeated_struct",
                "type": "RECORD",
                "mode": "REPEATED",
                "fields": [
                    {"name": "nested_numeric", "type": "NUMERIC"},
                    {"name": "nested_bytes", "type": "BYTES"}
                ]
            }
        ]
    }))
    .map_err(Into::into)
}

fn nested_record() -> Record {
    Record::builder()
        .field("repeated_int", vec![1i64, 2, 3])
        .field(
            "struct",
            Record::builder()
                .field("nested_int", 1)
                .field("nested_str", "a"),
        )
        .field(
            "repeated_struct",
            vec![
                Record::builder()
                    .field("nested_numeric", Decimal::new(123, 2))
                    .field("nested_bytes", &b"a"[..])
                    .build(),
                Record::builder()
                    .field("nested_numeric", Decimal::new(345, 2))
                    .field("nested_bytes", &b"b"[..])
                    .build(),
            ],
        )
        .build()
}

fn untyped_records() -> Result<Vec<Record>> {
    (1..=3)
        .map(|i: i64| {
            Ok::<_, Error>(
                Record::builder()
                    .field("id", i)
                    .field("label", format!("row-{i}"))
                    .field("amount", Decimal::new(i * 1_000_000_001, 9))
                    .field("tags", vec![format!("t{i}"), String::from("common")])
                    .field(
                        "detail",
                        Record::builder()
                            .field("flag", i % 2 == 0)
                            .field("score", 0.25 * i as f64),
                    )
                    .field("seen", Value::timestamp(1_700_000_000 + i, 1)?)
                    .build(),
            )
        })
        .collect()
}

async fn write(
    memory: &Memory,
    config: Config,
    table: &TableId,
    schema: &TableSchema,
    records: &[Record],
) -> Result<Commit> {
    memory.create_table(table.clone(), schema)?;

    let mut sink = Client::new(memory.clone(), config)
        .sink(table.clone(), schema.clone())
        .await?;

    let written = sink.write_all(records).await?;
    debug!(written);

    sink.close().await.map_err(Into::into)
}

#[tokio::test]
async fn scalar_round_trip() -> Result<()> {
    let _guard = init_tracing()?;

    let memory = Memory::default();
    let table = table_id("scalars");
    let schema = scalar_schema()?;
    let records = scalar_records()?;

    let commit = write(&memory, config(), &table, &schema, &records).await?;
    assert_eq!(4, commit.row_count());

    assert_eq!(
        4,
        Verifier::new(memory, table)
            .verify(&commit, &records)
            .await?
    );

    Ok(())
}

#[tokio::test]
async fn nested_round_trip() -> Result<()> {
    let _guard = init_tracing()?;

    let memory = Memory::default();
    let table = table_id("nested");
    let schema = nested_schema()?;
    let records = [nested_record()];

    let commit = write(&memory, config(), &table, &schema, &records).await?;

    let verifier = Verifier::new(memory.clone(), table.clone());
    assert_eq!(1, verifier.verify(&commit, &records).await?);

    let batches = ReadQuery::query(
        &memory,
        &format!("select repeated_int from {}", table.query_name()),
    )
    .await?;

    let returned = batches
        .iter()
        .map(VerificationRecord::from_batch)
        .collect::<Result<Vec<_>>>()?
        .concat();

    let expected = Record::builder()
        .field("repeated_int", vec![1i64, 2, 3])
        .build();

    assert_eq!(vec![VerificationRecord::from(expected)], returned);

    Ok(())
}

#[tokio::test]
async fn transient_failures_commit_exactly_once() -> Result<()> {
    let _guard = init_tracing()?;

    let memory = Memory::default();
    let table = table_id("retried");
    let schema = scalar_schema()?;
    let records = scalar_records()?;

    memory.inject(Fault::AfterAppend(Code::Unavailable))?;
    memory.inject(Fault::BeforeAppend(Code::DeadlineExceeded))?;
    memory.inject(Fault::AfterAppend(Code::Aborted))?;
    memory.inject(Fault::Finalize(Code::Unavailable))?;

    let commit = write(
        &memory,
        config().with_max_batch_rows(2),
        &table,
        &schema,
        &records,
    )
    .await?;

    assert_eq!(4, commit.row_count());
    assert_eq!(4, memory.row_count(&table)?);

    assert_eq!(
        4,
        Verifier::new(memory, table)
            .verify(&commit, &records)
            .await?
    );

    Ok(())
}

#[tokio::test]
async fn permuted_order_is_accepted() -> Result<()> {
    let _guard = init_tracing()?;

    let memory = Memory::default();
    let table = table_id("permuted");
    let schema = scalar_schema()?;
    let records = scalar_records()?;

    let commit = write(&memory, config(), &table, &schema, &records).await?;

    let verifier = Verifier::new(memory, table.clone())
        .with_query(format!("select * from {} order by str desc", table.query_name()));

    assert_eq!(4, verifier.verify(&commit, &records).await?);

    Ok(())
}

#[tokio::test]
async fn differences_are_rejected() -> Result<()> {
    let _guard = init_tracing()?;

    let memory = Memory::default();
    let table = table_id("different");
    let schema = scalar_schema()?;
    let records = scalar_records()?;

    let commit = write(&memory, config(), &table, &schema, &records).await?;
    let verifier = Verifier::new(memory, table);

    let Err(Error::VerificationMismatch(missing_row)) =
        verifier.verify(&commit, &records[..3]).await
    else {
        panic!("expected a row count mismatch")
    };

    assert!(missing_row.missing.is_empty());
    assert_eq!(1, missing_row.unexpected.len());

    let mut changed = records.clone();
    changed[0] = Record::builder()
        .field("int", 1)
        .field("float", 0.1)
        .field("numeric", Decimal::new(112, 2))
        .field("str", "a")
        .field("bool", true)
        .field("bytes", &b"a"[..])
        .field("timestamp", Value::timestamp(1_700_000_001, 123_456)?)
        .build();

    let Err(Error::VerificationMismatch(diff)) = verifier.verify(&commit, &changed).await else {
        panic!("expected a row value mismatch")
    };

    assert_eq!(
        vec![(VerificationRecord::from(&changed[0]), 1)],
        diff.missing
    );
    assert_eq!(
        vec![(VerificationRecord::from(&records[0]), 1)],
        diff.unexpected
    );

    Ok(())
}

#[tokio::test]
async fn commit_for_another_table_is_rejected() -> Result<()> {
    let _guard = init_tracing()?;

    let memory = Memory::default();
    let table = table_id("committed");
    let schema = scalar_schema()?;
    let records = scalar_records()?;

    let commit = write(&memory, config(), &table, &schema, &records).await?;

    let other = table_id("other");
    memory.create_table(other.clone(), &schema)?;

    assert!(matches!(
        Verifier::new(memory, other).verify(&commit, &records).await,
        Err(Error::TableMismatch { .. })
    ));

    Ok(())
}

#[tokio::test]
async fn independent_streams_share_limits() -> Result<()> {
    let _guard = init_tracing()?;

    let memory = Memory::default();
    let schema = scalar_schema()?;
    let records = scalar_records()?;

    let left = table_id("left");
    let right = table_id("right");

    memory.create_table(left.clone(), &schema)?;
    memory.create_table(right.clone(), &schema)?;

    let client = Client::new(
        memory.clone(),
        config()
            .with_max_batch_rows(1)
            .with_max_in_flight_batches(1),
    );

    let write = |table: TableId| {
        let client = client.clone();
        let schema = schema.clone();
        let records = records.clone();

        async move {
            let mut sink = client.sink(table, schema).await?;
            _ = sink.write_all(&records).await?;
            sink.close().await
        }
    };

    let (left_commit, right_commit) = tokio::try_join!(write(left.clone()), write(right.clone()))?;

    assert_eq!(
        4,
        Verifier::new(memory.clone(), left)
            .verify(&left_commit, &records)
            .await?
    );

    assert_eq!(
        4,
        Verifier::new(memory, right)
            .verify(&right_commit, &records)
            .await?
    );

    Ok(())
}

#[tokio::test]
async fn inferred_schema_round_trip() -> Result<()> {
    let _guard = init_tracing()?;

    let memory = Memory::default();
    let table = table_id("inferred");
    let records = untyped_records()?;

    let schema = TableSchema::infer(&records[0])?;
    debug!(?schema);

    assert_eq!(
        Some(FieldType::Struct),
        schema.field("detail").map(Field::field_type)
    );
    assert_eq!(Some(true), schema.field("tags").map(Field::is_repeated));
    assert_eq!(
        Some(FieldType::Timestamp),
        schema.field("seen").map(Field::field_type)
    );

    let commit = write(&memory, config(), &table, &schema, &records).await?;
    assert_eq!(3, commit.row_count());

    assert_eq!(
        3,
        Verifier::new(memory, table)
            .verify(&commit, &records)
            .await?
    );

    Ok(())
}

#[tokio::test]
async fn decimals_keep_full_scale() -> Result<()> {
    let _guard = init_tracing()?;

    let memory = Memory::default();
    let table = table_id("decimals");
    let schema = parse("id:INTEGER,amount:NUMERIC")?;

    let amounts = [
        "0.123456789",
        "0.000000001",
        "79228162514264337593543950335",
        "-79228162514264337593543950335",
        "12345678901234567890.5",
    ];

    let records = amounts
        .iter()
        .zip(1i64..)
        .map(|(amount, id)| {
            Ok::<_, Error>(
                Record::builder()
                    .field("id", id)
                    .field("amount", Decimal::from_str(amount)?)
                    .build(),
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let commit = write(&memory, config(), &table, &schema, &records).await?;

    assert_eq!(
        5,
        Verifier::new(memory.clone(), table.clone())
            .verify(&commit, &records)
            .await?
    );

    let batches = ReadQuery::query(
        &memory,
        &format!("select id, amount from {} order by id", table.query_name()),
    )
    .await?;

    for batch in &batches {
        assert_eq!(
            &DataType::Decimal128(38, 9),
            batch.schema().field_with_name("amount")?.data_type()
        );
    }

    let returned = batches
        .iter()
        .map(VerificationRecord::from_batch)
        .collect::<Result<Vec<_>>>()?
        .concat();

    let expected = amounts
        .iter()
        .map(|amount| {
            Decimal::from_str(amount)
                .map(|amount| Some(Canonical::Numeric(amount)))
                .map_err(Into::into)
        })
        .collect::<Result<Vec<_>>>()?;

    assert_eq!(
        expected,
        returned
            .iter()
            .map(|record| record.get("amount").cloned())
            .collect::<Vec<_>>()
    );

    Ok(())
}
