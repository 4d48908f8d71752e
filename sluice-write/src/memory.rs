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

//! In process table store
//!
//! Implements both [`WriteProtocol`] and [`ReadQuery`]. Appended batches are
//! held against their pending stream until it is finalized, reads are SQL
//! over the committed batches using DataFusion.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use arrow::{datatypes::SchemaRef, record_batch::RecordBatch};
use async_trait::async_trait;
use datafusion::{
    catalog::{CatalogProvider, MemorySchemaProvider, SchemaProvider},
    datasource::MemTable,
    prelude::{SessionConfig, SessionContext},
};
use sluice_schema::TableSchema;
use tracing::{debug, instrument};

use crate::{
    Ack, Code, Error, Finalized, ReadQuery, Result, Status, StreamHandle, TableId, WriteProtocol,
};

/// A failure injected into the next matching operation
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Fault {
    /// Fail an open
    Open(Code),

    /// Fail an append without applying it
    BeforeAppend(Code),

    /// Apply an append then fail, losing the acknowledgement
    AfterAppend(Code),

    /// Fail a finalize without committing
    Finalize(Code),
}

#[derive(Debug)]
struct Stream {
    table: TableId,
    next_offset: i64,
    batches: Vec<RecordBatch>,
}

#[derive(Debug)]
struct Table {
    schema: SchemaRef,
    committed: Vec<RecordBatch>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: BTreeMap<TableId, Table>,

    // open streams only, removed once finalized or aborted
    streams: BTreeMap<String, Stream>,
    faults: Vec<Fault>,
    stream_id: u64,
}

impl Inner {
    fn fault(&mut self, matches: impl Fn(&Fault) -> Option<Code>) -> Option<Code> {
        self.faults
            .iter()
            .position(|fault| matches(fault).is_some())
            .map(|position| self.faults.remove(position))
            .and_then(|fault| matches(&fault))
    }

    fn stream(&mut self, name: &str) -> Result<&mut Stream, Status> {
        self.streams
            .get_mut(name)
            .ok_or_else(|| Status::new(Code::NotFound, format!("stream: {name}")))
    }

    fn retire(&mut self, name: &str) -> Result<Stream, Status> {
        self.streams
            .remove(name)
            .ok_or_else(|| Status::new(Code::NotFound, format!("stream: {name}")))
    }
}

#[derive(Clone, Debug, Default)]
pub struct Memory {
    inner: Arc<Mutex<Inner>>,
}

impl Memory {
    fn lock(&self) -> Result<MutexGuard<'_, Inner>, Status> {
        self.inner
            .lock()
            .map_err(|err| Status::new(Code::Internal, err.to_string()))
    }

    /// Provision an empty table
    pub fn create_table(&self, table: TableId, schema: &TableSchema) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|err| Error::Message(err.to_string()))?;

        debug!(%table);

        _ = inner.tables.insert(
            table,
            Table {
                schema: schema.as_arrow(),
                committed: Vec::new(),
            },
        );

        Ok(())
    }

    /// Fail the next operation matching the fault
    pub fn inject(&self, fault: Fault) -> Result<()> {
        self.inner
            .lock()
            .map(|mut inner| inner.faults.push(fault))
            .map_err(|err| Error::Message(err.to_string()))
    }

    /// Number of streams neither finalized nor aborted
    pub fn open_streams(&self) -> Result<usize> {
        self.inner
            .lock()
            .map(|inner| inner.streams.len())
            .map_err(|err| Error::Message(err.to_string()))
    }

    /// Number of committed rows in the table
    pub fn row_count(&self, table: &TableId) -> Result<usize> {
        let inner = self
            .inner
            .lock()
            .map_err(|err| Error::Message(err.to_string()))?;

        inner
            .tables
            .get(table)
            .map(|table| table.committed.iter().map(RecordBatch::num_rows).sum())
            .ok_or_else(|| Error::Message(format!("table: {table}")))
    }
}

#[async_trait]
impl WriteProtocol for Memory {
    #[instrument(skip_all, fields(%table))]
    async fn open(&self, table: &TableId, schema: &TableSchema) -> Result<StreamHandle, Status> {
        let mut inner = self.lock()?;

        if let Some(code) = inner.fault(|fault| match fault {
            Fault::Open(code) => Some(*code),
            _otherwise => None,
        }) {
            return Err(Status::new(code, "injected"));
        }

        let existing = inner
            .tables
            .get(table)
            .ok_or_else(|| Status::new(Code::NotFound, format!("table: {table}")))?;

        if existing.schema.fields() != schema.as_arrow().fields() {
            return Err(Status::new(
                Code::InvalidArgument,
                format!("schema does not match table: {table}"),
            ));
        }

        inner.stream_id += 1;
        let name = format!("{table}/streams/{}", inner.stream_id);

        _ = inner.streams.insert(
            name.clone(),
            Stream {
                table: table.clone(),
                next_offset: 0,
                batches: Vec::new(),
            },
        );

        Ok(StreamHandle {
            name,
            table: table.clone(),
        })
    }

    #[instrument(skip_all, fields(stream = %stream.name, offset, rows = batch.num_rows()))]
    async fn append(
        &self,
        stream: &StreamHandle,
        batch: RecordBatch,
        offset: i64,
    ) -> Result<Ack, Status> {
        let mut inner = self.lock()?;

        if let Some(code) = inner.fault(|fault| match fault {
            Fault::BeforeAppend(code) => Some(*code),
            _otherwise => None,
        }) {
            return Err(Status::new(code, "injected before append"));
        }

        let schema = {
            let table = inner.stream(&stream.name)?.table.clone();

            inner
                .tables
                .get(&table)
                .map(|table| table.schema.clone())
                .ok_or_else(|| Status::new(Code::NotFound, format!("table: {table}")))?
        };

        let pending = inner.stream(&stream.name)?;

        if batch.schema().fields() != schema.fields() {
            return Err(Status::new(
                Code::InvalidArgument,
                "batch does not match table schema",
            ));
        }

        if offset < pending.next_offset {
            return Err(Status::new(
                Code::AlreadyExists,
                format!("offset: {offset}, next: {}", pending.next_offset),
            ));
        }

        if offset > pending.next_offset {
            return Err(Status::new(
                Code::OutOfRange,
                format!("offset: {offset}, next: {}", pending.next_offset),
            ));
        }

        let rows = i64::try_from(batch.num_rows())
            .map_err(|err| Status::new(Code::InvalidArgument, err.to_string()))?;

        pending.batches.push(batch);
        pending.next_offset += rows;

        debug!(next_offset = pending.next_offset);

        if let Some(code) = inner.fault(|fault| match fault {
            Fault::AfterAppend(code) => Some(*code),
            _otherwise => None,
        }) {
            Err(Status::new(code, "injected after append"))
        } else {
            Ok(Ack { offset })
        }
    }

    #[instrument(skip_all, fields(stream = %stream.name))]
    async fn finalize(&self, stream: &StreamHandle) -> Result<Finalized, Status> {
        let mut inner = self.lock()?;

        if let Some(code) = inner.fault(|fault| match fault {
            Fault::Finalize(code) => Some(*code),
            _otherwise => None,
        }) {
            return Err(Status::new(code, "injected"));
        }

        let pending = inner.retire(&stream.name)?;
        let row_count = pending.next_offset;
        let table = pending.table;

        inner
            .tables
            .get_mut(&table)
            .ok_or_else(|| Status::new(Code::NotFound, format!("table: {table}")))?
            .committed
            .extend(pending.batches);

        debug!(%table, row_count);

        Ok(Finalized { row_count })
    }

    #[instrument(skip_all, fields(stream = %stream.name))]
    async fn abort(&self, stream: &StreamHandle) -> Result<(), Status> {
        let mut inner = self.lock()?;
        inner.retire(&stream.name).map(|pending| {
            debug!(table = %pending.table, discarded = pending.batches.len());
        })
    }
}

impl Memory {
    fn session(&self) -> Result<SessionContext> {
        let ctx = SessionContext::new_with_config(
            SessionConfig::new()
                .set_bool("datafusion.sql_parser.enable_ident_normalization", false),
        );

        let catalog = ctx
            .catalog("datafusion")
            .ok_or(Error::Message(String::from("missing default catalog")))?;

        let inner = self
            .inner
            .lock()
            .map_err(|err| Error::Message(err.to_string()))?;

        let mut datasets = BTreeMap::new();

        for (id, table) in &inner.tables {
            let dataset = datasets.entry(id.dataset().to_owned()).or_insert_with(|| {
                Arc::new(MemorySchemaProvider::new()) as Arc<dyn SchemaProvider>
            });

            _ = dataset.register_table(
                id.table().to_owned(),
                Arc::new(MemTable::try_new(
                    table.schema.clone(),
                    vec![table.committed.clone()],
                )?),
            )?;
        }

        for (name, dataset) in datasets {
            _ = catalog.register_schema(&name, dataset)?;
        }

        Ok(ctx)
    }
}

#[async_trait]
impl ReadQuery for Memory {
    #[instrument(skip(self))]
    async fn query(&self, sql: &str) -> Result<Vec<RecordBatch>, Status> {
        let ctx = self
            .session()
            .map_err(|err| Status::new(Code::Internal, err.to_string()))?;

        let df = ctx
            .sql(sql)
            .await
            .map_err(|err| Status::new(Code::InvalidArgument, err.to_string()))?;

        df.collect()
            .await
            .inspect(|batches| debug!(batches = batches.len()))
            .map_err(|err| Status::new(Code::Internal, err.to_string()))
    }
}
