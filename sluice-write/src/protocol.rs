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

//! Remote store protocol
//!
//! The write side is an append-then-finalize protocol: rows appended to a
//! stream at explicit offsets are invisible to readers until the stream is
//! finalized. The store deduplicates appends by offset, answering
//! [`Code::AlreadyExists`] for an offset it has already applied.

use std::fmt::{self, Display, Formatter};

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use sluice_schema::TableSchema;

use crate::TableId;

/// Status code returned by the remote store
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Code {
    Aborted,
    AlreadyExists,
    Cancelled,
    DeadlineExceeded,
    FailedPrecondition,
    Internal,
    InvalidArgument,
    NotFound,
    OutOfRange,
    PermissionDenied,
    ResourceExhausted,
    Unauthenticated,
    Unavailable,
}

impl Code {
    /// Transient conditions that may succeed when attempted again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Aborted
                | Self::DeadlineExceeded
                | Self::Internal
                | Self::ResourceExhausted
                | Self::Unavailable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aborted => "aborted",
            Self::AlreadyExists => "already_exists",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::FailedPrecondition => "failed_precondition",
            Self::Internal => "internal",
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::OutOfRange => "out_of_range",
            Self::PermissionDenied => "permission_denied",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Unauthenticated => "unauthenticated",
            Self::Unavailable => "unavailable",
        }
    }
}

impl Display for Code {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed protocol call
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

/// An open write stream
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct StreamHandle {
    pub name: String,
    pub table: TableId,
}

/// Acknowledgement of an append at an offset
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Ack {
    pub offset: i64,
}

/// Confirmation that a stream is finalized
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Finalized {
    pub row_count: i64,
}

/// Proof that a stream was finalized and its rows are visible to readers
///
/// Only [`crate::StreamWriter::finalize`] creates a commit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Commit {
    table: TableId,
    stream: String,
    row_count: i64,
}

impl Commit {
    pub(crate) fn new(table: TableId, stream: String, row_count: i64) -> Self {
        Self {
            table,
            stream,
            row_count,
        }
    }

    pub fn table(&self) -> &TableId {
        &self.table
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn row_count(&self) -> i64 {
        self.row_count
    }
}

/// Append-then-finalize write protocol of the remote store
#[async_trait]
pub trait WriteProtocol: Clone + Send + Sync + 'static {
    /// Open a pending stream bound to the table and schema
    async fn open(&self, table: &TableId, schema: &TableSchema) -> Result<StreamHandle, Status>;

    /// Append a batch whose first row is at `offset`
    async fn append(
        &self,
        stream: &StreamHandle,
        batch: RecordBatch,
        offset: i64,
    ) -> Result<Ack, Status>;

    /// Make every appended row visible, ending the stream
    async fn finalize(&self, stream: &StreamHandle) -> Result<Finalized, Status>;

    /// Discard a pending stream and its rows
    async fn abort(&self, stream: &StreamHandle) -> Result<(), Status>;
}

/// Read query interface of the remote store
#[async_trait]
pub trait ReadQuery: Send + Sync {
    async fn query(&self, sql: &str) -> Result<Vec<RecordBatch>, Status>;
}
