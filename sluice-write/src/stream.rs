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

//! Write stream
//!
//! A stream moves through:
//!
//! ```text
//! Unopened -> Open -> (Appending <-> Flushing)* -> Finalizing -> Closed
//! ```
//!
//! with `Failed` reachable from any non-terminal state. Operations on a
//! stream are serialized, so there is at most one append in flight for each
//! offset position.

use std::{
    num::NonZeroU32,
    sync::{Arc, LazyLock},
    time::SystemTime,
};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram},
};
use sluice_schema::{EncodedRow, TableSchema, batch::record_batch};
use tokio::{
    sync::{Mutex, MutexGuard},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    Ack, Code, Commit, Config, Error, Limits, METER, Result, StreamHandle, TableId, WriteProtocol,
};

static APPEND_DURATION: LazyLock<Histogram<u64>> = LazyLock::new(|| {
    METER
        .u64_histogram("append_duration")
        .with_unit("ms")
        .with_description("The append latencies in milliseconds")
        .build()
});

static APPEND_RETRIES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("append_retries")
        .with_description("The number of appends retried at the same offset")
        .build()
});

static ROWS_APPENDED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("rows_appended")
        .with_description("The number of rows acknowledged by the store")
        .build()
});

static FINALIZE_DURATION: LazyLock<Histogram<u64>> = LazyLock::new(|| {
    METER
        .u64_histogram("finalize_duration")
        .with_unit("ms")
        .with_description("The finalize latencies in milliseconds")
        .build()
});

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum State {
    #[default]
    Unopened,
    Open,
    Appending,
    Flushing,
    Finalizing,
    Closed,
    Failed,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: State,
    handle: Option<StreamHandle>,
    offset: i64,
    commit: Option<Commit>,
}

/// A single logical stream to a destination table
#[derive(Debug)]
pub struct StreamWriter<P> {
    protocol: P,
    config: Config,
    limits: Arc<Limits>,
    table: TableId,
    schema: Arc<TableSchema>,
    token: CancellationToken,
    inner: Mutex<Inner>,
}

impl<P> StreamWriter<P>
where
    P: WriteProtocol,
{
    pub(crate) fn new(
        protocol: P,
        config: Config,
        limits: Arc<Limits>,
        table: TableId,
        schema: TableSchema,
        token: CancellationToken,
    ) -> Self {
        Self {
            protocol,
            config,
            limits,
            table,
            schema: Arc::new(schema),
            token,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn table(&self) -> &TableId {
        &self.table
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn state(&self) -> State {
        self.inner.lock().await.state
    }

    /// The offset of the next row to be appended
    pub async fn offset(&self) -> i64 {
        self.inner.lock().await.offset
    }

    /// Establish the stream with the store
    ///
    /// A transient failure leaves the stream unopened so that the caller may
    /// try again.
    #[instrument(skip(self), fields(table = %self.table))]
    pub async fn open(&self) -> Result<()> {
        let mut inner = self.lock().await?;

        if inner.state != State::Unopened {
            return Err(Error::InvalidState {
                operation: "open",
                state: inner.state,
            });
        }

        let opened = tokio::select! {
            biased;

            cancelled = self.token.cancelled() => {
                debug!(?cancelled);
                return Err(self.abandon(&mut inner).await)
            }

            opened = self.protocol.open(&self.table, &self.schema) => opened,
        };

        match opened {
            Ok(handle) => {
                debug!(stream = %handle.name);
                inner.handle = Some(handle);
                inner.state = State::Open;
                Ok(())
            }

            Err(status) => {
                if !status.is_retryable() {
                    inner.state = State::Failed;
                }

                warn!(%status, state = ?inner.state);

                Err(Error::StreamOpen {
                    table: self.table.clone(),
                    status,
                })
            }
        }
    }

    /// Transmit a batch at the next offset, suspending while the in-flight
    /// limits are exhausted
    ///
    /// Transient failures are retried at the same offset. An offset the store
    /// has already applied is treated as acknowledged.
    #[instrument(skip_all, fields(table = %self.table, rows = rows.len()))]
    pub async fn append(&self, rows: &[EncodedRow]) -> Result<Ack> {
        let mut inner = self.lock().await?;

        if !matches!(inner.state, State::Open | State::Appending) {
            return Err(Error::InvalidState {
                operation: "append",
                state: inner.state,
            });
        }

        let offset = inner.offset;

        if rows.is_empty() {
            return Ok(Ack { offset });
        }

        let handle = inner.handle.clone().ok_or(Error::InvalidState {
            operation: "append",
            state: inner.state,
        })?;

        let batch = record_batch(&self.schema, rows)?;
        let row_count = i64::try_from(rows.len())?;

        let bytes = rows.iter().map(EncodedRow::encoded_size).sum::<usize>();
        let bytes = u32::try_from(bytes.clamp(1, self.config.max_in_flight_bytes()))
            .unwrap_or(u32::MAX);

        inner.state = State::Flushing;

        let permits = tokio::select! {
            biased;

            cancelled = self.token.cancelled() => {
                debug!(?cancelled);
                return Err(self.abandon(&mut inner).await)
            }

            permits = async {
                let batch = self.limits.batches.acquire().await?;
                let bytes = self.limits.bytes.acquire_many(bytes).await?;
                Ok::<_, Error>((batch, bytes))
            } => permits,
        };

        let permits = match permits {
            Ok(permits) => permits,
            Err(error) => {
                inner.state = State::Failed;
                return Err(error);
            }
        };

        debug!(
            available_batches = self.limits.batches.available_permits(),
            available_bytes = self.limits.bytes.available_permits()
        );

        if let Some(ref rate_limiter) = self.limits.rate_limiter {
            let burst = self.config.records_per_second().unwrap_or(u32::MAX).max(1);
            let mut remaining = u32::try_from(rows.len()).unwrap_or(u32::MAX);

            while let Some(n) = NonZeroU32::new(remaining.min(burst)) {
                let rate_limit_start = SystemTime::now();

                tokio::select! {
                    biased;

                    cancelled = self.token.cancelled() => {
                        debug!(?cancelled);
                        return Err(self.abandon(&mut inner).await)
                    }

                    ready = rate_limiter.until_n_ready(n) => if let Err(error) = ready {
                        inner.state = State::Failed;
                        return Err(error.into());
                    },
                }

                debug!(
                    rate_limit_duration_ms = rate_limit_start
                        .elapsed()
                        .map_or(0, |duration| duration.as_millis() as u64)
                );

                remaining -= n.get();
            }
        }

        let attributes = [
            KeyValue::new("table", self.table.to_string()),
            KeyValue::new("stream", handle.name.clone()),
        ];

        let mut attempt = 0;

        let ack = loop {
            attempt += 1;

            let append_start = SystemTime::now();

            let outcome = tokio::select! {
                biased;

                cancelled = self.token.cancelled() => {
                    debug!(?cancelled);
                    return Err(self.abandon(&mut inner).await)
                }

                outcome = self.protocol.append(&handle, batch.clone(), offset) => outcome,
            };

            APPEND_DURATION.record(
                append_start
                    .elapsed()
                    .map_or(0, |duration| duration.as_millis() as u64),
                &attributes,
            );

            match outcome {
                Ok(ack) => break ack,

                Err(status) if status.code() == Code::AlreadyExists => {
                    debug!(offset, %status, "previously applied");
                    break Ack { offset };
                }

                Err(status) if status.code() == Code::InvalidArgument => {
                    inner.state = State::Failed;
                    return Err(Error::SchemaViolation { offset, status });
                }

                Err(status)
                    if status.is_retryable() && attempt < self.config.max_append_attempts() =>
                {
                    APPEND_RETRIES.add(1, &attributes);

                    let delay = self.config.backoff(attempt - 1);
                    warn!(offset, attempt, %status, ?delay);

                    tokio::select! {
                        biased;

                        cancelled = self.token.cancelled() => {
                            debug!(?cancelled);
                            return Err(self.abandon(&mut inner).await)
                        }

                        () = sleep(delay) => {}
                    }
                }

                Err(status) => {
                    inner.state = State::Failed;
                    return Err(Error::Append {
                        offset,
                        attempts: attempt,
                        status,
                    });
                }
            }
        };

        drop(permits);

        ROWS_APPENDED.add(row_count as u64, &attributes);

        inner.offset += row_count;
        inner.state = State::Appending;

        debug!(?ack, next = inner.offset, attempt);

        Ok(ack)
    }

    /// Commit every acknowledged row for visibility to readers
    ///
    /// Finalizing a closed stream returns the same commit.
    #[instrument(skip(self), fields(table = %self.table))]
    pub async fn finalize(&self) -> Result<Commit> {
        let mut inner = self.inner.lock().await;

        if let Some(ref commit) = inner.commit {
            return Ok(commit.clone());
        }

        if self.token.is_cancelled() {
            return Err(self.abandon(&mut inner).await);
        }

        let handle = match (inner.state, inner.handle.clone()) {
            (State::Open | State::Appending, Some(handle)) => handle,

            (State::Failed, handle) => {
                return Err(Error::Finalize {
                    stream: handle.map(|handle| handle.name),
                    reason: String::from("appended rows were not acknowledged"),
                });
            }

            (state, _) => {
                return Err(Error::InvalidState {
                    operation: "finalize",
                    state,
                });
            }
        };

        inner.state = State::Finalizing;

        let attributes = [KeyValue::new("table", self.table.to_string())];
        let finalize_start = SystemTime::now();
        let mut attempt = 0;

        let finalized = loop {
            attempt += 1;

            let outcome = tokio::select! {
                biased;

                cancelled = self.token.cancelled() => {
                    debug!(?cancelled);
                    return Err(self.abandon(&mut inner).await)
                }

                outcome = self.protocol.finalize(&handle) => outcome,
            };

            match outcome {
                Ok(finalized) => break finalized,

                Err(status)
                    if status.is_retryable() && attempt < self.config.max_append_attempts() =>
                {
                    let delay = self.config.backoff(attempt - 1);
                    warn!(attempt, %status, ?delay);

                    tokio::select! {
                        biased;

                        cancelled = self.token.cancelled() => {
                            debug!(?cancelled);
                            return Err(self.abandon(&mut inner).await)
                        }

                        () = sleep(delay) => {}
                    }
                }

                Err(status) => {
                    inner.state = State::Failed;
                    return Err(Error::Finalize {
                        stream: Some(handle.name),
                        reason: status.to_string(),
                    });
                }
            }
        };

        FINALIZE_DURATION.record(
            finalize_start
                .elapsed()
                .map_or(0, |duration| duration.as_millis() as u64),
            &attributes,
        );

        if finalized.row_count != inner.offset {
            inner.state = State::Failed;

            return Err(Error::Finalize {
                stream: Some(handle.name),
                reason: format!(
                    "finalized {} rows, acknowledged {}",
                    finalized.row_count, inner.offset
                ),
            });
        }

        let commit = Commit::new(self.table.clone(), handle.name, finalized.row_count);
        debug!(?commit);

        inner.commit = Some(commit.clone());
        inner.state = State::Closed;

        Ok(commit)
    }

    /// Discard the stream without finalizing
    #[instrument(skip(self), fields(table = %self.table))]
    pub async fn abort(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        match inner.state {
            State::Closed => Err(Error::InvalidState {
                operation: "abort",
                state: inner.state,
            }),

            State::Failed => Ok(()),

            _otherwise => {
                inner.state = State::Failed;

                if let Some(ref handle) = inner.handle {
                    self.protocol.abort(handle).await.map_err(|status| {
                        Error::Finalize {
                            stream: Some(handle.name.clone()),
                            reason: status.to_string(),
                        }
                    })?;
                }

                Ok(())
            }
        }
    }

    /// Cancel the stream, aborting any append in flight
    pub async fn cancel(&self) {
        self.token.cancel();

        let mut inner = self.inner.lock().await;

        if !inner.state.is_terminal() {
            _ = self.abandon(&mut inner).await;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    async fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock().await;

        if self.token.is_cancelled() && !inner.state.is_terminal() {
            Err(self.abandon(&mut inner).await)
        } else {
            Ok(inner)
        }
    }

    async fn abandon(&self, inner: &mut Inner) -> Error {
        inner.state = State::Failed;

        if let Some(ref handle) = inner.handle {
            _ = self
                .protocol
                .abort(handle)
                .await
                .inspect_err(|status| warn!(stream = %handle.name, %status));
        }

        Error::Cancelled
    }
}
