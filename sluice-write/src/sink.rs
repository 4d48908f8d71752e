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

//! Record sink
//!
//! Encodes records against the table schema and buffers them, appending a
//! batch to the stream whenever the row or byte limit is reached.

use std::{borrow::Borrow, pin::pin};

use futures::{Stream, StreamExt};
use sluice_schema::{EncodedRow, Encoder, Record};
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

use crate::{Ack, Commit, Result, StreamWriter, WriteProtocol};

#[derive(Debug)]
pub struct Sink<P> {
    stream: StreamWriter<P>,
    encoder: Encoder,
    buffer: Vec<EncodedRow>,
    buffered_bytes: usize,
}

impl<P> Sink<P>
where
    P: WriteProtocol,
{
    /// Open the stream, retrying transient failures with backoff
    #[instrument(skip_all, fields(table = %stream.table()))]
    pub async fn open(stream: StreamWriter<P>) -> Result<Self> {
        let attempts = stream.config().max_append_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;

            match stream.open().await {
                Ok(()) => break,

                Err(error) if error.is_retryable() && attempt < attempts => {
                    let delay = stream.config().backoff(attempt - 1);
                    warn!(attempt, %error, ?delay);
                    sleep(delay).await;
                }

                Err(error) => return Err(error),
            }
        }

        Ok(Self {
            encoder: Encoder::new(stream.schema().clone()),
            buffer: Vec::with_capacity(stream.config().max_batch_rows()),
            buffered_bytes: 0,
            stream,
        })
    }

    pub fn stream(&self) -> &StreamWriter<P> {
        &self.stream
    }

    /// Number of encoded rows waiting for the next flush
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Encode and buffer a record
    ///
    /// A record that does not match the schema is rejected as a whole and
    /// nothing is buffered for it.
    pub async fn write(&mut self, record: &Record) -> Result<()> {
        let row = self.encoder.encode(record)?;
        let max_rows = self.stream.config().max_batch_rows();
        let max_bytes = self.stream.config().max_batch_bytes();

        if !self.buffer.is_empty() && self.buffered_bytes + row.encoded_size() > max_bytes {
            _ = self.flush().await?;
        }

        self.buffered_bytes += row.encoded_size();
        self.buffer.push(row);

        if self.buffer.len() >= max_rows || self.buffered_bytes >= max_bytes {
            _ = self.flush().await?;
        }

        Ok(())
    }

    /// Append any buffered rows
    pub async fn flush(&mut self) -> Result<Option<Ack>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        debug!(rows = self.buffer.len(), bytes = self.buffered_bytes);

        let ack = self.stream.append(&self.buffer).await?;

        self.buffer.clear();
        self.buffered_bytes = 0;

        Ok(Some(ack))
    }

    /// Write every record from the source, returning the number written
    pub async fn write_all<I>(&mut self, records: I) -> Result<usize>
    where
        I: IntoIterator,
        I::Item: Borrow<Record>,
    {
        let mut written = 0;

        for record in records {
            self.write(record.borrow()).await?;
            written += 1;
        }

        Ok(written)
    }

    /// Write every record from an asynchronous source, returning the number
    /// written
    pub async fn write_stream<S>(&mut self, records: S) -> Result<usize>
    where
        S: Stream<Item = Record>,
    {
        let mut records = pin!(records);
        let mut written = 0;

        while let Some(record) = records.next().await {
            self.write(&record).await?;
            written += 1;
        }

        Ok(written)
    }

    /// Flush and finalize, making every written record visible
    #[instrument(skip_all, fields(table = %self.stream.table()))]
    pub async fn close(mut self) -> Result<Commit> {
        _ = self.flush().await?;
        self.stream.finalize().await
    }

    /// Discard buffered and appended rows
    pub async fn abort(mut self) -> Result<()> {
        self.buffer.clear();
        self.stream.abort().await
    }
}
