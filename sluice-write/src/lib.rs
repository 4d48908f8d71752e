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

//! Streaming write
//!
//! Delivers encoded rows to a remote table store over an append-then-finalize
//! protocol:
//! - [`stream::StreamWriter`] appends batches at tracked offsets, retrying
//!   transient failures at the same offset so that the store can deduplicate
//! - [`sink::Sink`] encodes and batches records for a stream
//! - [`memory::Memory`] is an in process store implementing both the write
//!   protocol and the read query interface

use std::{
    fmt::{self, Display, Formatter},
    io,
    marker::PhantomData,
    num::{NonZeroU32, TryFromIntError},
    result,
    str::FromStr,
    sync::{Arc, LazyLock},
};

use arrow::error::ArrowError;
use datafusion::error::DataFusionError;
use governor::{DefaultDirectRateLimiter, InsufficientCapacity, Quota, RateLimiter};
use opentelemetry::{InstrumentationScope, global, metrics::Meter};
use opentelemetry_semantic_conventions::SCHEMA_URL;
use sluice_schema::TableSchema;
use tokio::sync::{AcquireError, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::filter::ParseError;

pub mod config;
pub mod memory;
pub mod protocol;
pub mod sink;
pub mod stream;

pub use config::Config;
pub use protocol::{Ack, Code, Commit, Finalized, ReadQuery, Status, StreamHandle, WriteProtocol};
pub use sink::Sink;
pub use stream::{State, StreamWriter};

/// Error
#[derive(thiserror::Error, Debug)]
pub enum Error {
    Acquire(#[from] AcquireError),

    Append {
        offset: i64,
        attempts: u32,
        status: Status,
    },

    Arrow(#[from] ArrowError),

    Cancelled,

    DataFusion(Box<DataFusionError>),

    Finalize {
        stream: Option<String>,
        reason: String,
    },

    InsufficientCapacity(#[from] InsufficientCapacity),

    InvalidState {
        operation: &'static str,
        state: State,
    },

    InvalidTableId(String),

    Io(#[from] io::Error),

    Message(String),

    ParseFilter(#[from] ParseError),

    Schema(Box<sluice_schema::Error>),

    SchemaViolation {
        offset: i64,
        status: Status,
    },

    StreamOpen {
        table: TableId,
        status: Status,
    },

    TryFromInt(#[from] TryFromIntError),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<DataFusionError> for Error {
    fn from(value: DataFusionError) -> Self {
        Self::DataFusion(Box::new(value))
    }
}

impl From<sluice_schema::Error> for Error {
    fn from(value: sluice_schema::Error) -> Self {
        Self::Schema(Box::new(value))
    }
}

impl Error {
    /// Whether the operation may succeed if attempted again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StreamOpen { status, .. } => status.is_retryable(),
            _otherwise => false,
        }
    }
}

pub type Result<T, E = Error> = result::Result<T, E>;

pub(crate) static METER: LazyLock<Meter> = LazyLock::new(|| {
    global::meter_with_scope(
        InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(SCHEMA_URL)
            .build(),
    )
});

/// Destination table
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TableId {
    project: String,
    dataset: String,
    table: String,
}

impl TableId {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// The `dataset.table` name used in read queries
    pub fn query_name(&self) -> String {
        format!("{}.{}", self.dataset, self.table)
    }
}

impl Display for TableId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.project, self.dataset, self.table)
    }
}

impl FromStr for TableId {
    type Err = Error;

    /// Parse `project:dataset.table` or `project.dataset.table`
    fn from_str(s: &str) -> result::Result<Self, Self::Err> {
        let (project, qualified) = s
            .split_once(':')
            .or_else(|| s.split_once('.'))
            .ok_or_else(|| Error::InvalidTableId(s.to_owned()))?;

        let (dataset, table) = qualified
            .split_once('.')
            .ok_or_else(|| Error::InvalidTableId(s.to_owned()))?;

        if [project, dataset, table]
            .iter()
            .any(|part| part.is_empty() || part.contains(['.', ':']))
        {
            return Err(Error::InvalidTableId(s.to_owned()));
        }

        Ok(Self::new(project, dataset, table))
    }
}

/// Run scoped resources shared by every stream of a client
#[derive(Debug)]
pub(crate) struct Limits {
    pub(crate) batches: Semaphore,
    pub(crate) bytes: Semaphore,
    pub(crate) rate_limiter: Option<DefaultDirectRateLimiter>,
}

impl From<&Config> for Limits {
    fn from(config: &Config) -> Self {
        Self {
            batches: Semaphore::new(config.max_in_flight_batches()),
            bytes: Semaphore::new(config.max_in_flight_bytes()),
            rate_limiter: config
                .records_per_second()
                .and_then(NonZeroU32::new)
                .map(Quota::per_second)
                .map(RateLimiter::direct)
                .inspect(|rate_limiter| debug!(?rate_limiter)),
        }
    }
}

/// Streaming write client
///
/// Cloning a client shares its in-flight limits, so streams opened from
/// clones of the same client draw on a single budget.
#[derive(Clone, Debug)]
pub struct Client<P> {
    protocol: P,
    config: Config,
    limits: Arc<Limits>,
}

#[derive(Clone, Debug, Default)]
pub struct Builder<P = PhantomData<()>> {
    protocol: P,
    config: Config,
}

impl<P> Builder<P> {
    pub fn protocol<Q>(self, protocol: Q) -> Builder<Q>
    where
        Q: WriteProtocol,
    {
        Builder {
            protocol,
            config: self.config,
        }
    }

    pub fn config(self, config: Config) -> Self {
        Self { config, ..self }
    }
}

impl<P> Builder<P>
where
    P: WriteProtocol,
{
    pub fn build(self) -> Client<P> {
        Client {
            limits: Arc::new(Limits::from(&self.config)),
            protocol: self.protocol,
            config: self.config,
        }
    }
}

impl Client<PhantomData<()>> {
    pub fn builder() -> Builder {
        Builder::default()
    }
}

impl<P> Client<P>
where
    P: WriteProtocol,
{
    pub fn new(protocol: P, config: Config) -> Self {
        Builder::<PhantomData<()>>::default()
            .protocol(protocol)
            .config(config)
            .build()
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// An unopened stream to the table
    pub fn stream(&self, table: TableId, schema: TableSchema) -> StreamWriter<P> {
        self.stream_with_token(table, schema, CancellationToken::new())
    }

    /// An unopened stream that is aborted when the token is cancelled
    pub fn stream_with_token(
        &self,
        table: TableId,
        schema: TableSchema,
        token: CancellationToken,
    ) -> StreamWriter<P> {
        StreamWriter::new(
            self.protocol.clone(),
            self.config.clone(),
            self.limits.clone(),
            table,
            schema,
            token,
        )
    }

    /// An opened sink for the table
    pub async fn sink(&self, table: TableId, schema: TableSchema) -> Result<Sink<P>> {
        Sink::open(self.stream(table, schema)).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{fs::File, thread};
    use tracing::subscriber::DefaultGuard;
    use tracing_subscriber::EnvFilter;

    pub(crate) fn init_tracing() -> Result<DefaultGuard> {
        Ok(tracing::subscriber::set_default(
            tracing_subscriber::fmt()
                .with_level(true)
                .with_line_number(true)
                .with_thread_names(false)
                .with_env_filter(
                    EnvFilter::from_default_env()
                        .add_directive(format!("{}=debug", env!("CARGO_CRATE_NAME")).parse()?),
                )
                .with_writer(
                    thread::current()
                        .name()
                        .ok_or(Error::Message(String::from("unnamed thread")))
                        .and_then(|name| {
                            File::create(format!("../logs/{}/{name}.log", env!("CARGO_PKG_NAME"),))
                                .map_err(Into::into)
                        })
                        .map(Arc::new)?,
                )
                .finish(),
        ))
    }

    #[test]
    fn table_id_forms() -> Result<()> {
        let _guard = init_tracing()?;

        let expected = TableId::new("p", "d", "t");

        assert_eq!(expected, "p:d.t".parse()?);
        assert_eq!(expected, "p.d.t".parse()?);
        assert_eq!("p:d.t", expected.to_string());
        assert_eq!("d.t", expected.query_name());

        for invalid in ["t", "d.t", "p:d", "p:d.t.x", "p:.t", ":d.t", "p.d.t.x"] {
            assert!(
                matches!(invalid.parse::<TableId>(), Err(Error::InvalidTableId(_))),
                "{invalid}"
            );
        }

        Ok(())
    }
}
