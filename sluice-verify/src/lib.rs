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

//! Result verification
//!
//! Re-reads a committed table and checks that the rows returned are the
//! records that were written, as multisets.

use std::{
    fmt::{self, Display, Formatter},
    io, result,
};

use arrow::{datatypes::DataType, error::ArrowError};
use sluice_write::{Status, TableId};
use tracing_subscriber::filter::ParseError;

pub mod canonical;
pub mod verifier;

pub use canonical::{Canonical, VerificationRecord};
pub use verifier::{Mismatch, Verifier, compare};

/// Error
#[derive(thiserror::Error, Debug)]
pub enum Error {
    Arrow(#[from] ArrowError),

    Decimal(#[from] rust_decimal::Error),

    Io(#[from] io::Error),

    Message(String),

    ParseFilter(#[from] ParseError),

    Query(Status),

    Schema(Box<sluice_schema::Error>),

    TableMismatch {
        expected: TableId,
        committed: TableId,
    },

    UnsupportedType(DataType),

    VerificationMismatch(Mismatch),

    Write(Box<sluice_write::Error>),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::VerificationMismatch(mismatch) => write!(f, "{mismatch}"),
            otherwise => write!(f, "{otherwise:?}"),
        }
    }
}

impl From<sluice_schema::Error> for Error {
    fn from(value: sluice_schema::Error) -> Self {
        Self::Schema(Box::new(value))
    }
}

impl From<sluice_write::Error> for Error {
    fn from(value: sluice_write::Error) -> Self {
        Self::Write(Box::new(value))
    }
}

impl From<Status> for Error {
    fn from(value: Status) -> Self {
        Self::Query(value)
    }
}

pub type Result<T, E = Error> = result::Result<T, E>;
