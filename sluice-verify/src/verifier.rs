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

use std::{
    borrow::Borrow,
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
};

use sluice_schema::Record;
use sluice_write::{Commit, ReadQuery, TableId};
use tracing::{debug, error, instrument};

use crate::{Error, Result, VerificationRecord};

type Multiset = BTreeMap<VerificationRecord, usize>;

fn multiset(records: impl IntoIterator<Item = VerificationRecord>) -> Multiset {
    records
        .into_iter()
        .fold(Multiset::new(), |mut counts, record| {
            *counts.entry(record).or_default() += 1;
            counts
        })
}

/// Rows that differ between the expected records and the store
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Mismatch {
    /// Expected rows absent from the store, with multiplicity
    pub missing: Vec<(VerificationRecord, usize)>,

    /// Rows in the store that were not expected, with multiplicity
    pub unexpected: Vec<(VerificationRecord, usize)>,
}

impl Mismatch {
    fn between(expected: &Multiset, actual: &Multiset) -> Option<Self> {
        let surplus = |left: &Multiset, right: &Multiset| {
            left.iter()
                .filter_map(|(record, count)| {
                    count
                        .checked_sub(right.get(record).copied().unwrap_or_default())
                        .filter(|surplus| *surplus > 0)
                        .map(|surplus| (record.clone(), surplus))
                })
                .collect::<Vec<_>>()
        };

        let mismatch = Self {
            missing: surplus(expected, actual),
            unexpected: surplus(actual, expected),
        };

        (!mismatch.missing.is_empty() || !mismatch.unexpected.is_empty()).then_some(mismatch)
    }
}

impl Display for Mismatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "verification mismatch: {} missing, {} unexpected",
            self.missing.iter().map(|(_, count)| count).sum::<usize>(),
            self.unexpected
                .iter()
                .map(|(_, count)| count)
                .sum::<usize>()
        )?;

        for (record, count) in &self.missing {
            writeln!(f, "- {record} (x{count})")?;
        }

        for (record, count) in &self.unexpected {
            writeln!(f, "+ {record} (x{count})")?;
        }

        Ok(())
    }
}

/// Compare expected and returned rows as multisets, returning the number of
/// rows matched
pub fn compare(
    expected: impl IntoIterator<Item = VerificationRecord>,
    actual: impl IntoIterator<Item = VerificationRecord>,
) -> Result<usize> {
    let expected = multiset(expected);
    let actual = multiset(actual);

    if let Some(mismatch) = Mismatch::between(&expected, &actual) {
        error!(%mismatch);
        Err(Error::VerificationMismatch(mismatch))
    } else {
        Ok(expected.values().sum())
    }
}

/// Verifies a committed table against the records written to it
#[derive(Clone, Debug)]
pub struct Verifier<R> {
    reader: R,
    table: TableId,
    query: String,
}

impl<R> Verifier<R>
where
    R: ReadQuery,
{
    /// Reads every row of the table
    pub fn new(reader: R, table: TableId) -> Self {
        Self {
            query: format!("select * from {}", table.query_name()),
            reader,
            table,
        }
    }

    pub fn with_query(self, query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..self
        }
    }

    pub fn table(&self) -> &TableId {
        &self.table
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Run the query and compare its rows with the expected records
    ///
    /// Requires the commit of the stream that wrote the table, so a
    /// verification can only follow a finalize. A mismatch is final, the
    /// query is never retried.
    #[instrument(skip(self, commit, expected), fields(table = %self.table, query = %self.query))]
    pub async fn verify<I>(&self, commit: &Commit, expected: I) -> Result<usize>
    where
        I: IntoIterator,
        I::Item: Borrow<Record>,
    {
        if commit.table() != &self.table {
            return Err(Error::TableMismatch {
                expected: self.table.clone(),
                committed: commit.table().clone(),
            });
        }

        debug!(stream = commit.stream(), row_count = commit.row_count());

        let expected = expected
            .into_iter()
            .map(|record| VerificationRecord::from(record.borrow()))
            .collect::<Vec<_>>();

        let mut actual = Vec::new();

        for batch in self.reader.query(&self.query).await? {
            actual.extend(VerificationRecord::from_batch(&batch)?);
        }

        debug!(expected = expected.len(), actual = actual.len());

        compare(expected, actual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::init_tracing;
    use pretty_assertions::assert_eq;

    fn row(id: i64) -> VerificationRecord {
        VerificationRecord::from(Record::builder().field("id", id).build())
    }

    #[test]
    fn permuted_rows_match() -> Result<()> {
        let _guard = init_tracing()?;

        assert_eq!(
            4,
            compare(
                [row(1), row(2), row(2), row(3)],
                [row(2), row(3), row(1), row(2)],
            )?
        );

        Ok(())
    }

    #[test]
    fn duplicate_is_unexpected() -> Result<()> {
        let _guard = init_tracing()?;

        let Err(Error::VerificationMismatch(mismatch)) =
            compare([row(1), row(2)], [row(1), row(2), row(2)])
        else {
            panic!("expected mismatch")
        };

        assert_eq!(
            Mismatch {
                missing: vec![],
                unexpected: vec![(row(2), 1)],
            },
            mismatch
        );

        Ok(())
    }

    #[test]
    fn symmetric_difference() -> Result<()> {
        let _guard = init_tracing()?;

        let Err(error) = compare([row(1), row(2), row(2)], [row(2), row(3)]) else {
            panic!("expected mismatch")
        };

        let Error::VerificationMismatch(ref mismatch) = error else {
            panic!("expected mismatch: {error:?}")
        };

        assert_eq!(vec![(row(1), 1), (row(2), 1)], mismatch.missing);
        assert_eq!(vec![(row(3), 1)], mismatch.unexpected);

        assert_eq!(
            "verification mismatch: 2 missing, 1 unexpected\n\
             - {id: 1} (x1)\n\
             - {id: 2} (x1)\n\
             + {id: 3} (x1)\n",
            error.to_string()
        );

        Ok(())
    }

    #[test]
    fn empty_matches_empty() -> Result<()> {
        let _guard = init_tracing()?;

        assert_eq!(0, compare(Vec::new(), Vec::new())?);

        Ok(())
    }
}
