// source.rs
// Rows flowing into a pass: the `RowSource` seam and a cursor over a PostgreSQL table.

use anyhow::{Result, bail};
use itertools::Itertools;
use postgres::{Client, IsolationLevel, Portal, Transaction};
use std::collections::VecDeque;
use tracing::debug;

use crate::table::Table;

/// One source row: ordered field names with text values, `None` for NULL.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceRow(Vec<(String, Option<String>)>);

impl SourceRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, value: Option<&str>) -> Self {
        self.0.push((field.to_string(), value.map(str::to_string)));
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(field, _)| field.as_str())
    }

    /// `None` when the field is absent, `Some(None)` when it is present and NULL.
    pub fn get(&self, field: &str) -> Option<Option<&str>> {
        self.0
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value.as_deref())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, Option<String>)> for SourceRow {
    fn from_iter<I: IntoIterator<Item = (K, Option<String>)>>(iter: I) -> Self {
        SourceRow(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// A finite stream of rows for one pass.
pub trait RowSource {
    fn next_row(&mut self) -> Result<Option<SourceRow>>;
}

impl<I: Iterator<Item = SourceRow>> RowSource for I {
    fn next_row(&mut self) -> Result<Option<SourceRow>> {
        Ok(self.next())
    }
}

/// Streams a whole table through a portal inside a read-only snapshot, one
/// batch at a time. Every column arrives as text.
pub struct PostgresRowSource<'a> {
    transaction: Transaction<'a>,
    portal: Portal,
    fields: Vec<String>,
    buffer: VecDeque<SourceRow>,
    batch_size: usize,
    exhausted: bool,
}

impl<'a> PostgresRowSource<'a> {
    pub fn open(client: &'a mut Client, table: &Table, batch_size: usize) -> Result<Self> {
        let fields: Vec<String> = table
            .get_columns(client)?
            .into_iter()
            .map(|c| c.name)
            .collect();
        if fields.is_empty() {
            bail!("source table {table} does not exist or has no columns");
        }
        let query = format!(
            "SELECT {} FROM {}",
            fields
                .iter()
                .map(|f| format!("{}::text", pg_escape::quote_identifier(f)))
                .join(", "),
            table.quoted()
        );
        debug!(sql = %query, "opening source cursor");
        let mut transaction = client
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()?;
        let portal = transaction.bind(query.as_str(), &[])?;
        Ok(PostgresRowSource {
            transaction,
            portal,
            fields,
            buffer: VecDeque::new(),
            batch_size: batch_size.max(1),
            exhausted: false,
        })
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    fn fill(&mut self) -> Result<()> {
        let max_rows = i32::try_from(self.batch_size).unwrap_or(i32::MAX);
        let rows = self.transaction.query_portal(&self.portal, max_rows)?;
        if rows.len() < self.batch_size {
            self.exhausted = true;
        }
        for row in rows {
            let values = self
                .fields
                .iter()
                .enumerate()
                .map(|(i, field)| (field.clone(), row.get::<_, Option<String>>(i)));
            self.buffer.push_back(values.collect());
        }
        Ok(())
    }
}

impl RowSource for PostgresRowSource<'_> {
    fn next_row(&mut self) -> Result<Option<SourceRow>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill()?;
        }
        Ok(self.buffer.pop_front())
    }
}
