// destination.rs
// The operations a replication pass needs from the destination store, and
// their PostgreSQL implementation for any `GenericClient`.

use anyhow::{Result, bail};
use itertools::Itertools;
use postgres::GenericClient;
use postgres::types::ToSql;
use tracing::debug;

use crate::column_map::InsertPlan;
use crate::kept_data::KeptRow;
use crate::table::{Column, Table};

pub trait Destination {
    type Prepared;
    type PreparedUpdate;
    type Tx<'a>: DestinationTx
    where
        Self: 'a;

    /// Ordered insertable columns; errors when the table cannot be described.
    fn describe(&mut self, table: &Table) -> Result<Vec<Column>>;
    fn exists(&mut self, table: &Table) -> Result<bool>;
    /// Creates `table` as a structural copy of `template`.
    fn create_like(&mut self, table: &Table, template: &Table) -> Result<()>;
    fn prepare_insert(&mut self, plan: &InsertPlan) -> Result<Self::Prepared>;
    /// Executes a prepared insert; `params` line up with `plan.bound()`.
    fn insert(&mut self, prepared: &Self::Prepared, params: &[Option<String>]) -> Result<()>;
    /// Reads the key and value columns of every row as text.
    fn fetch_kept(
        &mut self,
        table: &Table,
        key: &Column,
        values: &[Column],
        lock: bool,
    ) -> Result<Vec<KeptRow>>;
    /// Prepares the update that writes kept values into `table` by key.
    fn prepare_update_kept(
        &mut self,
        table: &Table,
        key: &Column,
        values: &[Column],
    ) -> Result<Self::PreparedUpdate>;
    fn update_kept(&mut self, prepared: &Self::PreparedUpdate, row: &KeptRow) -> Result<u64>;
    /// Renames `table` to `to.name`; the schema never changes.
    fn rename(&mut self, table: &Table, to: &Table) -> Result<()>;
    fn drop_table(&mut self, table: &Table) -> Result<()>;
    /// Moves ownership of sequences owned by `from`'s columns to the same
    /// columns of `to`, so dropping `from` leaves `to`'s defaults intact.
    fn adopt_sequences(&mut self, from: &Table, to: &Table) -> Result<()>;
    /// Moves each identity sequence of `table` past the column's largest value
    /// and past the matching sequence of `previous`.
    fn advance_identities(&mut self, table: &Table, previous: &Table) -> Result<()>;
    fn lock_exclusive(&mut self, table: &Table) -> Result<()>;
    fn truncate(&mut self, table: &Table) -> Result<()>;
    /// Copies every row of `from` into `to`, returning the row count.
    fn copy_rows(&mut self, from: &Table, to: &Table) -> Result<u64>;
    /// Storage reclamation and statistics refresh; must run outside a transaction.
    fn optimize(&mut self, table: &Table) -> Result<()>;
    fn begin(&mut self) -> Result<Self::Tx<'_>>;
}

/// An open transaction on a destination. Dropping it without `commit` rolls back.
pub trait DestinationTx: Destination {
    fn commit(self) -> Result<()>;
    fn rollback(self) -> Result<()>;
}

fn as_params(values: &[Option<String>]) -> Vec<&(dyn ToSql + Sync)> {
    values.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

impl<C: GenericClient> Destination for C {
    type Prepared = postgres::Statement;
    type PreparedUpdate = postgres::Statement;
    type Tx<'a>
        = postgres::Transaction<'a>
    where
        Self: 'a;

    fn describe(&mut self, table: &Table) -> Result<Vec<Column>> {
        let columns = table.get_columns(self)?;
        if columns.is_empty() {
            bail!("table {table} does not exist or has no insertable columns");
        }
        Ok(columns)
    }

    fn exists(&mut self, table: &Table) -> Result<bool> {
        table.exists(self)
    }

    fn create_like(&mut self, table: &Table, template: &Table) -> Result<()> {
        let create_table_statement = format!(
            "CREATE TABLE {} (LIKE {} INCLUDING ALL)",
            table.quoted(),
            template.quoted()
        );
        debug!(sql = %create_table_statement, "creating shadow table");
        self.batch_execute(&create_table_statement)?;
        Ok(())
    }

    fn prepare_insert(&mut self, plan: &InsertPlan) -> Result<Self::Prepared> {
        let statement = plan.statement();
        debug!(sql = %statement, "preparing insert");
        Ok(self.prepare(&statement)?)
    }

    fn insert(&mut self, prepared: &Self::Prepared, params: &[Option<String>]) -> Result<()> {
        self.execute(prepared, &as_params(params))?;
        Ok(())
    }

    fn fetch_kept(
        &mut self,
        table: &Table,
        key: &Column,
        values: &[Column],
        lock: bool,
    ) -> Result<Vec<KeptRow>> {
        let select_cols = std::iter::once(key)
            .chain(values)
            .map(|c| format!("{}::text", c.quoted_name()))
            .join(", ");
        let query = format!(
            "SELECT {} FROM {}{}",
            select_cols,
            table.quoted(),
            if lock { " FOR SHARE" } else { "" }
        );
        debug!(sql = %query, "reading kept data");
        let rows = self.query(query.as_str(), &[])?;
        Ok(rows
            .iter()
            .map(|row| KeptRow {
                key: row.get(0),
                values: (1..=values.len()).map(|i| row.get(i)).collect(),
            })
            .collect())
    }

    fn prepare_update_kept(
        &mut self,
        table: &Table,
        key: &Column,
        values: &[Column],
    ) -> Result<Self::PreparedUpdate> {
        let set_clause = values
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = CAST(${}::text AS {})", c.quoted_name(), i + 1, c.data_type))
            .join(", ");
        let statement = format!(
            "UPDATE {} SET {} WHERE {} = CAST(${}::text AS {})",
            table.quoted(),
            set_clause,
            key.quoted_name(),
            values.len() + 1,
            key.data_type
        );
        debug!(sql = %statement, "preparing kept data update");
        Ok(self.prepare(&statement)?)
    }

    fn update_kept(&mut self, prepared: &Self::PreparedUpdate, row: &KeptRow) -> Result<u64> {
        let mut params = as_params(&row.values);
        params.push(&row.key);
        Ok(self.execute(prepared, &params)?)
    }

    fn rename(&mut self, table: &Table, to: &Table) -> Result<()> {
        let statement = format!("ALTER TABLE {} RENAME TO {}", table.quoted(), to.quoted_name());
        debug!(sql = %statement, "renaming table");
        self.batch_execute(&statement)?;
        Ok(())
    }

    fn drop_table(&mut self, table: &Table) -> Result<()> {
        self.batch_execute(&format!("DROP TABLE {}", table.quoted()))?;
        Ok(())
    }

    fn adopt_sequences(&mut self, from: &Table, to: &Table) -> Result<()> {
        let rows = self.query(
            "SELECT a.attname::text, pg_get_serial_sequence($1::text, a.attname)
             FROM pg_attribute a
             WHERE a.attrelid = to_regclass($1::text)
               AND a.attnum > 0
               AND NOT a.attisdropped
               AND a.attidentity = ''",
            &[&from.quoted()],
        )?;
        for row in rows {
            let column: String = row.get(0);
            let Some(sequence) = row.get::<_, Option<String>>(1) else {
                continue;
            };
            let statement = format!(
                "ALTER SEQUENCE {} OWNED BY {}.{}",
                sequence,
                to.quoted(),
                pg_escape::quote_identifier(&column)
            );
            debug!(sql = %statement, "re-owning sequence");
            self.batch_execute(&statement)?;
        }
        Ok(())
    }

    fn advance_identities(&mut self, table: &Table, previous: &Table) -> Result<()> {
        let rows = self.query(
            "SELECT a.attname::text,
                    pg_get_serial_sequence($1::text, a.attname),
                    (SELECT pg_get_serial_sequence($2::text, p.attname)
                     FROM pg_attribute p
                     WHERE p.attrelid = to_regclass($2::text)
                       AND p.attname = a.attname
                       AND NOT p.attisdropped)
             FROM pg_attribute a
             WHERE a.attrelid = to_regclass($1::text)
               AND a.attnum > 0
               AND NOT a.attisdropped
               AND a.attidentity <> ''",
            &[&table.quoted(), &previous.quoted()],
        )?;
        for row in rows {
            let column: String = row.get(0);
            let Some(sequence) = row.get::<_, Option<String>>(1) else {
                continue;
            };
            let previous_sequence: Option<String> = row.get(2);
            let statement = format!(
                "SELECT setval($1::text::regclass, v) FROM (
                     SELECT GREATEST(
                         (SELECT max({column}) FROM {table}),
                         pg_sequence_last_value($1::text::regclass),
                         pg_sequence_last_value($2::text::regclass)
                     ) AS v
                 ) s WHERE v IS NOT NULL",
                column = pg_escape::quote_identifier(&column),
                table = table.quoted()
            );
            debug!(sql = %statement, sequence = %sequence, "advancing identity sequence");
            self.query(statement.as_str(), &[&sequence, &previous_sequence])?;
        }
        Ok(())
    }

    fn lock_exclusive(&mut self, table: &Table) -> Result<()> {
        self.batch_execute(&format!(
            "LOCK TABLE {} IN ACCESS EXCLUSIVE MODE",
            table.quoted()
        ))?;
        Ok(())
    }

    fn truncate(&mut self, table: &Table) -> Result<()> {
        self.batch_execute(&format!("TRUNCATE {}", table.quoted()))?;
        Ok(())
    }

    fn copy_rows(&mut self, from: &Table, to: &Table) -> Result<u64> {
        let cols = self.describe(to)?.iter().map(Column::quoted_name).join(", ");
        let statement = format!(
            "INSERT INTO {to} ({cols}) OVERRIDING SYSTEM VALUE SELECT {cols} FROM {from}",
            to = to.quoted(),
            from = from.quoted(),
            cols = cols
        );
        debug!(sql = %statement, "copying shadow rows");
        Ok(self.execute(statement.as_str(), &[])?)
    }

    fn optimize(&mut self, table: &Table) -> Result<()> {
        self.batch_execute(&format!("VACUUM ANALYZE {}", table.quoted()))?;
        Ok(())
    }

    fn begin(&mut self) -> Result<Self::Tx<'_>> {
        Ok(self.transaction()?)
    }
}

impl DestinationTx for postgres::Transaction<'_> {
    fn commit(self) -> Result<()> {
        postgres::Transaction::commit(self)?;
        Ok(())
    }

    fn rollback(self) -> Result<()> {
        postgres::Transaction::rollback(self)?;
        Ok(())
    }
}
