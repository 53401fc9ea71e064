// In-memory destination used by unit tests, with switchable faults.

use anyhow::{Result, anyhow, bail};
use std::collections::BTreeMap;

use crate::column_map::{InsertPlan, PlanValue};
use crate::destination::{Destination, DestinationTx};
use crate::kept_data::KeptRow;
use crate::table::{Column, Table};

#[derive(Clone, Debug, Default)]
pub struct MemTable {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl MemTable {
    fn index_of(&self, column: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == column)
            .ok_or_else(|| anyhow!("column {column} does not exist"))
    }
}

/// A kept-data update prepared against one table.
#[derive(Clone, Debug)]
pub struct KeptUpdate {
    table: Table,
    key: Column,
    values: Vec<Column>,
}

#[derive(Clone, Debug, Default)]
pub struct Faults {
    /// Fail the n-th insert (1-based) of the store's lifetime.
    pub fail_insert_at: Option<u64>,
    /// Each rename whose target name is listed fails once, consuming the entry.
    pub rename_failures: Vec<String>,
    pub fail_fetch_kept: bool,
    pub fail_update_kept: bool,
    pub fail_copy: bool,
    pub fail_commit: bool,
    pub fail_drop: bool,
    pub fail_optimize: bool,
    pub fail_identities: bool,
}

#[derive(Debug, Default)]
pub struct MemoryDestination {
    pub tables: BTreeMap<String, MemTable>,
    pub faults: Faults,
    pub log: Vec<String>,
    inserts: u64,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, name: &str, columns: &[(&str, &str)], rows: Vec<Vec<Option<&str>>>) {
        let table = MemTable {
            columns: columns.iter().map(|(n, t)| Column::new(*n, *t)).collect(),
            rows: rows
                .into_iter()
                .map(|row| row.into_iter().map(|v| v.map(str::to_string)).collect())
                .collect(),
        };
        self.tables.insert(Table::new(name).to_string(), table);
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    pub fn rows(&self, name: &str) -> Vec<Vec<Option<String>>> {
        self.tables.get(name).map(|t| t.rows.clone()).unwrap_or_default()
    }

    pub fn column(&self, name: &str, column: &str) -> Vec<Option<String>> {
        let table = &self.tables[name];
        let idx = table.index_of(column).unwrap();
        table.rows.iter().map(|r| r[idx].clone()).collect()
    }

    fn table_mut(&mut self, table: &Table) -> Result<&mut MemTable> {
        self.tables
            .get_mut(&table.to_string())
            .ok_or_else(|| anyhow!("relation {table} does not exist"))
    }

    fn table_ref(&self, table: &Table) -> Result<&MemTable> {
        self.tables
            .get(&table.to_string())
            .ok_or_else(|| anyhow!("relation {table} does not exist"))
    }
}

impl Destination for MemoryDestination {
    type Prepared = InsertPlan;
    type PreparedUpdate = KeptUpdate;
    type Tx<'a>
        = MemoryTransaction<'a>
    where
        Self: 'a;

    fn describe(&mut self, table: &Table) -> Result<Vec<Column>> {
        Ok(self.table_ref(table)?.columns.clone())
    }

    fn exists(&mut self, table: &Table) -> Result<bool> {
        Ok(self.tables.contains_key(&table.to_string()))
    }

    fn create_like(&mut self, table: &Table, template: &Table) -> Result<()> {
        if self.exists(table)? {
            bail!("relation {table} already exists");
        }
        let columns = self.table_ref(template)?.columns.clone();
        self.log.push(format!("create {table}"));
        self.tables.insert(
            table.to_string(),
            MemTable {
                columns,
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    fn prepare_insert(&mut self, plan: &InsertPlan) -> Result<Self::Prepared> {
        self.table_ref(&plan.table)?;
        Ok(plan.clone())
    }

    fn insert(&mut self, prepared: &Self::Prepared, params: &[Option<String>]) -> Result<()> {
        self.inserts += 1;
        if self.faults.fail_insert_at == Some(self.inserts) {
            bail!("duplicate key value violates unique constraint");
        }
        let mut params = params.iter();
        let target = self.table_mut(&prepared.table)?;
        let mut row = vec![None; target.columns.len()];
        for planned in &prepared.columns {
            let idx = target.index_of(&planned.column.name)?;
            row[idx] = match &planned.value {
                PlanValue::Bind { .. } => params
                    .next()
                    .ok_or_else(|| anyhow!("missing parameter for {}", planned.column.name))?
                    .clone(),
                PlanValue::Expression(expression) => Some(expression.clone()),
            };
        }
        target.rows.push(row);
        Ok(())
    }

    fn fetch_kept(
        &mut self,
        table: &Table,
        key: &Column,
        values: &[Column],
        lock: bool,
    ) -> Result<Vec<KeptRow>> {
        if self.faults.fail_fetch_kept {
            bail!("could not read {table}");
        }
        if lock {
            self.log.push(format!("share lock {table}"));
        }
        let source = self.table_ref(table)?;
        let key_idx = source.index_of(&key.name)?;
        let value_idx = values
            .iter()
            .map(|c| source.index_of(&c.name))
            .collect::<Result<Vec<_>>>()?;
        Ok(source
            .rows
            .iter()
            .map(|row| KeptRow {
                key: row[key_idx].clone(),
                values: value_idx.iter().map(|&i| row[i].clone()).collect(),
            })
            .collect())
    }

    fn prepare_update_kept(
        &mut self,
        table: &Table,
        key: &Column,
        values: &[Column],
    ) -> Result<Self::PreparedUpdate> {
        self.table_ref(table)?;
        self.log.push(format!("prepare update {table}"));
        Ok(KeptUpdate {
            table: table.clone(),
            key: key.clone(),
            values: values.to_vec(),
        })
    }

    fn update_kept(&mut self, prepared: &Self::PreparedUpdate, row: &KeptRow) -> Result<u64> {
        if self.faults.fail_update_kept {
            bail!("could not update {}", prepared.table);
        }
        let target = self.table_mut(&prepared.table)?;
        let key_idx = target.index_of(&prepared.key.name)?;
        let value_idx = prepared
            .values
            .iter()
            .map(|c| target.index_of(&c.name))
            .collect::<Result<Vec<_>>>()?;
        let mut updated = 0;
        for existing in target.rows.iter_mut().filter(|r| r[key_idx] == row.key) {
            for (&idx, value) in value_idx.iter().zip(&row.values) {
                existing[idx] = value.clone();
            }
            updated += 1;
        }
        Ok(updated)
    }

    fn rename(&mut self, table: &Table, to: &Table) -> Result<()> {
        if let Some(pos) = self.faults.rename_failures.iter().position(|n| *n == to.name) {
            self.faults.rename_failures.remove(pos);
            bail!("permission denied for table {}", to.name);
        }
        if self.exists(to)? {
            bail!("relation {to} already exists");
        }
        let moved = self
            .tables
            .remove(&table.to_string())
            .ok_or_else(|| anyhow!("relation {table} does not exist"))?;
        self.log.push(format!("rename {table} -> {to}"));
        self.tables.insert(to.to_string(), moved);
        Ok(())
    }

    fn drop_table(&mut self, table: &Table) -> Result<()> {
        if self.faults.fail_drop {
            bail!("could not drop {table}");
        }
        self.tables
            .remove(&table.to_string())
            .ok_or_else(|| anyhow!("relation {table} does not exist"))?;
        self.log.push(format!("drop {table}"));
        Ok(())
    }

    fn adopt_sequences(&mut self, from: &Table, to: &Table) -> Result<()> {
        self.log.push(format!("adopt sequences {from} -> {to}"));
        Ok(())
    }

    fn advance_identities(&mut self, table: &Table, previous: &Table) -> Result<()> {
        if self.faults.fail_identities {
            bail!("permission denied for sequence {}_id_seq", table.name);
        }
        self.log.push(format!("advance identities {table} <- {previous}"));
        Ok(())
    }

    fn lock_exclusive(&mut self, table: &Table) -> Result<()> {
        self.table_ref(table)?;
        self.log.push(format!("exclusive lock {table}"));
        Ok(())
    }

    fn truncate(&mut self, table: &Table) -> Result<()> {
        self.table_mut(table)?.rows.clear();
        self.log.push(format!("truncate {table}"));
        Ok(())
    }

    fn copy_rows(&mut self, from: &Table, to: &Table) -> Result<u64> {
        if self.faults.fail_copy {
            bail!("could not copy {from} into {to}");
        }
        let source = self.table_ref(from)?.clone();
        let target = self.table_mut(to)?;
        let mapping = target
            .columns
            .iter()
            .map(|c| source.index_of(&c.name))
            .collect::<Result<Vec<_>>>()?;
        for row in &source.rows {
            target
                .rows
                .push(mapping.iter().map(|&i| row[i].clone()).collect());
        }
        self.log.push(format!("copy {from} -> {to}"));
        Ok(source.rows.len() as u64)
    }

    fn optimize(&mut self, table: &Table) -> Result<()> {
        if self.faults.fail_optimize {
            bail!("could not vacuum {table}");
        }
        self.log.push(format!("optimize {table}"));
        Ok(())
    }

    fn begin(&mut self) -> Result<Self::Tx<'_>> {
        self.log.push("begin".to_string());
        let snapshot = self.tables.clone();
        Ok(MemoryTransaction {
            store: self,
            snapshot: Some(snapshot),
        })
    }
}

/// Restores the table snapshot taken at `begin` unless committed.
pub struct MemoryTransaction<'a> {
    store: &'a mut MemoryDestination,
    snapshot: Option<BTreeMap<String, MemTable>>,
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.store.tables = snapshot;
            self.store.log.push("rollback".to_string());
        }
    }
}

impl DestinationTx for MemoryTransaction<'_> {
    fn commit(mut self) -> Result<()> {
        if self.store.faults.fail_commit {
            bail!("could not serialize access due to concurrent update");
        }
        self.snapshot = None;
        self.store.log.push("commit".to_string());
        Ok(())
    }

    fn rollback(self) -> Result<()> {
        Ok(())
    }
}

impl Destination for MemoryTransaction<'_> {
    type Prepared = InsertPlan;
    type PreparedUpdate = KeptUpdate;
    type Tx<'b>
        = MemoryTransaction<'b>
    where
        Self: 'b;

    fn describe(&mut self, table: &Table) -> Result<Vec<Column>> {
        self.store.describe(table)
    }
    fn exists(&mut self, table: &Table) -> Result<bool> {
        self.store.exists(table)
    }
    fn create_like(&mut self, table: &Table, template: &Table) -> Result<()> {
        self.store.create_like(table, template)
    }
    fn prepare_insert(&mut self, plan: &InsertPlan) -> Result<Self::Prepared> {
        self.store.prepare_insert(plan)
    }
    fn insert(&mut self, prepared: &Self::Prepared, params: &[Option<String>]) -> Result<()> {
        self.store.insert(prepared, params)
    }
    fn fetch_kept(
        &mut self,
        table: &Table,
        key: &Column,
        values: &[Column],
        lock: bool,
    ) -> Result<Vec<KeptRow>> {
        self.store.fetch_kept(table, key, values, lock)
    }
    fn prepare_update_kept(
        &mut self,
        table: &Table,
        key: &Column,
        values: &[Column],
    ) -> Result<Self::PreparedUpdate> {
        self.store.prepare_update_kept(table, key, values)
    }
    fn update_kept(&mut self, prepared: &Self::PreparedUpdate, row: &KeptRow) -> Result<u64> {
        self.store.update_kept(prepared, row)
    }
    fn rename(&mut self, table: &Table, to: &Table) -> Result<()> {
        self.store.rename(table, to)
    }
    fn drop_table(&mut self, table: &Table) -> Result<()> {
        self.store.drop_table(table)
    }
    fn adopt_sequences(&mut self, from: &Table, to: &Table) -> Result<()> {
        self.store.adopt_sequences(from, to)
    }
    fn advance_identities(&mut self, table: &Table, previous: &Table) -> Result<()> {
        self.store.advance_identities(table, previous)
    }
    fn lock_exclusive(&mut self, table: &Table) -> Result<()> {
        self.store.lock_exclusive(table)
    }
    fn truncate(&mut self, table: &Table) -> Result<()> {
        self.store.truncate(table)
    }
    fn copy_rows(&mut self, from: &Table, to: &Table) -> Result<u64> {
        self.store.copy_rows(from, to)
    }
    fn optimize(&mut self, table: &Table) -> Result<()> {
        self.store.optimize(table)
    }
    fn begin(&mut self) -> Result<Self::Tx<'_>> {
        self.store.begin()
    }
}
