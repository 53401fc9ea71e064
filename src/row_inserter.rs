use anyhow::anyhow;
use tracing::debug;

use crate::coerce::Coercion;
use crate::column_map::{ColumnMapper, InsertPlan, PlanValue};
use crate::destination::Destination;
use crate::error::ReplicateError;
use crate::source::SourceRow;
use crate::table::{Column, Table};

/// Writes rows into one open table through a plan compiled from the first row.
pub struct RowInserter<D: Destination> {
    table: Table,
    mapper: ColumnMapper,
    coercion: Coercion,
    schema: Option<Vec<Column>>,
    compiled: Option<(InsertPlan, D::Prepared)>,
    rows_written: u64,
}

impl<D: Destination> RowInserter<D> {
    /// Describes `table` up front; the plan itself waits for the first row.
    pub fn open(
        dest: &mut D,
        table: &Table,
        mapper: ColumnMapper,
        coercion: Coercion,
    ) -> Result<Self, ReplicateError> {
        let schema = dest
            .describe(table)
            .map_err(|e| ReplicateError::schema(table, e))?;
        Ok(RowInserter {
            table: table.clone(),
            mapper,
            coercion,
            schema: Some(schema),
            compiled: None,
            rows_written: 0,
        })
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn plan(&self) -> Option<&InsertPlan> {
        self.compiled.as_ref().map(|(plan, _)| plan)
    }

    pub fn write_row(&mut self, dest: &mut D, row: &SourceRow) -> Result<(), ReplicateError> {
        let row_number = self.rows_written + 1;
        if self.compiled.is_none() {
            let schema = self.schema.as_deref().ok_or_else(|| {
                ReplicateError::write(&self.table, row_number, anyhow!("inserter is closed"))
            })?;
            let fields: Vec<&str> = row.fields().collect();
            let plan = self.mapper.build_plan(&self.table, &fields, schema)?;
            debug!(table = %self.table, columns = ?plan.column_names(), "insert plan built");
            let prepared = dest
                .prepare_insert(&plan)
                .map_err(|e| ReplicateError::write(&self.table, row_number, e))?;
            self.compiled = Some((plan, prepared));
        }
        let Some((plan, prepared)) = &self.compiled else {
            return Err(ReplicateError::write(
                &self.table,
                row_number,
                anyhow!("no insert plan"),
            ));
        };

        let mut values = Vec::with_capacity(plan.parameter_count());
        for planned in plan.bound() {
            let PlanValue::Bind { source_field } = &planned.value else {
                continue;
            };
            let Some(raw) = row.get(source_field) else {
                return Err(ReplicateError::write(
                    &self.table,
                    row_number,
                    anyhow!("row has no field {source_field}, which the first row had"),
                ));
            };
            let value = self
                .coercion
                .apply(&planned.column, raw)
                .map_err(|e| ReplicateError::write(&self.table, row_number, e))?;
            values.push(value);
        }
        dest.insert(prepared, &values)
            .map_err(|e| ReplicateError::write(&self.table, row_number, e))?;
        self.rows_written = row_number;
        Ok(())
    }

    /// Drops the compiled plan and schema cache. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.compiled = None;
        self.schema = None;
    }
}
