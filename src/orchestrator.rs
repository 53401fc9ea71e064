use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_postgres::{PostgresConnectionManager, postgres::NoTls as R2d2NoTls};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

use crate::coerce::Coercion;
use crate::column_map::{ColumnMapper, InsertPlan};
use crate::config::{Config, StrategyKind, TableConfig};
use crate::destination::Destination;
use crate::error::ReplicateError;
use crate::source::{PostgresRowSource, RowSource};
use crate::swap::{
    PassReport, PassState, RenameDance, SwapCoordinator, SwapOptions, SwapOutcome, Transactional,
};

pub type PgPool = Pool<PostgresConnectionManager<R2d2NoTls>>;

/// Replicates every configured table, one after another, from the source
/// database into the destination database.
pub struct ReplicationOrchestrator {
    pub config: Config,
    pub source: PgPool,
    pub destination: PgPool,
}

impl ReplicationOrchestrator {
    pub fn new(config: Config, source: PgPool, destination: PgPool) -> Self {
        Self {
            config,
            source,
            destination,
        }
    }

    /// Builds both connection pools. Fails when either database is unreachable.
    pub fn connect(config: Config) -> Result<Self> {
        let source = pool(config.source_uri()?, config.pool_size).context("connecting to source")?;
        let destination = pool(config.destination_uri()?, config.pool_size)
            .context("connecting to destination")?;
        Ok(Self::new(config, source, destination))
    }

    pub fn swap_options(&self, execute: bool) -> SwapOptions {
        SwapOptions {
            execute,
            coercion: Coercion {
                null_as_empty_string: self.config.null_as_empty_string,
            },
        }
    }

    /// Runs one pass per selected table. A failed pass does not stop the
    /// batch; a stranded table or a ctrl-c does. Connection failures are
    /// returned as errors.
    pub fn run(&self, execute: bool, only: &[String], stop: &AtomicBool) -> Result<BatchReport> {
        let tables = self.config.select_tables(only)?;
        let options = self.swap_options(execute);
        let mut batch = BatchReport::default();
        for table in tables {
            if stop.load(Ordering::Relaxed) {
                warn!(remaining_from = %table.destination_table(), "interrupted, skipping remaining tables");
                batch.interrupted = true;
                break;
            }
            let report = self.replicate(table, options)?;
            let fatal = report.is_fatal();
            batch.reports.push(report);
            if fatal {
                error!(fatal = true, "halting batch, the destination needs manual repair");
                break;
            }
        }
        batch.log_summary();
        Ok(batch)
    }

    fn replicate(&self, table: &TableConfig, options: SwapOptions) -> Result<PassReport> {
        let mut source_client = self.source.get()?;
        let mut dest_client = self.destination.get()?;
        let source_table = table.source_table();
        let mut rows = match PostgresRowSource::open(&mut source_client, &source_table, self.config.batch_size) {
            Ok(rows) => rows,
            Err(e) => {
                error!(table = %source_table, error = %e, "cannot read source table");
                return Ok(PassReport {
                    table: table.destination_table(),
                    state: PassState::Aborted,
                    outcome: SwapOutcome::Discarded {
                        cause: Some(ReplicateError::schema(&source_table, e)),
                    },
                });
            }
        };
        Ok(run_pass(
            self.config.strategy,
            self.config.optimize,
            options,
            &mut *dest_client,
            &mut rows,
            table,
        ))
    }

    /// Resolves the insert plan a pass would use for `table`, without
    /// touching either database beyond reading their catalogs.
    pub fn plan_table(&self, table: &TableConfig) -> Result<InsertPlan> {
        let mut source_client = self.source.get()?;
        let mut dest_client = self.destination.get()?;
        let source_table = table.source_table();
        let fields: Vec<String> = source_table
            .get_columns(&mut *source_client)?
            .into_iter()
            .map(|c| c.name)
            .collect();
        anyhow::ensure!(!fields.is_empty(), "source table {source_table} does not exist");
        let destination = table.destination_table();
        let schema = Destination::describe(&mut *dest_client, &destination)
            .map_err(|e| ReplicateError::schema(&destination, e))?;
        let mapper = ColumnMapper::new(&destination, &table.mapping)?;
        Ok(mapper.build_plan(&destination, &fields, &schema)?)
    }
}

fn pool(uri: &str, size: u32) -> Result<PgPool> {
    let manager = PostgresConnectionManager::new(uri.parse()?, R2d2NoTls);
    Ok(Pool::builder().max_size(size).build(manager)?)
}

/// Picks the promotion strategy and drives one table through a full pass.
pub fn run_pass<D: Destination, R: RowSource>(
    strategy: StrategyKind,
    optimize: bool,
    options: SwapOptions,
    dest: &mut D,
    source: &mut R,
    table: &TableConfig,
) -> PassReport {
    let destination = table.destination_table();
    match strategy {
        StrategyKind::RenameDance => SwapCoordinator::new(RenameDance, options).replicate_table(
            dest,
            source,
            &destination,
            &table.mapping,
            table.keep.clone(),
        ),
        StrategyKind::Transactional => {
            SwapCoordinator::new(Transactional { optimize }, options).replicate_table(
                dest,
                source,
                &destination,
                &table.mapping,
                table.keep.clone(),
            )
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub reports: Vec<PassReport>,
    /// Set when a stop request cut the batch short.
    pub interrupted: bool,
}

impl BatchReport {
    pub fn committed(&self) -> usize {
        self.reports.iter().filter(|r| r.is_committed()).count()
    }

    pub fn failed(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| !r.is_committed() && !r.is_dry_run())
            .count()
    }

    pub fn is_fatal(&self) -> bool {
        self.reports.iter().any(PassReport::is_fatal)
    }

    /// 0 when every pass committed or finished its dry run, 2 when data was
    /// stranded, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.is_fatal() {
            2
        } else if self.failed() > 0 || self.interrupted {
            1
        } else {
            0
        }
    }

    pub fn log_summary(&self) {
        for report in &self.reports {
            match &report.outcome {
                SwapOutcome::Committed { rows } => {
                    info!(table = %report.table, rows, "committed")
                }
                SwapOutcome::Discarded { cause: None } => {
                    info!(table = %report.table, "dry run")
                }
                SwapOutcome::Discarded { cause: Some(e) } => {
                    warn!(table = %report.table, error = %e, "discarded")
                }
                SwapOutcome::Failed { error, stranded } => match stranded {
                    Some(parked) => {
                        error!(table = %report.table, stranded = %parked, error = %error, "failed")
                    }
                    None => error!(table = %report.table, error = %error, "failed"),
                },
            }
        }
        info!(
            tables = self.reports.len(),
            committed = self.committed(),
            failed = self.failed(),
            interrupted = self.interrupted,
            "batch finished"
        );
    }
}
