pub mod rename_dance;
pub mod transactional;

pub use rename_dance::RenameDance;
pub use transactional::Transactional;

use tracing::{debug, error, info, warn};

use crate::coerce::Coercion;
use crate::column_map::{ColumnMapper, MappingConfig};
use crate::destination::Destination;
use crate::error::ReplicateError;
use crate::kept_data::{KeptDataPreserver, KeptDataSpec};
use crate::row_inserter::RowInserter;
use crate::source::RowSource;
use crate::table::Table;

/// Makes a fully loaded shadow table the live table.
pub trait SwapStrategy {
    fn name(&self) -> &'static str;

    /// Runs kept-data preservation, then promotion. On `Ok` the shadow name is
    /// no longer in use as a staging table. On `Err` the production table is
    /// intact unless the error carries a stranded table.
    fn promote<D: Destination>(&self, dest: &mut D, pass: &mut Pass) -> Result<(), ReplicateError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassState {
    Idle,
    ShadowCreated,
    RowsLoaded,
    DataPreserved,
    Promoted,
    Aborted,
}

impl PassState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PassState::Promoted | PassState::Aborted)
    }
}

#[derive(Debug)]
pub enum SwapOutcome {
    /// The shadow is production now and the old data is gone.
    Committed { rows: u64 },
    /// The shadow was dropped and production left untouched. No cause means
    /// a dry run.
    Discarded { cause: Option<ReplicateError> },
    /// Promotion failed. `stranded` names the table holding the pre-pass data
    /// when it could not be moved back.
    Failed {
        error: ReplicateError,
        stranded: Option<Table>,
    },
}

/// Tables and progress of one pass, shared with the strategy.
#[derive(Debug)]
pub struct Pass {
    pub production: Table,
    pub shadow: Table,
    pub preserver: KeptDataPreserver,
    state: PassState,
}

impl Pass {
    pub fn new(production: &Table, keep: Option<KeptDataSpec>) -> Self {
        Pass {
            production: production.clone(),
            shadow: production.shadow(),
            preserver: KeptDataPreserver::new(keep),
            state: PassState::Idle,
        }
    }

    pub fn state(&self) -> PassState {
        self.state
    }

    pub fn advance(&mut self, to: PassState) {
        debug!(table = %self.production, from = ?self.state, to = ?to, "pass state");
        self.state = to;
    }
}

#[derive(Debug)]
pub struct PassReport {
    pub table: Table,
    pub state: PassState,
    pub outcome: SwapOutcome,
}

impl PassReport {
    pub fn is_committed(&self) -> bool {
        matches!(self.outcome, SwapOutcome::Committed { .. })
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self.outcome, SwapOutcome::Discarded { cause: None })
    }

    /// Data is left under a temporary name and an operator has to step in.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.outcome,
            SwapOutcome::Failed {
                stranded: Some(_),
                ..
            }
        )
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SwapOptions {
    /// Promote the shadow table. When false every pass stops after
    /// preservation and drops its shadow.
    pub execute: bool,
    pub coercion: Coercion,
}

/// Drives one table through shadow creation, loading, preservation and promotion.
pub struct SwapCoordinator<S: SwapStrategy> {
    strategy: S,
    options: SwapOptions,
}

impl<S: SwapStrategy> SwapCoordinator<S> {
    pub fn new(strategy: S, options: SwapOptions) -> Self {
        Self { strategy, options }
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Replaces the contents of `table` with the rows of `source`. Never
    /// returns an error: every failure is folded into the report's outcome.
    pub fn replicate_table<D: Destination, R: RowSource>(
        &self,
        dest: &mut D,
        source: &mut R,
        table: &Table,
        mapping: &MappingConfig,
        keep: Option<KeptDataSpec>,
    ) -> PassReport {
        let mut pass = Pass::new(table, keep);
        info!(
            table = %table,
            strategy = self.strategy.name(),
            execute = self.options.execute,
            "starting pass"
        );
        let outcome = match self.run(dest, source, mapping, &mut pass) {
            Ok(Some(rows)) => {
                pass.advance(PassState::Promoted);
                info!(table = %table, rows, "shadow table promoted");
                SwapOutcome::Committed { rows }
            }
            Ok(None) => {
                self.discard_shadow(dest, &pass);
                pass.advance(PassState::Aborted);
                info!(table = %table, "dry run, shadow table discarded");
                SwapOutcome::Discarded { cause: None }
            }
            Err(error) => self.abort(dest, &mut pass, error),
        };
        PassReport {
            table: table.clone(),
            state: pass.state(),
            outcome,
        }
    }

    /// `Ok(Some(rows))` once promoted, `Ok(None)` for a completed dry run.
    fn run<D: Destination, R: RowSource>(
        &self,
        dest: &mut D,
        source: &mut R,
        mapping: &MappingConfig,
        pass: &mut Pass,
    ) -> Result<Option<u64>, ReplicateError> {
        let mapper = ColumnMapper::new(&pass.production, mapping)?;
        let production_exists = dest
            .exists(&pass.production)
            .map_err(|e| ReplicateError::schema(&pass.production, e))?;
        if !production_exists {
            return Err(ReplicateError::schema(
                &pass.production,
                anyhow::anyhow!("destination table does not exist"),
            ));
        }
        let shadow_exists = dest
            .exists(&pass.shadow)
            .map_err(|e| ReplicateError::schema(&pass.shadow, e))?;
        if shadow_exists {
            return Err(ReplicateError::ShadowExists(pass.shadow.clone()));
        }
        dest.create_like(&pass.shadow, &pass.production)
            .map_err(|e| ReplicateError::schema(&pass.shadow, e))?;
        pass.advance(PassState::ShadowCreated);

        let rows = self.load(dest, source, mapper, pass)?;
        pass.advance(PassState::RowsLoaded);

        if !self.options.execute {
            pass.preserver
                .preserve(dest, &pass.production, &pass.shadow, false)?;
            pass.advance(PassState::DataPreserved);
            return Ok(None);
        }
        self.strategy.promote(dest, pass)?;
        Ok(Some(rows))
    }

    fn load<D: Destination, R: RowSource>(
        &self,
        dest: &mut D,
        source: &mut R,
        mapper: ColumnMapper,
        pass: &Pass,
    ) -> Result<u64, ReplicateError> {
        let mut inserter = RowInserter::open(dest, &pass.shadow, mapper, self.options.coercion)?;
        loop {
            let row = source.next_row().map_err(|e| {
                ReplicateError::write(&pass.shadow, inserter.rows_written() + 1, e)
            })?;
            let Some(row) = row else { break };
            inserter.write_row(dest, &row)?;
        }
        inserter.close();
        let rows = inserter.rows_written();
        if rows == 0 {
            warn!(table = %pass.production, "source produced no rows, destination will be emptied");
        }
        info!(table = %pass.production, rows, "shadow table loaded");
        Ok(rows)
    }

    fn abort<D: Destination>(&self, dest: &mut D, pass: &mut Pass, error: ReplicateError) -> SwapOutcome {
        let created = !matches!(pass.state(), PassState::Idle);
        if created {
            self.discard_shadow(dest, pass);
        }
        pass.advance(PassState::Aborted);
        match error {
            ReplicateError::Promotion {
                stranded: Some(ref temporary),
                ..
            } => {
                let stranded = temporary.clone();
                error!(
                    fatal = true,
                    table = %pass.production,
                    stranded = %stranded,
                    error = %error,
                    "promotion failed and the original data is left under a temporary name"
                );
                SwapOutcome::Failed {
                    error,
                    stranded: Some(stranded),
                }
            }
            ReplicateError::Promotion { .. } => {
                error!(table = %pass.production, error = %error, "promotion failed");
                SwapOutcome::Failed {
                    error,
                    stranded: None,
                }
            }
            error => {
                error!(table = %pass.production, error = %error, "pass aborted");
                SwapOutcome::Discarded { cause: Some(error) }
            }
        }
    }

    /// Best-effort drop of the shadow table; failures are only logged.
    fn discard_shadow<D: Destination>(&self, dest: &mut D, pass: &Pass) {
        match dest.exists(&pass.shadow) {
            Ok(false) => {}
            Ok(true) => {
                if let Err(e) = dest.drop_table(&pass.shadow) {
                    warn!(table = %pass.shadow, error = %e, "could not drop shadow table");
                }
            }
            Err(e) => warn!(table = %pass.shadow, error = %e, "could not check for shadow table"),
        }
    }
}
