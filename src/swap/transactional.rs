// transactional.rs
// Promotion by truncate-and-copy inside a single transaction.

use tracing::{info, warn};

use super::{Pass, PassState, SwapStrategy};
use crate::destination::{Destination, DestinationTx};
use crate::error::ReplicateError;

/// Preserves kept data, truncates the live table and copies the shadow into
/// it, all in one transaction. The live table keeps its identity, so grants,
/// dependent views and foreign keys pointing at it are unaffected.
#[derive(Clone, Copy, Debug)]
pub struct Transactional {
    /// Run storage reclamation on the destination after a successful commit.
    pub optimize: bool,
}

impl Default for Transactional {
    fn default() -> Self {
        Transactional { optimize: true }
    }
}

impl SwapStrategy for Transactional {
    fn name(&self) -> &'static str {
        "transactional"
    }

    fn promote<D: Destination>(&self, dest: &mut D, pass: &mut Pass) -> Result<(), ReplicateError> {
        let mut tx = dest
            .begin()
            .map_err(|e| ReplicateError::promotion(&pass.production, e))?;
        match replace_within(&mut tx, pass) {
            Ok(copied) => {
                tx.commit()
                    .map_err(|e| ReplicateError::promotion(&pass.production, e))?;
                info!(table = %pass.production, rows = copied, "destination replaced");
            }
            Err(error) => {
                if let Err(e) = tx.rollback() {
                    warn!(table = %pass.production, error = %e, "rollback failed");
                }
                return Err(error);
            }
        }

        if let Err(e) = dest.drop_table(&pass.shadow) {
            warn!(table = %pass.shadow, error = %e, "could not drop shadow table after commit");
        }
        if self.optimize {
            if let Err(e) = dest.optimize(&pass.production) {
                warn!(table = %pass.production, error = %e, "optimize after replace failed");
            }
        }
        Ok(())
    }
}

fn replace_within<T: Destination>(tx: &mut T, pass: &mut Pass) -> Result<u64, ReplicateError> {
    pass.preserver
        .preserve(tx, &pass.production, &pass.shadow, true)?;
    pass.advance(PassState::DataPreserved);
    let promotion = |e: anyhow::Error| ReplicateError::promotion(&pass.production, e);
    tx.lock_exclusive(&pass.production).map_err(promotion)?;
    tx.truncate(&pass.production).map_err(promotion)?;
    let copied = tx.copy_rows(&pass.shadow, &pass.production).map_err(promotion)?;
    tx.advance_identities(&pass.production, &pass.shadow)
        .map_err(promotion)?;
    Ok(copied)
}
