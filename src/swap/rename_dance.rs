// rename_dance.rs
// Promotion by renaming tables, for stores without transactional DDL.

use tracing::{error, info, warn};

use super::{Pass, PassState, SwapStrategy};
use crate::destination::Destination;
use crate::error::ReplicateError;

/// Parks the live table under a random name, renames the shadow into place,
/// then drops the parked table. Nothing locks the gap between the two
/// renames, so an outside writer can observe the destination name missing.
#[derive(Clone, Copy, Debug, Default)]
pub struct RenameDance;

impl SwapStrategy for RenameDance {
    fn name(&self) -> &'static str {
        "rename-dance"
    }

    fn promote<D: Destination>(&self, dest: &mut D, pass: &mut Pass) -> Result<(), ReplicateError> {
        pass.preserver
            .preserve(dest, &pass.production, &pass.shadow, false)?;
        pass.advance(PassState::DataPreserved);

        let parked = pass.production.swap_temp();
        dest.rename(&pass.production, &parked)
            .map_err(|e| ReplicateError::promotion(&pass.production, e))?;

        if let Err(e) = dest.rename(&pass.shadow, &pass.production) {
            return match dest.rename(&parked, &pass.production) {
                Ok(()) => {
                    warn!(table = %pass.production, "shadow rename failed, original table restored");
                    Err(ReplicateError::promotion(&pass.production, e))
                }
                Err(restore) => {
                    error!(
                        fatal = true,
                        table = %pass.production,
                        parked = %parked,
                        error = %restore,
                        "could not move the original table back"
                    );
                    Err(ReplicateError::stranded(&pass.production, &parked, e))
                }
            };
        }

        // Sequences owned by the parked table would go down with it, and the
        // promoted identity sequences have not moved past the loaded ids.
        let carried = dest
            .adopt_sequences(&parked, &pass.production)
            .and_then(|()| dest.advance_identities(&pass.production, &parked));
        if let Err(e) = carried {
            warn!(
                table = %pass.production,
                parked = %parked,
                error = %e,
                "could not carry sequences over, keeping the old table"
            );
            return Ok(());
        }
        if let Err(e) = dest.drop_table(&parked) {
            warn!(table = %parked, error = %e, "could not drop the old table");
        }
        info!(table = %pass.production, "tables swapped");
        Ok(())
    }
}
