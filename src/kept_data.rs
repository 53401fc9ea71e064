use anyhow::anyhow;
use serde::Deserialize;
use tracing::{debug, info};

use crate::destination::Destination;
use crate::error::ReplicateError;
use crate::table::{Column, Table};

/// Destination-only columns that must survive a full replace, matched by `key`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct KeptDataSpec {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub columns: Vec<String>,
}

impl KeptDataSpec {
    pub fn new<S: Into<String>>(key: impl Into<String>, columns: impl IntoIterator<Item = S>) -> Self {
        KeptDataSpec {
            key: key.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.key.trim().is_empty() || self.columns.is_empty()
    }
}

/// One captured production row: the key and the kept values, all as text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeptRow {
    pub key: Option<String>,
    pub values: Vec<Option<String>>,
}

/// Carries kept columns from the production table over to the shadow table.
/// Must run after the shadow is fully loaded and before it is promoted.
#[derive(Clone, Debug, Default)]
pub struct KeptDataPreserver {
    spec: Option<KeptDataSpec>,
}

impl KeptDataPreserver {
    pub fn new(spec: Option<KeptDataSpec>) -> Self {
        KeptDataPreserver {
            spec: spec.filter(|s| !s.is_empty()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.spec.is_some()
    }

    /// Returns `Ok(false)` without touching anything when nothing is configured.
    /// `lock` takes a share lock on the production rows while reading them.
    pub fn preserve<D: Destination>(
        &self,
        dest: &mut D,
        production: &Table,
        shadow: &Table,
        lock: bool,
    ) -> Result<bool, ReplicateError> {
        let Some(spec) = &self.spec else {
            return Ok(false);
        };
        let schema = dest
            .describe(production)
            .map_err(|e| ReplicateError::merge(production, e))?;
        let find = |name: &str| -> Result<Column, ReplicateError> {
            schema
                .iter()
                .find(|c| c.name == name)
                .cloned()
                .ok_or_else(|| {
                    ReplicateError::merge(production, anyhow!("kept column {name} not found"))
                })
        };
        let key = find(&spec.key)?;
        let values = spec
            .columns
            .iter()
            .map(|name| find(name))
            .collect::<Result<Vec<_>, _>>()?;

        let rows = dest
            .fetch_kept(production, &key, &values, lock)
            .map_err(|e| ReplicateError::merge(production, e))?;
        let mut updated = 0;
        if !rows.is_empty() {
            let update = dest
                .prepare_update_kept(shadow, &key, &values)
                .map_err(|e| ReplicateError::merge(production, e))?;
            for row in &rows {
                if row.key.is_none() {
                    debug!(table = %production, "skipping kept row with a null key");
                    continue;
                }
                updated += dest
                    .update_kept(&update, row)
                    .map_err(|e| ReplicateError::merge(production, e))?;
            }
        }
        info!(
            table = %production,
            captured = rows.len(),
            updated,
            "kept data carried over to shadow table"
        );
        Ok(true)
    }
}
