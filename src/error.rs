use crate::table::Table;
use thiserror::Error;

/// Failures of a single table pass. Every variant is fatal to the pass that
/// raised it and none is fatal to the batch on its own.
#[derive(Debug, Error)]
pub enum ReplicateError {
    #[error("cannot describe table {table}: {source}")]
    Schema {
        table: Table,
        #[source]
        source: anyhow::Error,
    },

    #[error("shadow table {0} already exists, probably left over from an interrupted run")]
    ShadowExists(Table),

    #[error("invalid mapping for {table}: {reason}")]
    InvalidMapping { table: Table, reason: String },

    #[error("write into {table} failed at row {row}: {source}")]
    Write {
        table: Table,
        row: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("preserving kept data from {table} failed: {source}")]
    Merge {
        table: Table,
        #[source]
        source: anyhow::Error,
    },

    #[error("promoting shadow table onto {table} failed: {source}")]
    Promotion {
        table: Table,
        /// Set when the pre-pass data could not be moved back and is left
        /// under this temporary name.
        stranded: Option<Table>,
        #[source]
        source: anyhow::Error,
    },
}

impl ReplicateError {
    pub fn schema(table: &Table, source: impl Into<anyhow::Error>) -> Self {
        ReplicateError::Schema {
            table: table.clone(),
            source: source.into(),
        }
    }

    pub fn invalid_mapping(table: &Table, reason: impl Into<String>) -> Self {
        ReplicateError::InvalidMapping {
            table: table.clone(),
            reason: reason.into(),
        }
    }

    pub fn write(table: &Table, row: u64, source: impl Into<anyhow::Error>) -> Self {
        ReplicateError::Write {
            table: table.clone(),
            row,
            source: source.into(),
        }
    }

    pub fn merge(table: &Table, source: impl Into<anyhow::Error>) -> Self {
        ReplicateError::Merge {
            table: table.clone(),
            source: source.into(),
        }
    }

    pub fn promotion(table: &Table, source: impl Into<anyhow::Error>) -> Self {
        ReplicateError::Promotion {
            table: table.clone(),
            stranded: None,
            source: source.into(),
        }
    }

    pub fn stranded(table: &Table, temporary: &Table, source: impl Into<anyhow::Error>) -> Self {
        ReplicateError::Promotion {
            table: table.clone(),
            stranded: Some(temporary.clone()),
            source: source.into(),
        }
    }

    /// The temporary table holding pre-pass data after a failed recovery.
    pub fn stranded_table(&self) -> Option<&Table> {
        match self {
            ReplicateError::Promotion { stranded, .. } => stranded.as_ref(),
            _ => None,
        }
    }
}
