//! Replication job configuration, read from a JSON file.

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::column_map::MappingConfig;
use crate::kept_data::KeptDataSpec;
use crate::table::Table;

#[derive(ValueEnum, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    /// Rename the shadow table into place (no transactional DDL needed)
    #[default]
    RenameDance,
    /// Truncate and copy inside one transaction
    Transactional,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub uri: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    pub source: String,
    /// Defaults to the source name.
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub mapping: MappingConfig,
    #[serde(default)]
    pub keep: Option<KeptDataSpec>,
}

impl TableConfig {
    pub fn source_table(&self) -> Table {
        Table::new(&self.source)
    }

    pub fn destination_table(&self) -> Table {
        Table::new(self.destination.as_deref().unwrap_or(&self.source))
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub source: ConnectionConfig,
    #[serde(default)]
    pub destination: ConnectionConfig,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_true")]
    pub null_as_empty_string: bool,
    #[serde(default = "default_true")]
    pub optimize: bool,
    pub tables: Vec<TableConfig>,
}

fn default_batch_size() -> usize {
    1000
}

fn default_pool_size() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("loading config file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            bail!("no tables configured");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be greater than zero");
        }
        if self.pool_size == 0 {
            bail!("pool_size must be greater than zero");
        }
        let mut seen = HashSet::new();
        for table in &self.tables {
            let destination = table.destination_table();
            if !seen.insert(destination.to_string()) {
                bail!("destination table {destination} is configured more than once");
            }
            if let Some(keep) = &table.keep {
                if keep.key.trim().is_empty() && !keep.columns.is_empty() {
                    bail!("kept columns for {destination} need a key column");
                }
            }
        }
        Ok(())
    }

    /// Command line values win over the file.
    pub fn apply_overrides(
        &mut self,
        source_uri: Option<String>,
        destination_uri: Option<String>,
        strategy: Option<StrategyKind>,
    ) {
        if source_uri.is_some() {
            self.source.uri = source_uri;
        }
        if destination_uri.is_some() {
            self.destination.uri = destination_uri;
        }
        if let Some(strategy) = strategy {
            self.strategy = strategy;
        }
    }

    pub fn source_uri(&self) -> Result<&str> {
        self.source
            .uri
            .as_deref()
            .context("no source connection URI configured")
    }

    pub fn destination_uri(&self) -> Result<&str> {
        self.destination
            .uri
            .as_deref()
            .context("no destination connection URI configured")
    }

    /// The configured tables, narrowed to `only` (destination names) when non-empty.
    pub fn select_tables(&self, only: &[String]) -> Result<Vec<&TableConfig>> {
        if only.is_empty() {
            return Ok(self.tables.iter().collect());
        }
        only.iter()
            .map(|name| {
                let wanted = Table::new(name);
                self.tables
                    .iter()
                    .find(|t| t.destination_table() == wanted)
                    .with_context(|| format!("table {name} is not in the configuration"))
            })
            .collect()
    }
}
