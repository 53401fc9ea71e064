// src/table.rs
// Table identifiers, the names derived from them during a pass, and column descriptions.

use anyhow::Result;
use pg_escape::quote_identifier;
use postgres::GenericClient;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Longest identifier PostgreSQL keeps without truncation (NAMEDATALEN - 1).
const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Table {
    pub schema: Option<String>,
    pub name: String,
}

impl FromStr for Table {
    type Err = Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Table::new(s))
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl Table {
    pub fn new(full_name: &str) -> Self {
        if let Some((schema, name)) = full_name.split_once('.') {
            Table {
                schema: Some(schema.to_string()),
                name: name.to_string(),
            }
        } else {
            Table {
                schema: None,
                name: full_name.to_string(),
            }
        }
    }

    /// The same table name in the same schema under a different relation name.
    pub fn with_name(&self, name: &str) -> Self {
        Table {
            schema: self.schema.clone(),
            name: name.to_string(),
        }
    }

    /// Quoted, schema-qualified form for use in generated SQL.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_identifier(schema), quote_identifier(&self.name)),
            None => quote_identifier(&self.name).to_string(),
        }
    }

    /// Quoted relation name without schema, as `ALTER TABLE .. RENAME TO` expects.
    pub fn quoted_name(&self) -> String {
        quote_identifier(&self.name).to_string()
    }

    /// Deterministic staging table for a destination: `<name>_copy` in the same schema.
    pub fn shadow(&self) -> Self {
        self.with_name(&suffixed(&self.name, "_copy"))
    }

    /// Randomized name the live table is parked under while the shadow takes its place.
    pub fn swap_temp(&self) -> Self {
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.with_name(&suffixed(&self.name, &format!("_swap_{}", &token[..12])))
    }

    /// Ordered, insertable columns of this table; empty when the table does not exist.
    pub fn get_columns<C: GenericClient>(&self, client: &mut C) -> Result<Vec<Column>> {
        let rows = client.query(
            "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
             FROM pg_attribute a
             WHERE a.attrelid = to_regclass($1::text)
               AND a.attnum > 0
               AND NOT a.attisdropped
               AND a.attgenerated = ''
             ORDER BY a.attnum",
            &[&self.quoted()],
        )?;
        Ok(rows
            .iter()
            .map(|row| Column::new(row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect())
    }

    pub fn exists<C: GenericClient>(&self, client: &mut C) -> Result<bool> {
        let row = client.query_one(
            "SELECT to_regclass($1::text) IS NOT NULL",
            &[&self.quoted()],
        )?;
        Ok(row.get(0))
    }

    pub fn drop_if_exists<C: GenericClient>(&self, client: &mut C) -> Result<()> {
        client.batch_execute(&format!("DROP TABLE IF EXISTS {}", self.quoted()))?;
        Ok(())
    }
}

fn suffixed(name: &str, suffix: &str) -> String {
    let mut keep = MAX_IDENTIFIER_LEN.saturating_sub(suffix.len()).min(name.len());
    while !name.is_char_boundary(keep) {
        keep -= 1;
    }
    format!("{}{}", &name[..keep], suffix)
}

/// One destination column: its name and its type as rendered by `format_type`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: String,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Column {
            name: name.into(),
            data_type: data_type.into(),
        }
    }

    pub fn quoted_name(&self) -> String {
        quote_identifier(&self.name).to_string()
    }
}
