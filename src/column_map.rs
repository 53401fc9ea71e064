use crate::error::ReplicateError;
use crate::table::{Column, Table};
use itertools::Itertools;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;

const COMPUTED_PREFIX: &str = "SQL:";
const ARROW: &str = "->";

/// Raw per-table mapping: destination column name to directive string.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct MappingConfig(BTreeMap<String, String>);

impl MappingConfig {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(column, directive)| (column.as_str(), directive.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MappingConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        MappingConfig(
            iter.into_iter()
                .map(|(column, directive)| (column.into(), directive.into()))
                .collect(),
        )
    }
}

/// Where one destination column gets its value from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MappingDirective {
    /// Copied from a source field. When `expression` is set the field only
    /// has to be present; the expression text takes the placeholder's place.
    Direct {
        source_field: String,
        expression: Option<String>,
    },
    /// Trusted SQL spliced into the statement as is; never escaped or bound.
    Computed { expression: String },
    /// Left out of the generated insert.
    Excluded,
}

impl FromStr for MappingDirective {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if let Some(expression) = raw.strip_prefix(COMPUTED_PREFIX) {
            let expression = expression.trim();
            if expression.is_empty() {
                return Err(format!("computed directive {raw:?} has no expression"));
            }
            return Ok(MappingDirective::Computed {
                expression: expression.to_string(),
            });
        }
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "-" {
            return Ok(MappingDirective::Excluded);
        }
        if let Some((field, expression)) = trimmed.split_once(ARROW) {
            let field = field.trim();
            if field.is_empty() {
                return Err(format!("directive {raw:?} names no source field"));
            }
            let expression = expression.trim();
            return Ok(MappingDirective::Direct {
                source_field: field.to_string(),
                expression: (!expression.is_empty()).then(|| expression.to_string()),
            });
        }
        Ok(MappingDirective::Direct {
            source_field: trimmed.to_string(),
            expression: None,
        })
    }
}

/// How a planned column is fed at insert time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlanValue {
    Bind { source_field: String },
    Expression(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedColumn {
    pub column: Column,
    pub value: PlanValue,
}

/// Ordered insert plan for one table. Built once per open table and never
/// rebuilt while rows are streaming.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InsertPlan {
    pub table: Table,
    pub columns: Vec<PlannedColumn>,
}

impl InsertPlan {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.column.name.as_str()).collect()
    }

    /// Planned columns that take a `$n` parameter, in binding order.
    pub fn bound(&self) -> impl Iterator<Item = &PlannedColumn> {
        self.columns
            .iter()
            .filter(|c| matches!(c.value, PlanValue::Bind { .. }))
    }

    pub fn parameter_count(&self) -> usize {
        self.bound().count()
    }

    /// Parameterized insert text. Bound values travel as text and are cast to
    /// the destination type server side; expressions are spliced verbatim.
    pub fn statement(&self) -> String {
        let mut placeholder = 0;
        let values = self
            .columns
            .iter()
            .map(|planned| match &planned.value {
                PlanValue::Bind { .. } => {
                    placeholder += 1;
                    format!("CAST(${}::text AS {})", placeholder, planned.column.data_type)
                }
                PlanValue::Expression(expression) => expression.clone(),
            })
            .join(", ");
        format!(
            "INSERT INTO {} ({}) OVERRIDING SYSTEM VALUE VALUES ({})",
            self.table.quoted(),
            self.columns.iter().map(|c| c.column.quoted_name()).join(", "),
            values
        )
    }
}

/// Resolves a table's mapping configuration against its destination schema.
#[derive(Clone, Debug)]
pub struct ColumnMapper {
    table: Table,
    directives: Option<BTreeMap<String, MappingDirective>>,
}

impl ColumnMapper {
    /// Parses every directive up front so a malformed mapping fails before any
    /// table is touched.
    pub fn new(table: &Table, config: &MappingConfig) -> Result<Self, ReplicateError> {
        let directives = if config.is_empty() {
            None
        } else {
            let parsed = config
                .iter()
                .map(|(column, raw)| {
                    raw.parse::<MappingDirective>()
                        .map(|directive| (column.to_string(), directive))
                        .map_err(|reason| {
                            ReplicateError::invalid_mapping(table, format!("column {column}: {reason}"))
                        })
                })
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            Some(parsed)
        };
        Ok(ColumnMapper {
            table: table.clone(),
            directives,
        })
    }

    pub fn is_identity(&self) -> bool {
        self.directives.is_none()
    }

    pub fn directive(&self, column: &str) -> Option<&MappingDirective> {
        self.directives.as_ref().and_then(|d| d.get(column))
    }

    /// Builds the plan for rows carrying `source_fields`, targeting `target`
    /// (the shadow table during a pass). Column order is the schema's.
    pub fn build_plan<S: AsRef<str>>(
        &self,
        target: &Table,
        source_fields: &[S],
        schema: &[Column],
    ) -> Result<InsertPlan, ReplicateError> {
        let has_field = |field: &str| source_fields.iter().any(|f| f.as_ref() == field);
        let columns: Vec<PlannedColumn> = schema
            .iter()
            .filter_map(|column| {
                let value = match &self.directives {
                    None => has_field(&column.name).then(|| PlanValue::Bind {
                        source_field: column.name.clone(),
                    }),
                    Some(directives) => match directives.get(&column.name)? {
                        MappingDirective::Excluded => None,
                        MappingDirective::Computed { expression } => {
                            Some(PlanValue::Expression(expression.clone()))
                        }
                        MappingDirective::Direct {
                            source_field,
                            expression,
                        } => has_field(source_field).then(|| match expression {
                            Some(expression) => PlanValue::Expression(expression.clone()),
                            None => PlanValue::Bind {
                                source_field: source_field.clone(),
                            },
                        }),
                    },
                };
                value.map(|value| PlannedColumn {
                    column: column.clone(),
                    value,
                })
            })
            .collect();
        if columns.is_empty() {
            return Err(ReplicateError::invalid_mapping(
                &self.table,
                "no destination columns remain after applying the mapping to the schema",
            ));
        }
        Ok(InsertPlan {
            table: target.clone(),
            columns,
        })
    }
}
