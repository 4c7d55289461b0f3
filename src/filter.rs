//! Table selection for change capture.
//!
//! A [`TableFilter`] narrows the set of catalog tables that get notification
//! triggers. Schema restriction is applied first and independently; `include`
//! then intersects and `exclude` subtracts. Names in `include`/`exclude` may be
//! bare (`users`) or schema-qualified (`public.users`).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A table discovered in the database catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    fn matches(&self, pattern: &str) -> bool {
        match pattern.split_once('.') {
            Some((schema, name)) => self.schema == schema && self.name == name,
            None => self.name == pattern,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableFilter {
    #[serde(default)]
    pub include: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Option<Vec<String>>,
    #[serde(default = "default_schemas")]
    pub schemas: Vec<String>,
}

impl Default for TableFilter {
    fn default() -> Self {
        Self {
            include: None,
            exclude: None,
            schemas: default_schemas(),
        }
    }
}

impl TableFilter {
    pub fn include<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include = Some(tables.into_iter().map(Into::into).collect());
        self
    }

    pub fn exclude<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = Some(tables.into_iter().map(Into::into).collect());
        self
    }

    pub fn schemas<I, S>(mut self, schemas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.schemas = schemas.into_iter().map(Into::into).collect();
        self
    }

    /// Whether a single table passes the filter.
    pub fn accepts(&self, table: &TableRef) -> bool {
        if !self.schemas.iter().any(|s| s == &table.schema) {
            return false;
        }
        if let Some(include) = &self.include {
            if !include.iter().any(|p| table.matches(p)) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.iter().any(|p| table.matches(p)) {
                return false;
            }
        }
        true
    }

    /// Resolves the catalog listing into the tables that get triggers,
    /// preserving catalog order and dropping duplicates.
    pub fn resolve(&self, catalog: impl IntoIterator<Item = TableRef>) -> Vec<TableRef> {
        let mut seen = HashSet::new();
        catalog
            .into_iter()
            .filter(|t| self.accepts(t))
            .filter(|t| seen.insert(t.clone()))
            .collect()
    }
}

fn default_schemas() -> Vec<String> {
    vec!["public".to_string()]
}
