//! Columns, schemas and rows.

use std::fmt;

use super::value::{Value, ValueKind};

/// A row is an ordered sequence of values agreeing with some schema.
/// Iterators hand ownership of each row to the caller.
pub type Row = Vec<Value>;

/// A typed column belonging to a source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ValueKind,
    pub nullable: bool,
    /// Name of the table (or alias) this column originates from. Empty for
    /// computed columns.
    pub source: String,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ValueKind, nullable: bool, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable,
            source: source.into(),
        }
    }
}

/// An ordered sequence of columns. Schemas compare structurally.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema(pub Vec<Column>);

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self(columns)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.0
    }

    /// Positions of every column matching `name`, optionally restricted to a
    /// source table. Multiple hits mean the reference is ambiguous.
    pub fn positions_of(&self, table: Option<&str>, name: &str) -> Vec<usize> {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, c)| {
                c.name.eq_ignore_ascii_case(name)
                    && table.map_or(true, |t| c.source.eq_ignore_ascii_case(t))
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Concatenate two schemas (join output).
    pub fn join(&self, other: &Schema) -> Schema {
        let mut cols = self.0.clone();
        cols.extend(other.0.iter().cloned());
        Schema(cols)
    }

    /// Rename every column source, used when a table or subquery is aliased.
    pub fn with_source(&self, source: &str) -> Schema {
        Schema(
            self.0
                .iter()
                .map(|c| Column {
                    source: source.to_string(),
                    ..c.clone()
                })
                .collect(),
        )
    }

    /// Check a row is the right width for this schema. Kinds are not checked
    /// per row; the analyzer guarantees them at plan time.
    pub fn check_row(&self, row: &[Value]) -> bool {
        row.len() == self.0.len()
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} {}", c.name, c.kind.sql_name())?;
        }
        write!(f, ")")
    }
}
