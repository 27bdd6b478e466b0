//! Query result types.

use crate::sql::{Row, Schema, Value};

/// A fully drained result: column names plus rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_schema(schema: &Schema) -> Self {
        Self::new(schema.columns().iter().map(|c| c.name.clone()).collect())
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value at (row, column name); None when either does not exist.
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(index)
    }

    /// One column of every row, for compact assertions.
    pub fn column_values(&self, column: &str) -> Vec<Value> {
        match self.columns.iter().position(|c| c == column) {
            Some(index) => self.rows.iter().map(|r| r[index].clone()).collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_access() {
        let mut rs = ResultSet::new(vec!["a".into(), "b".into()]);
        rs.push(vec![Value::Int64(1), Value::text("x")]);
        rs.push(vec![Value::Int64(2), Value::text("y")]);

        assert_eq!(rs.len(), 2);
        assert_eq!(rs.value(1, "b"), Some(&Value::text("y")));
        assert_eq!(rs.value(0, "missing"), None);
        assert_eq!(
            rs.column_values("a"),
            vec![Value::Int64(1), Value::Int64(2)]
        );
    }
}
