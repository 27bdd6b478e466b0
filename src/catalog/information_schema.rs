//! The `information_schema` views: TABLES and COLUMNS.
//!
//! Both are answered from the catalog registry without touching any
//! repository.

use crate::executor::{RowIter, RowsIter};
use crate::session::Context;
use crate::sql::{Column, Row, Schema, Value, ValueKind};

use super::{Table, INFORMATION_SCHEMA};

pub const TABLES_NAME: &str = "tables";
pub const COLUMNS_NAME: &str = "columns";

pub fn tables_schema() -> Schema {
    Schema::new(vec![
        Column::new("table_catalog", ValueKind::Text, false, TABLES_NAME),
        Column::new("table_schema", ValueKind::Text, false, TABLES_NAME),
        Column::new("table_name", ValueKind::Text, false, TABLES_NAME),
        Column::new("table_type", ValueKind::Text, false, TABLES_NAME),
    ])
}

pub fn columns_schema() -> Schema {
    Schema::new(vec![
        Column::new("table_catalog", ValueKind::Text, false, COLUMNS_NAME),
        Column::new("table_schema", ValueKind::Text, false, COLUMNS_NAME),
        Column::new("table_name", ValueKind::Text, false, COLUMNS_NAME),
        Column::new("column_name", ValueKind::Text, false, COLUMNS_NAME),
        Column::new("ordinal_position", ValueKind::Int64, false, COLUMNS_NAME),
        Column::new("data_type", ValueKind::Text, false, COLUMNS_NAME),
        Column::new("is_nullable", ValueKind::Text, false, COLUMNS_NAME),
    ])
}

pub fn tables_iter(ctx: &Context) -> Box<dyn RowIter> {
    let database = ctx.session().database().to_string();
    let rows: Vec<Row> = Table::GIT_TABLES
        .iter()
        .map(|t| {
            vec![
                Value::text("def"),
                Value::text(&database),
                Value::text(t.name()),
                Value::text("SYSTEM VIEW"),
            ]
        })
        .chain([Table::InfoTables, Table::InfoColumns].iter().map(|t| {
            vec![
                Value::text("def"),
                Value::text(INFORMATION_SCHEMA),
                Value::text(t.name()),
                Value::text("SYSTEM VIEW"),
            ]
        }))
        .collect();
    Box::new(RowsIter::new(rows))
}

pub fn columns_iter(ctx: &Context) -> Box<dyn RowIter> {
    let database = ctx.session().database().to_string();
    let mut rows = Vec::new();
    for table in Table::GIT_TABLES {
        for (position, column) in table.schema().columns().iter().enumerate() {
            rows.push(vec![
                Value::text("def"),
                Value::text(&database),
                Value::text(table.name()),
                Value::text(&column.name),
                Value::Int64(position as i64 + 1),
                Value::text(column.kind.sql_name()),
                Value::text(if column.nullable { "YES" } else { "NO" }),
            ]);
        }
    }
    Box::new(RowsIter::new(rows))
}
