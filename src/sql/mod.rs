//! SQL model: values, schemas, expressions and the text frontend.
//!
//! Uses the `sqlparser` crate for parsing, lowered to the engine's plan and
//! expression representation.

mod error;
mod expr;
mod functions;
mod parser;
mod schema;
mod value;

pub use error::{ParseError, ParseResult};
pub use expr::{like_to_regex, projection_schema, BinaryOp, Expr, UnaryOp};
pub use functions::{AggFunc, ScalarFunc};
pub use parser::{Parser, Statement};
pub use schema::{Column, Row, Schema};
pub use value::{Value, ValueKind};
