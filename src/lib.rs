//! gitql - SQL over git repositories.
//!
//! This crate exposes the contents of git repositories as a read-only
//! relational database: refs, commits, trees, blobs and their
//! relationships become virtual tables materialized on demand from the
//! object stores. Queries are analyzed through a fixpoint rule engine that
//! pushes filters and projections into the tables, picks indexes, and
//! fuses chains of joins on git-natural keys into a single walk of the
//! object graph.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gitql::db::{Engine, EngineConfig};
//!
//! let config = EngineConfig::new().with_directory("/srv/repos");
//! let engine = Engine::new(config).unwrap();
//! let session = Arc::new(engine.session());
//! let result = engine.query(&session, "SELECT ref_name FROM refs").unwrap();
//! for row in &result.rows {
//!     println!("{}", row[0]);
//! }
//! ```

#![allow(dead_code)] // Several helpers exist for public API completeness.

pub mod catalog;
pub mod db;
pub mod executor;
pub mod index;
pub mod planner;
pub mod session;
pub mod sql;
pub mod storage;
pub mod tables;
