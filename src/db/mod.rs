//! High-level engine API and REPL interface.

mod config;
mod engine;
mod repl;

pub use config::{ConfigError, DirectorySpec, EngineConfig, LibraryFormat};
pub use engine::{Engine, EngineError, EngineResult};
pub use repl::{Repl, ReplConfig};
