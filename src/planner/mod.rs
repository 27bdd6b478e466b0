//! Query planning: logical plan nodes, the analyzer fixpoint and the
//! squash-joins rewrite.

mod analyzer;
mod error;
mod nodes;
mod squash;

pub use analyzer::{Analyzer, MAX_PASSES};
pub use error::{PlanError, PlanResult};
pub use nodes::{IndexLookup, Plan, SortField, TableNode};
pub use squash::{
    squash_joins, EntriesFrom, SquashStage, SquashedTable, StageInput, StageKind,
};
