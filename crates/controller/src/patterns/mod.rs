//! # Error Pattern Rules
//!
//! - **Types** (`types.rs`): severities, match clauses, recovery actions, settings
//! - **Store** (`store.rs`): fail-closed loading and validation of the rule document
//! - **Matcher** (`matcher.rs`): first-match-wins evaluation with confidence scoring

pub mod matcher;
pub mod store;
pub mod types;

pub use matcher::{MatchResult, PatternMatcher};
pub use store::{LoadError, PatternSource, PatternStore};
pub use types::{
    Clause, ErrorPattern, EventField, GlobalSettings, Propagation, RecoveryAction, Severity, Step,
};
