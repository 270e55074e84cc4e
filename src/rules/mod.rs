//! Access rules.
//!
//! - **`compiler`**: parses `METHOD~path` lines into an immutable [`RuleTable`] and answers lookups
//! - **`loader`**: reads the rule file, degrading to an empty table when it is unavailable

pub mod compiler;
pub mod loader;

pub use compiler::{AccessRule, Decision, RoutingMode, RuleTable, RULE_DELIMITER};
pub use loader::{load_rule_table, read_rule_lines};
