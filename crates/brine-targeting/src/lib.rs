//! Matching of minion ids, environments and users against expressions.

use thiserror::Error;

mod expr;
mod target;

pub use expr::{check_whitelist_blacklist, expr_match, glob_match, glob_to_regex};
pub use target::{compound_match, expand_nodegroups, grain_match, matches, MatchContext};

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("invalid regular expression: {0}")]
    InvalidRegex(String),
    #[error("invalid compound expression: {0}")]
    Syntax(String),
    #[error("unknown nodegroup: {0}")]
    UnknownNodegroup(String),
    #[error("nodegroup nesting too deep at {0}")]
    NodegroupCycle(String),
}
