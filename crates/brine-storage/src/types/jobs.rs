//! Jobs, targets and minion returns.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Jid, MinionId};

/// How a target expression is interpreted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    #[default]
    Glob,
    Pcre,
    List,
    Grain,
    Nodegroup,
    Compound,
}

/// Error type for parsing TargetKind from string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTargetKindError(pub String);

impl std::fmt::Display for ParseTargetKindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid target type: {}", self.0)
    }
}

impl std::error::Error for ParseTargetKindError {}

impl FromStr for TargetKind {
    type Err = ParseTargetKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "glob" => Ok(TargetKind::Glob),
            "pcre" => Ok(TargetKind::Pcre),
            "list" => Ok(TargetKind::List),
            "grain" => Ok(TargetKind::Grain),
            "nodegroup" => Ok(TargetKind::Nodegroup),
            "compound" => Ok(TargetKind::Compound),
            _ => Err(ParseTargetKindError(s.to_string())),
        }
    }
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Glob => "glob",
            TargetKind::Pcre => "pcre",
            TargetKind::List => "list",
            TargetKind::Grain => "grain",
            TargetKind::Nodegroup => "nodegroup",
            TargetKind::Compound => "compound",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub expr: String,
    #[serde(default)]
    pub kind: TargetKind,
}

impl Target {
    pub fn glob(expr: impl Into<String>) -> Self {
        Target {
            expr: expr.into(),
            kind: TargetKind::Glob,
        }
    }
}

/// A published job. Immutable once dispatched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub jid: Jid,
    pub target: Target,
    pub fun: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    pub user: String,
    /// Id of the master that allocated the JID. Relayed jobs keep it.
    #[serde(default)]
    pub origin: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One minion's result for a job. Append-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobReturn {
    pub jid: Jid,
    pub minion_id: MinionId,
    pub fun: String,
    pub success: bool,
    pub payload: serde_json::Value,
    pub ended_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_kind_defaults_to_glob() {
        let target: Target = serde_json::from_str(r#"{"expr":"web*"}"#).unwrap();
        assert_eq!(target, Target::glob("web*"));
    }

    #[test]
    fn target_kind_parses() {
        assert_eq!("compound".parse::<TargetKind>().unwrap(), TargetKind::Compound);
        assert!("ipcidr".parse::<TargetKind>().is_err());
    }
}
