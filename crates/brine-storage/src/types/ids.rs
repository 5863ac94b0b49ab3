//! Strongly-typed identifiers (avoid mixing strings arbitrarily).

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MinionId(pub String);

impl MinionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids double as file names in the pki and cache directories.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0 != "."
            && self.0 != ".."
            && !self.0.contains(['/', '\\', '\0'])
    }
}

impl std::fmt::Display for MinionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MinionId {
    fn from(s: &str) -> Self {
        MinionId(s.to_string())
    }
}

/// Job identifier, `%Y%m%d%H%M%S%f` with an optional `_<pid>` suffix.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(pub String);

impl Jid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Jid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Jid {
    fn from(s: &str) -> Self {
        Jid(s.to_string())
    }
}
