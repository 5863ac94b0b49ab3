//! Minion key records.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::MinionId;

/// Acceptance state of a minion key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyState {
    Pending,
    Accepted,
    Rejected,
    /// A key that was presented under an id which already holds a different key.
    /// Kept beside the primary record, never in place of it.
    Denied,
}

/// Error type for parsing KeyState from string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseKeyStateError(pub String);

impl std::fmt::Display for ParseKeyStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid key state: {}", self.0)
    }
}

impl std::error::Error for ParseKeyStateError {}

impl FromStr for KeyState {
    type Err = ParseKeyStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(KeyState::Pending),
            "accepted" => Ok(KeyState::Accepted),
            "rejected" => Ok(KeyState::Rejected),
            "denied" => Ok(KeyState::Denied),
            _ => Err(ParseKeyStateError(s.to_string())),
        }
    }
}

impl KeyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyState::Pending => "pending",
            KeyState::Accepted => "accepted",
            KeyState::Rejected => "rejected",
            KeyState::Denied => "denied",
        }
    }
}

/// Primary key record for a minion (pending, accepted or rejected).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRecord {
    pub id: MinionId,
    pub public_key: Vec<u8>, // X25519
    pub state: KeyState,
    pub updated_at: DateTime<Utc>,
}

/// Minion ids grouped per key state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyListing {
    pub accepted: Vec<MinionId>,
    pub pending: Vec<MinionId>,
    pub rejected: Vec<MinionId>,
    pub denied: Vec<MinionId>,
}

impl KeyListing {
    pub fn ids(&self, state: KeyState) -> &[MinionId] {
        match state {
            KeyState::Accepted => &self.accepted,
            KeyState::Pending => &self.pending,
            KeyState::Rejected => &self.rejected,
            KeyState::Denied => &self.denied,
        }
    }

    pub fn sort(&mut self) {
        self.accepted.sort();
        self.pending.sort();
        self.rejected.sort();
        self.denied.sort();
    }
}
