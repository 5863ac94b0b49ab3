//! Messages exchanged on the request and publish channels.

use std::collections::BTreeMap;

use brine_storage::{Jid, Job, JobReturn, KeyListing, MinionId, Target};
use serde::{Deserialize, Serialize};

/// Hex encoding for byte fields so frames stay readable JSON.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

mod opt_hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&hex::encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

// ───────────────────────────────────── Request channel ────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    /// Key handshake, sent in the clear.
    Auth(AuthRequest),
    /// Payload sealed with the session key by an authenticated minion.
    Secure(SealedMessage),
    /// Job submission from a local client or an upper tier.
    Publish(PublishRequest),
    /// Liveness check. Needs no session.
    Ping,
    /// Key administration. Only honoured on the local client channel.
    Admin(AdminRequest),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthRequest {
    pub id: MinionId,
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    /// Grains offered for `autosign_grains_dir` matching.
    #[serde(default)]
    pub autosign_grains: BTreeMap<String, serde_json::Value>,
    /// A lower master relaying for its own minions.
    #[serde(default)]
    pub syndic: bool,
}

/// Session-key sealed envelope used in both directions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedMessage {
    pub id: MinionId,
    pub session_version: u64,
    #[serde(with = "hex_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishRequest {
    pub target: Target,
    pub fun: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    pub user: String,
    /// Root token read from the master cache dir.
    #[serde(default)]
    pub token: Option<String>,
    /// Set when relaying a job allocated elsewhere.
    #[serde(default)]
    pub jid: Option<Jid>,
    #[serde(default)]
    pub origin: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminRequest {
    pub token: String,
    pub action: KeyAction,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum KeyAction {
    List,
    /// Accept pending keys matching `pattern`; rejected keys too with `include_rejected`.
    Accept {
        pattern: String,
        #[serde(default)]
        include_rejected: bool,
    },
    Reject {
        pattern: String,
        #[serde(default)]
        include_accepted: bool,
    },
    Delete { pattern: String },
    /// Fingerprints of every key matching `pattern`.
    Finger { pattern: String },
}

/// Plaintext inside a [`SealedMessage`] sent by a minion.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MinionRequest {
    Return(JobReturn),
    /// Returns gathered by a syndic from its lower tier.
    SyndicReturn { returns: Vec<JobReturn> },
    /// Minions a syndic expects to answer a relayed job.
    SyndicMinions { jid: Jid, minions: Vec<MinionId> },
    Grains { grains: serde_json::Value },
    Pillar {
        #[serde(default)]
        saltenv: Option<String>,
    },
    FileList { saltenv: String },
    FileFetch { saltenv: String, path: String },
}

// ───────────────────────────────────── Replies ────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Response {
    Auth(AuthReply),
    Secure(SealedMessage),
    Published(PublishReply),
    Pong,
    /// Session key moved on; authenticate again.
    Reauth,
    Admin(AdminReply),
    Error { message: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AdminReply {
    Keys(KeyListing),
    /// Ids whose state changed.
    Changed { ids: Vec<MinionId> },
    Fingers { fingers: BTreeMap<String, String> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuthReply {
    Accepted(SessionGrant),
    Pending,
    Rejected,
    /// `max_minions` reached.
    Full,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionGrant {
    #[serde(with = "hex_bytes")]
    pub master_public_key: Vec<u8>,
    /// Ed25519 signature over `master_public_key`.
    #[serde(default, with = "opt_hex_bytes")]
    pub master_signature: Option<Vec<u8>>,
    pub session_version: u64,
    #[serde(with = "hex_bytes")]
    pub wrapped_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub nonce: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishReply {
    pub jid: Jid,
    pub minions: Vec<MinionId>,
}

/// Plaintext inside a [`SealedMessage`] sent back to a minion.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MinionReply {
    Ack,
    Pillar { data: serde_json::Value },
    FileList { files: Vec<String> },
    File {
        #[serde(with = "hex_bytes")]
        data: Vec<u8>,
        hash: String,
    },
    Error { message: String },
}

// ───────────────────────────────────── Publish channel ────────────────────────────────

/// One encrypted publish. Every subscriber receives every frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PubFrame {
    pub session_version: u64,
    #[serde(with = "hex_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Plaintext inside a [`PubFrame`]. Minions match `job.target` themselves.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PublishLoad {
    pub job: Job,
}
