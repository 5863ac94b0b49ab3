//! Key handshake with a master.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use brine_config::MinionConfig;
use brine_crypto::{
    fingerprint, fingerprint_matches, public_key_from_bytes, unwrap_key, verify_signature,
    HashType, Nonce, SessionKey,
};
use brine_storage::MinionId;
use brine_transport::{AuthReply, AuthRequest, Connection, Request, Response, SessionGrant};
use tracing::{debug, error, info, warn};

use crate::keys::MinionKeys;
use crate::{AuthError, TrustError};

/// Session material obtained from one successful handshake.
#[derive(Clone)]
pub struct Session {
    pub key: Arc<SessionKey>,
    pub version: u64,
    pub master_public_key: Vec<u8>,
}

/// Associated data binding a wrapped session key to one minion and version.
pub fn session_aad(id: &MinionId, version: u64) -> Vec<u8> {
    format!("session:{}:{}", id, version).into_bytes()
}

pub struct Authenticator {
    id: MinionId,
    keys: MinionKeys,
    hash_type: HashType,
    master_finger: Option<String>,
    sign_key: Option<Vec<u8>>,
    autosign_grains: BTreeMap<String, serde_json::Value>,
    syndic: bool,
    timeout: Duration,
}

impl Authenticator {
    pub fn new(id: MinionId, keys: MinionKeys, hash_type: HashType, timeout: Duration) -> Self {
        Self {
            id,
            keys,
            hash_type,
            master_finger: None,
            sign_key: None,
            autosign_grains: BTreeMap::new(),
            syndic: false,
            timeout,
        }
    }

    /// Pin the master's key fingerprint.
    pub fn with_master_finger(mut self, finger: impl Into<String>) -> Self {
        self.master_finger = Some(finger.into());
        self
    }

    /// Require grants to carry a signature from this Ed25519 key.
    pub fn with_sign_key(mut self, verifying_key: Vec<u8>) -> Self {
        self.sign_key = Some(verifying_key);
        self
    }

    pub fn with_autosign_grains(mut self, grains: BTreeMap<String, serde_json::Value>) -> Self {
        self.autosign_grains = grains;
        self
    }

    /// Authenticate as a syndic so the master takes relayed returns.
    pub fn as_syndic(mut self) -> Self {
        self.syndic = true;
        self
    }

    /// Keys from `pki_dir`, the pinned fingerprint, and the master signing
    /// key when `verify_master_pubkey_sign` is on (missing key is fatal).
    pub async fn from_config(config: &MinionConfig) -> Result<Self, AuthError> {
        let keys = MinionKeys::load_or_generate(&config.pki_dir).await?;
        let mut auth = Self::new(
            MinionId::from(config.minion_id()),
            keys,
            config.hash_type,
            Duration::from_secs(config.auth_timeout),
        );
        if let Some(finger) = &config.master_finger {
            auth = auth.with_master_finger(finger.clone());
        }
        if config.verify_master_pubkey_sign {
            let path = config.master_sign_pub_path();
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|_| TrustError::MissingSigningKey(path.display().to_string()))?;
            let key = hex::decode(contents.trim())
                .map_err(|_| TrustError::MissingSigningKey(path.display().to_string()))?;
            auth = auth.with_sign_key(key);
        }
        let offered: BTreeMap<String, serde_json::Value> = config
            .autosign_grains
            .iter()
            .filter_map(|name| config.grains.get(name).map(|v| (name.clone(), v.clone())))
            .collect();
        Ok(auth.with_autosign_grains(offered))
    }

    pub fn id(&self) -> &MinionId {
        &self.id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn authenticate(&self, conn: &dyn Connection) -> Result<Session, AuthError> {
        let request = Request::Auth(AuthRequest {
            id: self.id.clone(),
            public_key: self.keys.public_key_bytes().to_vec(),
            autosign_grains: self.autosign_grains.clone(),
            syndic: self.syndic,
        });
        debug!(master = conn.master(), "sending auth request");
        match conn.request(&request, self.timeout).await? {
            Response::Auth(AuthReply::Accepted(grant)) => self.accept_grant(&grant).await,
            Response::Auth(AuthReply::Pending) => {
                info!(master = conn.master(), "key is pending acceptance");
                Err(AuthError::Pending)
            }
            Response::Auth(AuthReply::Rejected) => {
                error!(master = conn.master(), "key was rejected by the master");
                Err(AuthError::Rejected)
            }
            Response::Auth(AuthReply::Full) => {
                warn!(master = conn.master(), "master refused the key, max_minions reached");
                Err(AuthError::Full)
            }
            Response::Error { message } => Err(AuthError::Protocol(message)),
            other => Err(AuthError::Protocol(format!(
                "unexpected auth response: {other:?}"
            ))),
        }
    }

    /// Verify the master behind `grant` and unwrap the session key.
    pub async fn accept_grant(&self, grant: &SessionGrant) -> Result<Session, AuthError> {
        let presented = fingerprint(&grant.master_public_key, self.hash_type);
        let mut vouched = false;

        if let Some(pinned) = &self.master_finger {
            if !fingerprint_matches(pinned, &presented) {
                error!(expected = %pinned, actual = %presented, "master fingerprint mismatch");
                return Err(TrustError::FingerprintMismatch {
                    expected: pinned.clone(),
                    actual: presented,
                }
                .into());
            }
            vouched = true;
        }

        if let Some(sign_key) = &self.sign_key {
            let signature = grant
                .master_signature
                .as_deref()
                .ok_or(TrustError::MissingSignature)?;
            verify_signature(sign_key, &grant.master_public_key, signature).map_err(|e| {
                error!(error = %e, "master public key signature did not verify");
                TrustError::BadSignature(e)
            })?;
            vouched = true;
        }

        match self.keys.cached_master_key().await? {
            Some(cached) if cached != grant.master_public_key && !vouched => {
                error!(
                    actual = %presented,
                    "the master key has changed, the master could have been subverted"
                );
                return Err(TrustError::MasterKeyChanged.into());
            }
            Some(cached) if cached == grant.master_public_key => {}
            _ => self.keys.cache_master_key(&grant.master_public_key).await?,
        }

        let master_pk =
            public_key_from_bytes(&grant.master_public_key).map_err(|_| TrustError::MalformedMasterKey)?;
        let shared = self.keys.keypair().shared_secret(&master_pk);
        let nonce = Nonce::from_slice(&grant.nonce)
            .map_err(|e| AuthError::Protocol(e.to_string()))?;
        let raw = unwrap_key(
            &grant.wrapped_key,
            &nonce,
            &shared,
            &session_aad(&self.id, grant.session_version),
        )
        .map_err(|_| AuthError::Protocol("session key did not unwrap".into()))?;
        let key = SessionKey::from_slice(&raw).map_err(|e| AuthError::Protocol(e.to_string()))?;

        debug!(version = grant.session_version, "session established");
        Ok(Session {
            key: Arc::new(key),
            version: grant.session_version,
            master_public_key: grant.master_public_key.clone(),
        })
    }
}
