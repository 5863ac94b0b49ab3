//! Master identity and the shared session key.
//!
//! The session key is published as an immutable [`VersionedKey`] behind an
//! `Arc`. Rotation swaps in a new value with the next version number, so a
//! publish that loaded the key before the swap keeps a complete old key and
//! one that loads it after sees the complete new one.

use std::io;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use brine_client::session_aad;
use brine_config::MasterConfig;
use brine_crypto::{
    fingerprint, generate_session_key, public_key_from_bytes, wrap_key, HashType, Keypair,
    SessionKey, SigningKeypair,
};
use brine_storage::MinionId;
use brine_transport::SessionGrant;
use tracing::{info, warn};

pub struct VersionedKey {
    pub version: u64,
    pub key: SessionKey,
    pub created: Instant,
}

pub struct SessionKeyring {
    current: RwLock<Arc<VersionedKey>>,
}

impl SessionKeyring {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(VersionedKey {
                version: 1,
                key: generate_session_key(),
                created: Instant::now(),
            })),
        }
    }

    pub fn current(&self) -> Arc<VersionedKey> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the key and return the new version.
    pub fn rotate(&self) -> u64 {
        let mut slot = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let version = slot.version + 1;
        *slot = Arc::new(VersionedKey {
            version,
            key: generate_session_key(),
            created: Instant::now(),
        });
        info!(version, "session key rotated");
        version
    }

    pub fn age(&self) -> Duration {
        self.current().created.elapsed()
    }
}

impl Default for SessionKeyring {
    fn default() -> Self {
        Self::new()
    }
}

// ───────────────────────────────────── Identity ───────────────────────────────────────

const MASTER_KEY: &str = "master.key";
const MASTER_PUB: &str = "master.pub";

fn decode_32(path: &Path, contents: &str) -> io::Result<[u8; 32]> {
    let bytes = hex::decode(contents.trim()).map_err(|e| {
        io::Error::new(io::ErrorKind::InvalidData, format!("{}: {e}", path.display()))
    })?;
    bytes.try_into().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: expected 32 bytes", path.display()),
        )
    })
}

async fn write_private(path: &Path, contents: &str) -> io::Result<()> {
    tokio::fs::write(path, contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

/// Load `<dir>/<name>.key`, or generate it and write the `.pub` beside it.
async fn load_or_create(
    dir: &Path,
    key_file: &str,
    pub_file: &str,
    generate: impl FnOnce() -> ([u8; 32], [u8; 32]),
) -> io::Result<[u8; 32]> {
    let key_path = dir.join(key_file);
    match tokio::fs::read_to_string(&key_path).await {
        Ok(contents) => decode_32(&key_path, &contents),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(dir).await?;
            let (secret, public) = generate();
            write_private(&key_path, &hex::encode(secret)).await?;
            tokio::fs::write(dir.join(pub_file), hex::encode(public)).await?;
            info!(path = %key_path.display(), "generated master key");
            Ok(secret)
        }
        Err(e) => Err(e),
    }
}

/// The master's exchange key and, when configured, the signature over it.
pub struct MasterIdentity {
    keypair: Keypair,
    signature: Option<Vec<u8>>,
    hash_type: HashType,
}

impl MasterIdentity {
    pub fn new(keypair: Keypair, signature: Option<Vec<u8>>, hash_type: HashType) -> Self {
        Self {
            keypair,
            signature,
            hash_type,
        }
    }

    /// Load or create the keys under `pki_dir`. With `master_sign_pubkey`
    /// the public key is signed; `master_use_pubkey_signature` reuses the
    /// signature file, writing it the first time.
    pub async fn load(config: &MasterConfig) -> io::Result<Self> {
        let pki = &config.pki_dir;
        let secret = load_or_create(pki, MASTER_KEY, MASTER_PUB, || {
            let kp = Keypair::generate();
            (kp.secret_key_bytes(), kp.public_key_bytes())
        })
        .await?;
        let keypair = Keypair::from_secret_bytes(&secret);

        let signature = if config.master_sign_pubkey {
            let name = &config.master_sign_key_name;
            let sign_secret = load_or_create(
                pki,
                &format!("{name}.key"),
                &format!("{name}.pub"),
                || {
                    let kp = SigningKeypair::generate();
                    (kp.secret_key_bytes(), kp.verifying_key_bytes())
                },
            )
            .await?;
            let signer = SigningKeypair::from_secret_bytes(&sign_secret);
            let public = keypair.public_key_bytes();
            if config.master_use_pubkey_signature {
                Some(
                    precomputed_signature(
                        &pki.join(&config.master_pubkey_signature),
                        &signer,
                        &public,
                    )
                    .await?,
                )
            } else {
                Some(signer.sign(&public).to_vec())
            }
        } else {
            None
        };

        Ok(Self::new(keypair, signature, config.hash_type))
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.keypair.public_key_bytes()
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.keypair.public_key_bytes(), self.hash_type)
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    /// Wrap the current session key for one minion.
    pub fn grant(
        &self,
        id: &MinionId,
        minion_public_key: &[u8],
        session: &VersionedKey,
    ) -> Result<SessionGrant, String> {
        let minion_pk = public_key_from_bytes(minion_public_key).map_err(str::to_string)?;
        let shared = self.keypair.shared_secret(&minion_pk);
        let (nonce, wrapped) = wrap_key(
            session.key.as_bytes(),
            &shared,
            &session_aad(id, session.version),
        )
        .map_err(|e| e.to_string())?;
        Ok(SessionGrant {
            master_public_key: self.keypair.public_key_bytes().to_vec(),
            master_signature: self.signature.clone(),
            session_version: session.version,
            wrapped_key: wrapped.0,
            nonce: nonce.0.to_vec(),
        })
    }
}

/// Read the stored signature, replacing it when it no longer verifies
/// against the current public key.
async fn precomputed_signature(
    path: &Path,
    signer: &SigningKeypair,
    public: &[u8; 32],
) -> io::Result<Vec<u8>> {
    if let Ok(contents) = tokio::fs::read_to_string(path).await {
        match hex::decode(contents.trim()) {
            Ok(sig)
                if brine_crypto::verify_signature(&signer.verifying_key_bytes(), public, &sig)
                    .is_ok() =>
            {
                return Ok(sig);
            }
            _ => warn!(path = %path.display(), "stored master pubkey signature is stale"),
        }
    }
    let sig = signer.sign(public).to_vec();
    tokio::fs::write(path, hex::encode(&sig)).await?;
    info!(path = %path.display(), "wrote master pubkey signature");
    Ok(sig)
}

#[cfg(test)]
mod tests {
    use super::*;
    use brine_crypto::{unwrap_key, Nonce};

    #[test]
    fn rotation_publishes_whole_keys() {
        let ring = SessionKeyring::new();
        let before = ring.current();
        assert_eq!(ring.rotate(), 2);
        let after = ring.current();
        assert_eq!(before.version, 1);
        assert_eq!(after.version, 2);
        assert_ne!(before.key.as_bytes(), after.key.as_bytes());
    }

    #[test]
    fn grant_unwraps_for_the_minion_only() {
        let identity = MasterIdentity::new(Keypair::generate(), None, HashType::Sha256);
        let minion = Keypair::generate();
        let ring = SessionKeyring::new();
        let session = ring.current();
        let id = MinionId::from("web01");
        let grant = identity
            .grant(&id, &minion.public_key_bytes(), &session)
            .unwrap();

        let master_pk = public_key_from_bytes(&grant.master_public_key).unwrap();
        let shared = minion.shared_secret(&master_pk);
        let nonce = Nonce::from_slice(&grant.nonce).unwrap();
        let raw = unwrap_key(&grant.wrapped_key, &nonce, &shared, &session_aad(&id, 1)).unwrap();
        assert_eq!(&raw[..], session.key.as_bytes());

        // bound to the id
        let other = MinionId::from("web02");
        assert!(unwrap_key(&grant.wrapped_key, &nonce, &shared, &session_aad(&other, 1)).is_err());
    }

    #[tokio::test]
    async fn signature_file_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = MasterConfig::from_yaml_str(&format!(
            "pki_dir: {}\nmaster_use_pubkey_signature: true\n",
            dir.path().display()
        ))
        .unwrap();
        let first = MasterIdentity::load(&config).await.unwrap();
        let sig_path = dir.path().join("master_pubkey_signature");
        assert!(sig_path.exists());
        assert!(dir.path().join("master_sign.pub").exists());

        let second = MasterIdentity::load(&config).await.unwrap();
        assert_eq!(first.signature(), second.signature());
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());
    }
}
