//! The minion's key pair and its cached copy of the master key.

use std::io;
use std::path::{Path, PathBuf};

use brine_crypto::Keypair;
use tracing::info;

const MINION_KEY: &str = "minion.key";
const MINION_PUB: &str = "minion.pub";
const MASTER_PUB_CACHE: &str = "minion_master.pub";

pub struct MinionKeys {
    keypair: Keypair,
    pki_dir: PathBuf,
}

fn decode_key(path: &Path, contents: &str) -> io::Result<[u8; 32]> {
    let bytes = hex::decode(contents.trim())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{}: {e}", path.display())))?;
    bytes.try_into().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: expected a 32 byte key", path.display()),
        )
    })
}

async fn write_file(path: &Path, contents: &str, private: bool) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents).await?;
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
    }
    #[cfg(not(unix))]
    let _ = private;
    tokio::fs::rename(&tmp, path).await
}

impl MinionKeys {
    /// Load `minion.key` from `pki_dir`, creating a fresh pair on first start.
    pub async fn load_or_generate(pki_dir: &Path) -> io::Result<Self> {
        let key_path = pki_dir.join(MINION_KEY);
        match tokio::fs::read_to_string(&key_path).await {
            Ok(contents) => {
                let secret = decode_key(&key_path, &contents)?;
                Ok(Self {
                    keypair: Keypair::from_secret_bytes(&secret),
                    pki_dir: pki_dir.to_path_buf(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(pki_dir).await?;
                let keypair = Keypair::generate();
                write_file(&key_path, &hex::encode(keypair.secret_key_bytes()), true).await?;
                write_file(
                    &pki_dir.join(MINION_PUB),
                    &hex::encode(keypair.public_key_bytes()),
                    false,
                )
                .await?;
                info!(pki_dir = %pki_dir.display(), "generated minion keys");
                Ok(Self {
                    keypair,
                    pki_dir: pki_dir.to_path_buf(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Keys that live only in memory. Used by in-process deployments.
    pub fn ephemeral(pki_dir: &Path) -> Self {
        Self {
            keypair: Keypair::generate(),
            pki_dir: pki_dir.to_path_buf(),
        }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.keypair.public_key_bytes()
    }

    pub async fn cached_master_key(&self) -> io::Result<Option<Vec<u8>>> {
        let path = self.pki_dir.join(MASTER_PUB_CACHE);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(decode_key(&path, &contents)?.to_vec())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn cache_master_key(&self, public_key: &[u8]) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.pki_dir).await?;
        write_file(
            &self.pki_dir.join(MASTER_PUB_CACHE),
            &hex::encode(public_key),
            false,
        )
        .await
    }
}
