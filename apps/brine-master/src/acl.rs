//! Who may publish what.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use brine_config::{MasterConfig, PublisherAclBlacklist};
use brine_targeting::expr_match;
use rand::RngCore;
use thiserror::Error;

/// Job lookups never need permission.
const ALWAYS_ALLOWED: &[&str] = &["saltutil.find_job"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AclError {
    #[error("user {0} is blacklisted")]
    BlacklistedUser(String),
    #[error("function {0} is blacklisted")]
    BlacklistedFunction(String),
    #[error("user {user} may not run {fun}")]
    NotPermitted { user: String, fun: String },
}

pub struct PublisherAcl {
    acl: BTreeMap<String, Vec<String>>,
    blacklist: PublisherAclBlacklist,
}

impl PublisherAcl {
    pub fn new(acl: BTreeMap<String, Vec<String>>, blacklist: PublisherAclBlacklist) -> Self {
        Self { acl, blacklist }
    }

    pub fn from_config(config: &MasterConfig) -> Self {
        Self::new(
            config.publisher_acl.clone(),
            config.publisher_acl_blacklist.clone(),
        )
    }

    /// `root` is set for callers holding the root token. They skip the ACL
    /// but not the blacklist.
    pub fn authorize(&self, user: &str, root: bool, fun: &str) -> Result<(), AclError> {
        if ALWAYS_ALLOWED.contains(&fun) {
            return Ok(());
        }
        if self.blacklist.users.iter().any(|u| expr_match(user, u)) {
            return Err(AclError::BlacklistedUser(user.to_string()));
        }
        if self.blacklist.modules.iter().any(|m| expr_match(fun, m)) {
            return Err(AclError::BlacklistedFunction(fun.to_string()));
        }
        if root {
            return Ok(());
        }
        let permitted = self
            .acl
            .iter()
            .filter(|(who, _)| expr_match(user, who))
            .any(|(_, funs)| funs.iter().any(|f| expr_match(fun, f)));
        if permitted {
            Ok(())
        } else {
            Err(AclError::NotPermitted {
                user: user.to_string(),
                fun: fun.to_string(),
            })
        }
    }
}

/// Read the root token, creating it (mode 0600) when absent.
pub async fn load_or_create_root_token(path: &Path) -> io::Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(token) if !token.trim().is_empty() => return Ok(token.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut raw = [0u8; 32];
    rand::rng().fill_bytes(&mut raw);
    let token = hex::encode(raw);
    tokio::fs::write(path, &token).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(token)
}
