use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use brine_crypto::HashType;
use serde::Deserialize;
use tracing::warn;

use crate::{load_yaml, parse_yaml, ConfigError, MasterType, TransportKind};

/// `master:` as written: a single address or a list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum MasterSetting {
    One(String),
    Many(Vec<String>),
}

impl MasterSetting {
    pub fn addresses(&self) -> Vec<String> {
        match self {
            MasterSetting::One(m) => vec![m.clone()],
            MasterSetting::Many(ms) => ms.clone(),
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, MasterSetting::Many(_))
    }
}

/// Minion daemon configuration (`/etc/brine/minion`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MinionConfig {
    pub id: Option<String>,
    pub log_level: String,

    // ── masters ──
    pub master: MasterSetting,
    pub master_type: MasterType,
    pub master_tries: i32,
    pub master_alive_interval: u64,
    pub master_failback: bool,
    pub master_failback_interval: u64,
    pub random_master: bool,

    // ── transport ──
    pub transport: TransportKind,
    pub publish_port: u16,
    #[serde(alias = "master_port")]
    pub ret_port: u16,
    pub source_address: Option<IpAddr>,
    pub source_publish_port: Option<u16>,
    pub source_ret_port: Option<u16>,

    // ── reconnect ──
    pub retry_dns: u64,
    pub retry_dns_count: Option<u32>,
    pub random_startup_delay: u64,
    pub recon_default: u64,
    pub recon_max: u64,
    pub recon_randomize: bool,

    // ── authentication ──
    pub auth_timeout: u64,
    pub acceptance_wait_time: u64,
    pub acceptance_wait_time_max: u64,
    pub rejected_retry: bool,
    pub master_finger: Option<String>,
    pub verify_master_pubkey_sign: bool,
    pub master_sign_key_name: String,
    pub autosign_grains: Vec<String>,

    // ── local state ──
    pub pki_dir: PathBuf,
    pub cachedir: PathBuf,
    pub cache_jobs: bool,
    pub hash_type: HashType,
    pub grains: BTreeMap<String, serde_json::Value>,
    pub saltenv: Option<String>,
}

impl Default for MinionConfig {
    fn default() -> Self {
        Self {
            id: None,
            log_level: "warning".into(),
            master: MasterSetting::One("salt".into()),
            master_type: MasterType::Str,
            master_tries: 1,
            master_alive_interval: 0,
            master_failback: false,
            master_failback_interval: 0,
            random_master: false,
            transport: TransportKind::Tcp,
            publish_port: 4505,
            ret_port: 4506,
            source_address: None,
            source_publish_port: None,
            source_ret_port: None,
            retry_dns: 30,
            retry_dns_count: None,
            random_startup_delay: 0,
            recon_default: 1000,
            recon_max: 10000,
            recon_randomize: true,
            auth_timeout: 5,
            acceptance_wait_time: 10,
            acceptance_wait_time_max: 0,
            rejected_retry: false,
            master_finger: None,
            verify_master_pubkey_sign: false,
            master_sign_key_name: "master_sign".into(),
            autosign_grains: Vec::new(),
            pki_dir: PathBuf::from("/etc/brine/pki/minion"),
            cachedir: PathBuf::from("/var/cache/brine/minion"),
            cache_jobs: false,
            hash_type: HashType::Sha256,
            grains: BTreeMap::new(),
            saltenv: None,
        }
    }
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

impl MinionConfig {
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config: Self = load_yaml(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Self = parse_yaml(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.id.is_none() {
            self.id = hostname();
        }
        if self.id.is_none() {
            return Err(ConfigError::Invalid(
                "id is not set and no hostname is available".into(),
            ));
        }
        if self.master.addresses().is_empty() {
            return Err(ConfigError::Invalid("master list is empty".into()));
        }
        match self.master_type {
            MasterType::Failover | MasterType::Distributed if !self.master.is_list() => {
                return Err(ConfigError::Invalid(format!(
                    "master_type {:?} requires master to be a list",
                    self.master_type
                )
                .to_lowercase()));
            }
            MasterType::Failover if self.retry_dns != 0 => {
                warn!("master_type: failover forces retry_dns to 0");
                self.retry_dns = 0;
            }
            _ => {}
        }
        if self.master_tries == 0 || self.master_tries < -1 {
            return Err(ConfigError::Invalid(
                "master_tries must be -1 (forever) or at least 1".into(),
            ));
        }
        if self.master_failback && self.master_failback_interval == 0 {
            self.master_failback_interval = self.master_alive_interval;
        }
        if self.recon_max < self.recon_default {
            return Err(ConfigError::Invalid(
                "recon_max must not be below recon_default".into(),
            ));
        }
        if self.acceptance_wait_time_max == 0 {
            self.acceptance_wait_time_max = self.acceptance_wait_time;
        }
        Ok(())
    }

    /// The resolved minion id. Set by `validate()`.
    pub fn minion_id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    /// Tries per master before moving on; `None` means forever.
    pub fn master_tries_limit(&self) -> Option<u32> {
        u32::try_from(self.master_tries).ok()
    }

    pub fn masters(&self) -> Vec<String> {
        self.master.addresses()
    }

    /// Pinned master signing public key (`<pki_dir>/<master_sign_key_name>.pub`).
    pub fn master_sign_pub_path(&self) -> PathBuf {
        self.pki_dir
            .join(format!("{}.pub", self.master_sign_key_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = MinionConfig::from_yaml_str("id: web01\n").unwrap();
        assert_eq!(config.minion_id(), "web01");
        assert_eq!(config.masters(), vec!["salt"]);
        assert_eq!(config.recon_default, 1000);
        assert_eq!(config.recon_max, 10000);
        assert!(config.recon_randomize);
        assert_eq!(config.retry_dns, 30);
        assert_eq!(config.retry_dns_count, None);
        assert_eq!(config.auth_timeout, 5);
        assert_eq!(config.acceptance_wait_time, 10);
        // zero max falls back to the base wait
        assert_eq!(config.acceptance_wait_time_max, 10);
        assert_eq!(config.master_tries_limit(), Some(1));
    }

    #[test]
    fn failover_forces_retry_dns_off() {
        let yaml = "id: web01\nmaster: [m1, m2]\nmaster_type: failover\nmaster_tries: 3\n";
        let config = MinionConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.retry_dns, 0);
        assert_eq!(config.masters(), vec!["m1", "m2"]);
        assert_eq!(config.master_tries_limit(), Some(3));
    }

    #[test]
    fn failover_requires_list() {
        let yaml = "id: web01\nmaster: m1\nmaster_type: failover\n";
        let err = MinionConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("requires master to be a list"));
    }

    #[test]
    fn failback_interval_defaults_to_alive_interval() {
        let yaml = "id: a\nmaster: [m1, m2]\nmaster_type: failover\nmaster_failback: true\nmaster_alive_interval: 30\n";
        let config = MinionConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.master_failback_interval, 30);
    }

    #[test]
    fn master_tries_forever() {
        let config = MinionConfig::from_yaml_str("id: a\nmaster_tries: -1\n").unwrap();
        assert_eq!(config.master_tries_limit(), None);
        assert!(MinionConfig::from_yaml_str("id: a\nmaster_tries: 0\n").is_err());
    }

    #[test]
    fn master_port_alias() {
        let config = MinionConfig::from_yaml_str("id: a\nmaster_port: 5506\n").unwrap();
        assert_eq!(config.ret_port, 5506);
    }
}
