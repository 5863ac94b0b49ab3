use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use brine_crypto::HashType;
use serde::Deserialize;
use tracing::warn;

use crate::{
    load_yaml, parse_yaml, string_or_list, ConfigError, IpcMode, MergeStrategy, StateOutput,
    StoreKind, SyndicFailover, TransportKind,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PublisherAclBlacklist {
    pub users: Vec<String>,
    pub modules: Vec<String>,
}

/// Master daemon configuration (`/etc/brine/master`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub id: String,
    pub log_level: String,

    // ── transport ──
    pub transport: TransportKind,
    pub interface: IpAddr,
    pub publish_port: u16,
    pub ret_port: u16,
    pub ipc_mode: IpcMode,
    pub tcp_master_workers: u16,
    pub sock_dir: PathBuf,
    pub metrics_addr: Option<SocketAddr>,

    // ── directories ──
    pub pki_dir: PathBuf,
    pub cachedir: PathBuf,

    // ── workers / maintenance ──
    pub worker_threads: usize,
    pub loop_interval: u64,
    pub keep_jobs_seconds: u64,
    pub job_cache: bool,
    pub cache: StoreKind,
    pub memcache_expire_seconds: u64,
    pub memcache_max_items: usize,
    pub memcache_full_cleanup: bool,
    pub presence_events: bool,
    /// Seconds a minion counts as present after its last request.
    pub presence_window: u64,
    pub timeout: u64,
    pub gather_job_timeout: u64,
    pub unique_jid: bool,

    // ── keys ──
    pub open_mode: bool,
    pub auto_accept: bool,
    pub autosign_file: Option<PathBuf>,
    pub autoreject_file: Option<PathBuf>,
    pub autosign_grains_dir: Option<PathBuf>,
    /// Minutes an autosign directory marker stays valid.
    pub autosign_timeout: u64,
    pub max_minions: usize,
    pub rotate_aes_key: bool,
    pub publish_session: u64,
    pub master_sign_pubkey: bool,
    pub master_sign_key_name: String,
    pub master_use_pubkey_signature: bool,
    pub master_pubkey_signature: String,
    pub hash_type: HashType,

    // ── publish ──
    pub publisher_acl: BTreeMap<String, Vec<String>>,
    pub publisher_acl_blacklist: PublisherAclBlacklist,
    pub nodegroups: BTreeMap<String, String>,
    pub order_masters: bool,
    #[serde(deserialize_with = "string_or_list")]
    pub syndic_master: Vec<String>,
    pub syndic_failover: SyndicFailover,
    /// Ports of the upper masters, unless given as `host:port`.
    pub syndic_master_port: u16,
    pub syndic_master_publish_port: u16,
    /// Returns kept per upper master while it is unreachable.
    pub syndic_buffer_size: usize,

    // ── fileserver / pillar ──
    pub fileserver_backend: Vec<String>,
    pub file_roots: BTreeMap<String, Vec<PathBuf>>,
    pub pillar_roots: BTreeMap<String, Vec<PathBuf>>,
    pub saltenv_whitelist: Vec<String>,
    pub saltenv_blacklist: Vec<String>,
    pub pillar_source_merging_strategy: MergeStrategy,
    pub pillar_merge_lists: bool,
    pub pillar_safe_render_error: bool,
    /// `yaml` or `yamlex`; the latter turns `smart` merging into `aggregate`.
    pub renderer: String,
    pub ext_pillar: Vec<BTreeMap<String, serde_yaml::Value>>,
    #[serde(alias = "pillar_roots_override_ext_pillar")]
    pub ext_pillar_first: bool,
    pub fileserver_update_interval: u64,

    pub state_output: StateOutput,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            id: "master".into(),
            log_level: "warning".into(),
            transport: TransportKind::Tcp,
            interface: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            publish_port: 4505,
            ret_port: 4506,
            ipc_mode: IpcMode::Ipc,
            tcp_master_workers: 4515,
            sock_dir: PathBuf::from("/var/run/brine/master"),
            metrics_addr: None,
            pki_dir: PathBuf::from("/etc/brine/pki/master"),
            cachedir: PathBuf::from("/var/cache/brine/master"),
            worker_threads: 5,
            loop_interval: 60,
            keep_jobs_seconds: 86400,
            job_cache: true,
            cache: StoreKind::Fs,
            memcache_expire_seconds: 0,
            memcache_max_items: 1024,
            memcache_full_cleanup: false,
            presence_events: false,
            presence_window: 300,
            timeout: 5,
            gather_job_timeout: 10,
            unique_jid: false,
            open_mode: false,
            auto_accept: false,
            autosign_file: None,
            autoreject_file: None,
            autosign_grains_dir: None,
            autosign_timeout: 120,
            max_minions: 0,
            rotate_aes_key: true,
            publish_session: 86400,
            master_sign_pubkey: false,
            master_sign_key_name: "master_sign".into(),
            master_use_pubkey_signature: false,
            master_pubkey_signature: "master_pubkey_signature".into(),
            hash_type: HashType::Sha256,
            publisher_acl: BTreeMap::new(),
            publisher_acl_blacklist: PublisherAclBlacklist::default(),
            nodegroups: BTreeMap::new(),
            order_masters: false,
            syndic_master: Vec::new(),
            syndic_failover: SyndicFailover::Random,
            syndic_master_port: 4506,
            syndic_master_publish_port: 4505,
            syndic_buffer_size: 1000,
            fileserver_backend: vec!["roots".into()],
            file_roots: BTreeMap::from([("base".into(), vec![PathBuf::from("/srv/brine")])]),
            pillar_roots: BTreeMap::from([("base".into(), vec![PathBuf::from("/srv/pillar")])]),
            saltenv_whitelist: Vec::new(),
            saltenv_blacklist: Vec::new(),
            pillar_source_merging_strategy: MergeStrategy::Smart,
            pillar_merge_lists: false,
            pillar_safe_render_error: true,
            renderer: "yaml".into(),
            ext_pillar: Vec::new(),
            ext_pillar_first: false,
            fileserver_update_interval: 60,
            state_output: StateOutput::Full,
        }
    }
}

impl MasterConfig {
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
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be at least 1".into()));
        }
        if self.loop_interval == 0 {
            return Err(ConfigError::Invalid("loop_interval must be at least 1".into()));
        }
        if self.memcache_expire_seconds > 0 && self.memcache_max_items == 0 {
            return Err(ConfigError::Invalid(
                "memcache_max_items must be positive when the memcache is enabled".into(),
            ));
        }
        if self.fileserver_backend.is_empty() {
            warn!("fileserver_backend is empty, no files will be served");
        }
        if !matches!(self.renderer.as_str(), "yaml" | "yamlex") {
            return Err(ConfigError::Invalid(format!(
                "unsupported renderer '{}', expected yaml or yamlex",
                self.renderer
            )));
        }
        if self.open_mode {
            warn!("open_mode is enabled, every presented key will be accepted");
        }
        if self.master_use_pubkey_signature && !self.master_sign_pubkey {
            // A pre-computed signature is only produced by the signing key.
            self.master_sign_pubkey = true;
        }
        Ok(())
    }

    /// File holding the local client root token.
    pub fn root_key_path(&self) -> PathBuf {
        self.cachedir.join(".root_key")
    }

    pub fn autosign_dir(&self) -> PathBuf {
        self.pki_dir.join("minions_autosign")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_documented_defaults() {
        let config = MasterConfig::from_yaml_str("").unwrap();
        assert_eq!(config.publish_port, 4505);
        assert_eq!(config.ret_port, 4506);
        assert_eq!(config.worker_threads, 5);
        assert_eq!(config.keep_jobs_seconds, 86400);
        assert_eq!(config.loop_interval, 60);
        assert_eq!(config.autosign_timeout, 120);
        assert_eq!(config.memcache_max_items, 1024);
        assert_eq!(config.hash_type, HashType::Sha256);
        assert_eq!(
            config.pillar_source_merging_strategy,
            MergeStrategy::Smart
        );
        assert!(config.pillar_safe_render_error);
        assert!(config.rotate_aes_key);
        assert!(!config.auto_accept);
        assert!(config.job_cache);
    }

    #[test]
    fn ext_pillar_first_accepts_legacy_name() {
        let config =
            MasterConfig::from_yaml_str("pillar_roots_override_ext_pillar: true\n").unwrap();
        assert!(config.ext_pillar_first);
    }

    #[test]
    fn syndic_master_string_or_list() {
        let one = MasterConfig::from_yaml_str("syndic_master: top1\n").unwrap();
        assert_eq!(one.syndic_master, vec!["top1"]);
        let many = MasterConfig::from_yaml_str("syndic_master: [top1, top2]\n").unwrap();
        assert_eq!(many.syndic_master, vec!["top1", "top2"]);
    }

    #[test]
    fn acl_and_ext_pillar_parse() {
        let yaml = r#"
publisher_acl:
  fred:
    - test.*
    - pkg.install
publisher_acl_blacklist:
  users:
    - root
  modules:
    - cmd.run
ext_pillar:
  - yaml_file: /srv/extra.yaml
  - per_minion: /srv/minions
nodegroups:
  web: "L@web01,web02"
"#;
        let config = MasterConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.publisher_acl["fred"], vec!["test.*", "pkg.install"]);
        assert_eq!(config.publisher_acl_blacklist.modules, vec!["cmd.run"]);
        assert_eq!(config.ext_pillar.len(), 2);
        assert!(config.ext_pillar[0].contains_key("yaml_file"));
        assert_eq!(config.nodegroups["web"], "L@web01,web02");
    }

    #[test]
    fn zero_workers_is_invalid() {
        let err = MasterConfig::from_yaml_str("worker_threads: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn renderer_is_restricted() {
        assert!(MasterConfig::from_yaml_str("renderer: yamlex\n").is_ok());
        assert!(MasterConfig::from_yaml_str("renderer: jinja|yaml\n").is_err());
    }

    #[test]
    fn unknown_enum_value_is_parse_error() {
        let err = MasterConfig::from_yaml_str("state_output: sparkly\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
