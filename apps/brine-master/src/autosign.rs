//! Automatic key acceptance and rejection.
//!
//! Sources are consulted in order: the `auto_accept` flag, `autosign_file`,
//! marker files under `<pki_dir>/minions_autosign`, then `autosign_grains_dir`.
//! `autoreject_file` is checked separately by the key manager and wins over
//! all of them.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use brine_config::MasterConfig;
use brine_storage::MinionId;
use brine_targeting::expr_match;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct CachedList {
    modified: SystemTime,
    lines: Vec<String>,
}

pub struct Autosigner {
    auto_accept: bool,
    autosign_file: Option<PathBuf>,
    autoreject_file: Option<PathBuf>,
    grains_dir: Option<PathBuf>,
    marker_dir: PathBuf,
    marker_timeout: Duration,
    lists: Mutex<HashMap<PathBuf, CachedList>>,
}

fn parse_lines(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(unix)]
fn world_writable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o002 != 0
}

#[cfg(not(unix))]
fn world_writable(_meta: &std::fs::Metadata) -> bool {
    false
}

impl Autosigner {
    pub fn from_config(config: &MasterConfig) -> Self {
        Self {
            auto_accept: config.auto_accept,
            autosign_file: config.autosign_file.clone(),
            autoreject_file: config.autoreject_file.clone(),
            grains_dir: config.autosign_grains_dir.clone(),
            marker_dir: config.autosign_dir(),
            marker_timeout: Duration::from_secs(config.autosign_timeout * 60),
            lists: Mutex::new(HashMap::new()),
        }
    }

    /// Lines of a match file, re-read only when its mtime moves. A missing
    /// or world-writable file yields nothing.
    async fn read_list(&self, path: &Path) -> Vec<String> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "match file unreadable");
                return Vec::new();
            }
        };
        if world_writable(&meta) {
            warn!(path = %path.display(), "match file is world writable, ignoring it");
            return Vec::new();
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        let mut lists = self.lists.lock().await;
        if let Some(cached) = lists.get(path) {
            if cached.modified == modified {
                return cached.lines.clone();
            }
        }
        let lines = match tokio::fs::read_to_string(path).await {
            Ok(contents) => parse_lines(&contents),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read match file");
                return Vec::new();
            }
        };
        lists.insert(
            path.to_path_buf(),
            CachedList {
                modified,
                lines: lines.clone(),
            },
        );
        lines
    }

    async fn listed(&self, path: Option<&Path>, id: &MinionId) -> bool {
        match path {
            Some(path) => self
                .read_list(path)
                .await
                .iter()
                .any(|expr| expr_match(id.as_str(), expr)),
            None => false,
        }
    }

    pub async fn autorejected(&self, id: &MinionId) -> bool {
        self.listed(self.autoreject_file.as_deref(), id).await
    }

    pub async fn autosigned(
        &self,
        id: &MinionId,
        grains: &BTreeMap<String, serde_json::Value>,
    ) -> bool {
        if self.auto_accept {
            return true;
        }
        if self.listed(self.autosign_file.as_deref(), id).await {
            return true;
        }
        if self.consume_marker(id).await {
            return true;
        }
        self.grains_match(grains).await
    }

    /// Remove markers older than `autosign_timeout`. Returns how many went.
    pub async fn expire_markers(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.marker_dir).await {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let now = SystemTime::now();
        let mut expired = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if meta.is_file() && age > self.marker_timeout {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => expired += 1,
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to expire autosign marker"),
                }
            }
        }
        if expired > 0 {
            info!(expired, "expired autosign markers");
        }
        expired
    }

    /// A live `<marker_dir>/<id>` accepts the key once.
    async fn consume_marker(&self, id: &MinionId) -> bool {
        if !id.is_valid() {
            return false;
        }
        self.expire_markers().await;
        let path = self.marker_dir.join(id.as_str());
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(minion_id = %id, "key accepted through autosign marker");
                true
            }
            Err(_) => false,
        }
    }

    async fn grains_match(&self, grains: &BTreeMap<String, serde_json::Value>) -> bool {
        let Some(dir) = &self.grains_dir else {
            return false;
        };
        for (name, value) in grains {
            if name.contains(['/', '\\']) || name.starts_with('.') {
                continue;
            }
            let wanted = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if self
                .read_list(&dir.join(name))
                .await
                .iter()
                .any(|line| *line == wanted)
            {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer(dir: &Path, extra: &str) -> Autosigner {
        let yaml = format!("pki_dir: {}\n{}", dir.display(), extra);
        Autosigner::from_config(&MasterConfig::from_yaml_str(&yaml).unwrap())
    }

    #[tokio::test]
    async fn autosign_file_matching() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("autosign.conf");
        std::fs::write(&file, "# trusted\nweb*\ndb[0-9]+\nexact.example\n").unwrap();
        let s = signer(dir.path(), &format!("autosign_file: {}\n", file.display()));
        let none = BTreeMap::new();

        assert!(s.autosigned(&MinionId::from("web01"), &none).await);
        assert!(s.autosigned(&MinionId::from("db42"), &none).await);
        assert!(s.autosigned(&MinionId::from("exact.example"), &none).await);
        assert!(!s.autosigned(&MinionId::from("king_bob"), &none).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn world_writable_file_is_ignored() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("autosign.conf");
        std::fs::write(&file, "*\n").unwrap();
        std::fs::set_permissions(&file, std::fs::Permissions::from_mode(0o666)).unwrap();
        let s = signer(dir.path(), &format!("autosign_file: {}\n", file.display()));
        assert!(!s.autosigned(&MinionId::from("web01"), &BTreeMap::new()).await);
    }

    #[tokio::test]
    async fn marker_is_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let s = signer(dir.path(), "");
        std::fs::create_dir_all(dir.path().join("minions_autosign")).unwrap();
        std::fs::write(dir.path().join("minions_autosign/web01"), "").unwrap();

        let none = BTreeMap::new();
        assert!(s.autosigned(&MinionId::from("web01"), &none).await);
        assert!(!s.autosigned(&MinionId::from("web01"), &none).await);
    }

    #[tokio::test]
    async fn stale_markers_expire() {
        let dir = tempfile::tempdir().unwrap();
        let s = signer(dir.path(), "autosign_timeout: 0\n");
        std::fs::create_dir_all(dir.path().join("minions_autosign")).unwrap();
        std::fs::write(dir.path().join("minions_autosign/web01"), "").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(s.expire_markers().await, 1);
        assert!(!s.autosigned(&MinionId::from("web01"), &BTreeMap::new()).await);
    }

    #[tokio::test]
    async fn grains_dir_values() {
        let dir = tempfile::tempdir().unwrap();
        let grains_dir = dir.path().join("autosign_grains");
        std::fs::create_dir_all(&grains_dir).unwrap();
        std::fs::write(grains_dir.join("uuid"), "8f7d68e2-30c5-40c6-b84a-df7e978a03ee\n").unwrap();
        let s = signer(
            dir.path(),
            &format!("autosign_grains_dir: {}\n", grains_dir.display()),
        );

        let good = BTreeMap::from([(
            "uuid".to_string(),
            serde_json::json!("8f7d68e2-30c5-40c6-b84a-df7e978a03ee"),
        )]);
        let bad = BTreeMap::from([("uuid".to_string(), serde_json::json!("nope"))]);
        assert!(s.autosigned(&MinionId::from("x"), &good).await);
        assert!(!s.autosigned(&MinionId::from("x"), &bad).await);
    }

    #[tokio::test]
    async fn autoreject_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("autoreject.conf");
        std::fs::write(&file, "evil*\n").unwrap();
        let s = signer(dir.path(), &format!("autoreject_file: {}\n", file.display()));
        assert!(s.autorejected(&MinionId::from("evil01")).await);
        assert!(!s.autorejected(&MinionId::from("web01")).await);
    }
}
