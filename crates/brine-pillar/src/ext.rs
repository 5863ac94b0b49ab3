//! External pillar providers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use brine_storage::MinionId;
use tracing::error;

use crate::PillarError;

/// A source of pillar data outside `pillar_roots`.
///
/// `pillar` is the data compiled so far (empty when `ext_pillar_first` is
/// set). Implementations return a mapping.
#[async_trait]
pub trait ExtPillarProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(
        &self,
        minion_id: &str,
        pillar: &serde_json::Value,
    ) -> Result<serde_json::Value, PillarError>;
}

async fn read_mapping(path: &std::path::Path) -> Result<serde_json::Value, PillarError> {
    let contents = tokio::fs::read_to_string(path).await?;
    let parsed: serde_json::Value = if contents.trim().is_empty() {
        serde_json::Value::Object(Default::default())
    } else {
        serde_yaml::from_str(&contents)?
    };
    if !parsed.is_object() {
        return Err(PillarError::Provider(format!(
            "{} does not contain a mapping",
            path.display()
        )));
    }
    Ok(parsed)
}

/// The same YAML file for every minion.
pub struct YamlFileProvider {
    path: PathBuf,
}

impl YamlFileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ExtPillarProvider for YamlFileProvider {
    fn name(&self) -> &str {
        "yaml_file"
    }

    async fn fetch(
        &self,
        _minion_id: &str,
        _pillar: &serde_json::Value,
    ) -> Result<serde_json::Value, PillarError> {
        read_mapping(&self.path).await
    }
}

/// `<dir>/<minion id>.yaml`; a missing file is an empty mapping.
pub struct PerMinionProvider {
    dir: PathBuf,
}

impl PerMinionProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ExtPillarProvider for PerMinionProvider {
    fn name(&self) -> &str {
        "per_minion"
    }

    async fn fetch(
        &self,
        minion_id: &str,
        _pillar: &serde_json::Value,
    ) -> Result<serde_json::Value, PillarError> {
        if !MinionId::from(minion_id).is_valid() {
            return Err(PillarError::InvalidPath(minion_id.to_string()));
        }
        let path = self.dir.join(format!("{minion_id}.yaml"));
        match read_mapping(&path).await {
            Err(PillarError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(serde_json::Value::Object(Default::default()))
            }
            other => other,
        }
    }
}

/// Instantiate the `ext_pillar` list. Unknown or malformed entries are
/// logged and skipped so the rest of the pillar still compiles.
pub fn build_ext_pillars(
    entries: &[BTreeMap<String, serde_yaml::Value>],
) -> Vec<Arc<dyn ExtPillarProvider>> {
    let mut providers: Vec<Arc<dyn ExtPillarProvider>> = Vec::new();
    for entry in entries {
        for (name, arg) in entry {
            let Some(path) = arg.as_str() else {
                error!(ext_pillar = %name, "ext_pillar argument must be a path");
                continue;
            };
            match name.as_str() {
                "yaml_file" => providers.push(Arc::new(YamlFileProvider::new(path))),
                "per_minion" => providers.push(Arc::new(PerMinionProvider::new(path))),
                other => error!(ext_pillar = %other, "ext_pillar not available, skipping"),
            }
        }
    }
    providers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn per_minion_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("web01.yaml"), "role: web\n")
            .await
            .unwrap();
        let provider = PerMinionProvider::new(dir.path());
        let empty = serde_json::json!({});

        let got = provider.fetch("web01", &empty).await.unwrap();
        assert_eq!(got, serde_json::json!({"role": "web"}));
        assert_eq!(provider.fetch("db01", &empty).await.unwrap(), empty);
        assert!(provider.fetch("../etc", &empty).await.is_err());
    }

    #[tokio::test]
    async fn yaml_file_must_be_a_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extra.yaml");
        tokio::fs::write(&path, "- a\n- b\n").await.unwrap();
        let err = YamlFileProvider::new(&path)
            .fetch("web01", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not contain a mapping"));
    }

    #[test]
    fn unknown_providers_are_skipped() {
        let entries: Vec<BTreeMap<String, serde_yaml::Value>> = serde_yaml::from_str(
            "- yaml_file: /srv/extra.yaml\n- cmd_json: echo {}\n- per_minion: /srv/minions\n",
        )
        .unwrap();
        let names: Vec<String> = build_ext_pillars(&entries)
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["yaml_file", "per_minion"]);
    }
}
