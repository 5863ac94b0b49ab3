//! Per-minion pillar compilation.
//!
//! Each environment in `pillar_roots` may carry a `top.sls` mapping
//! environments to targets to SLS names. Matching SLS files are rendered
//! (plain YAML), their `include` lists resolved, and the results merged with
//! the configured strategy. External providers run before or after the
//! roots depending on `ext_pillar_first`. Failures never abort a compile;
//! they are collected under `_errors`.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use brine_config::{MasterConfig, MergeStrategy};
use brine_storage::{Target, TargetKind};
use brine_targeting::{glob_match, matches, MatchContext};
use futures::future::BoxFuture;
use serde_yaml::{Mapping, Value};
use tracing::{debug, error};

use crate::ext::{build_ext_pillars, ExtPillarProvider};
use crate::fileserver::walk_files;
use crate::merge::{merge, untag};

pub const ERRORS_KEY: &str = "_errors";
const TOP_FILE: &str = "top.sls";
const BASE_ENV: &str = "base";

#[derive(Clone, Debug)]
pub struct PillarOptions {
    pub roots: BTreeMap<String, Vec<PathBuf>>,
    pub strategy: MergeStrategy,
    pub renderer: String,
    pub merge_lists: bool,
    pub safe_render_error: bool,
    pub ext_pillar_first: bool,
    pub nodegroups: BTreeMap<String, String>,
}

impl PillarOptions {
    pub fn from_config(config: &MasterConfig) -> Self {
        Self {
            roots: config.pillar_roots.clone(),
            strategy: config.pillar_source_merging_strategy,
            renderer: config.renderer.clone(),
            merge_lists: config.pillar_merge_lists,
            safe_render_error: config.pillar_safe_render_error,
            ext_pillar_first: config.ext_pillar_first,
            nodegroups: config.nodegroups.clone(),
        }
    }
}

/// State threaded through one compile.
struct Compile<'a> {
    minion_id: &'a str,
    grains: &'a serde_json::Value,
    rendered: HashSet<(String, String)>,
    errors: Vec<String>,
}

pub struct PillarCompiler {
    opts: PillarOptions,
    ext: Vec<Arc<dyn ExtPillarProvider>>,
}

impl PillarCompiler {
    pub fn new(opts: PillarOptions, ext: Vec<Arc<dyn ExtPillarProvider>>) -> Self {
        Self { opts, ext }
    }

    pub fn from_config(config: &MasterConfig) -> Self {
        Self::new(
            PillarOptions::from_config(config),
            build_ext_pillars(&config.ext_pillar),
        )
    }

    fn merge(&self, a: Value, b: Value) -> Value {
        merge(a, b, self.opts.strategy, &self.opts.renderer, self.opts.merge_lists)
    }

    /// Compile the pillar for one minion. `saltenv` restricts the top files
    /// and SLS lookups to a single environment.
    pub async fn compile(
        &self,
        minion_id: &str,
        grains: &serde_json::Value,
        saltenv: Option<&str>,
    ) -> serde_json::Value {
        let mut state = Compile {
            minion_id,
            grains,
            rendered: HashSet::new(),
            errors: Vec::new(),
        };

        let merged = if self.opts.ext_pillar_first {
            let ext = self.run_ext(Value::Mapping(Mapping::new()), &mut state).await;
            let rendered = self.render_roots(saltenv, &mut state).await;
            self.merge(ext, rendered)
        } else {
            let rendered = self.render_roots(saltenv, &mut state).await;
            self.run_ext(rendered, &mut state).await
        };

        let mut out = match serde_json::to_value(untag(merged)) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(_) => serde_json::Map::new(),
            Err(e) => {
                state.errors.push(format!("Pillar data could not be serialized: {e}"));
                serde_json::Map::new()
            }
        };
        if !state.errors.is_empty() {
            out.insert(ERRORS_KEY.to_string(), serde_json::json!(state.errors));
        }
        serde_json::Value::Object(out)
    }

    async fn run_ext(&self, mut pillar: Value, state: &mut Compile<'_>) -> Value {
        for provider in &self.ext {
            let current = match serde_json::to_value(untag(pillar.clone())) {
                Ok(v) => v,
                Err(_) => serde_json::Value::Object(Default::default()),
            };
            let fetched = provider
                .fetch(state.minion_id, &current)
                .await
                .and_then(|data| Ok(serde_yaml::to_value(data)?));
            match fetched {
                Ok(data) => pillar = self.merge(pillar, data),
                Err(e) => {
                    error!(ext_pillar = provider.name(), error = %e, "ext_pillar failed");
                    state
                        .errors
                        .push(format!("Failed to load ext_pillar {}: {}", provider.name(), e));
                }
            }
        }
        pillar
    }

    // ───────────────────────────── top ─────────────────────────────

    fn environments(&self, saltenv: Option<&str>, state: &mut Compile<'_>) -> Vec<String> {
        if let Some(env) = saltenv {
            if !self.opts.roots.contains_key(env) {
                state.errors.push(format!(
                    "No matching pillar environment for environment '{env}' found"
                ));
                return Vec::new();
            }
            return vec![env.to_string()];
        }
        let mut envs: Vec<String> = self.opts.roots.keys().cloned().collect();
        // base first, the rest alphabetically
        envs.sort_by_key(|e| (e != BASE_ENV, e.clone()));
        envs
    }

    /// env -> SLS names matched for this minion, in top file order.
    async fn top_matches(
        &self,
        envs: &[String],
        state: &mut Compile<'_>,
    ) -> Vec<(String, Vec<String>)> {
        let mut found: Vec<(String, Vec<String>)> = Vec::new();
        for env in envs {
            let Some(top) = self.load_top(env, state).await else {
                continue;
            };
            for (top_env, targets) in top {
                let Some(top_env) = top_env.as_str() else {
                    continue;
                };
                if !envs.iter().any(|e| e == top_env) {
                    continue;
                }
                let Value::Mapping(targets) = targets else {
                    state.errors.push(format!(
                        "Top file for environment '{env}' has a malformed '{top_env}' section"
                    ));
                    continue;
                };
                for (expr, items) in targets {
                    let Some(expr) = expr.as_str() else { continue };
                    let (sls_names, target) = parse_top_entry(expr, &items);
                    let ctx = MatchContext {
                        id: state.minion_id,
                        grains: state.grains,
                        nodegroups: &self.opts.nodegroups,
                    };
                    match matches(&target, &ctx) {
                        Ok(true) => {
                            let slot = match found.iter().position(|(e, _)| e == top_env) {
                                Some(idx) => idx,
                                None => {
                                    found.push((top_env.to_string(), Vec::new()));
                                    found.len() - 1
                                }
                            };
                            for sls in sls_names {
                                if !found[slot].1.contains(&sls) {
                                    found[slot].1.push(sls);
                                }
                            }
                        }
                        Ok(false) => {}
                        Err(e) => state
                            .errors
                            .push(format!("Invalid target '{expr}' in top file: {e}")),
                    }
                }
            }
        }
        found
    }

    async fn load_top(&self, env: &str, state: &mut Compile<'_>) -> Option<Mapping> {
        for root in self.opts.roots.get(env).into_iter().flatten() {
            let contents = match tokio::fs::read_to_string(root.join(TOP_FILE)).await {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    state.errors.push(format!(
                        "Reading top file for environment '{env}' failed: {e}"
                    ));
                    return None;
                }
            };
            return match serde_yaml::from_str::<Value>(&contents) {
                Ok(Value::Mapping(top)) => Some(top),
                Ok(Value::Null) => None,
                Ok(_) => {
                    state.errors.push(format!(
                        "Top file for environment '{env}' does not render to a dictionary"
                    ));
                    None
                }
                Err(e) => {
                    error!(env, error = %e, "top file render failed");
                    state.errors.push(self.render_error(TOP_FILE, &e.to_string()));
                    None
                }
            };
        }
        None
    }

    // ───────────────────────────── render ─────────────────────────────

    async fn render_roots(&self, saltenv: Option<&str>, state: &mut Compile<'_>) -> Value {
        let envs = self.environments(saltenv, state);
        let mut pillar = Value::Mapping(Mapping::new());
        for (env, names) in self.top_matches(&envs, state).await {
            for name in names {
                for sls in self.expand_sls(&env, &name, state).await {
                    if let Some(data) = self.render_sls(env.clone(), sls, state).await {
                        pillar = self.merge(pillar, data);
                    }
                }
            }
        }
        pillar
    }

    /// Glob SLS names expand against what exists in `env`.
    async fn expand_sls(&self, env: &str, name: &str, state: &mut Compile<'_>) -> Vec<String> {
        if !name.contains(['*', '?', '[']) {
            return vec![name.to_string()];
        }
        let mut available = Vec::new();
        for root in self.opts.roots.get(env).into_iter().flatten() {
            match walk_files(root).await {
                Ok(files) => available.extend(files),
                Err(e) => state.errors.push(format!(
                    "Listing pillar environment '{env}' failed: {e}"
                )),
            }
        }
        let mut names: Vec<String> = available
            .iter()
            .filter_map(|f| sls_name(f))
            .filter(|n| n != "top" && glob_match(n, name))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn render_error(&self, sls: &str, detail: &str) -> String {
        if self.opts.safe_render_error {
            format!("Rendering SLS '{sls}' failed. Please see master log for details.")
        } else {
            format!("Rendering SLS '{sls}' failed, render error:\n{detail}")
        }
    }

    /// Render one SLS and everything it includes. Included data is merged
    /// first so the including file has the last word. Each (env, sls) is
    /// rendered at most once per compile.
    fn render_sls<'a, 'c>(
        &'a self,
        env: String,
        sls: String,
        state: &'a mut Compile<'c>,
    ) -> BoxFuture<'a, Option<Value>>
    where
        'c: 'a,
    {
        Box::pin(async move {
            if !state.rendered.insert((env.clone(), sls.clone())) {
                debug!(%env, %sls, "already rendered");
                return None;
            }
            let Some((path, is_init)) = self.locate(&env, &sls).await else {
                state.errors.push(format!(
                    "Specified SLS '{sls}' in environment '{env}' is not available on the master"
                ));
                return None;
            };

            let parsed = match tokio::fs::read_to_string(&path).await {
                Ok(contents) => serde_yaml::from_str::<Value>(&contents).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            let mut data = match parsed {
                Ok(Value::Null) => Mapping::new(),
                Ok(Value::Mapping(m)) => m,
                Ok(_) => {
                    state
                        .errors
                        .push(format!("SLS '{sls}' does not render to a dictionary"));
                    return None;
                }
                Err(detail) => {
                    error!(%sls, path = %path.display(), error = %detail, "sls render failed");
                    state.errors.push(self.render_error(&sls, &detail));
                    return None;
                }
            };

            let Some(includes) = data.remove("include") else {
                return Some(Value::Mapping(data));
            };
            let Value::Sequence(includes) = includes else {
                state.errors.push(format!(
                    "Include Declaration in SLS '{sls}' is not formed as a list"
                ));
                return None;
            };

            let mut acc = Value::Mapping(Mapping::new());
            for entry in includes {
                let Some((name, key)) = include_entry(&entry) else {
                    state
                        .errors
                        .push(format!("Malformed include entry in SLS '{sls}'"));
                    continue;
                };
                let target = resolve_relative(&sls, &name, is_init);
                if let Some(included) = self.render_sls(env.clone(), target, state).await {
                    let included = match key {
                        Some(key) => nest_under(&key, included),
                        None => included,
                    };
                    acc = self.merge(acc, included);
                }
            }
            Some(self.merge(acc, Value::Mapping(data)))
        })
    }

    /// `a.b` is `a/b.sls` or `a/b/init.sls` in the first root that has it.
    async fn locate(&self, env: &str, sls: &str) -> Option<(PathBuf, bool)> {
        let rel: PathBuf = sls.split('.').collect();
        if sls.is_empty() || sls.split('.').any(|p| p.is_empty() || p == "..") {
            return None;
        }
        for root in self.opts.roots.get(env).into_iter().flatten() {
            let file = root.join(&rel).with_extension("sls");
            if tokio::fs::metadata(&file).await.is_ok_and(|m| m.is_file()) {
                return Some((file, false));
            }
            let init = root.join(&rel).join("init.sls");
            if tokio::fs::metadata(&init).await.is_ok_and(|m| m.is_file()) {
                return Some((init, true));
            }
        }
        None
    }
}

/// A top file target's items: SLS names plus an optional `- match: kind`.
fn parse_top_entry(expr: &str, items: &Value) -> (Vec<String>, Target) {
    let mut names = Vec::new();
    let mut kind = TargetKind::Glob;
    let list = match items {
        Value::Sequence(list) => list.clone(),
        Value::String(s) => vec![Value::String(s.clone())],
        _ => Vec::new(),
    };
    for item in list {
        match item {
            Value::String(name) => names.push(name),
            Value::Mapping(map) => {
                if let Some(parsed) = map
                    .get("match")
                    .and_then(Value::as_str)
                    .and_then(|m| TargetKind::from_str(m).ok())
                {
                    kind = parsed;
                }
            }
            _ => {}
        }
    }
    (
        names,
        Target {
            expr: expr.to_string(),
            kind,
        },
    )
}

/// `- name` or `- name: {key: "x:y"}`.
fn include_entry(entry: &Value) -> Option<(String, Option<String>)> {
    match entry {
        Value::String(name) => Some((name.clone(), None)),
        Value::Mapping(map) if map.len() == 1 => {
            let (name, opts) = map.iter().next()?;
            let key = opts.get("key").and_then(Value::as_str).map(str::to_string);
            Some((name.as_str()?.to_string(), key))
        }
        _ => None,
    }
}

/// `.sibling` resolves against the including SLS; each extra dot climbs
/// one level.
fn resolve_relative(current: &str, include: &str, current_is_init: bool) -> String {
    let Some(rest) = include.strip_prefix('.') else {
        return include.to_string();
    };
    let mut parts: Vec<&str> = current.split('.').collect();
    if !current_is_init {
        parts.pop();
    }
    let mut rest = rest;
    while let Some(next) = rest.strip_prefix('.') {
        parts.pop();
        rest = next;
    }
    parts.push(rest);
    parts.retain(|p| !p.is_empty());
    parts.join(".")
}

fn nest_under(key: &str, data: Value) -> Value {
    key.rsplit(':').fold(data, |inner, part| {
        let mut map = Mapping::new();
        map.insert(Value::String(part.to_string()), inner);
        Value::Mapping(map)
    })
}

/// `web/nginx.sls` -> `web.nginx`, `web/init.sls` -> `web`.
fn sls_name(file: &str) -> Option<String> {
    let stem = file.strip_suffix(".sls")?;
    let stem = stem.strip_suffix("/init").unwrap_or(stem);
    Some(stem.replace('/', "."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_includes() {
        assert_eq!(resolve_relative("web.nginx", ".php", false), "web.php");
        assert_eq!(resolve_relative("web", ".php", true), "web.php");
        assert_eq!(resolve_relative("a.b.c", "..d", false), "a.d");
        assert_eq!(resolve_relative("a.b", "users", false), "users");
    }

    #[test]
    fn include_key_nests() {
        let data: Value = serde_yaml::from_str("port: 80\n").unwrap();
        let nested = nest_under("apps:web", data);
        let want: Value = serde_yaml::from_str("apps: {web: {port: 80}}\n").unwrap();
        assert_eq!(nested, want);
    }

    #[test]
    fn sls_names_from_paths() {
        assert_eq!(sls_name("web/nginx.sls").as_deref(), Some("web.nginx"));
        assert_eq!(sls_name("web/init.sls").as_deref(), Some("web"));
        assert_eq!(sls_name("README"), None);
    }

    #[test]
    fn top_entry_match_kind() {
        let items: Value = serde_yaml::from_str("[{match: grain}, web, common]").unwrap();
        let (names, target) = parse_top_entry("os:Debian", &items);
        assert_eq!(names, vec!["web", "common"]);
        assert_eq!(target.kind, TargetKind::Grain);
    }
}
