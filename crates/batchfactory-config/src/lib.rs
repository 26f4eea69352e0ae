//! Engine-facing configuration: scheduler options and the content-hash
//! primitive the broker uses to derive `job_idx` from a request.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Engine-facing options, threaded through `Scheduler::execute` and down into
/// every `pump` call as `PumpOptions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOptions {
    /// If false, `execute` drives only the data plane; broker dispatch is skipped.
    #[serde(default = "default_true")]
    pub dispatch_brokers: bool,
    /// Brokers return deterministic stub responses instead of dispatching.
    #[serde(default)]
    pub mock: bool,
    /// Hard cap on scheduler iterations.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
    /// If set, the scheduler never ascends above this barrier level.
    #[serde(default)]
    pub max_barrier_level: Option<u32>,
    /// First pump only: re-read Input ops' seed sets.
    #[serde(default = "default_true")]
    pub reload_inputs: bool,
    /// Root directory under which ledgers and broker caches are created.
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_max_iterations() -> u64 {
    10_000
}

fn default_cache_root() -> PathBuf {
    PathBuf::from(".batchfactory_cache")
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            dispatch_brokers: true,
            mock: false,
            max_iterations: default_max_iterations(),
            max_barrier_level: None,
            reload_inputs: true,
            cache_root: default_cache_root(),
        }
    }
}

/// Load + merge YAML files in order (later files override earlier ones via
/// deep-merge), then canonicalize to JSON and hash. Mirrors the layered
/// config convention used for run-level configuration elsewhere in this
/// codebase; useful for loading an `EngineOptions` plus user-defined pipeline
/// parameters from the same files.
pub fn load_layered_yaml(paths: &[&Path]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {}", p.display()))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {}", p.display()))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);
    let hash = content_hash_str(&canonical);

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively, emitting
/// compact JSON. Two semantically-equal requests with keys in a different
/// order hash identically.
pub fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

fn content_hash_str(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Content hash of a JSON value: the broker's `job_idx` is exactly this
/// applied to a request object, so that two entries producing the same
/// canonicalized request collide onto the same cached job.
pub fn content_hash(v: &Value) -> String {
    content_hash_str(&canonicalize_json(v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_hash_is_stable_under_key_reordering() {
        let a = json!({"prompt": "hi", "model": "x"});
        let b = json!({"model": "x", "prompt": "hi"});
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn content_hash_differs_for_different_requests() {
        let a = json!({"prompt": "hi"});
        let b = json!({"prompt": "bye"});
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn engine_options_defaults_match_spec() {
        let opts = EngineOptions::default();
        assert!(opts.dispatch_brokers);
        assert!(!opts.mock);
        assert!(opts.reload_inputs);
        assert_eq!(opts.max_barrier_level, None);
    }
}
