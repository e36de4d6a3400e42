//! Layered supervisor configuration: defaults, rc file, environment, CLI.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use indexmap::IndexMap;

mod execution;

pub use execution::{
    read_script_source, resolve_output_path, AdapterSettings, ExecutionConfig, NodeFacts,
    NodeFlavor, FIXED_ENV_KEYS,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/overlay-supervisor/supervisor.rc";

/// Prefix marking a user-declared variable for the script environment.
pub const USER_ENV_PREFIX: &str = "SCRIPT_ENV_";

pub const KEY_FLAVOR: &str = "OVERLAY_NODE_FLAVOR";
pub const KEY_INTERPRETER: &str = "OVERLAY_INTERPRETER";
pub const KEY_TIMEOUT: &str = "OVERLAY_SCRIPT_TIMEOUT";
pub const KEY_MAX_RETRIES: &str = "OVERLAY_MAX_RETRIES";
pub const KEY_RETRY_DELAY: &str = "OVERLAY_RETRY_DELAY";
pub const KEY_OUTPUT_FILE: &str = "OVERLAY_OUTPUT_FILE";
pub const KEY_REQUIRED_FIELDS: &str = "OVERLAY_REQUIRED_FIELDS";
pub const KEY_SCRIPT_PATH: &str = "OVERLAY_SCRIPT_PATH";
pub const KEY_AUTOSCALER_FIELD: &str = "OVERLAY_AUTOSCALER_FIELD";
pub const KEY_AUTOSCALER_CONFIG_KEY: &str = "OVERLAY_AUTOSCALER_CONFIG_KEY";
pub const KEY_AUTOSCALER_CONFIG_PATH: &str = "OVERLAY_AUTOSCALER_CONFIG_PATH";

/// Snapshot of every recognised key. Entries keep their declaration order so
/// user variables reach the script in the order they were written.
#[derive(Debug, Clone)]
pub struct Config {
    inner: IndexMap<String, String>,
    pub config_path: PathBuf,
}

impl Config {
    /// Load defaults, then the rc file (if present), then the process
    /// environment. Later layers win.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let rc = if config_path.exists() {
            let text = fs::read_to_string(&config_path)
                .with_context(|| format!("reading config file: {}", config_path.display()))?;
            Some(text)
        } else {
            None
        };

        Ok(Self::from_sources(config_path, rc.as_deref(), env::vars()))
    }

    /// Build from an rc file body and an environment listing. Used by `load`
    /// and directly by tests.
    pub fn from_sources<I>(config_path: PathBuf, rc: Option<&str>, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut map = default_map();

        if let Some(text) = rc {
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((k, v)) = line.split_once('=') {
                    map.insert(k.trim().to_string(), unquote(v.trim()).to_string());
                }
            }
        }

        // Environment takes precedence over the rc file
        for (k, v) in vars {
            if is_config_key(&k) {
                map.insert(k, v);
            }
        }

        Self { inner: map, config_path }
    }

    /// Override a single key; used for command-line flags.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key).cloned()
    }

    /// Value or empty string. Node facts are optional and exported empty when
    /// unset.
    pub fn get_or_empty(&self, key: &str) -> String {
        self.get(key).unwrap_or_default()
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.get(key) {
            Some(v) if !v.trim().is_empty() => {
                let n = v
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("{} must be a non-negative integer, got '{}'", key, v))?;
                Ok(Some(n))
            }
            _ => Ok(None),
        }
    }

    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).filter(|v| !v.is_empty()).map(PathBuf::from)
    }

    /// Comma-separated list, trimmed, empty items dropped.
    pub fn get_list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
    }

    /// User-declared variables with the `SCRIPT_ENV_` prefix stripped.
    pub fn user_env(&self) -> IndexMap<String, String> {
        self.inner
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(USER_ENV_PREFIX)
                    .filter(|name| !name.is_empty())
                    .map(|name| (name.to_string(), v.clone()))
            })
            .collect()
    }
}

fn unquote(v: &str) -> &str {
    for q in ['"', '\''] {
        if v.len() >= 2 && v.starts_with(q) && v.ends_with(q) {
            return &v[1..v.len() - 1];
        }
    }
    v
}

fn is_config_key(k: &str) -> bool {
    k.starts_with("OVERLAY_") || k.starts_with(USER_ENV_PREFIX) || FIXED_ENV_KEYS.contains(&k)
}

fn default_map() -> IndexMap<String, String> {
    let mut m = IndexMap::new();
    m.insert(KEY_FLAVOR.into(), "static".into());
    m.insert(KEY_INTERPRETER.into(), "/bin/sh".into());

    // Numbers
    m.insert(KEY_TIMEOUT.into(), "300".into());
    m.insert(KEY_MAX_RETRIES.into(), "3".into());
    m.insert(KEY_RETRY_DELAY.into(), "30".into());

    m
}
