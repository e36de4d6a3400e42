//! Environment exported to the overlay script.

use indexmap::IndexMap;
use tracing::warn;

use crate::config::{ExecutionConfig, FIXED_ENV_KEYS};

/// The exact variables handed to the child process, in export order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptEnvironment {
    vars: IndexMap<String, String>,
}

impl ScriptEnvironment {
    /// Fixed node keys first, then user keys. A user key that collides with a
    /// fixed key is dropped.
    pub fn build(cfg: &ExecutionConfig) -> Self {
        let mut vars = IndexMap::new();

        for (key, value) in cfg.node.pairs() {
            vars.insert(key.to_string(), value.to_string());
        }
        vars.insert(
            "OUTPUT_FILE".to_string(),
            cfg.output_path.to_string_lossy().into_owned(),
        );
        vars.insert(
            "SCRIPT_TIMEOUT".to_string(),
            cfg.timeout.as_secs().to_string(),
        );

        for (key, value) in &cfg.user_env {
            if FIXED_ENV_KEYS.contains(&key.as_str()) {
                warn!(key = %key, "user variable collides with a fixed key, ignoring it");
                continue;
            }
            if key.contains('=') || key.contains('\0') || value.contains('\0') {
                warn!(key = %key, "user variable is not a valid environment entry, ignoring it");
                continue;
            }
            vars.insert(key.clone(), value.clone());
        }

        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
