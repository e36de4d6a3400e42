//! The immutable per-run execution configuration.

use std::{
    fmt, fs,
    io::{self, Read},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use indexmap::{IndexMap, IndexSet};
use is_terminal::IsTerminal;
use serde::Serialize;

use super::{
    Config, KEY_AUTOSCALER_CONFIG_KEY, KEY_AUTOSCALER_CONFIG_PATH, KEY_AUTOSCALER_FIELD,
    KEY_FLAVOR, KEY_INTERPRETER, KEY_MAX_RETRIES, KEY_OUTPUT_FILE, KEY_REQUIRED_FIELDS,
    KEY_RETRY_DELAY, KEY_SCRIPT_PATH, KEY_TIMEOUT,
};

/// Environment keys the supervisor always sets for the script. User variables
/// never override these.
pub const FIXED_ENV_KEYS: &[&str] = &[
    "CLUSTER_NAME",
    "NODE_NAME",
    "NODE_INDEX",
    "NODEPOOL_NAME",
    "NODE_ROLE",
    "HCLOUD_TOKEN",
    "NETWORK_REGION",
    "LOCATION",
    "SERVER_TYPE",
    "ORIGINAL_NETWORK_CIDR",
    "CLUSTER_IPV4_CIDR",
    "SERVICE_IPV4_CIDR",
    "OUTPUT_FILE",
    "SCRIPT_TIMEOUT",
];

const STATIC_OUTPUT_FILE: &str = "/tmp/overlay-network-result.json";
const AUTOSCALER_OUTPUT_FILE: &str = "/tmp/overlay-network-autoscaler-result.json";
const AUTOSCALER_CONFIG_PATH: &str = "/etc/rancher/k3s/config.yaml.d/overlay-network.yaml";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NodeFlavor {
    /// Control plane and static worker nodes.
    #[default]
    Static,
    /// Nodes created by the cluster autoscaler; runs the post-processing step.
    Autoscaler,
}

impl NodeFlavor {
    pub fn default_output_file(self) -> &'static str {
        match self {
            Self::Static => STATIC_OUTPUT_FILE,
            Self::Autoscaler => AUTOSCALER_OUTPUT_FILE,
        }
    }

    fn default_domain_field(self) -> &'static str {
        match self {
            Self::Static => "ipv4_address",
            Self::Autoscaler => "node_ip",
        }
    }
}

impl FromStr for NodeFlavor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "autoscaler" => Ok(Self::Autoscaler),
            other => Err(anyhow!(
                "unknown node flavor '{}', expected 'static' or 'autoscaler'",
                other
            )),
        }
    }
}

impl fmt::Display for NodeFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static => f.write_str("static"),
            Self::Autoscaler => f.write_str("autoscaler"),
        }
    }
}

/// Facts about the node being bootstrapped, exported verbatim to the script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFacts {
    pub cluster_name: String,
    pub node_name: String,
    pub node_index: String,
    pub nodepool_name: String,
    pub node_role: String,
    pub hcloud_token: String,
    pub network_region: String,
    pub location: String,
    pub server_type: String,
    pub original_network_cidr: String,
    pub cluster_ipv4_cidr: String,
    pub service_ipv4_cidr: String,
}

impl NodeFacts {
    fn from_config(cfg: &Config) -> Self {
        Self {
            cluster_name: cfg.get_or_empty("CLUSTER_NAME"),
            node_name: cfg.get_or_empty("NODE_NAME"),
            node_index: cfg.get_or_empty("NODE_INDEX"),
            nodepool_name: cfg.get_or_empty("NODEPOOL_NAME"),
            node_role: cfg.get_or_empty("NODE_ROLE"),
            hcloud_token: cfg.get_or_empty("HCLOUD_TOKEN"),
            network_region: cfg.get_or_empty("NETWORK_REGION"),
            location: cfg.get_or_empty("LOCATION"),
            server_type: cfg.get_or_empty("SERVER_TYPE"),
            original_network_cidr: cfg.get_or_empty("ORIGINAL_NETWORK_CIDR"),
            cluster_ipv4_cidr: cfg.get_or_empty("CLUSTER_IPV4_CIDR"),
            service_ipv4_cidr: cfg.get_or_empty("SERVICE_IPV4_CIDR"),
        }
    }

    /// Key/value pairs in export order.
    pub fn pairs(&self) -> [(&'static str, &str); 12] {
        [
            ("CLUSTER_NAME", self.cluster_name.as_str()),
            ("NODE_NAME", self.node_name.as_str()),
            ("NODE_INDEX", self.node_index.as_str()),
            ("NODEPOOL_NAME", self.nodepool_name.as_str()),
            ("NODE_ROLE", self.node_role.as_str()),
            ("HCLOUD_TOKEN", self.hcloud_token.as_str()),
            ("NETWORK_REGION", self.network_region.as_str()),
            ("LOCATION", self.location.as_str()),
            ("SERVER_TYPE", self.server_type.as_str()),
            ("ORIGINAL_NETWORK_CIDR", self.original_network_cidr.as_str()),
            ("CLUSTER_IPV4_CIDR", self.cluster_ipv4_cidr.as_str()),
            ("SERVICE_IPV4_CIDR", self.service_ipv4_cidr.as_str()),
        ]
    }
}

/// Where the autoscaler flavor writes the extracted address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterSettings {
    /// Result document field holding the overlay address.
    pub field: String,
    /// Key written to the configuration fragment.
    pub config_key: String,
    pub config_path: PathBuf,
}

/// Everything one supervisor run needs. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub flavor: NodeFlavor,
    pub interpreter: PathBuf,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub output_path: PathBuf,
    pub node: NodeFacts,
    pub user_env: IndexMap<String, String>,
    pub script: String,
    pub required_fields: IndexSet<String>,
    pub adapter: Option<AdapterSettings>,
}

impl ExecutionConfig {
    pub fn from_config(cfg: &Config, script: String) -> Result<Self> {
        let flavor: NodeFlavor = cfg
            .get(KEY_FLAVOR)
            .unwrap_or_else(|| "static".to_string())
            .parse()?;

        let interpreter = cfg
            .get_path(KEY_INTERPRETER)
            .unwrap_or_else(|| PathBuf::from("/bin/sh"));

        let timeout_secs = cfg.get_u64(KEY_TIMEOUT)?.unwrap_or(300);
        if timeout_secs == 0 {
            bail!("{} must be at least 1 second", KEY_TIMEOUT);
        }

        let max_attempts = cfg.get_u64(KEY_MAX_RETRIES)?.unwrap_or(3);
        if max_attempts == 0 {
            bail!("{} must be at least 1", KEY_MAX_RETRIES);
        }
        let max_attempts = u32::try_from(max_attempts)
            .with_context(|| format!("{} is too large", KEY_MAX_RETRIES))?;

        let delay_secs = cfg.get_u64(KEY_RETRY_DELAY)?.unwrap_or(30);

        let output_path = output_path_for(cfg, flavor);

        // `status` is always required, whatever the configured list says
        let mut required_fields = IndexSet::new();
        required_fields.insert("status".to_string());
        match cfg.get_list(KEY_REQUIRED_FIELDS) {
            Some(list) => required_fields.extend(list),
            None => {
                required_fields.insert(flavor.default_domain_field().to_string());
            }
        }

        let adapter = match flavor {
            NodeFlavor::Static => None,
            NodeFlavor::Autoscaler => Some(AdapterSettings {
                field: cfg
                    .get(KEY_AUTOSCALER_FIELD)
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| "node_ip".to_string()),
                config_key: cfg
                    .get(KEY_AUTOSCALER_CONFIG_KEY)
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| "node-ip".to_string()),
                config_path: cfg
                    .get_path(KEY_AUTOSCALER_CONFIG_PATH)
                    .unwrap_or_else(|| PathBuf::from(AUTOSCALER_CONFIG_PATH)),
            }),
        };

        Ok(Self {
            flavor,
            interpreter,
            timeout: Duration::from_secs(timeout_secs),
            max_attempts,
            initial_delay: Duration::from_secs(delay_secs),
            output_path,
            node: NodeFacts::from_config(cfg),
            user_env: cfg.user_env(),
            script,
            required_fields,
            adapter,
        })
    }

    /// Printable view with secrets redacted.
    pub fn redacted_json(&self) -> serde_json::Value {
        let node: serde_json::Map<String, serde_json::Value> = self
            .node
            .pairs()
            .into_iter()
            .map(|(k, v)| {
                let shown = if k == "HCLOUD_TOKEN" && !v.is_empty() {
                    "<redacted>"
                } else {
                    v
                };
                (k.to_string(), serde_json::Value::from(shown))
            })
            .collect();

        serde_json::json!({
            "flavor": self.flavor,
            "interpreter": self.interpreter,
            "timeout_seconds": self.timeout.as_secs(),
            "max_attempts": self.max_attempts,
            "initial_delay_seconds": self.initial_delay.as_secs(),
            "output_path": self.output_path,
            "required_fields": self.required_fields,
            "node": node,
            "user_env": self.user_env,
            "adapter": self.adapter,
            "script_bytes": self.script.len(),
        })
    }
}

fn output_path_for(cfg: &Config, flavor: NodeFlavor) -> PathBuf {
    cfg.get_path(KEY_OUTPUT_FILE)
        .unwrap_or_else(|| PathBuf::from(flavor.default_output_file()))
}

/// Where the result document goes, resolved without validating the rest of
/// the configuration. An unparseable flavor falls back to the static default.
pub fn resolve_output_path(cfg: &Config) -> PathBuf {
    let flavor = cfg
        .get(KEY_FLAVOR)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    output_path_for(cfg, flavor)
}

/// Read the script body from `path`, or from stdin when `path` is `-` or
/// absent and stdin is piped. A blank body counts as no script.
pub fn read_script_source(path: Option<&Path>) -> Result<String> {
    let (body, origin) = match path {
        Some(p) if p != Path::new("-") => {
            let body = fs::read_to_string(p)
                .with_context(|| format!("reading script: {}", p.display()))?;
            (body, p.display().to_string())
        }
        Some(_) => (read_stdin()?, "stdin".to_string()),
        None if !io::stdin().is_terminal() => (read_stdin()?, "stdin".to_string()),
        None => bail!(
            "no script given: pass --script <path>, set {}, or pipe the script on stdin",
            KEY_SCRIPT_PATH
        ),
    };
    if body.trim().is_empty() {
        bail!("script from {} is empty", origin);
    }
    Ok(body)
}

fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    io::stdin()
        .read_to_string(&mut buf)
        .context("reading script from stdin")?;
    Ok(buf)
}
