//! Configuration for the CloudStack cloud controller manager
//!
//! The config file is TOML with a `[global]` table for label knobs and
//! engine tuning, one `[environment.<name>]` table per CloudStack
//! environment, and an optional `[custom-command]` table overriding API
//! command names. Credentials missing from the file fall back to
//! `CLOUDSTACK_<ENV>_API_URL`, `CLOUDSTACK_<ENV>_API_KEY` and
//! `CLOUDSTACK_<ENV>_SECRET_KEY` environment variables, so secrets can be
//! injected without writing them to disk.

use crate::error::{CloudError, Result};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;

/// Default number of load balancer update workers
pub const DEFAULT_UPDATE_LB_WORKERS: usize = 5;

/// Annotation consulted for a node's network id when no label knob is set
pub const DEFAULT_NETWORK_ID_ANNOTATION: &str = "csccm.cloudprovider/network-id";

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudConfig {
    #[serde(default)]
    pub global: GlobalConfig,

    /// CloudStack environments, keyed by name
    #[serde(default)]
    pub environment: BTreeMap<String, EnvironmentConfig>,

    #[serde(default, rename = "custom-command")]
    pub command: CustomCommandConfig,
}

/// Cluster-wide knobs: which labels drive node/service pairing and how
/// many update workers to run.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct GlobalConfig {
    /// Node label holding the CloudStack project id (required on nodes)
    #[serde(default)]
    pub project_id_label: String,

    /// Service label naming the pool the service's backends come from
    #[serde(default, rename = "service-label")]
    pub service_filter_label: String,

    /// Node label naming the pool a node belongs to
    #[serde(default, rename = "node-label")]
    pub node_filter_label: String,

    /// Node label overriding the node's provider-side name/id
    #[serde(default)]
    pub node_name_label: String,

    /// Node label selecting the CloudStack environment
    #[serde(default)]
    pub environment_label: String,

    /// Node label or annotation holding the node's network id
    #[serde(default)]
    pub network_id_label: String,

    /// Number of concurrent load balancer update workers
    #[serde(default)]
    pub update_lb_workers: usize,
}

impl GlobalConfig {
    /// Worker count with the default applied.
    pub fn workers(&self) -> usize {
        if self.update_lb_workers == 0 {
            DEFAULT_UPDATE_LB_WORKERS
        } else {
            self.update_lb_workers
        }
    }

    /// The label/annotation name for node network ids.
    pub fn network_id_key(&self) -> &str {
        if self.network_id_label.is_empty() {
            DEFAULT_NETWORK_ID_ANNOTATION
        } else {
            &self.network_id_label
        }
    }
}

/// Credentials and LB settings for one CloudStack environment
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub api_url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub secret_key: String,

    #[serde(default)]
    pub ssl_no_verify: bool,

    /// CloudStack returns numeric ids as strings in some codepaths;
    /// accept both spellings here.
    #[serde(default, deserialize_with = "string_or_int")]
    pub lb_environment_id: String,

    #[serde(default)]
    pub lb_domain: String,
}

/// Overrides for CloudStack API command names that differ between
/// installations.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CustomCommandConfig {
    #[serde(default)]
    pub associate_ip: String,

    #[serde(default)]
    pub assign_networks: String,
}

/// Parse configuration from TOML text. `None` yields an all-default
/// config, matching a controller started without a cloud-config file.
pub fn read_config(input: Option<&str>) -> Result<CloudConfig> {
    let mut cfg: CloudConfig = match input {
        Some(text) => toml::from_str(text)?,
        None => CloudConfig::default(),
    };
    apply_env_fallbacks(&mut cfg);
    Ok(cfg)
}

/// Load configuration from a file path.
pub fn load_config(path: &std::path::Path) -> Result<CloudConfig> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        CloudError::Configuration(format!("unable to read {}: {}", path.display(), e))
    })?;
    read_config(Some(&text))
}

fn apply_env_fallbacks(cfg: &mut CloudConfig) {
    for (name, env) in cfg.environment.iter_mut() {
        let prefix = name.to_uppercase().replace('-', "_");
        fallback(&mut env.api_url, &format!("CLOUDSTACK_{}_API_URL", prefix));
        fallback(&mut env.api_key, &format!("CLOUDSTACK_{}_API_KEY", prefix));
        fallback(
            &mut env.secret_key,
            &format!("CLOUDSTACK_{}_SECRET_KEY", prefix),
        );
    }
}

fn fallback(field: &mut String, var: &str) {
    if field.is_empty() {
        if let Ok(v) = std::env::var(var) {
            *field = v;
        }
    }
}

fn string_or_int<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrInt {
        Str(String),
        Int(i64),
    }

    Ok(match StringOrInt::deserialize(deserializer)? {
        StringOrInt::Str(s) => s,
        StringOrInt::Int(i) => i.to_string(),
    })
}
