//! Bootstrap configuration for minienv
//!
//! Everything is read once at startup from `MINIENV_*` / `KUBERNETES_*`
//! environment variables and passed into the pool and API constructors;
//! nothing here mutates after that.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BRANCH: &str = "master";

/// A repo+branch pair that may be deployed when a whitelist is configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistRepo {
    pub name: String,
    pub url: String,
    pub branch: String,
}

/// Remote session store coordinates.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub address: String,
    pub password: String,
    pub db: i64,
}

/// Orchestrator API endpoint.
#[derive(Debug, Clone)]
pub struct KubeApiConfig {
    /// Fully assembled base URL, e.g. `https://10.0.0.1:443`.
    pub base_url: String,
    /// Path of the bearer token file; no Authorization header when unset.
    pub token_path: Option<String>,
    pub namespace: String,
}

/// Tunable intervals and thresholds. The defaults match the original
/// deployment; tests tighten them.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// Delay between reconciler passes.
    pub check_env_interval: Duration,
    /// A `Claimed` slot with no activity for longer than this returns to `Idle`.
    pub expire_claim_no_activity_seconds: i64,
    /// A `Running` slot with no activity for longer than this is torn down.
    pub default_env_expiration_seconds: i64,
    /// Pod-termination poll: attempts and delay between them.
    pub pod_termination_attempts: u32,
    pub pod_termination_delay: Duration,
    /// Per-call timeout on orchestrator requests.
    pub kube_call_timeout: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            check_env_interval: Duration::from_secs(15),
            expire_claim_no_activity_seconds: 30,
            default_env_expiration_seconds: 60,
            pod_termination_attempts: 6,
            pod_termination_delay: Duration::from_secs(5),
            kube_call_timeout: Duration::from_secs(10),
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API listen port.
    pub port: u16,
    /// Container version tag rendered into manifests.
    pub version: String,
    /// Container image for the env pod.
    pub image: String,
    pub redis: Option<RedisConfig>,
    /// PVC storage class; unset means host-path persistent volumes.
    pub storage_class: Option<String>,
    pub provision_volume_size: String,
    pub provision_images: String,
    pub kube: KubeApiConfig,
    pub node_host_name: String,
    pub node_name_override: String,
    pub node_host_protocol: String,
    pub storage_driver: String,
    pub allow_origin: String,
    /// Pool size N.
    pub env_count: u32,
    pub whitelist: Option<Vec<WhitelistRepo>>,
    pub timers: TimerConfig,
}

fn env_or(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let redis = env_opt("MINIENV_REDIS_ADDRESS").map(|address| RedisConfig {
            address,
            password: env_or("MINIENV_REDIS_PASSWORD", ""),
            db: env_or("MINIENV_REDIS_DB", "0").parse().unwrap_or(0),
        });

        let kube_protocol = env_or("KUBERNETES_SERVICE_PROTOCOL", "https://");
        let kube_host = env_or("KUBERNETES_SERVICE_HOST", "");
        let kube_port = env_or("KUBERNETES_SERVICE_PORT", "");
        let kube = KubeApiConfig {
            base_url: format!("{kube_protocol}{kube_host}:{kube_port}"),
            token_path: env_opt("KUBERNETES_TOKEN_PATH"),
            namespace: env_or("MINIENV_NAMESPACE", "default"),
        };

        let env_count = env_or("MINIENV_PROVISION_COUNT", "1")
            .parse()
            .context("MINIENV_PROVISION_COUNT is not a number")?;

        Ok(Self {
            port: env_or("MINIENV_PORT", "8080")
                .parse()
                .context("MINIENV_PORT is not a port number")?,
            version: env_or("MINIENV_VERSION", "latest"),
            image: env_or("MINIENV_IMAGE", "minienv/minienv:latest"),
            redis,
            storage_class: env_opt("MINIENV_VOLUME_STORAGE_CLASS"),
            provision_volume_size: env_or("MINIENV_PROVISION_VOLUME_SIZE", ""),
            provision_images: env_or("MINIENV_PROVISION_IMAGES", ""),
            kube,
            node_host_name: env_or("MINIENV_NODE_HOST_NAME", ""),
            node_name_override: env_or("MINIENV_NODE_NAME_OVERRIDE", ""),
            node_host_protocol: env_or("MINIENV_NODE_HOST_PROTOCOL", ""),
            storage_driver: env_or("MINIENV_STORAGE_DRIVER", "aufs"),
            allow_origin: env_or("MINIENV_ALLOW_ORIGIN", ""),
            env_count,
            whitelist: parse_whitelist(&env_or("MINIENV_REPO_WHITELIST", "")),
            timers: TimerConfig::default(),
        })
    }

    /// Host-path persistent volumes are used when no storage class is set.
    pub fn host_path_volumes(&self) -> bool {
        self.storage_class.is_none()
    }

    /// Whether a `(repo, branch)` pair may be deployed. Everything is allowed
    /// when no whitelist is configured.
    pub fn repo_allowed(&self, repo: &str, branch: &str) -> bool {
        match &self.whitelist {
            None => true,
            Some(repos) => repos.iter().any(|r| r.url == repo && r.branch == branch),
        }
    }
}

/// Parse the `name|url|branch` triples of `MINIENV_REPO_WHITELIST`.
///
/// `name|url` defaults the branch to `master`; a bare `name` is used for both
/// name and url.
pub fn parse_whitelist(raw: &str) -> Option<Vec<WhitelistRepo>> {
    if raw.is_empty() {
        return None;
    }
    let repos: Vec<WhitelistRepo> = raw
        .split(',')
        .map(|entry| {
            let parts: Vec<&str> = entry.split('|').collect();
            if parts.len() >= 2 {
                WhitelistRepo {
                    name: parts[0].to_string(),
                    url: parts[1].to_string(),
                    branch: if parts.len() >= 3 {
                        parts[2].to_string()
                    } else {
                        DEFAULT_BRANCH.to_string()
                    },
                }
            } else {
                WhitelistRepo {
                    name: entry.to_string(),
                    url: entry.to_string(),
                    branch: DEFAULT_BRANCH.to_string(),
                }
            }
        })
        .collect();
    Some(repos)
}

/// YAML manifest templates loaded from disk at startup. Missing files are
/// fatal.
#[derive(Debug, Clone)]
pub struct Templates {
    /// Only present in host-path mode.
    pub pv: Option<String>,
    pub pvc: String,
    pub deployment: String,
    pub service: String,
    pub provisioner_job: String,
}

impl Templates {
    pub fn load(dir: &Path, host_path: bool) -> Result<Self> {
        let read = |name: &str| -> Result<String> {
            std::fs::read_to_string(dir.join(name))
                .with_context(|| format!("cannot read template file {name}"))
        };
        let (pv, pvc) = if host_path {
            (Some(read("env-pv-host-path.yml")?), read("env-pvc-host-path.yml")?)
        } else {
            (None, read("env-pvc-storage-class.yml")?)
        };
        Ok(Self {
            pv,
            pvc,
            deployment: read("env-deployment.yml")?,
            service: read("env-service.yml")?,
            provisioner_job: read("provisioner-job.yml")?,
        })
    }
}
