//! Environment lifecycle
//!
//! Identity naming, the deployment details record, tab discovery, the
//! deployment planner, the warm-up provisioner, and the slot pool with its
//! reconciler.

pub mod planner;
pub mod pool;
pub mod provisioner;
pub mod tabs;

use serde::{Deserialize, Serialize};

use crate::repo::EnvConfig;

/// One user-facing HTTP endpoint exposed by a running environment. The URL
/// carries the `$sessionId` sentinel until it is stamped at response time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTab {
    #[serde(default)]
    pub port: i64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub hide: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
}

impl DeploymentTab {
    pub fn from_port(port: i64) -> Self {
        Self {
            port,
            name: port.to_string(),
            ..Self::default()
        }
    }
}

/// Computed record of ports, URLs, and tabs for an active environment.
///
/// Serialised into the deployment's pod-template annotation for recovery on
/// restart; the field names match what deployed environments already carry,
/// so they must not change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeploymentDetails {
    #[serde(default)]
    pub node_host_name: String,
    #[serde(default)]
    pub env_id: String,
    #[serde(default)]
    pub claim_token: String,
    #[serde(default)]
    pub log_port: String,
    #[serde(default)]
    pub log_url: String,
    #[serde(default)]
    pub editor_port: String,
    #[serde(default)]
    pub editor_url: String,
    #[serde(default)]
    pub app_proxy_port: String,
    #[serde(default)]
    pub tabs: Vec<DeploymentTab>,
    #[serde(skip)]
    pub env_config: Option<EnvConfig>,
}

impl DeploymentDetails {
    /// Serialise for embedding into the annotation literal: JSON with every
    /// `"` escaped as `\"`. Empty string when serialisation fails.
    pub fn to_annotation_string(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => json.replace('"', "\\\""),
            Err(_) => String::new(),
        }
    }

    /// Reverse of [`to_annotation_string`]. `None` when the annotation does
    /// not decode.
    pub fn from_annotation_string(raw: &str) -> Option<Self> {
        let json = raw.replace("\\\"", "\"");
        serde_json::from_str(&json).ok()
    }
}

// Identity naming. Service names and app labels embed the claim token so that
// stale services become unreachable once a slot is re-claimed.

pub fn persistent_volume_name(env_id: u32) -> String {
    format!("minienv-env-{env_id}-pv").to_lowercase()
}

pub fn persistent_volume_path(env_id: u32) -> String {
    format!("/minienv-env-{env_id}").to_lowercase()
}

pub fn persistent_volume_claim_name(env_id: u32) -> String {
    format!("env-{env_id}-pvc").to_lowercase()
}

pub fn deployment_name(env_id: u32) -> String {
    format!("env-{env_id}-deployment").to_lowercase()
}

pub fn service_name(env_id: u32, claim_token: &str) -> String {
    format!("env-{env_id}-service-{claim_token}").to_lowercase()
}

pub fn app_label(env_id: u32, claim_token: &str) -> String {
    format!("env-{env_id}-app-{claim_token}").to_lowercase()
}

pub fn provisioner_job_name(env_id: u32) -> String {
    format!("env-{env_id}-provision-job").to_lowercase()
}

pub fn provisioner_label(env_id: u32) -> String {
    format!("env-{env_id}-provision").to_lowercase()
}
