//! Response shapes for the orchestrator API.
//!
//! Only the fields the engine acts on are decoded; everything else in the
//! response is ignored. All fields default so that `kind: Status` error
//! bodies decode into any shape.

use serde::{Deserialize, Serialize};

pub const POD_PHASE_SUCCEEDED: &str = "Succeeded";
pub const POD_PHASE_FAILED: &str = "Failed";

/// Minimal kind-tagged response.
#[derive(Debug, Default, Deserialize)]
pub struct KindResponse {
    #[serde(default)]
    pub kind: String,
}

/// Response to a delete: the orchestrator answers with a `Status` object.
#[derive(Debug, Default, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub status: String,
}

/// Deployment, decoded down to the pod-template annotations that carry the
/// recovery state.
#[derive(Debug, Default, Deserialize)]
pub struct DeploymentResponse {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub spec: Option<DeploymentSpec>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeploymentSpec {
    #[serde(default)]
    pub template: Option<DeploymentTemplate>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeploymentTemplate {
    #[serde(default)]
    pub metadata: Option<TemplateMetadata>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TemplateMetadata {
    #[serde(default)]
    pub annotations: Option<EnvAnnotations>,
}

/// The annotations the deployment template carries for adoption on restart.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct EnvAnnotations {
    #[serde(rename = "minienv.repo", default)]
    pub repo: String,
    #[serde(rename = "minienv.repoWithCreds", default)]
    pub repo_with_creds: String,
    #[serde(rename = "minienv.branch", default)]
    pub branch: String,
    #[serde(rename = "minienv.claimToken", default)]
    pub claim_token: String,
    #[serde(rename = "minienv.envDetails", default)]
    pub env_details: String,
}

impl DeploymentResponse {
    /// The pod-template annotations, if the response carries any.
    pub fn annotations(&self) -> Option<&EnvAnnotations> {
        self.spec
            .as_ref()?
            .template
            .as_ref()?
            .metadata
            .as_ref()?
            .annotations
            .as_ref()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PodListResponse {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub items: Vec<PodItem>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct PodItem {
    #[serde(default)]
    pub metadata: Option<ItemMetadata>,
    #[serde(default)]
    pub status: Option<PodStatus>,
}

impl PodItem {
    pub fn app_label(&self) -> Option<&str> {
        self.metadata
            .as_ref()?
            .labels
            .as_ref()
            .map(|l| l.app.as_str())
    }

    pub fn name(&self) -> &str {
        self.metadata.as_ref().map_or("", |m| m.name.as_str())
    }

    pub fn phase(&self) -> &str {
        self.status.as_ref().map_or("", |s| s.phase.as_str())
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ItemMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub labels: Option<AppLabel>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct AppLabel {
    #[serde(default)]
    pub app: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReplicaSetListResponse {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub items: Vec<ReplicaSetItem>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ReplicaSetItem {
    #[serde(default)]
    pub metadata: Option<ItemMetadata>,
}

impl ReplicaSetItem {
    pub fn app_label(&self) -> Option<&str> {
        self.metadata
            .as_ref()?
            .labels
            .as_ref()
            .map(|l| l.app.as_str())
    }

    pub fn name(&self) -> &str {
        self.metadata.as_ref().map_or("", |m| m.name.as_str())
    }
}

/// Body sent when deleting a replica set so its pods go down with it.
#[derive(Debug, Serialize)]
pub struct DeleteOptions {
    pub kind: &'static str,
    #[serde(rename = "orphanDependents")]
    pub orphan_dependents: bool,
}

impl DeleteOptions {
    pub fn no_orphans() -> Self {
        Self {
            kind: "DeleteOptions",
            orphan_dependents: false,
        }
    }
}
