//! Thin Kubernetes REST client
//!
//! Raw CRUD over the resources the lifecycle engine touches. Manifests go up
//! as opaque YAML; responses come back kind-tagged and are decoded just far
//! enough for the pool to make decisions.

mod client;
mod types;

pub use client::KubeClient;
pub use types::{
    DeploymentResponse, EnvAnnotations, PodItem, ReplicaSetItem, POD_PHASE_FAILED,
    POD_PHASE_SUCCEEDED,
};
