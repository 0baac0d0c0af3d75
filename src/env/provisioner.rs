//! Warm-up provisioner
//!
//! A per-slot one-shot Job that preloads container images onto the slot's
//! persistent volume before the slot becomes claimable.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use super::planner::{substitute, DeploymentPlanner};
use super::{
    persistent_volume_claim_name, persistent_volume_name, provisioner_job_name, provisioner_label,
};
use crate::config::{Config, Templates};
use crate::k8s::{KubeClient, POD_PHASE_FAILED, POD_PHASE_SUCCEEDED};

pub struct Provisioner {
    kube: Arc<KubeClient>,
    config: Arc<Config>,
    templates: Arc<Templates>,
    planner: Arc<DeploymentPlanner>,
}

impl Provisioner {
    pub fn new(
        kube: Arc<KubeClient>,
        config: Arc<Config>,
        templates: Arc<Templates>,
        planner: Arc<DeploymentPlanner>,
    ) -> Self {
        Self {
            kube,
            config,
            templates,
            planner,
        }
    }

    /// Start the warm-up Job for a slot: tear down any previous provisioner,
    /// ensure the PV (host-path mode) and PVC exist, then create the Job.
    pub async fn deploy(&self, env_id: u32) -> Result<()> {
        if let Err(err) = self.delete(env_id).await {
            warn!(env_id, error = %err, "Failed to delete previous provisioner");
        }
        if self.config.host_path_volumes()
            && !self
                .kube
                .persistent_volume_exists(&persistent_volume_name(env_id))
                .await?
        {
            if let Some(yaml) = self.planner.render_pv_yaml(env_id) {
                self.kube.save_persistent_volume(&yaml).await?;
            }
        }
        if !self
            .kube
            .persistent_volume_claim_exists(&persistent_volume_claim_name(env_id))
            .await?
        {
            self.kube
                .save_persistent_volume_claim(&self.planner.render_pvc_yaml(env_id))
                .await?;
        }
        let job = substitute(
            &self.templates.provisioner_job,
            &[
                ("$nodeNameOverride", &self.config.node_name_override),
                ("$minienvVersion", &self.config.version),
                ("$jobName", &provisioner_job_name(env_id)),
                ("$appLabel", &provisioner_label(env_id)),
                ("$storageDriver", &self.config.storage_driver),
                ("$provisionImages", &self.config.provision_images),
                ("$pvcName", &persistent_volume_claim_name(env_id)),
            ],
        );
        self.kube.save_job(&job).await
    }

    /// The provisioner counts as running while any pod with its label has an
    /// empty phase or a phase that is neither `Succeeded` nor `Failed`.
    pub async fn is_running(&self, env_id: u32) -> Result<bool> {
        let label = provisioner_label(env_id);
        let pods = self.kube.list_pods().await?;
        for pod in pods {
            if pod.app_label() == Some(label.as_str()) {
                let phase = pod.phase();
                debug!(env_id, phase, "Provisioner pod found");
                if phase.is_empty() || (phase != POD_PHASE_SUCCEEDED && phase != POD_PHASE_FAILED) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Delete the Job and every pod bearing the provisioner label.
    pub async fn delete(&self, env_id: u32) -> Result<()> {
        self.kube.delete_job(&provisioner_job_name(env_id)).await?;
        let label = provisioner_label(env_id);
        let pods = self.kube.list_pods().await?;
        for pod in pods {
            if pod.app_label() == Some(label.as_str()) {
                let name = pod.name().to_string();
                if let Err(err) = self.kube.delete_pod(&name).await {
                    warn!(env_id, pod = %name, error = %err, "Failed to delete provisioner pod");
                }
            }
        }
        info!(env_id, "Provisioner deleted");
        Ok(())
    }
}
