//! Environment pool & reconciler
//!
//! A fixed-size table of slots, each a small state machine over
//! `Idle -> Provisioning -> Idle -> Claimed -> Running`. HTTP handlers and the
//! periodic reconciler both mutate slots; all mutation goes through the slot
//! lock, which is never held across orchestrator I/O. Mutators snapshot under
//! the lock, mark transient intent (`Claimed`) on the slot, perform I/O, then
//! re-acquire and commit after re-validating the claim token.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::planner::DeploymentPlanner;
use super::provisioner::Provisioner;
use super::{
    app_label, deployment_name, persistent_volume_claim_name, persistent_volume_name,
    service_name, DeploymentDetails,
};
use crate::config::Config;
use crate::k8s::KubeClient;
use crate::repo::DeploymentRepo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStatus {
    Idle,
    Provisioning,
    Claimed,
    Running,
}

/// One entry in the fixed-size pool. Slots are created at startup and never
/// added or removed afterwards.
#[derive(Debug, Clone)]
pub struct EnvSlot {
    pub id: u32,
    pub status: EnvStatus,
    pub claim_token: String,
    pub last_activity: i64,
    pub repo: String,
    pub repo_with_creds: String,
    pub branch: String,
    pub details: Option<DeploymentDetails>,
    /// Recorded from the up request; the reconciler's Running check uses the
    /// global default window, not this.
    pub expiration_seconds: i64,
}

impl EnvSlot {
    fn new(id: u32) -> Self {
        Self {
            id,
            status: EnvStatus::Idle,
            claim_token: String::new(),
            last_activity: 0,
            repo: String::new(),
            repo_with_creds: String::new(),
            branch: String::new(),
            details: None,
            expiration_seconds: 0,
        }
    }

    /// Back to `Idle` with every claim-scoped field cleared.
    fn clear(&mut self) {
        self.status = EnvStatus::Idle;
        self.claim_token.clear();
        self.last_activity = 0;
        self.repo.clear();
        self.repo_with_creds.clear();
        self.branch.clear();
        self.details = None;
        self.expiration_seconds = 0;
    }

    fn matches_token(&self, claim_token: &str) -> bool {
        !self.claim_token.is_empty() && self.claim_token == claim_token
    }
}

#[derive(Debug, Error)]
pub enum UpError {
    #[error("Invalid claim token")]
    InvalidClaim,
    #[error("{0}")]
    Orchestrator(anyhow::Error),
}

impl From<anyhow::Error> for UpError {
    fn from(err: anyhow::Error) -> Self {
        Self::Orchestrator(err)
    }
}

/// Result of a ping against a claim token.
#[derive(Debug, Default)]
pub struct PingOutcome {
    pub claim_granted: bool,
    pub up: bool,
    pub repo: String,
    pub branch: String,
    pub details: Option<DeploymentDetails>,
}

pub struct EnvPool {
    slots: Mutex<Vec<EnvSlot>>,
    kube: Arc<KubeClient>,
    planner: Arc<DeploymentPlanner>,
    provisioner: Provisioner,
    config: Arc<Config>,
}

impl EnvPool {
    pub fn new(
        kube: Arc<KubeClient>,
        planner: Arc<DeploymentPlanner>,
        provisioner: Provisioner,
        config: Arc<Config>,
    ) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            kube,
            planner,
            provisioner,
            config,
        }
    }

    /// Startup: adopt running deployments, seed the rest into `Provisioning`,
    /// scale down slots beyond the configured count, then run one reconcile
    /// pass. The HTTP listener binds only after this returns, so nothing here
    /// races with requests. Orchestrator failures are logged, not fatal; the
    /// reconciler converges later.
    pub async fn init(&self) {
        let count = self.config.env_count;
        info!(count, "Provisioning environments");
        for id in 1..=count {
            let mut slot = EnvSlot::new(id);
            match self.kube.get_deployment(&deployment_name(id)).await {
                Ok(Some(deployment)) => {
                    let adopted = deployment.annotations().filter(|a| {
                        !a.repo.is_empty()
                            && !a.repo_with_creds.is_empty()
                            && !a.claim_token.is_empty()
                            && !a.env_details.is_empty()
                    });
                    if let Some(ann) = adopted {
                        info!(id, repo = %ann.repo, "Adopting running environment");
                        slot.status = EnvStatus::Running;
                        slot.claim_token = ann.claim_token.clone();
                        slot.last_activity = Utc::now().timestamp();
                        slot.repo = ann.repo.clone();
                        slot.repo_with_creds = ann.repo_with_creds.clone();
                        slot.branch = ann.branch.clone();
                        slot.details =
                            DeploymentDetails::from_annotation_string(&ann.env_details);
                    } else {
                        warn!(id, "Insufficient deployment metadata; tearing down");
                        self.delete_env(id, "").await;
                    }
                }
                Ok(None) => {}
                Err(err) => warn!(id, error = %err, "Failed to query deployment at startup"),
            }
            if slot.status != EnvStatus::Running {
                info!(id, "Provisioning environment");
                slot.status = EnvStatus::Provisioning;
                if let Err(err) = self.provisioner.deploy(id).await {
                    warn!(id, error = %err, "Failed to deploy provisioner");
                }
            }
            self.slots.lock().await.push(slot);
        }

        // Scale down: slots beyond the configured count are identified by
        // their leftover PVC; stop at the first id without one.
        let mut id = count + 1;
        loop {
            let pvc_name = persistent_volume_claim_name(id);
            match self.kube.persistent_volume_claim_exists(&pvc_name).await {
                Ok(true) => {
                    info!(id, "De-provisioning environment");
                    let claim_token = match self.kube.get_deployment(&deployment_name(id)).await {
                        Ok(Some(deployment)) => deployment
                            .annotations()
                            .map(|a| a.claim_token.clone())
                            .unwrap_or_default(),
                        _ => String::new(),
                    };
                    self.delete_env(id, &claim_token).await;
                    if let Err(err) = self.provisioner.delete(id).await {
                        warn!(id, error = %err, "Failed to delete provisioner");
                    }
                    if let Err(err) = self.kube.delete_persistent_volume_claim(&pvc_name).await {
                        warn!(id, error = %err, "Failed to delete persistent volume claim");
                    }
                    if self.config.host_path_volumes() {
                        if let Err(err) = self
                            .kube
                            .delete_persistent_volume(&persistent_volume_name(id))
                            .await
                        {
                            warn!(id, error = %err, "Failed to delete persistent volume");
                        }
                    }
                    id += 1;
                }
                _ => break,
            }
        }

        self.reconcile_tick().await;
    }

    /// Re-arm the reconciler after each pass; a slow pass stretches the
    /// cadence rather than overlapping the next one.
    pub fn spawn_reconciler(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(pool.config.timers.check_env_interval).await;
                pool.reconcile_tick().await;
            }
        })
    }

    /// Claim the first idle slot. `None` when the pool is exhausted.
    pub async fn claim(&self) -> Option<String> {
        let mut slots = self.slots.lock().await;
        let slot = slots.iter_mut().find(|s| s.status == EnvStatus::Idle)?;
        let claim_token = uuid::Uuid::new_v4().simple().to_string();
        info!(id = slot.id, "Claimed environment");
        slot.status = EnvStatus::Claimed;
        slot.claim_token = claim_token.clone();
        slot.last_activity = Utc::now().timestamp();
        Some(claim_token)
    }

    /// The repo currently bound to a claim, for the repo-view permission gate.
    pub async fn repo_for_token(&self, claim_token: &str) -> Option<String> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .find(|s| s.matches_token(claim_token))
            .map(|s| s.repo.clone())
    }

    /// Drive the claimed slot up against a repo. Returns the existing details
    /// when the deployment is already up for the same repo+branch; otherwise
    /// tears down whatever is there and deploys fresh.
    pub async fn up(
        &self,
        claim_token: &str,
        repo: &DeploymentRepo,
        env_vars: &HashMap<String, String>,
        expiration_seconds: Option<i64>,
    ) -> Result<DeploymentDetails, UpError> {
        let (env_id, status, cur_repo, cur_branch, cur_details) = {
            let slots = self.slots.lock().await;
            let slot = slots
                .iter()
                .find(|s| s.matches_token(claim_token))
                .ok_or(UpError::InvalidClaim)?;
            (
                slot.id,
                slot.status,
                slot.repo.clone(),
                slot.branch.clone(),
                slot.details.clone(),
            )
        };

        debug!(env_id, "Checking whether environment is already deployed");
        let deployed = self.is_env_deployed(env_id).await?;
        if deployed
            && status == EnvStatus::Running
            && cur_repo.eq_ignore_ascii_case(&repo.repo)
            && cur_branch.eq_ignore_ascii_case(&repo.branch)
        {
            if let Some(details) = cur_details {
                info!(env_id, "Returning existing environment details");
                let mut slots = self.slots.lock().await;
                if let Some(slot) = slots.iter_mut().find(|s| s.matches_token(claim_token)) {
                    slot.last_activity = Utc::now().timestamp();
                }
                return Ok(details);
            }
        }

        // Mark the slot Claimed so a reconciler tick doesn't read the
        // teardown of the old repo as the environment having stopped.
        {
            let mut slots = self.slots.lock().await;
            let slot = slots
                .iter_mut()
                .find(|s| s.matches_token(claim_token))
                .ok_or(UpError::InvalidClaim)?;
            slot.status = EnvStatus::Claimed;
        }

        info!(env_id, repo = %repo.repo, branch = %repo.branch, "Creating new deployment");
        let details = self.deploy_env(env_id, claim_token, repo, env_vars).await?;

        let mut slots = self.slots.lock().await;
        let slot = slots
            .iter_mut()
            .find(|s| s.matches_token(claim_token))
            .ok_or(UpError::InvalidClaim)?;
        slot.status = EnvStatus::Running;
        slot.repo = repo.repo.clone();
        slot.repo_with_creds = repo.with_credentials();
        slot.branch = repo.branch.clone();
        slot.details = Some(details.clone());
        slot.last_activity = Utc::now().timestamp();
        slot.expiration_seconds = match expiration_seconds {
            Some(requested) if requested >= 0 => requested,
            _ => self.config.timers.default_env_expiration_seconds,
        };
        Ok(details)
    }

    /// Record activity on a claim and report whether its environment is up.
    /// With `get_env_details` the deployment is re-probed; a vanished
    /// deployment demotes the slot back to `Claimed`. Probe errors propagate.
    pub async fn ping(&self, claim_token: &str, get_env_details: bool) -> Result<PingOutcome> {
        let snapshot = {
            let mut slots = self.slots.lock().await;
            match slots.iter_mut().find(|s| s.matches_token(claim_token)) {
                None => return Ok(PingOutcome::default()),
                Some(slot) => {
                    slot.last_activity = Utc::now().timestamp();
                    (slot.id, slot.status, slot.repo.clone(), slot.branch.clone(), slot.details.clone())
                }
            }
        };
        let (env_id, status, repo, branch, details) = snapshot;
        let mut outcome = PingOutcome {
            claim_granted: true,
            up: status == EnvStatus::Running,
            repo,
            branch,
            details: None,
        };
        if outcome.up && get_env_details {
            let deployed = self.is_env_deployed(env_id).await?;
            outcome.up = deployed;
            if deployed {
                outcome.details = details;
            } else {
                let mut slots = self.slots.lock().await;
                if let Some(slot) = slots
                    .iter_mut()
                    .find(|s| s.matches_token(claim_token) && s.status == EnvStatus::Running)
                {
                    slot.status = EnvStatus::Claimed;
                    slot.repo.clear();
                    slot.repo_with_creds.clear();
                    slot.branch.clear();
                    slot.details = None;
                }
            }
        }
        Ok(outcome)
    }

    /// One reconciler pass over every slot. Slot ids are snapshotted under
    /// the lock; each slot is processed outside it and committed under it.
    /// Errors are logged and swallowed - the next pass retries.
    pub async fn reconcile_tick(&self) {
        let snapshots: Vec<EnvSlot> = self.slots.lock().await.clone();
        for slot in snapshots {
            debug!(id = slot.id, status = ?slot.status, "Checking environment");
            match slot.status {
                EnvStatus::Idle => {}
                EnvStatus::Provisioning => self.check_provisioning(&slot).await,
                EnvStatus::Running => self.check_running(&slot).await,
                EnvStatus::Claimed => self.check_claimed(&slot).await,
            }
        }
    }

    async fn check_provisioning(&self, snapshot: &EnvSlot) {
        let id = snapshot.id;
        match self.provisioner.is_running(id).await {
            Err(err) => warn!(id, error = %err, "Failed to check provisioner status"),
            Ok(true) => debug!(id, "Still provisioning"),
            Ok(false) => {
                info!(id, "Provisioning complete");
                if let Err(err) = self.provisioner.delete(id).await {
                    warn!(id, error = %err, "Failed to delete provisioner");
                }
                let mut slots = self.slots.lock().await;
                if let Some(slot) = slots
                    .iter_mut()
                    .find(|s| s.id == id && s.status == EnvStatus::Provisioning)
                {
                    slot.clear();
                }
            }
        }
    }

    async fn check_running(&self, snapshot: &EnvSlot) {
        let id = snapshot.id;
        // The activity window is the global default; the per-slot
        // expirationSeconds recorded at up time is not consulted here.
        let threshold = self.config.timers.default_env_expiration_seconds;
        if Utc::now().timestamp() - snapshot.last_activity > threshold {
            info!(id, "Environment no longer active");
            // Mark and clear under the lock first so requests see the slot
            // recycling before the slow teardown happens.
            let proceed = {
                let mut slots = self.slots.lock().await;
                match slots.iter_mut().find(|s| {
                    s.id == id
                        && s.status == EnvStatus::Running
                        && s.claim_token == snapshot.claim_token
                }) {
                    Some(slot) => {
                        slot.clear();
                        slot.status = EnvStatus::Provisioning;
                        true
                    }
                    None => false,
                }
            };
            if proceed {
                self.delete_env(id, &snapshot.claim_token).await;
                info!(id, "Re-provisioning environment");
                if let Err(err) = self.provisioner.deploy(id).await {
                    warn!(id, error = %err, "Failed to deploy provisioner");
                }
            }
        } else {
            match self.is_env_deployed(id).await {
                Err(err) => warn!(id, error = %err, "Failed to check deployment"),
                Ok(true) => {}
                Ok(false) => {
                    info!(id, "Environment no longer deployed");
                    let mut slots = self.slots.lock().await;
                    if let Some(slot) = slots.iter_mut().find(|s| {
                        s.id == id
                            && s.status == EnvStatus::Running
                            && s.claim_token == snapshot.claim_token
                    }) {
                        slot.clear();
                    }
                }
            }
        }
    }

    async fn check_claimed(&self, snapshot: &EnvSlot) {
        let elapsed = Utc::now().timestamp() - snapshot.last_activity;
        if elapsed > self.config.timers.expire_claim_no_activity_seconds {
            info!(id = snapshot.id, "Environment claim expired");
            let mut slots = self.slots.lock().await;
            if let Some(slot) = slots.iter_mut().find(|s| {
                s.id == snapshot.id
                    && s.status == EnvStatus::Claimed
                    && s.claim_token == snapshot.claim_token
            }) {
                slot.clear();
            }
        }
    }

    async fn is_env_deployed(&self, env_id: u32) -> Result<bool> {
        Ok(self
            .kube
            .get_deployment(&deployment_name(env_id))
            .await?
            .is_some())
    }

    /// Teardown of the previous deployment happens-before the new service
    /// and deployment creation.
    async fn deploy_env(
        &self,
        env_id: u32,
        claim_token: &str,
        repo: &DeploymentRepo,
        env_vars: &HashMap<String, String>,
    ) -> Result<DeploymentDetails> {
        self.delete_env(env_id, claim_token).await;
        let details = self.planner.plan(env_id, claim_token, repo).await?;
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
        // Service first: the deployment annotation serialises details that
        // the service's ports are part of.
        self.kube
            .save_service(&self.planner.render_service_yaml(&details))
            .await?;
        self.kube
            .save_deployment(&self.planner.render_deployment_yaml(&details, repo, env_vars))
            .await?;
        Ok(details)
    }

    /// Best-effort teardown: every sub-call error is logged and ignored.
    async fn delete_env(&self, env_id: u32, claim_token: &str) {
        info!(env_id, "Deleting environment");
        let label = app_label(env_id, claim_token);
        if let Err(err) = self.kube.delete_deployment(&deployment_name(env_id)).await {
            warn!(env_id, error = %err, "Failed to delete deployment");
        }
        if let Err(err) = self.kube.delete_replica_set(&label).await {
            warn!(env_id, error = %err, "Failed to delete replica set");
        }
        if let Err(err) = self
            .kube
            .delete_service(&service_name(env_id, claim_token))
            .await
        {
            warn!(env_id, error = %err, "Failed to delete service");
        }
        if let Err(err) = self.kube.wait_for_pod_termination(&label).await {
            warn!(env_id, error = %err, "Failed waiting for pod termination");
        }
    }

    /// Current (id, status) pairs, for tests and introspection.
    pub async fn slot_states(&self) -> Vec<(u32, EnvStatus)> {
        self.slots
            .lock()
            .await
            .iter()
            .map(|s| (s.id, s.status))
            .collect()
    }
}
