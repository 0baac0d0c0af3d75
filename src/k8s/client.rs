//! REST client for the orchestrator.
//!
//! Contract: `get` answers `Ok(true)` / `Ok(Some(..))` only when the response
//! `kind` matches the expected kind - a 404 comes back as a `Status` object,
//! so non-existence and an unexpected kind are indistinguishable to callers.
//! `save` posts opaque YAML and errors on a kind mismatch. `delete` reports
//! whether the returned `status` is `"Success"`. No retries; callers decide.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::types::{
    DeleteOptions, DeploymentResponse, KindResponse, PodItem, PodListResponse, ReplicaSetItem,
    ReplicaSetListResponse, StatusResponse,
};
use crate::config::TimerConfig;

pub struct KubeClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    namespace: String,
    pod_termination_attempts: u32,
    pod_termination_delay: Duration,
}

impl KubeClient {
    pub fn new(
        base_url: String,
        token: String,
        namespace: String,
        timers: &TimerConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timers.kube_call_timeout)
            .build()
            .context("failed to build orchestrator HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
            namespace,
            pod_termination_attempts: timers.pod_termination_attempts,
            pod_termination_delay: timers.pod_termination_delay,
        })
    }

    fn pv_url(&self, name: &str) -> String {
        format!("{}/api/v1/persistentvolumes{}", self.base_url, suffix(name))
    }

    fn namespaced_url(&self, prefix: &str, resource: &str, name: &str) -> String {
        format!(
            "{}/{}/namespaces/{}/{}{}",
            self.base_url,
            prefix,
            self.namespace,
            resource,
            suffix(name)
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut req = self.http.get(url);
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }
        let resp = req.send().await.with_context(|| format!("GET {url}"))?;
        resp.json().await.with_context(|| format!("decoding {url}"))
    }

    async fn post_yaml<T: DeserializeOwned>(&self, url: &str, yaml: &str) -> Result<T> {
        let mut req = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/yaml")
            .body(yaml.to_string());
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }
        let resp = req.send().await.with_context(|| format!("POST {url}"))?;
        resp.json().await.with_context(|| format!("decoding {url}"))
    }

    async fn delete_returning_status(&self, url: &str) -> Result<bool> {
        let mut req = self.http.delete(url);
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }
        let resp = req.send().await.with_context(|| format!("DELETE {url}"))?;
        let status: StatusResponse = resp.json().await.with_context(|| format!("decoding {url}"))?;
        Ok(status.status == "Success")
    }

    async fn exists(&self, url: &str, expected_kind: &str) -> Result<bool> {
        let resp: KindResponse = self.get_json(url).await?;
        Ok(resp.kind == expected_kind)
    }

    async fn save(&self, url: &str, yaml: &str, expected_kind: &str) -> Result<()> {
        let resp: KindResponse = self.post_yaml(url, yaml).await?;
        if resp.kind != expected_kind {
            bail!("unable to create {expected_kind}: got kind {:?}", resp.kind);
        }
        Ok(())
    }

    // --- persistent volumes (cluster scope) ---

    pub async fn persistent_volume_exists(&self, name: &str) -> Result<bool> {
        self.exists(&self.pv_url(name), "PersistentVolume").await
    }

    pub async fn save_persistent_volume(&self, yaml: &str) -> Result<()> {
        self.save(&self.pv_url(""), yaml, "PersistentVolume").await
    }

    pub async fn delete_persistent_volume(&self, name: &str) -> Result<bool> {
        self.delete_returning_status(&self.pv_url(name)).await
    }

    // --- persistent volume claims ---

    pub async fn persistent_volume_claim_exists(&self, name: &str) -> Result<bool> {
        let url = self.namespaced_url("api/v1", "persistentvolumeclaims", name);
        self.exists(&url, "PersistentVolumeClaim").await
    }

    pub async fn save_persistent_volume_claim(&self, yaml: &str) -> Result<()> {
        let url = self.namespaced_url("api/v1", "persistentvolumeclaims", "");
        self.save(&url, yaml, "PersistentVolumeClaim").await
    }

    pub async fn delete_persistent_volume_claim(&self, name: &str) -> Result<bool> {
        let url = self.namespaced_url("api/v1", "persistentvolumeclaims", name);
        self.delete_returning_status(&url).await
    }

    // --- jobs ---

    pub async fn job_exists(&self, name: &str) -> Result<bool> {
        let url = self.namespaced_url("apis/batch/v1", "jobs", name);
        self.exists(&url, "Job").await
    }

    pub async fn save_job(&self, yaml: &str) -> Result<()> {
        let url = self.namespaced_url("apis/batch/v1", "jobs", "");
        self.save(&url, yaml, "Job").await
    }

    pub async fn delete_job(&self, name: &str) -> Result<bool> {
        info!(name, "Deleting job");
        let url = self.namespaced_url("apis/batch/v1", "jobs", name);
        self.delete_returning_status(&url).await
    }

    // --- deployments ---

    pub async fn get_deployment(&self, name: &str) -> Result<Option<DeploymentResponse>> {
        let url = self.namespaced_url("apis/extensions/v1beta1", "deployments", name);
        let resp: DeploymentResponse = self.get_json(&url).await?;
        Ok((resp.kind == "Deployment").then_some(resp))
    }

    pub async fn save_deployment(&self, yaml: &str) -> Result<()> {
        let url = self.namespaced_url("apis/extensions/v1beta1", "deployments", "");
        self.save(&url, yaml, "Deployment").await
    }

    pub async fn delete_deployment(&self, name: &str) -> Result<bool> {
        info!(name, "Deleting deployment");
        let url = self.namespaced_url("apis/extensions/v1beta1", "deployments", name);
        self.delete_returning_status(&url).await
    }

    // --- replica sets ---

    pub async fn list_replica_sets(&self) -> Result<Vec<ReplicaSetItem>> {
        let url = self.namespaced_url("apis/extensions/v1beta1", "replicasets", "");
        let resp: ReplicaSetListResponse = self.get_json(&url).await?;
        if resp.kind != "ReplicaSetList" {
            return Ok(Vec::new());
        }
        Ok(resp.items)
    }

    /// Delete the replica set whose `app` label matches, taking its pods with
    /// it. `Ok(false)` when no such replica set exists.
    pub async fn delete_replica_set(&self, label: &str) -> Result<bool> {
        debug!(label, "Looking up replica set by label");
        let name = self
            .list_replica_sets()
            .await?
            .into_iter()
            .find(|rs| rs.app_label() == Some(label))
            .map(|rs| rs.name().to_string());
        let Some(name) = name else {
            return Ok(false);
        };
        info!(name, "Deleting replica set");
        let url = self.namespaced_url("apis/extensions/v1beta1", "replicasets", &name);
        let body = serde_json::to_string(&DeleteOptions::no_orphans())?;
        let mut req = self
            .http
            .delete(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }
        let resp = req.send().await.with_context(|| format!("DELETE {url}"))?;
        let status: StatusResponse = resp.json().await.with_context(|| format!("decoding {url}"))?;
        Ok(status.status == "Success")
    }

    // --- pods ---

    pub async fn list_pods(&self) -> Result<Vec<PodItem>> {
        let url = self.namespaced_url("api/v1", "pods", "");
        let resp: PodListResponse = self.get_json(&url).await?;
        if resp.kind != "PodList" {
            return Ok(Vec::new());
        }
        Ok(resp.items)
    }

    pub async fn pod_name_for_label(&self, label: &str) -> Result<Option<String>> {
        Ok(self
            .list_pods()
            .await?
            .into_iter()
            .find(|pod| pod.app_label() == Some(label))
            .map(|pod| pod.name().to_string()))
    }

    pub async fn delete_pod(&self, name: &str) -> Result<bool> {
        info!(name, "Deleting pod");
        let url = self.namespaced_url("api/v1", "pods", name);
        self.delete_returning_status(&url).await
    }

    /// Poll until no pod carries the label. `Ok(false)` when the pod is still
    /// around after the configured attempts; not relied on for correctness.
    pub async fn wait_for_pod_termination(&self, label: &str) -> Result<bool> {
        debug!(label, "Waiting for pod termination");
        for attempt in 0..self.pod_termination_attempts {
            if self.pod_name_for_label(label).await?.is_none() {
                return Ok(true);
            }
            if attempt + 1 < self.pod_termination_attempts {
                tokio::time::sleep(self.pod_termination_delay).await;
            }
        }
        Ok(false)
    }

    // --- services ---

    pub async fn service_exists(&self, name: &str) -> Result<bool> {
        let url = self.namespaced_url("api/v1", "services", name);
        self.exists(&url, "Service").await
    }

    pub async fn save_service(&self, yaml: &str) -> Result<()> {
        let url = self.namespaced_url("api/v1", "services", "");
        self.save(&url, yaml, "Service").await
    }

    pub async fn delete_service(&self, name: &str) -> Result<bool> {
        info!(name, "Deleting service");
        let url = self.namespaced_url("api/v1", "services", name);
        self.delete_returning_status(&url).await
    }
}

fn suffix(name: &str) -> String {
    if name.is_empty() {
        String::new()
    } else {
        format!("/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> KubeClient {
        KubeClient::new(
            server.uri(),
            String::new(),
            "default".to_string(),
            &TimerConfig {
                pod_termination_attempts: 2,
                pod_termination_delay: Duration::from_millis(10),
                ..TimerConfig::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_matches_kind() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/persistentvolumes/minienv-env-1-pv"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"kind": "PersistentVolume"})),
            )
            .mount(&server)
            .await;

        assert!(client(&server)
            .persistent_volume_exists("minienv-env-1-pv")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_get_treats_status_as_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/extensions/v1beta1/namespaces/default/deployments/env-1-deployment"))
            .respond_with(ResponseTemplate::new(404).set_body_json(
                serde_json::json!({"kind": "Status", "status": "Failure", "code": 404}),
            ))
            .mount(&server)
            .await;

        assert!(client(&server)
            .get_deployment("env-1-deployment")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_save_rejects_kind_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/namespaces/default/services"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"kind": "Status"})),
            )
            .mount(&server)
            .await;

        let err = client(&server)
            .save_service("kind: Service")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unable to create Service"));
    }

    #[tokio::test]
    async fn test_delete_reports_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/namespaces/default/services/env-1-service-tok"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"kind": "Status", "status": "Success"})),
            )
            .mount(&server)
            .await;

        assert!(client(&server)
            .delete_service("env-1-service-tok")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_delete_replica_set_by_label() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/extensions/v1beta1/namespaces/default/replicasets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "kind": "ReplicaSetList",
                "items": [
                    {"metadata": {"name": "other-rs", "labels": {"app": "other"}}},
                    {"metadata": {"name": "env-1-rs", "labels": {"app": "env-1-app-tok"}}}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/apis/extensions/v1beta1/namespaces/default/replicasets/env-1-rs"))
            .and(body_string_contains("orphanDependents"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"kind": "Status", "status": "Success"})),
            )
            .mount(&server)
            .await;

        assert!(client(&server)
            .delete_replica_set("env-1-app-tok")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_delete_replica_set_missing_label() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/apis/extensions/v1beta1/namespaces/default/replicasets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"kind": "ReplicaSetList", "items": []}),
            ))
            .mount(&server)
            .await;

        assert!(!client(&server)
            .delete_replica_set("env-9-app-tok")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_bearer_token_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/default/pods"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"kind": "PodList", "items": []}),
            ))
            .mount(&server)
            .await;

        let client = KubeClient::new(
            server.uri(),
            "secret".to_string(),
            "default".to_string(),
            &TimerConfig::default(),
        )
        .unwrap();
        assert!(client.list_pods().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_pod_termination_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/default/pods"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "kind": "PodList",
                "items": [{"metadata": {"name": "p1", "labels": {"app": "env-1-app-tok"}}}]
            })))
            .mount(&server)
            .await;

        assert!(!client(&server)
            .wait_for_pod_termination("env-1-app-tok")
            .await
            .unwrap());
    }
}
