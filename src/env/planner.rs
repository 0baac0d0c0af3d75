//! Deployment planner
//!
//! Computes the `DeploymentDetails` for an environment (ports, URLs, tabs)
//! and renders the PV/PVC/Service/Deployment manifests by literal `$variable`
//! substitution in the opaque YAML templates.
//!
//! Substitution is ordered: within a template, variables that share a prefix
//! are replaced longest first (`$gitRepoWithCreds` before `$gitRepo`,
//! `$platformPort` and `$platformCommand` before `$platform`). The tables
//! below are that order; keep them sorted that way when adding variables.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use super::tabs::{discover_tabs, merge_app_tabs};
use super::{
    app_label, deployment_name, persistent_volume_claim_name, persistent_volume_name,
    persistent_volume_path, service_name, DeploymentDetails,
};
use crate::config::{Config, Templates};
use crate::repo::{DeploymentRepo, RepoFetcher};

pub const DEFAULT_LOG_PORT: i64 = 8001;
pub const DEFAULT_EDITOR_PORT: i64 = 8002;
pub const DEFAULT_APP_PROXY_PORT: i64 = 8003;

/// Sentinel substituted per-request at response time.
pub const SESSION_ID_VAR: &str = "$sessionId";

pub struct DeploymentPlanner {
    config: Arc<Config>,
    templates: Arc<Templates>,
    fetcher: RepoFetcher,
}

impl DeploymentPlanner {
    pub fn new(config: Arc<Config>, templates: Arc<Templates>, fetcher: RepoFetcher) -> Self {
        Self {
            config,
            templates,
            fetcher,
        }
    }

    /// Compute the details for an environment about to be deployed: fetch the
    /// repo's env config and compose document, discover tabs, pick disjoint
    /// ports, and shape the sentinel-bearing URLs.
    pub async fn plan(
        &self,
        env_id: u32,
        claim_token: &str,
        repo: &DeploymentRepo,
    ) -> Result<DeploymentDetails> {
        let env_config = self.fetcher.fetch_env_config(repo).await?;
        let compose = self.fetcher.fetch_compose(repo).await?;
        let mut tabs = compose.as_ref().map(discover_tabs).unwrap_or_default();
        if let Some(specs) = env_config
            .as_ref()
            .and_then(|c| c.metadata.as_ref())
            .and_then(|m| m.app_tabs.as_ref())
        {
            merge_app_tabs(&mut tabs, specs);
        }

        let tab_ports: Vec<i64> = tabs.iter().map(|t| t.port).collect();
        let log_port = next_free_port(DEFAULT_LOG_PORT, &tab_ports, &[]);
        let editor_port = next_free_port(DEFAULT_EDITOR_PORT, &tab_ports, &[log_port]);
        let app_proxy_port =
            next_free_port(DEFAULT_APP_PROXY_PORT, &tab_ports, &[log_port, editor_port]);

        let proto = &self.config.node_host_protocol;
        let host = &self.config.node_host_name;
        let hide_editor = env_config
            .as_ref()
            .and_then(|c| c.metadata.as_ref())
            .and_then(|m| m.editor_tab.as_ref())
            .is_some_and(|t| t.hide);

        for tab in &mut tabs {
            tab.url = format!(
                "{proto}://{SESSION_ID_VAR}-{app_proxy_port}-{}.{host}{}",
                tab.port, tab.path
            );
        }

        Ok(DeploymentDetails {
            node_host_name: host.clone(),
            env_id: env_id.to_string(),
            claim_token: claim_token.to_string(),
            log_port: log_port.to_string(),
            log_url: format!("{proto}://{SESSION_ID_VAR}-{log_port}.{host}"),
            editor_port: editor_port.to_string(),
            editor_url: if hide_editor {
                String::new()
            } else {
                format!("{proto}://{SESSION_ID_VAR}-{editor_port}.{host}")
            },
            app_proxy_port: app_proxy_port.to_string(),
            tabs,
            env_config,
        })
    }

    pub fn render_pv_yaml(&self, env_id: u32) -> Option<String> {
        let template = self.templates.pv.as_ref()?;
        Some(substitute(
            template,
            &[
                ("$pvSize", &self.config.provision_volume_size),
                ("$pvName", &persistent_volume_name(env_id)),
                ("$pvPath", &persistent_volume_path(env_id)),
            ],
        ))
    }

    pub fn render_pvc_yaml(&self, env_id: u32) -> String {
        substitute(
            &self.templates.pvc,
            &[
                ("$pvSize", &self.config.provision_volume_size),
                ("$pvcName", &persistent_volume_claim_name(env_id)),
                (
                    "$pvcStorageClass",
                    self.config.storage_class.as_deref().unwrap_or(""),
                ),
            ],
        )
    }

    pub fn render_service_yaml(&self, details: &DeploymentDetails) -> String {
        let env_id = slot_id(details);
        substitute(
            &self.templates.service,
            &[
                ("$serviceName", &service_name(env_id, &details.claim_token)),
                ("$appLabel", &app_label(env_id, &details.claim_token)),
                ("$logPort", &details.log_port),
                ("$editorPort", &details.editor_port),
                ("$appProxyPort", &details.app_proxy_port),
            ],
        )
    }

    pub fn render_deployment_yaml(
        &self,
        details: &DeploymentDetails,
        repo: &DeploymentRepo,
        env_vars: &HashMap<String, String>,
    ) -> String {
        let env_id = slot_id(details);
        let config = &self.config;
        let runtime = details
            .env_config
            .as_ref()
            .and_then(|c| c.runtime.as_ref());
        let editor_src_dir = details
            .env_config
            .as_ref()
            .and_then(|c| c.metadata.as_ref())
            .and_then(|m| m.editor_tab.as_ref())
            .map_or("", |t| t.src_dir.as_str());
        let platform_port = runtime.map_or(String::new(), |r| r.port.to_string());

        substitute(
            &self.templates.deployment,
            &[
                ("$minienvVersion", &config.version),
                ("$minienvImage", &config.image),
                ("$nodeNameOverride", &config.node_name_override),
                ("$nodeHostProtocol", &config.node_host_protocol),
                ("$allowOrigin", &config.allow_origin),
                ("$storageDriver", &config.storage_driver),
                // longer name first: $gitRepoWithCreds shares the $gitRepo prefix
                ("$gitRepoWithCreds", &repo.with_credentials()),
                ("$gitRepo", &repo.repo),
                ("$gitBranch", &repo.branch),
                ("$appProxyPort", &details.app_proxy_port),
                ("$logPort", &details.log_port),
                ("$editorPort", &details.editor_port),
                ("$editorSrcDir", editor_src_dir),
                // $platformPort / $platformCommand before their prefix $platform
                ("$platformPort", &platform_port),
                (
                    "$platformCommand",
                    runtime.map_or("", |r| r.command.as_str()),
                ),
                ("$platform", runtime.map_or("", |r| r.platform.as_str())),
                ("$deploymentName", &deployment_name(env_id)),
                ("$appLabel", &app_label(env_id, &details.claim_token)),
                ("$claimToken", &details.claim_token),
                ("$envDetails", &details.to_annotation_string()),
                ("$envVars", &render_env_vars_yaml(env_vars)),
                ("$pvcName", &persistent_volume_claim_name(env_id)),
            ],
        )
    }
}

fn slot_id(details: &DeploymentDetails) -> u32 {
    details.env_id.parse().unwrap_or(0)
}

/// Ordered literal replacement.
pub(crate) fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(name, value);
    }
    out
}

/// Smallest port >= `candidate` that collides with neither a tab port nor an
/// already-chosen core port.
fn next_free_port(candidate: i64, tab_ports: &[i64], taken: &[i64]) -> i64 {
    let mut port = candidate;
    while taken.contains(&port) || tab_ports.contains(&port) {
        port += 1;
    }
    port
}

/// Per-request user vars rendered as YAML list items under the container's
/// `env:` key. Keys are emitted in sorted order.
fn render_env_vars_yaml(env_vars: &HashMap<String, String>) -> String {
    let mut keys: Vec<&String> = env_vars.keys().collect();
    keys.sort();
    keys.iter()
        .map(|k| format!("          - name: {k}\n            value: \"{}\"", env_vars[*k]))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KubeApiConfig, TimerConfig};
    use crate::env::DeploymentTab;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config() -> Config {
        Config {
            port: 8080,
            version: "latest".into(),
            image: "minienv/minienv:latest".into(),
            redis: None,
            storage_class: None,
            provision_volume_size: "5Gi".into(),
            provision_images: String::new(),
            kube: KubeApiConfig {
                base_url: "https://kube:443".into(),
                token_path: None,
                namespace: "default".into(),
            },
            node_host_name: "minienv.local".into(),
            node_name_override: String::new(),
            node_host_protocol: "http".into(),
            storage_driver: "aufs".into(),
            allow_origin: "*".into(),
            env_count: 1,
            whitelist: None,
            timers: TimerConfig::default(),
        }
    }

    fn test_templates() -> Templates {
        Templates {
            pv: Some("name: $pvName\npath: $pvPath\nsize: $pvSize\n".into()),
            pvc: "name: $pvcName\nclass: $pvcStorageClass\nsize: $pvSize\n".into(),
            deployment: "repoWithCreds: $gitRepoWithCreds\nrepo: $gitRepo\nbranch: $gitBranch\n\
                         details: \"$envDetails\"\nenv:\n$envVars\n"
                .into(),
            service: "name: $serviceName\napp: $appLabel\nports: $logPort $editorPort $appProxyPort\n"
                .into(),
            provisioner_job: "job: $jobName\napp: $appLabel\n".into(),
        }
    }

    fn planner(config: Config) -> DeploymentPlanner {
        DeploymentPlanner::new(
            Arc::new(config),
            Arc::new(test_templates()),
            RepoFetcher::new().unwrap(),
        )
    }

    #[test]
    fn test_next_free_port_skips_collisions() {
        assert_eq!(next_free_port(8001, &[], &[]), 8001);
        assert_eq!(next_free_port(8001, &[8001, 8002], &[]), 8003);
        assert_eq!(next_free_port(8002, &[8003], &[8002]), 8004);
    }

    #[test]
    fn test_replacement_order_with_shared_prefix() {
        let rendered = substitute(
            "a: $gitRepoWithCreds b: $gitRepo",
            &[
                ("$gitRepoWithCreds", "https://u:p@x/y"),
                ("$gitRepo", "https://x/y"),
            ],
        );
        assert_eq!(rendered, "a: https://u:p@x/y b: https://x/y");
    }

    #[test]
    fn test_env_vars_yaml_block() {
        let mut vars = HashMap::new();
        vars.insert("B".to_string(), "2".to_string());
        vars.insert("A".to_string(), "1".to_string());
        let yaml = render_env_vars_yaml(&vars);
        assert_eq!(
            yaml,
            "          - name: A\n            value: \"1\"\n          - name: B\n            value: \"2\""
        );
    }

    #[tokio::test]
    async fn test_plan_ports_and_urls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a/b/master/docker-compose.yml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "services:\n  web:\n    ports:\n      - \"8080:80\"\n",
            ))
            .mount(&server)
            .await;

        let planner = planner(test_config());
        let repo = DeploymentRepo {
            repo: format!("{}/a/b", server.uri()),
            branch: "master".into(),
            ..DeploymentRepo::default()
        };
        let details = planner.plan(1, "tok", &repo).await.unwrap();

        assert_eq!(details.log_port, "8001");
        assert_eq!(details.editor_port, "8002");
        assert_eq!(details.app_proxy_port, "8003");
        assert_eq!(details.log_url, "http://$sessionId-8001.minienv.local");
        assert_eq!(details.editor_url, "http://$sessionId-8002.minienv.local");
        assert_eq!(details.tabs.len(), 1);
        assert_eq!(
            details.tabs[0].url,
            "http://$sessionId-8003-8080.minienv.local"
        );
    }

    #[tokio::test]
    async fn test_plan_shifts_ports_off_tab_collisions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a/b/master/docker-compose.yml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "services:\n  web:\n    ports:\n      - \"8001:80\"\n      - \"8002:81\"\n",
            ))
            .mount(&server)
            .await;

        let planner = planner(test_config());
        let repo = DeploymentRepo {
            repo: format!("{}/a/b", server.uri()),
            branch: "master".into(),
            ..DeploymentRepo::default()
        };
        let details = planner.plan(1, "tok", &repo).await.unwrap();

        // 8001 and 8002 are tab ports, so the core ports slide up
        assert_eq!(details.log_port, "8003");
        assert_eq!(details.editor_port, "8004");
        assert_eq!(details.app_proxy_port, "8005");

        // all four port sets are disjoint
        let mut ports = vec![
            details.log_port.clone(),
            details.editor_port.clone(),
            details.app_proxy_port.clone(),
        ];
        ports.extend(details.tabs.iter().map(|t| t.port.to_string()));
        let unique: std::collections::HashSet<_> = ports.iter().collect();
        assert_eq!(unique.len(), ports.len());
    }

    #[tokio::test]
    async fn test_plan_missing_compose_yields_no_tabs() {
        let server = MockServer::start().await;
        let planner = planner(test_config());
        let repo = DeploymentRepo {
            repo: format!("{}/a/b", server.uri()),
            branch: "master".into(),
            ..DeploymentRepo::default()
        };
        let details = planner.plan(1, "tok", &repo).await.unwrap();
        assert!(details.tabs.is_empty());
        assert_eq!(details.log_port, "8001");
    }

    #[tokio::test]
    async fn test_plan_hides_editor_url_when_configured() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a/b/master/minienv.yml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "metadata:\n  editorTab:\n    hide: true\n    srcDir: /src\n",
            ))
            .mount(&server)
            .await;

        let planner = planner(test_config());
        let repo = DeploymentRepo {
            repo: format!("{}/a/b", server.uri()),
            branch: "master".into(),
            ..DeploymentRepo::default()
        };
        let details = planner.plan(1, "tok", &repo).await.unwrap();
        assert!(details.editor_url.is_empty());
        assert_eq!(details.editor_port, "8002");
    }

    #[test]
    fn test_render_deployment_escapes_details() {
        let planner = planner(test_config());
        let details = DeploymentDetails {
            env_id: "1".into(),
            claim_token: "tok".into(),
            log_port: "8001".into(),
            editor_port: "8002".into(),
            app_proxy_port: "8003".into(),
            tabs: vec![DeploymentTab::from_port(8080)],
            ..DeploymentDetails::default()
        };
        let repo = DeploymentRepo {
            repo: "https://github.com/a/b".into(),
            branch: "master".into(),
            username: "u".into(),
            password: "p".into(),
        };
        let yaml = planner.render_deployment_yaml(&details, &repo, &HashMap::new());
        assert!(yaml.contains("repoWithCreds: https://u:p@github.com/a/b"));
        assert!(yaml.contains("repo: https://github.com/a/b"));
        assert!(yaml.contains("\\\"EnvId\\\""));
    }

    #[test]
    fn test_render_service_embeds_claim_token() {
        let planner = planner(test_config());
        let details = DeploymentDetails {
            env_id: "1".into(),
            claim_token: "TOK".into(),
            log_port: "8001".into(),
            editor_port: "8002".into(),
            app_proxy_port: "8003".into(),
            ..DeploymentDetails::default()
        };
        let yaml = planner.render_service_yaml(&details);
        assert!(yaml.contains("name: env-1-service-tok"));
        assert!(yaml.contains("app: env-1-app-tok"));
    }

    #[test]
    fn test_render_pv_pvc() {
        let planner = planner(test_config());
        let pv = planner.render_pv_yaml(1).unwrap();
        assert!(pv.contains("name: minienv-env-1-pv"));
        assert!(pv.contains("path: /minienv-env-1"));
        assert!(pv.contains("size: 5Gi"));

        let pvc = planner.render_pvc_yaml(1);
        assert!(pvc.contains("name: env-1-pvc"));
        assert!(pvc.contains("class: \n") || pvc.contains("class: "));
    }
}
