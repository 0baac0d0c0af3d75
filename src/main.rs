use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use minienv::api::{self, AppState};
use minienv::auth::{InMemoryUserStore, UserStore};
use minienv::config::{Config, Templates};
use minienv::env::planner::DeploymentPlanner;
use minienv::env::pool::EnvPool;
use minienv::env::provisioner::Provisioner;
use minienv::k8s::KubeClient;
use minienv::repo::RepoFetcher;
use minienv::session::{InMemorySessionStore, RedisSessionStore, SessionStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let config = Arc::new(Config::from_env()?);
    let templates = Arc::new(Templates::load(
        Path::new("."),
        config.host_path_volumes(),
    )?);

    let kube_token = match &config.kube.token_path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("cannot read orchestrator token file {path}"))?
            .trim()
            .to_string(),
        None => String::new(),
    };
    let kube = Arc::new(KubeClient::new(
        config.kube.base_url.clone(),
        kube_token,
        config.kube.namespace.clone(),
        &config.timers,
    )?);

    let sessions: Arc<dyn SessionStore> = match &config.redis {
        Some(redis_config) => match RedisSessionStore::connect(redis_config).await {
            Ok(store) => {
                info!(address = %redis_config.address, "Using Redis session store");
                Arc::new(store)
            }
            Err(err) => {
                warn!(error = %err, "Failed to connect to Redis; using in-memory session store");
                Arc::new(InMemorySessionStore::new())
            }
        },
        None => Arc::new(InMemorySessionStore::new()),
    };
    let users: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::new());

    let planner = Arc::new(DeploymentPlanner::new(
        config.clone(),
        templates.clone(),
        RepoFetcher::new()?,
    ));
    let provisioner = Provisioner::new(
        kube.clone(),
        config.clone(),
        templates.clone(),
        planner.clone(),
    );
    let pool = Arc::new(EnvPool::new(kube, planner, provisioner, config.clone()));

    // Adoption and scale-down complete before the listener binds, so startup
    // never races with requests.
    pool.init().await;
    let _reconciler = pool.spawn_reconciler();

    let state = AppState {
        pool,
        sessions,
        users,
        // An auth provider is an external collaborator; embedders wire one in
        // through the library API.
        auth: None,
        fetcher: Arc::new(RepoFetcher::new()?),
        config: config.clone(),
    };

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "minienv API listening");
    axum::serve(listener, api::router(state))
        .await
        .context("server error")?;
    Ok(())
}
