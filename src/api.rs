//! REST API server
//!
//! Drives the pool through claim -> up -> ping under user-supplied claim
//! tokens, with CORS + no-store cache headers on every response and an auth
//! gate on the protected endpoints. Every URL returned to a client has the
//! `$sessionId` sentinel stamped with the caller's session at response time.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::auth::{AuthProvider, User, UserStore};
use crate::config::{Config, WhitelistRepo, DEFAULT_BRANCH};
use crate::env::planner::SESSION_ID_VAR;
use crate::env::pool::{EnvPool, UpError};
use crate::env::{service_name, DeploymentDetails};
use crate::error::ApiError;
use crate::repo::{DeploymentRepo, RepoFetcher};
use crate::session::{generate_session_id, Session, SessionStore};

pub const SESSION_ID_HEADER: &str = "Minienv-Session-Id";
pub const ACCESS_TOKEN_HEADER: &str = "X-Access-Token";

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<EnvPool>,
    pub sessions: Arc<dyn SessionStore>,
    pub users: Arc<dyn UserStore>,
    pub auth: Option<Arc<dyn AuthProvider>>,
    pub fetcher: Arc<RepoFetcher>,
    pub config: Arc<Config>,
}

/// User and session resolved by the auth gate for a protected request.
#[derive(Clone, Default)]
struct AuthContext {
    user: Option<User>,
    session: Option<Session>,
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/claim", post(claim))
        .route("/whitelist", get(whitelist))
        .route("/ping", post(ping))
        .route("/info", post(info))
        .route("/up", post(up))
        .route_layer(middleware::from_fn_with_state(state.clone(), authorize));
    Router::new()
        .route("/", get(root))
        .route("/me", get(me))
        .route("/auth/callback", get(auth_callback))
        .merge(protected)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            cors_and_cache,
        ))
        .with_state(state)
}

// --- wire types ---

#[derive(Debug, Serialize)]
pub struct MeResponse {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub authenticated: bool,
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    #[serde(rename = "claimGranted")]
    pub claim_granted: bool,
    #[serde(rename = "claimToken")]
    pub claim_token: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct WhitelistResponse {
    pub repos: Option<Vec<WhitelistRepo>>,
}

#[derive(Debug, Deserialize)]
pub struct PingRequest {
    #[serde(rename = "claimToken")]
    pub claim_token: String,
    #[serde(rename = "getEnvDetails", default)]
    pub get_env_details: bool,
}

#[derive(Debug, Serialize)]
pub struct PingResponse {
    #[serde(rename = "claimGranted")]
    pub claim_granted: bool,
    pub up: bool,
    pub repo: String,
    pub branch: String,
    #[serde(rename = "envDetails")]
    pub env_details: Option<EnvUpResponse>,
}

#[derive(Debug, Deserialize)]
pub struct EnvInfoRequest {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct EnvInfoResponse {
    pub env: Option<EnvInfoEnv>,
}

#[derive(Debug, Serialize)]
pub struct EnvInfoEnv {
    pub platform: String,
    pub vars: Option<Vec<EnvInfoVar>>,
}

#[derive(Debug, Serialize)]
pub struct EnvInfoVar {
    pub name: String,
    #[serde(rename = "defaultValue")]
    pub default_value: String,
}

#[derive(Debug, Deserialize)]
pub struct EnvUpRequest {
    #[serde(rename = "claimToken")]
    pub claim_token: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(rename = "expirationSeconds", default)]
    pub expiration_seconds: Option<i64>,
    #[serde(rename = "envVars", default)]
    pub env_vars: Option<HashMap<String, String>>,
}

#[derive(Debug, Serialize)]
pub struct EnvUpResponse {
    #[serde(rename = "logUrl")]
    pub log_url: String,
    #[serde(rename = "editorUrl")]
    pub editor_url: String,
    pub tabs: Vec<TabResponse>,
}

#[derive(Debug, Serialize)]
pub struct TabResponse {
    pub port: i64,
    pub url: String,
    pub hide: bool,
    pub name: String,
    pub path: String,
}

// --- middleware ---

async fn cors_and_cache(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        apply_cors_and_cache_headers(&mut response, &state.config.allow_origin);
        return response;
    }
    let mut response = next.run(request).await;
    apply_cors_and_cache_headers(&mut response, &state.config.allow_origin);
    response
}

fn apply_cors_and_cache_headers(response: &mut Response, allow_origin: &str) {
    let headers = response.headers_mut();
    if let Ok(origin) = HeaderValue::from_str(allow_origin) {
        headers.insert(HeaderName::from_static("access-control-allow-origin"), origin);
    }
    let allow = HeaderName::from_static("access-control-allow-headers");
    headers.append(&allow, HeaderValue::from_static("Content-Type"));
    headers.append(&allow, HeaderValue::from_static(SESSION_ID_HEADER));
    headers.append(&allow, HeaderValue::from_static(ACCESS_TOKEN_HEADER));
    headers.insert(
        HeaderName::from_static("cache-control"),
        HeaderValue::from_static("no-store, must-revalidate"),
    );
    headers.insert(HeaderName::from_static("expires"), HeaderValue::from_static("0"));
}

/// Auth gate for the protected endpoints. With no provider configured the
/// request runs unauthenticated (the session is still resolved so response
/// URLs can be bound to it).
async fn authorize(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let session_id = header_value(request.headers(), SESSION_ID_HEADER);
    let access_token = header_value(request.headers(), ACCESS_TOKEN_HEADER);

    let context = match &state.auth {
        None => AuthContext {
            user: None,
            session: lookup_session(&state, &session_id).await,
        },
        Some(provider) => {
            if session_id.is_empty() && access_token.is_empty() {
                return Err(ApiError::NotAuthenticated);
            }
            if !access_token.is_empty() {
                let user = match state.users.get(&access_token).await.ok().flatten() {
                    Some(user) => user,
                    None => {
                        let user = provider
                            .login_user(&access_token)
                            .await
                            .map_err(|_| ApiError::NotAuthenticated)?;
                        let _ = state.users.set(&access_token, &user).await;
                        user
                    }
                };
                AuthContext {
                    user: Some(user),
                    session: None,
                }
            } else {
                let session = lookup_session(&state, &session_id)
                    .await
                    .filter(|s| s.user.is_some())
                    .ok_or(ApiError::NotAuthenticated)?;
                AuthContext {
                    user: session.user.clone(),
                    session: Some(session),
                }
            }
        }
    };
    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

async fn lookup_session(state: &AppState, session_id: &str) -> Option<Session> {
    if session_id.is_empty() {
        return None;
    }
    state.sessions.get(session_id).await.ok().flatten()
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

// --- handlers ---

async fn root() -> StatusCode {
    StatusCode::OK
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> Json<MeResponse> {
    let session = get_or_create_session(&state, &headers).await;
    Json(me_response(&session))
}

async fn auth_callback(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<MeResponse>, ApiError> {
    let mut session = get_or_create_session(&state, &headers).await;
    let provider = state.auth.as_ref().ok_or(ApiError::AuthFailed)?;
    let user = provider
        .on_auth_callback(&params)
        .await
        .map_err(|_| ApiError::AuthFailed)?;
    let _ = state.users.set(&user.access_token, &user).await;
    session.user = Some(user);
    let _ = state.sessions.set(&session.id.clone(), &session).await;
    Ok(Json(me_response(&session)))
}

async fn claim(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthContext>,
) -> Json<ClaimResponse> {
    match state.pool.claim().await {
        Some(claim_token) => Json(ClaimResponse {
            claim_granted: true,
            claim_token,
            message: String::new(),
        }),
        None => {
            warn!("Claim failed; no environments available");
            Json(ClaimResponse {
                claim_granted: false,
                claim_token: String::new(),
                message: "No environments available".to_string(),
            })
        }
    }
}

async fn whitelist(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthContext>,
) -> Json<WhitelistResponse> {
    Json(WhitelistResponse {
        repos: state.config.whitelist.clone(),
    })
}

async fn ping(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    payload: Result<Json<PingRequest>, JsonRejection>,
) -> Result<Json<PingResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.to_string()))?;

    // The repo-view permission gates whether the claim resolves at all.
    if let (Some(provider), Some(user)) = (&state.auth, &auth.user) {
        if let Some(repo) = state.pool.repo_for_token(&request.claim_token).await {
            if !repo.is_empty()
                && !provider.user_can_view_repo(user, &repo).await.unwrap_or(false)
            {
                return Ok(Json(PingResponse {
                    claim_granted: false,
                    up: false,
                    repo: String::new(),
                    branch: String::new(),
                    env_details: None,
                }));
            }
        }
    }

    let outcome = state
        .pool
        .ping(&request.claim_token, request.get_env_details)
        .await
        .map_err(ApiError::Upstream)?;
    let env_details = match &outcome.details {
        Some(details) => Some(env_up_response(&state, details, auth.session).await),
        None => None,
    };
    Ok(Json(PingResponse {
        claim_granted: outcome.claim_granted,
        up: outcome.up,
        repo: outcome.repo,
        branch: outcome.branch,
        env_details,
    }))
}

async fn info(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    payload: Result<Json<EnvInfoRequest>, JsonRejection>,
) -> Result<Json<EnvInfoResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let branch = branch_or_default(&request.branch);
    if !state.config.repo_allowed(&request.repo, &branch) {
        warn!(repo = %request.repo, %branch, "Info request failed; repo not whitelisted");
        return Err(ApiError::RepoNotAllowed);
    }
    let (username, password) =
        credentials_for_request(&request.username, &request.password, &auth.user);
    let repo = DeploymentRepo {
        repo: request.repo,
        branch,
        username,
        password,
    };
    let env_config = state
        .fetcher
        .fetch_env_config(&repo)
        .await
        .map_err(ApiError::Upstream)?;
    let env = env_config.map(|config| EnvInfoEnv {
        platform: config
            .runtime
            .map(|r| r.platform)
            .unwrap_or_default(),
        vars: config
            .metadata
            .and_then(|m| m.env)
            .and_then(|e| e.vars)
            .map(|vars| {
                vars.into_iter()
                    .map(|v| EnvInfoVar {
                        name: v.name,
                        default_value: v.default_value,
                    })
                    .collect()
            }),
    });
    Ok(Json(EnvInfoResponse { env }))
}

async fn up(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    payload: Result<Json<EnvUpRequest>, JsonRejection>,
) -> Result<Json<EnvUpResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let branch = branch_or_default(&request.branch);

    if state.pool.repo_for_token(&request.claim_token).await.is_none() {
        warn!("Up request failed; claim no longer valid");
        return Err(ApiError::InvalidClaim);
    }
    if !state.config.repo_allowed(&request.repo, &branch) {
        warn!(repo = %request.repo, %branch, "Up request failed; repo not whitelisted");
        return Err(ApiError::RepoNotAllowed);
    }

    let (username, password) =
        credentials_for_request(&request.username, &request.password, &auth.user);
    let repo = DeploymentRepo {
        repo: request.repo,
        branch,
        username,
        password,
    };
    let env_vars = request.env_vars.unwrap_or_default();
    let details = state
        .pool
        .up(
            &request.claim_token,
            &repo,
            &env_vars,
            request.expiration_seconds,
        )
        .await
        .map_err(|err| match err {
            UpError::InvalidClaim => ApiError::InvalidClaim,
            UpError::Orchestrator(err) => ApiError::Upstream(err),
        })?;
    Ok(Json(env_up_response(&state, &details, auth.session).await))
}

// --- helpers ---

fn me_response(session: &Session) -> MeResponse {
    MeResponse {
        session_id: session.id.clone(),
        authenticated: session.user.is_some(),
        username: session
            .user
            .as_ref()
            .map(|u| u.username.clone())
            .unwrap_or_default(),
    }
}

async fn get_or_create_session(state: &AppState, headers: &HeaderMap) -> Session {
    let session_id = header_value(headers, SESSION_ID_HEADER);
    if let Some(session) = lookup_session(state, &session_id).await {
        return session;
    }
    let session = Session::new(generate_session_id());
    let _ = state.sessions.set(&session.id.clone(), &session).await;
    session
}

fn branch_or_default(branch: &str) -> String {
    if branch.is_empty() {
        DEFAULT_BRANCH.to_string()
    } else {
        branch.to_string()
    }
}

/// Explicit request credentials win; otherwise an authenticated user's access
/// token is passed as `x-access-token`.
fn credentials_for_request(
    username: &str,
    password: &str,
    user: &Option<User>,
) -> (String, String) {
    if username.is_empty() {
        if let Some(user) = user {
            if !user.access_token.is_empty() {
                return ("x-access-token".to_string(), user.access_token.clone());
            }
        }
    }
    (username.to_string(), password.to_string())
}

/// Stamp the `$sessionId` sentinel in every URL with `{hex(now)}-{sessionId}`
/// and bind the environment to the caller's session.
async fn env_up_response(
    state: &AppState,
    details: &DeploymentDetails,
    session: Option<Session>,
) -> EnvUpResponse {
    let mut session_id = String::new();
    if let Some(mut session) = session {
        session_id = session.id.clone();
        session.env_id = details.env_id.clone();
        let env_id = details.env_id.parse().unwrap_or(0);
        session.env_service_name = service_name(env_id, &details.claim_token);
        let _ = state.sessions.set(&session.id.clone(), &session).await;
    }
    let stamped = format!("{:x}-{}", Utc::now().timestamp(), session_id);
    EnvUpResponse {
        log_url: details.log_url.replace(SESSION_ID_VAR, &stamped),
        editor_url: details.editor_url.replace(SESSION_ID_VAR, &stamped),
        tabs: details
            .tabs
            .iter()
            .map(|tab| TabResponse {
                port: tab.port,
                url: tab.url.replace(SESSION_ID_VAR, &stamped),
                hide: tab.hide,
                name: tab.name.clone(),
                path: tab.path.clone(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::InMemoryUserStore;
    use crate::config::{KubeApiConfig, Templates, TimerConfig};
    use crate::env::planner::DeploymentPlanner;
    use crate::env::provisioner::Provisioner;
    use crate::k8s::KubeClient;
    use crate::session::InMemorySessionStore;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let config = Arc::new(Config {
            port: 8080,
            version: "latest".into(),
            image: "minienv/minienv:latest".into(),
            redis: None,
            storage_class: None,
            provision_volume_size: "5Gi".into(),
            provision_images: String::new(),
            kube: KubeApiConfig {
                base_url: "http://127.0.0.1:1".into(),
                token_path: None,
                namespace: "default".into(),
            },
            node_host_name: "minienv.local".into(),
            node_name_override: String::new(),
            node_host_protocol: "http".into(),
            storage_driver: "aufs".into(),
            allow_origin: "https://minienv.local".into(),
            env_count: 0,
            whitelist: None,
            timers: TimerConfig::default(),
        });
        let templates = Arc::new(Templates {
            pv: None,
            pvc: String::new(),
            deployment: String::new(),
            service: String::new(),
            provisioner_job: String::new(),
        });
        let kube = Arc::new(
            KubeClient::new(
                config.kube.base_url.clone(),
                String::new(),
                config.kube.namespace.clone(),
                &config.timers,
            )
            .unwrap(),
        );
        let planner = Arc::new(DeploymentPlanner::new(
            config.clone(),
            templates.clone(),
            RepoFetcher::new().unwrap(),
        ));
        let provisioner =
            Provisioner::new(kube.clone(), config.clone(), templates, planner.clone());
        let pool = Arc::new(EnvPool::new(kube, planner, provisioner, config.clone()));
        AppState {
            pool,
            sessions: Arc::new(InMemorySessionStore::new()),
            users: Arc::new(InMemoryUserStore::new()),
            auth: None,
            fetcher: Arc::new(RepoFetcher::new().unwrap()),
            config,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_me_creates_session() {
        let app = router(test_state());
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/me")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["sessionId"].as_str().unwrap().len(), 32);
        assert_eq!(json["authenticated"], false);
    }

    #[tokio::test]
    async fn test_cors_and_cache_headers() {
        let app = router(test_state());
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/me")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let headers = response.headers();
        assert_eq!(
            headers.get("access-control-allow-origin").unwrap(),
            "https://minienv.local"
        );
        let allow: Vec<_> = headers
            .get_all("access-control-allow-headers")
            .iter()
            .collect();
        assert_eq!(allow.len(), 3);
        assert_eq!(
            headers.get("cache-control").unwrap(),
            "no-store, must-revalidate"
        );
    }

    #[tokio::test]
    async fn test_options_short_circuits() {
        let app = router(test_state());
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("OPTIONS")
                    .uri("/claim")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get("access-control-allow-origin")
            .is_some());
    }

    #[tokio::test]
    async fn test_claim_exhausted_pool() {
        let app = router(test_state());
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/claim")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["claimGranted"], false);
        assert_eq!(json["message"], "No environments available");
    }

    #[tokio::test]
    async fn test_up_invalid_claim_is_401() {
        let app = router(test_state());
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/up")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"claimToken":"nope","repo":"https://x/y"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_ping_malformed_body_is_400() {
        let app = router(test_state());
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/ping")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_whitelist_echoes_config() {
        let mut state = test_state();
        let mut config = (*state.config).clone();
        config.whitelist = crate::config::parse_whitelist("demo|https://x/y|dev");
        state.config = Arc::new(config);
        let app = router(state);
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/whitelist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["repos"][0]["name"], "demo");
        assert_eq!(json["repos"][0]["branch"], "dev");
    }

    #[test]
    fn test_credentials_fall_back_to_access_token() {
        let user = Some(User {
            access_token: "tok".into(),
            ..User::default()
        });
        assert_eq!(
            credentials_for_request("", "", &user),
            ("x-access-token".to_string(), "tok".to_string())
        );
        assert_eq!(
            credentials_for_request("u", "p", &user),
            ("u".to_string(), "p".to_string())
        );
    }

    #[test]
    fn test_branch_default() {
        assert_eq!(branch_or_default(""), "master");
        assert_eq!(branch_or_default("dev"), "dev");
    }
}
