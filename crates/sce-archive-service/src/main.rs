use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use clap::Parser;
use sce_archive_api::{
    ArchiveApi, BootstrapAdminRequest, CreateObjectRequest, CreatePostRequest, LoginRequest,
    RegisterRequest, API_CONTRACT_VERSION,
};
use sce_archive_core::{
    AccountId, AccountPatch, AccountProfile, ArchiveError, ClearanceLevel, ContentRecord,
    ContentRecordId, ContentRecordPatch, DenyReason, Post, PostId, PostPatch, Role,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::{Args, ServiceConfig};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: ArchiveApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    code: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct VerifyEmailRequest {
    token: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RoleRequest {
    role: Role,
}

#[derive(Debug, Clone, Deserialize)]
struct ClearanceRequest {
    clearance: ClearanceLevel,
}

#[derive(Debug, Clone, Deserialize)]
struct PositionRequest {
    position: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct LogoutResponse {
    revoked: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DeletedResponse {
    id: String,
}

impl ServiceError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            code: "INTERNAL",
            error: message.into(),
        }
    }
}

impl From<ArchiveError> for ServiceError {
    fn from(err: ArchiveError) -> Self {
        let status = match &err {
            ArchiveError::Validation(_) => StatusCode::BAD_REQUEST,
            ArchiveError::DuplicateKey { .. } => StatusCode::CONFLICT,
            ArchiveError::NotFound { .. } => StatusCode::NOT_FOUND,
            ArchiveError::Forbidden(DenyReason::NotAuthenticated) | ArchiveError::Credential => {
                StatusCode::UNAUTHORIZED
            }
            ArchiveError::Forbidden(_) => StatusCode::FORBIDDEN,
            ArchiveError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            code: err.code(),
            error: err.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

fn envelope<T>(data: T) -> Json<ServiceEnvelope<T>>
where
    T: Serialize,
{
    Json(ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    })
}

/// `Authorization: Bearer <token>`, if present.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// Run a blocking archive call off the async runtime.
async fn run_blocking<T, F>(state: ServiceState, op: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce(&ArchiveApi) -> Result<T, ArchiveError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || op(&state.api))
        .await
        .map_err(|err| ServiceError::internal(format!("archive worker failed: {err}")))?
        .map_err(ServiceError::from)
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/auth/bootstrap-admin", post(auth_bootstrap_admin))
        .route("/v1/auth/register", post(auth_register))
        .route("/v1/auth/verify-email", post(auth_verify_email))
        .route("/v1/auth/login", post(auth_login))
        .route("/v1/auth/logout", post(auth_logout))
        .route("/v1/auth/session", get(auth_session))
        .route("/v1/accounts", get(accounts_list))
        .route("/v1/accounts/:account_id", axum::routing::patch(accounts_update_profile))
        .route("/v1/accounts/:account_id/role", put(accounts_set_role))
        .route("/v1/accounts/:account_id/clearance", put(accounts_set_clearance))
        .route("/v1/accounts/:account_id/position", put(accounts_set_position))
        .route("/v1/objects", get(objects_list).post(objects_create))
        .route(
            "/v1/objects/:object_id",
            get(objects_show).patch(objects_update).delete(objects_delete),
        )
        .route("/v1/objects/by-number/:external_number", get(objects_show_by_number))
        .route("/v1/posts", get(posts_list).post(posts_create))
        .route("/v1/posts/:post_id", get(posts_show).patch(posts_update).delete(posts_delete))
        .route("/v1/admin/reset", post(admin_reset))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::resolve(Args::parse())?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_filter.as_str())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(db = %config.db.display(), bind = %config.bind, "starting archive service");
    let state = ServiceState { api: ArchiveApi::new(config.db) };
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    if let Err(err) = axum::serve(listener, app(state)).await {
        error!(error = %err, "archive service stopped");
        return Err(err.into());
    }
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    envelope(HealthResponse { status: "ok" })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<sce_archive_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = run_blocking(state, ArchiveApi::schema_status).await?;
    Ok(envelope(status))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<sce_archive_api::MigrateResult>>, ServiceError> {
    let result = run_blocking(state, move |api| api.migrate(request.dry_run)).await?;
    Ok(envelope(result))
}

async fn auth_bootstrap_admin(
    State(state): State<ServiceState>,
    Json(request): Json<BootstrapAdminRequest>,
) -> Result<Json<ServiceEnvelope<AccountProfile>>, ServiceError> {
    let profile = run_blocking(state, move |api| api.bootstrap_admin(request)).await?;
    Ok(envelope(profile))
}

async fn auth_register(
    State(state): State<ServiceState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<ServiceEnvelope<sce_archive_api::Registration>>, ServiceError> {
    let registration = run_blocking(state, move |api| api.register(request)).await?;
    Ok(envelope(registration))
}

async fn auth_verify_email(
    State(state): State<ServiceState>,
    Json(request): Json<VerifyEmailRequest>,
) -> Result<Json<ServiceEnvelope<sce_archive_api::SessionGrant>>, ServiceError> {
    let grant = run_blocking(state, move |api| api.verify_email(&request.token)).await?;
    Ok(envelope(grant))
}

async fn auth_login(
    State(state): State<ServiceState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<ServiceEnvelope<sce_archive_api::SessionGrant>>, ServiceError> {
    let grant = run_blocking(state, move |api| api.login(request)).await?;
    Ok(envelope(grant))
}

async fn auth_logout(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<LogoutResponse>>, ServiceError> {
    let Some(token) = bearer_token(&headers) else {
        return Err(ArchiveError::Forbidden(DenyReason::NotAuthenticated).into());
    };
    let revoked = run_blocking(state, move |api| api.logout(&token)).await?;
    Ok(envelope(LogoutResponse { revoked }))
}

async fn auth_session(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<AccountProfile>>, ServiceError> {
    let token = bearer_token(&headers);
    let profile = run_blocking(state, move |api| {
        let account = match token {
            Some(token) => api.resolve_session(&token)?,
            None => None,
        };
        account
            .map(|account| account.profile())
            .ok_or(ArchiveError::Forbidden(DenyReason::NotAuthenticated))
    })
    .await?;
    Ok(envelope(profile))
}

async fn accounts_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<AccountProfile>>>, ServiceError> {
    let token = bearer_token(&headers);
    let accounts = run_blocking(state, move |api| {
        let requester = api.resolve_principal(token.as_deref())?;
        api.list_accounts(requester.as_ref())
    })
    .await?;
    Ok(envelope(accounts))
}

async fn accounts_update_profile(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
    Json(patch): Json<AccountPatch>,
) -> Result<Json<ServiceEnvelope<AccountProfile>>, ServiceError> {
    let token = bearer_token(&headers);
    let profile = run_blocking(state, move |api| {
        let target = AccountId::parse(&account_id)?;
        let requester = api.resolve_principal(token.as_deref())?;
        api.update_profile(requester.as_ref(), target, patch)
    })
    .await?;
    Ok(envelope(profile))
}

async fn accounts_set_role(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
    Json(request): Json<RoleRequest>,
) -> Result<Json<ServiceEnvelope<AccountProfile>>, ServiceError> {
    let token = bearer_token(&headers);
    let profile = run_blocking(state, move |api| {
        let target = AccountId::parse(&account_id)?;
        let requester = api.resolve_principal(token.as_deref())?;
        api.set_account_role(requester.as_ref(), target, request.role)
    })
    .await?;
    Ok(envelope(profile))
}

async fn accounts_set_clearance(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
    Json(request): Json<ClearanceRequest>,
) -> Result<Json<ServiceEnvelope<AccountProfile>>, ServiceError> {
    let token = bearer_token(&headers);
    let profile = run_blocking(state, move |api| {
        let target = AccountId::parse(&account_id)?;
        let requester = api.resolve_principal(token.as_deref())?;
        api.set_account_clearance(requester.as_ref(), target, request.clearance)
    })
    .await?;
    Ok(envelope(profile))
}

async fn accounts_set_position(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
    Json(request): Json<PositionRequest>,
) -> Result<Json<ServiceEnvelope<AccountProfile>>, ServiceError> {
    let token = bearer_token(&headers);
    let profile = run_blocking(state, move |api| {
        let target = AccountId::parse(&account_id)?;
        let requester = api.resolve_principal(token.as_deref())?;
        api.set_account_position(requester.as_ref(), target, request.position)
    })
    .await?;
    Ok(envelope(profile))
}

async fn objects_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<ContentRecord>>>, ServiceError> {
    let token = bearer_token(&headers);
    let records = run_blocking(state, move |api| {
        let requester = api.resolve_principal(token.as_deref())?;
        api.list_objects(requester.as_ref())
    })
    .await?;
    Ok(envelope(records))
}

async fn objects_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<CreateObjectRequest>,
) -> Result<Json<ServiceEnvelope<ContentRecord>>, ServiceError> {
    let token = bearer_token(&headers);
    let record = run_blocking(state, move |api| {
        let requester = api.resolve_principal(token.as_deref())?;
        api.create_object(requester.as_ref(), request)
    })
    .await?;
    Ok(envelope(record))
}

async fn objects_show(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(object_id): Path<String>,
) -> Result<Json<ServiceEnvelope<ContentRecord>>, ServiceError> {
    let token = bearer_token(&headers);
    let record = run_blocking(state, move |api| {
        let id = ContentRecordId::parse(&object_id)?;
        let requester = api.resolve_principal(token.as_deref())?;
        api.get_object(requester.as_ref(), id)
    })
    .await?;
    Ok(envelope(record))
}

async fn objects_show_by_number(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(external_number): Path<String>,
) -> Result<Json<ServiceEnvelope<ContentRecord>>, ServiceError> {
    let token = bearer_token(&headers);
    let record = run_blocking(state, move |api| {
        let requester = api.resolve_principal(token.as_deref())?;
        api.get_object_by_number(requester.as_ref(), &external_number)
    })
    .await?;
    Ok(envelope(record))
}

async fn objects_update(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(object_id): Path<String>,
    Json(patch): Json<ContentRecordPatch>,
) -> Result<Json<ServiceEnvelope<ContentRecord>>, ServiceError> {
    let token = bearer_token(&headers);
    let record = run_blocking(state, move |api| {
        let id = ContentRecordId::parse(&object_id)?;
        let requester = api.resolve_principal(token.as_deref())?;
        api.update_object(requester.as_ref(), id, patch)
    })
    .await?;
    Ok(envelope(record))
}

async fn objects_delete(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(object_id): Path<String>,
) -> Result<Json<ServiceEnvelope<DeletedResponse>>, ServiceError> {
    let token = bearer_token(&headers);
    let id = run_blocking(state, move |api| {
        let id = ContentRecordId::parse(&object_id)?;
        let requester = api.resolve_principal(token.as_deref())?;
        api.delete_object(requester.as_ref(), id)?;
        Ok(id)
    })
    .await?;
    Ok(envelope(DeletedResponse { id: id.to_string() }))
}

async fn posts_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<Post>>>, ServiceError> {
    let token = bearer_token(&headers);
    let posts = run_blocking(state, move |api| {
        let requester = api.resolve_principal(token.as_deref())?;
        api.list_posts(requester.as_ref())
    })
    .await?;
    Ok(envelope(posts))
}

async fn posts_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<CreatePostRequest>,
) -> Result<Json<ServiceEnvelope<Post>>, ServiceError> {
    let token = bearer_token(&headers);
    let post = run_blocking(state, move |api| {
        let requester = api.resolve_principal(token.as_deref())?;
        api.create_post(requester.as_ref(), request)
    })
    .await?;
    Ok(envelope(post))
}

async fn posts_show(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(post_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Post>>, ServiceError> {
    let token = bearer_token(&headers);
    let post = run_blocking(state, move |api| {
        let id = PostId::parse(&post_id)?;
        let requester = api.resolve_principal(token.as_deref())?;
        api.get_post(requester.as_ref(), id)
    })
    .await?;
    Ok(envelope(post))
}

async fn posts_update(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(post_id): Path<String>,
    Json(patch): Json<PostPatch>,
) -> Result<Json<ServiceEnvelope<Post>>, ServiceError> {
    let token = bearer_token(&headers);
    let post = run_blocking(state, move |api| {
        let id = PostId::parse(&post_id)?;
        let requester = api.resolve_principal(token.as_deref())?;
        api.update_post(requester.as_ref(), id, patch)
    })
    .await?;
    Ok(envelope(post))
}

async fn posts_delete(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(post_id): Path<String>,
) -> Result<Json<ServiceEnvelope<DeletedResponse>>, ServiceError> {
    let token = bearer_token(&headers);
    let id = run_blocking(state, move |api| {
        let id = PostId::parse(&post_id)?;
        let requester = api.resolve_principal(token.as_deref())?;
        api.delete_post(requester.as_ref(), id)?;
        Ok(id)
    })
    .await?;
    Ok(envelope(DeletedResponse { id: id.to_string() }))
}

async fn admin_reset(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<sce_archive_store_sqlite::CollectionCounts>>, ServiceError> {
    let token = bearer_token(&headers);
    let removed = run_blocking(state, move |api| {
        let requester = api.resolve_principal(token.as_deref())?;
        api.reset_database(requester.as_ref())
    })
    .await?;
    Ok(envelope(removed))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("sce-archive-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_router() -> (Router, PathBuf) {
        let db_path = unique_temp_db_path();
        (app(ServiceState { api: ArchiveApi::new(db_path.clone()) }), db_path)
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}"),
        }
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().uri(uri).method(method);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body.to_string())),
            None => builder.body(axum::body::Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        let response = match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        let status = response.status();
        (status, response_json(response).await)
    }

    fn data_str<'a>(value: &'a Value, pointer: &str) -> &'a str {
        value
            .pointer(pointer)
            .and_then(Value::as_str)
            .unwrap_or_else(|| panic!("missing {pointer} in response: {value}"))
    }

    async fn bootstrap_admin_token(router: &Router) -> String {
        let (status, _) = send(
            router,
            "POST",
            "/v1/auth/bootstrap-admin",
            None,
            Some(json!({
                "email": "director@sce.example",
                "username": "director",
                "password": "director-password"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, login) = send(
            router,
            "POST",
            "/v1/auth/login",
            None,
            Some(json!({ "email": "director@sce.example", "password": "director-password" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        data_str(&login, "/data/token").to_string()
    }

    async fn reader_token(router: &Router, name: &str) -> String {
        let (status, registration) = send(
            router,
            "POST",
            "/v1/auth/register",
            None,
            Some(json!({
                "email": format!("{name}@sce.example"),
                "username": name,
                "password": "reader-password",
                "confirm_password": "reader-password"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let verification = data_str(&registration, "/data/verification_token").to_string();
        let (status, grant) = send(
            router,
            "POST",
            "/v1/auth/verify-email",
            None,
            Some(json!({ "token": verification })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        data_str(&grant, "/data/token").to_string()
    }

    fn object_payload(number: &str, clearance: u8) -> Value {
        json!({
            "external_number": number,
            "title": format!("Object {number}"),
            "classification": "euclid",
            "body": "Description.",
            "procedures": "Procedures.",
            "required_clearance": clearance
        })
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let (router, _) = test_router();
        let (status, value) = send(&router, "GET", "/v1/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(data_str(&value, "/service_contract_version"), SERVICE_CONTRACT_VERSION);
        assert_eq!(data_str(&value, "/data/status"), "ok");
    }

    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let (router, _) = test_router();
        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/openapi")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = String::from_utf8_lossy(&bytes);
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/objects/{object_id}"));
        assert!(body.contains("/v1/auth/login"));
    }

    #[tokio::test]
    async fn clearance_gates_object_reads_over_http() {
        let (router, db_path) = test_router();
        let admin = bootstrap_admin_token(&router).await;
        let reader = reader_token(&router, "reader").await;

        let (status, _) =
            send(&router, "POST", "/v1/objects", Some(&admin), Some(object_payload("001", 1))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, secret) =
            send(&router, "POST", "/v1/objects", Some(&admin), Some(object_payload("002", 3))).await;
        assert_eq!(status, StatusCode::OK);
        let secret_id = data_str(&secret, "/data/id").to_string();

        let (status, anonymous) = send(&router, "GET", "/v1/objects", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(anonymous.pointer("/data").and_then(Value::as_array).map(Vec::len), Some(1));

        let uri = format!("/v1/objects/{secret_id}");
        let (status, denied) = send(&router, "GET", &uri, Some(&reader), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(data_str(&denied, "/error"), "forbidden: clearance level 3 required");

        let (status, anonymous_denied) = send(&router, "GET", &uri, None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(data_str(&anonymous_denied, "/code"), "FORBIDDEN_NOT_AUTHENTICATED");

        let (status, shown) = send(&router, "GET", &uri, Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(data_str(&shown, "/data/external_number"), "002");

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn mutations_require_admin_and_report_conflicts() {
        let (router, db_path) = test_router();
        let admin = bootstrap_admin_token(&router).await;
        let reader = reader_token(&router, "writer").await;

        let (status, _) =
            send(&router, "POST", "/v1/objects", Some(&reader), Some(object_payload("010", 1))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) =
            send(&router, "POST", "/v1/objects", None, Some(object_payload("010", 1))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) =
            send(&router, "POST", "/v1/objects", Some(&admin), Some(object_payload("010", 1))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, conflict) =
            send(&router, "POST", "/v1/objects", Some(&admin), Some(object_payload("010", 2))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(data_str(&conflict, "/code"), "DUPLICATE_KEY");

        let (status, _) = send(&router, "GET", "/v1/objects/not-a-ulid", None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn session_lifecycle_and_self_guard() {
        let (router, db_path) = test_router();
        let admin = bootstrap_admin_token(&router).await;

        let (status, session) = send(&router, "GET", "/v1/auth/session", Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
        let admin_id = data_str(&session, "/data/id").to_string();

        let (status, denied) = send(
            &router,
            "PUT",
            &format!("/v1/accounts/{admin_id}/role"),
            Some(&admin),
            Some(json!({ "role": "reader" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(data_str(&denied, "/error"), "forbidden: you cannot change your own role");

        let (status, wrong) = send(
            &router,
            "POST",
            "/v1/auth/login",
            None,
            Some(json!({ "email": "director@sce.example", "password": "guess-guess" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(data_str(&wrong, "/error"), "invalid email or password");

        let (status, logout) = send(&router, "POST", "/v1/auth/logout", Some(&admin), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(logout.pointer("/data/revoked").and_then(Value::as_bool), Some(true));

        let (status, _) = send(&router, "GET", "/v1/accounts", Some(&admin), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn bearer_token_requires_scheme_and_value() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, http::HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc123"));
        headers.insert(AUTHORIZATION, http::HeaderValue::from_static("Basic abc123"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, http::HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}
