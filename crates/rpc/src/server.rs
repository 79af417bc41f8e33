use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{MatchedPath, Path as AxumPath, State};
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use ipkey_registry::{Credential, KeyRegistry, RegistryError, Result as RegistryResult};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<KeyRegistry>,
    pub start_time: Instant,
    pub req_count: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(registry: Arc<KeyRegistry>) -> Self {
        Self {
            registry,
            start_time: Instant::now(),
            req_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn record_request(&self) -> u64 {
        self.req_count.fetch_add(1, Ordering::Relaxed) as u64 + 1
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    credentials: usize,
    req_total: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateKeyResponse {
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoveKeyRequest {
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AddIpRequest {
    #[serde(default)]
    pub ip: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new<S: Into<String>>(status: StatusCode, message: S) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Unauthorized => Self::new(StatusCode::FORBIDDEN, "Unauthorized"),
            RegistryError::MissingParameter { field: "key" } => {
                Self::new(StatusCode::BAD_REQUEST, "Key is required")
            }
            RegistryError::MissingParameter { field: "ip" } => {
                Self::new(StatusCode::BAD_REQUEST, "IP is required")
            }
            RegistryError::MissingParameter { field } => {
                Self::new(StatusCode::BAD_REQUEST, format!("{field} is required"))
            }
            RegistryError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, "Key not found"),
            err @ (RegistryError::KeyCollision { .. } | RegistryError::PersistenceFailure(_)) => {
                error!("Registry operation failed: {:#}", err);
                Self::internal()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let payload = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, payload).into_response()
    }
}

pub async fn start_server<F>(state: AppState, addr: &str, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(Arc::new(state));
    let listener = bind_listener(addr).await?;
    info!("ipkey RPC listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("RPC server terminated unexpectedly")
}

async fn bind_listener(addr: &str) -> Result<tokio::net::TcpListener> {
    if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
        tokio::net::TcpListener::bind(socket_addr)
            .await
            .with_context(|| format!("failed to bind RPC listener on {socket_addr}"))
    } else {
        tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind RPC listener on {addr}"))
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/create_key/:admin_key", get(handle_create_key))
        .route("/list_key/:admin_key", get(handle_list_keys))
        .route("/remove_key/:admin_key", post(handle_remove_key))
        .route("/add_ip/:key", post(handle_add_ip))
        .route("/get_ip/:key", get(handle_get_ip))
        .layer(
            // Paths carry keys and the admin secret, so spans only record the route
            TraceLayer::new_for_http().make_span_with(|req: &Request<_>| {
                let route = req
                    .extensions()
                    .get::<MatchedPath>()
                    .map(MatchedPath::as_str)
                    .unwrap_or("unmatched");
                info_span!("http_request", method = %req.method(), route)
            }),
        )
        .with_state(state)
}

/// Run a registry call on the blocking pool.
///
/// Mutations hold the registry write lock across a file write and fsync, so
/// they must not park an async worker.
async fn with_registry<T, F>(state: &SharedState, op: F) -> Result<T, ApiError>
where
    F: FnOnce(&KeyRegistry) -> RegistryResult<T> + Send + 'static,
    T: Send + 'static,
{
    let registry = Arc::clone(&state.registry);
    let outcome = tokio::task::spawn_blocking(move || op(registry.as_ref()))
        .await
        .map_err(|err| {
            error!("Registry task failed: {}", err);
            ApiError::internal()
        })?;
    outcome.map_err(ApiError::from)
}

async fn handle_health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let req_total = state.record_request();
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_seconds(),
        credentials: state.registry.len(),
        req_total,
    })
}

async fn handle_create_key(
    State(state): State<SharedState>,
    AxumPath(admin_key): AxumPath<String>,
) -> Result<(StatusCode, Json<CreateKeyResponse>), ApiError> {
    state.record_request();
    let key = with_registry(&state, move |registry| registry.create_key(&admin_key)).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateKeyResponse {
            key: key.to_string(),
        }),
    ))
}

async fn handle_list_keys(
    State(state): State<SharedState>,
    AxumPath(admin_key): AxumPath<String>,
) -> Result<Json<Vec<Credential>>, ApiError> {
    state.record_request();
    let credentials =
        with_registry(&state, move |registry| registry.list_keys(&admin_key)).await?;
    Ok(Json(credentials))
}

async fn handle_remove_key(
    State(state): State<SharedState>,
    AxumPath(admin_key): AxumPath<String>,
    body: Result<Json<RemoveKeyRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    state.record_request();
    let key = body.ok().and_then(|Json(req)| req.key).unwrap_or_default();

    let revoked = key.clone();
    with_registry(&state, move |registry| registry.revoke_key(&admin_key, &revoked)).await?;
    Ok(Json(MessageResponse {
        message: format!("Key {key} removed"),
    }))
}

async fn handle_add_ip(
    State(state): State<SharedState>,
    AxumPath(key): AxumPath<String>,
    body: Result<Json<AddIpRequest>, JsonRejection>,
) -> Result<Json<Credential>, ApiError> {
    state.record_request();
    let ip = body.ok().and_then(|Json(req)| req.ip).unwrap_or_default();

    let credential = with_registry(&state, move |registry| registry.bind_ip(&key, &ip)).await?;
    Ok(Json(credential))
}

async fn handle_get_ip(
    State(state): State<SharedState>,
    AxumPath(key): AxumPath<String>,
) -> Result<Json<Credential>, ApiError> {
    state.record_request();
    let credential = with_registry(&state, move |registry| registry.resolve_ip(&key)).await?;
    Ok(Json(credential))
}
