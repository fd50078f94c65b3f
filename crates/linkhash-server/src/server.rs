//! Web server entrypoints live here.

use std::{future::Future, net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use axum::{
    Extension, Json, Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, MatchedPath, Path, Query},
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize, de::Deserializer};
use serde_json::Value;
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{
    add_extension::AddExtensionLayer,
    classify::ServerErrorsFailureClass,
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer, ExposeHeaders},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::api::{
    ApiFailure, CreateJobRequest, FailureKind, LinkageApi, ListRecordsParams, PAGE_LIMIT_DEFAULT,
    PAGE_LIMIT_MAX, RecordFilter, RecordStatus, StatusRange, SubmitBatchRequest,
};
use crate::config::{CorsConfig, ServerConfig, parse_header, parse_method};

const HEALTHZ_PATH: &str = "/v1/healthz";
const JOBS_PATH: &str = "/v1/jobs";
const JOB_PATH: &str = "/v1/jobs/{job_id}";
const RECORDS_PATH: &str = "/v1/jobs/{job_id}/records";
const STATUS_PATH: &str = "/v1/jobs/{job_id}/status";
const REDISPATCH_PATH: &str = "/v1/jobs/{job_id}/redispatch";
const HEALTHZ_STATUS: &str = "ok";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_JOB_ID_LEN: usize = 128;
const ERROR_INVALID_PARAMETER: &str = "invalid_parameter";
const ERROR_NOT_FOUND: &str = "not_found";
const ERROR_CONFLICT: &str = "conflict";
const ERROR_INVALID_SCHEMA: &str = "invalid_schema";
const ERROR_INVALID_DATA: &str = "invalid_data";
const ERROR_CURSOR_OUT_OF_BOUNDS: &str = "cursor_out_of_bounds";
const ERROR_METHOD_NOT_ALLOWED: &str = "method_not_allowed";
const ERROR_INTERNAL: &str = "internal_server_error";
const REQUEST_ID_HEADER: &str = "x-request-id";

pub type DynLinkageApi = Arc<dyn LinkageApi>;
type ApiStateHandle = Arc<ApiState>;

#[derive(Clone)]
struct ApiState {
    api: DynLinkageApi,
}

#[derive(Debug, Serialize, Copy, Clone, PartialEq, Eq)]
struct HealthzResponse {
    status: &'static str,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ShutdownEvent {
    Pending,
    CtrlC,
    SigTerm,
    ListenerFailed,
}

#[derive(Debug, Deserialize)]
struct CreateJobBody {
    job_id: String,
    schema: Value,
    /// Base64 (standard alphabet) secret key material.
    secret: String,
}

#[derive(Debug, Deserialize)]
struct SubmitQuery {
    #[serde(default)]
    header: bool,
    #[serde(default = "default_validate")]
    validate: bool,
}

#[derive(Debug, Deserialize)]
struct RedispatchQuery {
    #[serde(default = "default_validate")]
    validate: bool,
}

#[derive(Debug, Deserialize)]
struct RecordsQuery {
    index_start: Option<u64>,
    index_end: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_string_list")]
    status: Vec<String>,
    limit: Option<usize>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteRecordsQuery {
    index_start: Option<u64>,
    index_end: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_string_list")]
    status: Vec<String>,
}

#[derive(Debug, Serialize)]
struct JobListResponse {
    jobs: Vec<String>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    ranges: Vec<StatusRange>,
}

#[derive(Debug, Serialize)]
struct DeleteRecordsResponse {
    deleted: u64,
}

#[derive(Debug, Clone, Serialize)]
struct ApiErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

#[derive(Debug, Clone)]
struct ApiError {
    status: StatusCode,
    body: ApiErrorBody,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
    #[error("invalid CORS configuration: {reason}")]
    CorsConfig { reason: String },
}

fn default_validate() -> bool {
    true
}

impl CreateJobBody {
    fn into_request(self) -> Result<CreateJobRequest, ApiError> {
        let CreateJobBody {
            job_id,
            schema,
            secret,
        } = self;
        let job_id = validate_job_id(job_id)?;
        let secret = BASE64
            .decode(secret.trim())
            .map_err(|err| ApiError::invalid_param("secret", format!("invalid base64: {err}")))?;
        if secret.is_empty() {
            return Err(ApiError::invalid_param("secret", "must not be empty"));
        }
        Ok(CreateJobRequest {
            job_id,
            schema,
            secret,
        })
    }
}

impl RecordsQuery {
    fn into_params(self, job_id: String) -> Result<ListRecordsParams, ApiError> {
        let RecordsQuery {
            index_start,
            index_end,
            status,
            limit,
            cursor,
        } = self;
        let filter = build_filter(index_start, index_end, status)?;
        let limit = limit.unwrap_or(PAGE_LIMIT_DEFAULT);
        ensure_range("limit", limit, 1, PAGE_LIMIT_MAX)?;
        let cursor = match sanitize_optional(cursor) {
            Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
                ApiError::invalid_param("cursor", format!("cursor `{raw}` is not a record index"))
            })?),
            None => None,
        };
        Ok(ListRecordsParams {
            job_id,
            filter,
            limit,
            cursor,
        })
    }
}

impl DeleteRecordsQuery {
    fn into_filter(self) -> Result<RecordFilter, ApiError> {
        build_filter(self.index_start, self.index_end, self.status)
    }
}

fn build_filter(
    index_start: Option<u64>,
    index_end: Option<u64>,
    status: Vec<String>,
) -> Result<RecordFilter, ApiError> {
    if let (Some(start), Some(end)) = (index_start, index_end) {
        if start > end {
            return Err(ApiError::invalid_param(
                "index_end",
                "must not be smaller than index_start",
            ));
        }
    }
    let mut statuses = Vec::new();
    for name in expand_csv(status) {
        let parsed = RecordStatus::from_str(&name).map_err(|_| {
            ApiError::invalid_param("status", format!("unknown record status `{name}`"))
        })?;
        if !statuses.contains(&parsed) {
            statuses.push(parsed);
        }
    }
    Ok(RecordFilter {
        index_start,
        index_end,
        statuses,
    })
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            body: ApiErrorBody {
                error,
                message: message.into(),
                field: None,
                request_id: None,
            },
        }
    }

    fn with_field(mut self, field: &str) -> Self {
        debug_assert!(!field.is_empty());
        self.body.field = Some(field.to_string());
        self
    }

    fn with_request_id(mut self, request_id: Option<&str>) -> Self {
        if let Some(id) = request_id {
            debug_assert!(!id.is_empty());
            self.body.request_id = Some(id.to_string());
        }
        self
    }

    fn invalid_param(field: &str, message: impl Into<String>) -> Self {
        ApiError::new(StatusCode::BAD_REQUEST, ERROR_INVALID_PARAMETER, message).with_field(field)
    }

    fn internal() -> Self {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ERROR_INTERNAL,
            "internal server error",
        )
    }

    fn resource_not_found(path: &str) -> Self {
        debug_assert!(path.starts_with('/'));
        ApiError::new(
            StatusCode::NOT_FOUND,
            ERROR_NOT_FOUND,
            format!("resource `{path}` not found"),
        )
    }

    fn method_not_allowed(method: &str, path: &str) -> Self {
        ApiError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            ERROR_METHOD_NOT_ALLOWED,
            format!("method `{method}` not allowed for `{path}`"),
        )
    }
}

impl From<ApiFailure> for ApiError {
    fn from(failure: ApiFailure) -> Self {
        let ApiFailure {
            kind,
            message,
            field,
        } = failure;
        let api = match kind {
            FailureKind::InvalidParameter => {
                ApiError::new(StatusCode::BAD_REQUEST, ERROR_INVALID_PARAMETER, message)
            }
            FailureKind::NotFound { resource } => {
                ApiError::new(StatusCode::NOT_FOUND, ERROR_NOT_FOUND, message).with_field(&resource)
            }
            FailureKind::Conflict => ApiError::new(StatusCode::CONFLICT, ERROR_CONFLICT, message),
            FailureKind::InvalidSchema => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                ERROR_INVALID_SCHEMA,
                message,
            ),
            FailureKind::InvalidData => {
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, ERROR_INVALID_DATA, message)
            }
            FailureKind::CursorOutOfBounds => ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                ERROR_CURSOR_OUT_OF_BOUNDS,
                message,
            ),
            FailureKind::Internal => {
                tracing::error!(%message, "linkage request failed");
                return ApiError::internal();
            }
        };
        match field {
            Some(field) if api.body.field.is_none() => api.with_field(&field),
            _ => api,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn validate_job_id(value: String) -> Result<String, ApiError> {
    let trimmed = trim_non_empty("job_id", value)?;
    if trimmed.len() > MAX_JOB_ID_LEN {
        return Err(ApiError::invalid_param(
            "job_id",
            format!("must be at most {MAX_JOB_ID_LEN} bytes"),
        ));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(ApiError::invalid_param(
            "job_id",
            "must not contain control characters",
        ));
    }
    Ok(trimmed)
}

fn trim_non_empty(field: &str, value: String) -> Result<String, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::invalid_param(field, "must not be empty"));
    }
    Ok(trimmed.to_string())
}

fn sanitize_optional(value: Option<String>) -> Option<String> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn deserialize_string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => Ok(vec![value]),
        OneOrMany::Many(values) => Ok(values),
    }
}

fn expand_csv(values: Vec<String>) -> Vec<String> {
    let mut out = Vec::new();
    for value in values {
        for part in value.split(',') {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                continue;
            }
            out.push(trimmed.to_string());
        }
    }
    out
}

fn ensure_range(field: &str, value: usize, min: usize, max: usize) -> Result<(), ApiError> {
    debug_assert!(max >= min);
    if value < min || value > max {
        return Err(ApiError::invalid_param(
            field,
            format!("must be between {min} and {max}"),
        ));
    }
    Ok(())
}

pub fn build_api_router() -> Router {
    debug_assert!(HEALTHZ_PATH.starts_with("/v1/"));

    Router::new()
        .route(
            HEALTHZ_PATH,
            get(healthz).fallback(method_not_allowed_handler),
        )
        .route(
            JOBS_PATH,
            get(list_jobs)
                .post(create_job)
                .fallback(method_not_allowed_handler),
        )
        .route(
            JOB_PATH,
            get(get_job)
                .delete(delete_job)
                .fallback(method_not_allowed_handler),
        )
        .route(
            RECORDS_PATH,
            get(list_records)
                .post(submit_batch)
                .delete(delete_records)
                .fallback(method_not_allowed_handler),
        )
        .route(
            STATUS_PATH,
            get(status_ranges).fallback(method_not_allowed_handler),
        )
        .route(
            REDISPATCH_PATH,
            post(redispatch).fallback(method_not_allowed_handler),
        )
}

/// Full application router: API routes plus tracing, request ids, CORS and
/// the shared `LinkageApi` handle.
pub fn build_router(config: &ServerConfig, api: DynLinkageApi) -> Result<Router, ServerError> {
    let state: ApiStateHandle = Arc::new(ApiState { api });

    let mut router = Router::new()
        .merge(build_api_router())
        .fallback(not_found_handler)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes));

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            let path = matched_path_or_uri(request);
            let request_id =
                header_request_id(request.headers()).unwrap_or_else(|| "-".to_string());
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                path = %path,
                request_id = %request_id
            )
        })
        .on_response(
            |response: &axum::response::Response, latency: Duration, span: &tracing::Span| {
                let status = response.status().as_u16();
                let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
                tracing::info!(parent: span, status, latency_ms, "request completed");
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, span: &tracing::Span| {
                let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
                tracing::error!(parent: span, latency_ms, error = %error, "request failed");
            },
        );

    if config.cors.enabled {
        let cors_layer = build_cors_layer(&config.cors)?;
        router = router.layer(cors_layer);
    }

    router = router.layer(trace_layer);

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);
    router = router
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(
            request_id_header,
            MakeRequestUuid::default(),
        ));

    Ok(router.layer(AddExtensionLayer::new(state)))
}

pub async fn serve(config: ServerConfig, api: DynLinkageApi) -> Result<(), ServerError> {
    debug_assert!(config.listen_addr.len() <= 128);

    let listen_addr = parse_listen_addr(&config.listen_addr)?;
    let app = build_router(&config, api)?;
    let listener = bind_listener(listen_addr).await?;

    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, "linkhash server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownEvent::Pending);
    let shutdown_future = broadcast_shutdown(shutdown_tx);

    let mut server_future = Box::pin(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_future)
            .await
    });

    let drain_rx = shutdown_rx.clone();
    let mut drain_timeout = Box::pin(drain_timeout_future(drain_rx));

    tokio::select! {
        result = server_future.as_mut() => {
            if let Err(source) = result {
                return Err(ServerError::Serve { source });
            }
        }
        _ = drain_timeout.as_mut() => {
            // Timeout elapsed; dropping the server future forces termination.
        }
    }

    let final_event = *shutdown_rx.borrow();
    if final_event == ShutdownEvent::Pending {
        tracing::info!("server stopped without external shutdown signal");
    } else {
        tracing::info!(?final_event, "server shutdown complete");
    }

    Ok(())
}

fn build_cors_layer(config: &CorsConfig) -> Result<CorsLayer, ServerError> {
    if config.allow_origins.is_empty() {
        return Err(ServerError::CorsConfig {
            reason: "allow_origins must list at least one origin".to_string(),
        });
    }
    let origins: Vec<HeaderValue> = config
        .allow_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|err| ServerError::CorsConfig {
                reason: format!("origin `{origin}` is not a valid header value: {err}"),
            })
        })
        .collect::<Result<_, _>>()?;

    let methods: Vec<Method> = config
        .allow_methods
        .iter()
        .map(|method| parse_method(method).map_err(|reason| ServerError::CorsConfig { reason }))
        .collect::<Result<_, _>>()?;

    let allow_headers: Vec<HeaderName> = config
        .allow_headers
        .iter()
        .map(|name| parse_header(name).map_err(|reason| ServerError::CorsConfig { reason }))
        .collect::<Result<_, _>>()?;

    let expose_headers: Vec<HeaderName> = config
        .expose_headers
        .iter()
        .map(|name| parse_header(name).map_err(|reason| ServerError::CorsConfig { reason }))
        .collect::<Result<_, _>>()?;

    let mut cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::list(methods))
        .allow_credentials(config.allow_credentials)
        .max_age(Duration::from_secs(config.max_age_secs));

    if !allow_headers.is_empty() {
        cors = cors.allow_headers(AllowHeaders::list(allow_headers));
    }

    if !expose_headers.is_empty() {
        cors = cors.expose_headers(ExposeHeaders::list(expose_headers));
    }

    Ok(cors)
}

async fn healthz() -> impl IntoResponse {
    Json(HealthzResponse {
        status: HEALTHZ_STATUS,
    })
}

async fn list_jobs(
    Extension(state): Extension<ApiStateHandle>,
) -> Result<Json<JobListResponse>, ApiError> {
    let jobs = state.api.list_jobs().await?;
    Ok(Json(JobListResponse { jobs }))
}

async fn create_job(
    Extension(state): Extension<ApiStateHandle>,
    Json(body): Json<CreateJobBody>,
) -> Result<StatusCode, ApiError> {
    let request = body.into_request()?;
    state.api.create_job(request).await?;
    Ok(StatusCode::CREATED)
}

async fn get_job(
    Extension(state): Extension<ApiStateHandle>,
    Path(job_id): Path<String>,
) -> Result<axum::response::Response, ApiError> {
    let view = state.api.get_job(job_id).await?;
    Ok(Json(view).into_response())
}

async fn delete_job(
    Extension(state): Extension<ApiStateHandle>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.api.delete_job(job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn submit_batch(
    Extension(state): Extension<ApiStateHandle>,
    Path(job_id): Path<String>,
    Query(query): Query<SubmitQuery>,
    body: Bytes,
) -> Result<axum::response::Response, ApiError> {
    let request = SubmitBatchRequest {
        job_id,
        payload: body.to_vec(),
        has_header: query.header,
        validate: query.validate,
    };
    let receipt = state.api.submit_batch(request).await?;
    Ok((StatusCode::CREATED, Json(receipt)).into_response())
}

async fn status_ranges(
    Extension(state): Extension<ApiStateHandle>,
    Path(job_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let ranges = state.api.status_ranges(job_id).await?;
    Ok(Json(StatusResponse { ranges }))
}

async fn list_records(
    Extension(state): Extension<ApiStateHandle>,
    Path(job_id): Path<String>,
    Query(query): Query<RecordsQuery>,
) -> Result<axum::response::Response, ApiError> {
    let params = query.into_params(job_id)?;
    let page = state.api.list_records(params).await?;
    Ok(Json(page).into_response())
}

async fn delete_records(
    Extension(state): Extension<ApiStateHandle>,
    Path(job_id): Path<String>,
    Query(query): Query<DeleteRecordsQuery>,
) -> Result<Json<DeleteRecordsResponse>, ApiError> {
    let filter = query.into_filter()?;
    let deleted = state.api.delete_records(job_id, filter).await?;
    Ok(Json(DeleteRecordsResponse { deleted }))
}

async fn redispatch(
    Extension(state): Extension<ApiStateHandle>,
    Path(job_id): Path<String>,
    Query(query): Query<RedispatchQuery>,
) -> Result<axum::response::Response, ApiError> {
    let receipt = state.api.redispatch(job_id, query.validate).await?;
    Ok(Json(receipt).into_response())
}

async fn method_not_allowed_handler(request: Request<Body>) -> axum::response::Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let request_id = header_request_id(request.headers());
    ApiError::method_not_allowed(&method, &path)
        .with_request_id(request_id.as_deref())
        .into_response()
}

async fn not_found_handler(request: Request<Body>) -> axum::response::Response {
    let path = request.uri().path().to_string();
    let request_id = header_request_id(request.headers());
    ApiError::resource_not_found(&path)
        .with_request_id(request_id.as_deref())
        .into_response()
}

fn matched_path_or_uri<B>(request: &Request<B>) -> String {
    if let Some(path) = request.extensions().get::<MatchedPath>() {
        return path.as_str().to_string();
    }
    request.uri().path().to_string()
}

fn header_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

async fn wait_for_shutdown() -> ShutdownEvent {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownEvent::CtrlC,
            Err(error) => {
                tracing::warn!(%error, "failed to capture Ctrl+C signal");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => match term.recv().await {
                Some(_) => ShutdownEvent::SigTerm,
                None => ShutdownEvent::ListenerFailed,
            },
            Err(error) => {
                tracing::warn!(%error, "failed to capture SIGTERM");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending();

    tokio::select! {
        event = ctrl_c => event,
        event = sigterm => event,
    }
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return Err(ServerError::EmptyListenAddr);
    }

    trimmed
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: trimmed.to_string(),
            source,
        })
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: addr.to_string(),
            source,
        })
}

fn broadcast_shutdown(
    sender: watch::Sender<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let event = wait_for_shutdown().await;
        debug_assert!(event != ShutdownEvent::Pending);
        if let Err(error) = sender.send(event) {
            tracing::warn!(?event, %error, "failed to broadcast shutdown event");
        }
    }
}

fn drain_timeout_future(
    mut receiver: watch::Receiver<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        if receiver.changed().await.is_ok() {
            let event = *receiver.borrow_and_update();
            tracing::info!(?event, "shutdown signal received; draining connections");
            tokio::time::sleep(DRAIN_TIMEOUT).await;
            tracing::warn!(
                ?event,
                seconds = DRAIN_TIMEOUT.as_secs(),
                "graceful shutdown timed out; continuing shutdown"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BatchReceipt, JobView, RecordPage, RedispatchReceipt};
    use axum::http::header;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct MockLinkageApi;

    #[async_trait::async_trait]
    impl LinkageApi for MockLinkageApi {
        async fn create_job(&self, request: CreateJobRequest) -> Result<(), ApiFailure> {
            if request.job_id == "taken" {
                return Err(ApiFailure::conflict("job `taken` already exists"));
            }
            Ok(())
        }

        async fn list_jobs(&self) -> Result<Vec<String>, ApiFailure> {
            Ok(vec!["alpha".to_string()])
        }

        async fn get_job(&self, job_id: String) -> Result<JobView, ApiFailure> {
            Err(ApiFailure::not_found(
                "job_id",
                format!("job `{job_id}` not found"),
            ))
        }

        async fn delete_job(&self, _job_id: String) -> Result<(), ApiFailure> {
            Ok(())
        }

        async fn submit_batch(
            &self,
            request: SubmitBatchRequest,
        ) -> Result<BatchReceipt, ApiFailure> {
            let count = request.payload.iter().filter(|b| **b == b'\n').count() as u64;
            Ok(BatchReceipt {
                start_index: 0,
                end_index: count,
                count,
                chunks_dispatched: 1,
                chunks_failed: 0,
            })
        }

        async fn status_ranges(&self, _job_id: String) -> Result<Vec<StatusRange>, ApiFailure> {
            Ok(vec![StatusRange {
                status: RecordStatus::Queued,
                start: 0,
                end: 2,
            }])
        }

        async fn list_records(&self, params: ListRecordsParams) -> Result<RecordPage, ApiFailure> {
            if params.cursor == Some(99) {
                return Err(ApiFailure::cursor_out_of_bounds("cursor outside bounds"));
            }
            Ok(RecordPage {
                records: Vec::new(),
                next_cursor: None,
            })
        }

        async fn delete_records(
            &self,
            _job_id: String,
            _filter: RecordFilter,
        ) -> Result<u64, ApiFailure> {
            Ok(2)
        }

        async fn redispatch(
            &self,
            _job_id: String,
            _validate: bool,
        ) -> Result<RedispatchReceipt, ApiFailure> {
            Ok(RedispatchReceipt {
                records_requeued: 0,
                chunks_dispatched: 0,
                chunks_failed: 0,
            })
        }
    }

    fn mock_router(cors: CorsConfig) -> Router {
        let config = ServerConfig {
            cors,
            ..ServerConfig::with_listen_addr("127.0.0.1:8080")
        };
        build_router(&config, Arc::new(MockLinkageApi)).expect("router builds")
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body readable")
            .to_bytes();
        serde_json::from_slice(bytes.as_ref()).expect("json body")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .expect("request builds")
    }

    #[test]
    fn records_query_rejects_unparseable_cursor() {
        let query = RecordsQuery {
            index_start: None,
            index_end: None,
            status: Vec::new(),
            limit: None,
            cursor: Some("abc".to_string()),
        };
        let error = query
            .into_params("job".to_string())
            .expect_err("cursor must be numeric");
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.body.field.as_deref(), Some("cursor"));
    }

    #[test]
    fn records_query_parses_status_list_and_defaults_limit() {
        let query = RecordsQuery {
            index_start: Some(2),
            index_end: Some(10),
            status: vec!["done,error".to_string(), "done".to_string()],
            limit: None,
            cursor: Some(" 4 ".to_string()),
        };
        let params = query.into_params("job".to_string()).expect("valid query");
        assert_eq!(params.limit, PAGE_LIMIT_DEFAULT);
        assert_eq!(params.cursor, Some(4));
        assert_eq!(
            params.filter.statuses,
            vec![RecordStatus::Done, RecordStatus::Error]
        );
    }

    #[test]
    fn filter_rejects_inverted_bounds_and_unknown_status() {
        assert!(build_filter(Some(5), Some(1), Vec::new()).is_err());
        let error = build_filter(None, None, vec!["finished".to_string()])
            .expect_err("unknown status rejected");
        assert_eq!(error.body.field.as_deref(), Some("status"));
    }

    #[test]
    fn limit_must_be_within_bounds() {
        let query = RecordsQuery {
            index_start: None,
            index_end: None,
            status: Vec::new(),
            limit: Some(PAGE_LIMIT_MAX + 1),
            cursor: None,
        };
        assert!(query.into_params("job".to_string()).is_err());
    }

    #[test]
    fn create_job_body_rejects_bad_secret() {
        let body = CreateJobBody {
            job_id: "job".to_string(),
            schema: Value::Null,
            secret: "***".to_string(),
        };
        let error = body.into_request().expect_err("secret must be base64");
        assert_eq!(error.body.field.as_deref(), Some("secret"));
    }

    #[test]
    fn failure_kinds_map_to_statuses() {
        let cases = [
            (ApiFailure::conflict("dup"), StatusCode::CONFLICT),
            (
                ApiFailure::invalid_schema("bad"),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ApiFailure::cursor_out_of_bounds("oob"),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (ApiFailure::not_found("job_id", "gone"), StatusCode::NOT_FOUND),
            (
                ApiFailure::internal("boom"),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (failure, status) in cases {
            assert_eq!(ApiError::from(failure).status, status);
        }
    }

    #[tokio::test]
    async fn healthz_and_job_listing_respond() {
        let router = mock_router(CorsConfig::default());
        let response = router
            .clone()
            .oneshot(get(HEALTHZ_PATH))
            .await
            .expect("healthz");
        assert_eq!(response.status(), StatusCode::OK);

        let response = router.oneshot(get(JOBS_PATH)).await.expect("jobs");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "jobs": ["alpha"] })
        );
    }

    #[tokio::test]
    async fn create_job_conflict_is_409() {
        let router = mock_router(CorsConfig::default());
        let body = serde_json::json!({ "job_id": "taken", "schema": {}, "secret": "c2VjcmV0" });
        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(JOBS_PATH)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request builds"),
            )
            .await
            .expect("create job");
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["error"], ERROR_CONFLICT);
    }

    #[tokio::test]
    async fn cursor_out_of_bounds_is_distinct_from_unparseable() {
        let router = mock_router(CorsConfig::default());
        let response = router
            .clone()
            .oneshot(get("/v1/jobs/j/records?cursor=99"))
            .await
            .expect("list records");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body_json(response).await["error"], ERROR_CURSOR_OUT_OF_BOUNDS);

        let response = router
            .oneshot(get("/v1/jobs/j/records?cursor=nope"))
            .await
            .expect("list records");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], ERROR_INVALID_PARAMETER);
    }

    #[tokio::test]
    async fn submit_batch_returns_created_receipt() {
        let router = mock_router(CorsConfig::default());
        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/v1/jobs/j/records?header=false")
                    .body(Body::from("a,b\nc,d\n"))
                    .expect("request builds"),
            )
            .await
            .expect("submit");
        assert_eq!(response.status(), StatusCode::CREATED);
        let value = body_json(response).await;
        assert_eq!(value["start_index"], 0);
        assert_eq!(value["end_index"], 2);
    }

    #[tokio::test]
    async fn unknown_route_and_wrong_method_are_json_errors() {
        let router = mock_router(CorsConfig::default());
        let response = router
            .clone()
            .oneshot(get("/v1/nothing"))
            .await
            .expect("fallback");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::PUT)
                    .uri(STATUS_PATH.replace("{job_id}", "j"))
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("method fallback");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn cors_enabled_allows_explicit_origin() {
        let cors = CorsConfig {
            enabled: true,
            allow_origins: vec!["http://localhost:5173".to_string()],
            ..CorsConfig::default()
        };
        let router = mock_router(cors);
        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri(HEALTHZ_PATH)
                    .header(header::ORIGIN, "http://localhost:5173")
                    .body(Body::empty())
                    .expect("request builds"),
            )
            .await
            .expect("request succeeds");
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .expect("ACAO header present when enabled"),
            "http://localhost:5173"
        );
    }

    #[test]
    fn cors_requires_origins() {
        let cors = CorsConfig {
            enabled: true,
            ..CorsConfig::default()
        };
        assert!(matches!(
            build_cors_layer(&cors),
            Err(ServerError::CorsConfig { .. })
        ));
    }
}
