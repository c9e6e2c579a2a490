use std::net::SocketAddr;
use std::path::{Path as FsPath, PathBuf};
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, RawQuery, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use cxr_db_api::{
    BrowseRequest, BrowseResult, BrowserApi, BrowserConfig, DatasetSummary, FindingOption,
    RandomRequest, SessionId, API_CONTRACT_VERSION, DEFAULT_MAX_SESSIONS,
};
use cxr_db_core::{parse_query_string, DEFAULT_HISTORY_LIMIT};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const SESSION_HEADER: &str = "x-cxr-session";

#[derive(Debug, Clone)]
struct ServiceState {
    api: BrowserApi,
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
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "cxr-db-service")]
#[command(about = "Local HTTP service for browsing the CXR database")]
struct Args {
    #[arg(long, default_value = "sample")]
    data_dir: PathBuf,
    /// Defaults to `<data-dir>/sample_labels.csv`.
    #[arg(long)]
    csv: Option<PathBuf>,
    /// Defaults to `<data-dir>/images`.
    #[arg(long)]
    images: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 3600)]
    cache_ttl_secs: u64,
    #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
    history_limit: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_SESSIONS)]
    max_sessions: usize,
}

impl Args {
    fn config(&self) -> BrowserConfig {
        let csv_path = self.csv.clone().unwrap_or_else(|| self.data_dir.join("sample_labels.csv"));
        let image_dir = self.images.clone().unwrap_or_else(|| self.data_dir.join("images"));
        let mut config = BrowserConfig::new(csv_path, image_dir);
        config.cache_ttl = Duration::from_secs(self.cache_ttl_secs);
        config.history_limit = self.history_limit;
        config.max_sessions = self.max_sessions;
        config
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(status: StatusCode, message: impl Into<String>) -> ServiceError {
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn load_error(err: &anyhow::Error) -> ServiceError {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn session_from_headers(headers: &HeaderMap) -> Option<SessionId> {
    headers.get(SESSION_HEADER).and_then(|value| value.to_str().ok()).and_then(SessionId::parse)
}

fn browse_response(result: BrowseResult) -> Response {
    let session_id = result.session_id.to_string();
    ([(SESSION_HEADER, session_id)], Json(envelope(result))).into_response()
}

fn image_content_type(path: &FsPath) -> &'static str {
    match path.extension().and_then(|extension| extension.to_str()) {
        Some(extension) if extension.eq_ignore_ascii_case("png") => "image/png",
        Some(extension)
            if extension.eq_ignore_ascii_case("jpg") || extension.eq_ignore_ascii_case("jpeg") =>
        {
            "image/jpeg"
        }
        _ => "application/octet-stream",
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/browse", get(browse))
        .route("/v1/browse/random", post(browse_random))
        .route("/v1/findings", get(findings))
        .route("/v1/dataset", get(dataset))
        .route("/v1/images/:file", get(image))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let args = Args::parse();
    let state = ServiceState { api: BrowserApi::new(args.config()) };
    match state.api.dataset_summary() {
        Ok(summary) => {
            tracing::info!(rows = summary.rows, digest = %summary.source_digest, "dataset ready");
        }
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "dataset unavailable");
        }
    }

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "cxr-db-service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn browse(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Result<Response, ServiceError> {
    let request = BrowseRequest {
        session_id: session_from_headers(&headers),
        query: parse_query_string(raw_query.as_deref().unwrap_or_default()),
        actions: Vec::new(),
    };
    let result = state.api.browse(request).map_err(|err| ServiceState::load_error(&err))?;
    Ok(browse_response(result))
}

async fn browse_random(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<RandomRequest>,
) -> Result<Response, ServiceError> {
    let result = state
        .api
        .random(session_from_headers(&headers), request)
        .map_err(|err| ServiceState::load_error(&err))?;
    Ok(browse_response(result))
}

async fn findings(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<Vec<FindingOption>>>, ServiceError> {
    let options = state.api.findings().map_err(|err| ServiceState::load_error(&err))?;
    Ok(Json(envelope(options)))
}

async fn dataset(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<DatasetSummary>>, ServiceError> {
    let summary = state.api.dataset_summary().map_err(|err| ServiceState::load_error(&err))?;
    Ok(Json(envelope(summary)))
}

async fn image(
    State(state): State<ServiceState>,
    Path(file): Path<String>,
) -> Result<Response, ServiceError> {
    let path = state
        .api
        .image_path(&file)
        .map_err(|err| ServiceState::load_error(&err))?
        .ok_or_else(|| {
            ServiceState::error(StatusCode::NOT_FOUND, format!("unknown image: {file}"))
        })?;
    let bytes = tokio::fs::read(&path).await.map_err(|err| {
        tracing::warn!(path = %path.display(), error = %err, "image not readable");
        ServiceState::error(StatusCode::NOT_FOUND, format!("image not available: {file}"))
    })?;
    Ok(([(CONTENT_TYPE, image_content_type(&path))], bytes).into_response())
}
