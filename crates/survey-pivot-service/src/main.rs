use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use survey_pivot_api::{MetadataSummary, SurveyPivotApi, ViewRequest, API_CONTRACT_VERSION};
use survey_pivot_core::{CategoryView, Selection};
use survey_pivot_store::{DataSources, LoadState, SourceLocation, StoreHandle};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    store: StoreHandle,
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
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remediation: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    load_state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ViewQuery {
    demographic: Option<String>,
    view: Option<String>,
    format: Option<String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ViewFormat {
    Structured,
    Flat,
}

impl ViewFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "structured" => Some(Self::Structured),
            "flat" => Some(Self::Flat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct FlatViewResponse {
    demographic: String,
    view: CategoryView,
    groups: Vec<String>,
    rows: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
struct GroupsResponse {
    demographic: String,
    view: CategoryView,
    groups: Vec<String>,
}

#[derive(Debug, Parser)]
#[command(name = "survey-pivot-service")]
#[command(about = "Local HTTP service serving pivoted survey summaries")]
struct Args {
    /// Directory or base URL holding summary_stats.json and metadata.json.
    #[arg(long, default_value = "./data")]
    data: String,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
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
            state: None,
            remediation: None,
        }
    }

    /// The facade over the loaded store, or 503 while the data is not ready.
    fn api(&self) -> Result<SurveyPivotApi, ServiceError> {
        match self.store.state() {
            LoadState::Ready(store) => Ok(SurveyPivotApi::new(store)),
            LoadState::Loading => Err(ServiceError {
                state: Some("loading"),
                ..Self::error(StatusCode::SERVICE_UNAVAILABLE, "survey data is still loading")
            }),
            LoadState::Failed(failure) => Err(ServiceError {
                state: Some("failed"),
                remediation: Some(failure.remediation()),
                ..Self::error(StatusCode::SERVICE_UNAVAILABLE, failure.to_string())
            }),
        }
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

fn selection_from(
    demographic: Option<String>,
    view: Option<String>,
) -> Result<Selection, ServiceError> {
    ViewRequest { demographic, view }
        .into_selection()
        .map_err(|err| ServiceState::error(StatusCode::BAD_REQUEST, format!("{err:#}")))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/metadata", get(metadata))
        .route("/v1/view", get(view))
        .route("/v1/groups", get(groups))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let args = Args::parse();
    let sources = DataSources::relative_to(&SourceLocation::parse(&args.data));
    let store = StoreHandle::new();
    let load = store.spawn_load(sources);

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, data = %args.data, "survey pivot service listening");
    let served = axum::serve(listener, app(ServiceState { store })).await;
    load.abort();
    served.context("survey pivot service stopped unexpectedly")?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let load_state = state.store.state();
    let snapshot_id = match &load_state {
        LoadState::Ready(store) => Some(store.snapshot_id().to_string()),
        LoadState::Loading | LoadState::Failed(_) => None,
    };
    Json(envelope(HealthResponse { status: "ok", load_state: load_state.as_str(), snapshot_id }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn metadata(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<MetadataSummary>>, ServiceError> {
    let api = state.api()?;
    Ok(Json(envelope(api.metadata_summary())))
}

async fn view(
    State(state): State<ServiceState>,
    Query(query): Query<ViewQuery>,
) -> Result<Response, ServiceError> {
    let format = match query.format.as_deref() {
        None => ViewFormat::Structured,
        Some(value) => ViewFormat::parse(value).ok_or_else(|| {
            ServiceState::error(
                StatusCode::BAD_REQUEST,
                format!("unknown view format `{value}` (expected `structured` or `flat`)"),
            )
        })?,
    };
    let selection = selection_from(query.demographic, query.view)?;
    let api = state.api()?;
    let view = api.view(&selection);
    tracing::debug!(
        demographic = %selection.demographic,
        view = %selection.view,
        rows = view.rows.len(),
        "serving pivot view"
    );

    let response = match format {
        ViewFormat::Structured => Json(envelope(view)).into_response(),
        ViewFormat::Flat => Json(envelope(FlatViewResponse {
            rows: view.flat_rows(),
            demographic: view.demographic,
            view: view.view,
            groups: view.groups,
        }))
        .into_response(),
    };
    Ok(response)
}

async fn groups(
    State(state): State<ServiceState>,
    Query(query): Query<ViewQuery>,
) -> Result<Json<ServiceEnvelope<GroupsResponse>>, ServiceError> {
    let selection = selection_from(query.demographic, query.view)?;
    let api = state.api()?;
    let groups = api.groups(&selection);
    Ok(Json(envelope(GroupsResponse {
        demographic: selection.demographic,
        view: selection.view,
        groups,
    })))
}
