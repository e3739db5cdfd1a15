//! Axum JSON API and Askama dashboard over the event store.

use std::collections::HashMap;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path, Query, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use eventi_core::{
    DashboardStats, ErrorCategory, ErrorLogEntry, ErrorQuery, EventOrdering, EventPatch, EventQuery,
    FacetCount, Page, Pagination, ProductionRecord, RunQuery, RunRecord, RunStatus, StagingQuery,
    StagingRecord,
};
use eventi_storage::{EventFacet, EventStore, PgEventStore, StoreError};
use eventi_sync::SyncConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

mod external;

pub const CRATE_NAME: &str = "eventi-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub tokens: ApiTokens,
}

impl AppState {
    pub fn new(store: Arc<dyn EventStore>, tokens: ApiTokens) -> Self {
        Self { store, tokens }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Read,
    Write,
}

impl Scope {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scopes {
    pub read: bool,
    pub write: bool,
}

/// Bearer tokens for the external staging API, each with its scopes.
#[derive(Debug, Clone, Default)]
pub struct ApiTokens {
    tokens: HashMap<String, Scopes>,
}

impl ApiTokens {
    /// Parse `token=read write;other=read`.
    pub fn parse(raw: &str) -> Self {
        let mut tokens = HashMap::new();
        for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((token, scopes)) = entry.split_once('=') else {
                warn!("ignoring api token entry without scopes");
                continue;
            };
            let mut parsed = Scopes::default();
            for scope in scopes.split([' ', ',']).map(str::trim) {
                match scope {
                    "read" => parsed.read = true,
                    "write" => parsed.write = true,
                    _ => {}
                }
            }
            tokens.insert(token.trim().to_string(), parsed);
        }
        Self { tokens }
    }

    pub fn from_env() -> Self {
        std::env::var("EVENTI_API_TOKENS")
            .map(|v| Self::parse(&v))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn authorize(&self, headers: &HeaderMap, scope: Scope) -> Result<(), ApiError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or(ApiError::Unauthorized)?;
        let scopes = self.tokens.get(token).ok_or(ApiError::Unauthorized)?;
        let allowed = match scope {
            Scope::Read => scopes.read,
            Scope::Write => scopes.write,
        };
        if allowed {
            Ok(())
        } else {
            Err(ApiError::Forbidden(scope.as_str()))
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    BadRequest(String),
    #[error("{message}")]
    Invalid { message: String, details: JsonValue },
    #[error("authentication credentials were not provided or are invalid")]
    Unauthorized,
    #[error("token lacks the `{0}` scope")]
    Forbidden(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::BadRequest(_) | Self::Invalid { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Store(StoreError::Constraint(_)) => StatusCode::CONFLICT,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = match self {
            Self::Invalid { message, details } => json!({ "error": message, "details": details }),
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn app(state: AppState) -> Router {
    let state = Arc::new(state);
    let admin = Router::new()
        .route("/api/dashboard", get(dashboard_handler))
        .route("/api/events", get(list_events))
        .route("/api/events/cities", get(city_facets))
        .route("/api/events/sources", get(source_facets))
        .route(
            "/api/events/{id}",
            get(get_event).patch(patch_event).delete(delete_event),
        )
        .route("/api/events/{id}/toggle_active", post(toggle_event))
        .route("/api/staging", get(list_staging))
        .route("/api/staging/{id}", get(get_staging))
        .route("/api/etl-runs", get(list_runs))
        .route("/api/etl-runs/{id}", get(get_run))
        .route("/api/etl-errors", get(list_errors))
        .route("/api/etl-errors/{id}", get(get_error))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), require_token));

    Router::new()
        .route("/", get(index_handler))
        .merge(admin)
        .merge(external::routes())
        .with_state(state)
}

/// Admin API gate: `GET`/`HEAD` need the `read` scope, anything else `write`.
async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let scope = if matches!(*req.method(), Method::GET | Method::HEAD) {
        Scope::Read
    } else {
        Scope::Write
    };
    state.tokens.authorize(req.headers(), scope)?;
    Ok(next.run(req).await)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("EVENTI_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    let store = PgEventStore::connect(&config.database_url).await?;
    let tokens = ApiTokens::from_env();
    if tokens.is_empty() {
        warn!("EVENTI_API_TOKENS is empty; every /api call will be rejected");
    }
    let state = AppState::new(Arc::new(store), tokens);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "web server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[derive(Debug, Default, Deserialize)]
struct EventListParams {
    city: Option<String>,
    source: Option<String>,
    is_active: Option<bool>,
    date_start: Option<NaiveDate>,
    date_end: Option<NaiveDate>,
    date_from: Option<NaiveDate>,
    date_to: Option<NaiveDate>,
    search: Option<String>,
    ordering: Option<String>,
    page: Option<usize>,
    page_size: Option<usize>,
}

impl EventListParams {
    fn into_query(self) -> ApiResult<EventQuery> {
        let ordering = match non_empty(self.ordering) {
            Some(raw) => raw
                .parse::<EventOrdering>()
                .map_err(|e| ApiError::BadRequest(format!("invalid ordering: {e}")))?,
            None => EventOrdering::default(),
        };
        Ok(EventQuery {
            city: non_empty(self.city),
            source: non_empty(self.source),
            is_active: self.is_active,
            date_start: self.date_start,
            date_end: self.date_end,
            date_from: self.date_from,
            date_to: self.date_to,
            search: non_empty(self.search),
            ordering,
            pagination: Pagination::new(self.page, self.page_size),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StagingListParams {
    pub(crate) city: Option<String>,
    pub(crate) source: Option<String>,
    pub(crate) uuid: Option<String>,
    pub(crate) search: Option<String>,
    pub(crate) page: Option<usize>,
    pub(crate) page_size: Option<usize>,
}

impl StagingListParams {
    pub(crate) fn into_query(self) -> StagingQuery {
        StagingQuery {
            city: non_empty(self.city),
            source: non_empty(self.source),
            uuid: non_empty(self.uuid),
            search: non_empty(self.search),
            pagination: Pagination::new(self.page, self.page_size),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunListParams {
    run_type: Option<String>,
    source: Option<String>,
    status: Option<String>,
    page: Option<usize>,
    page_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorListParams {
    error_type: Option<String>,
    source: Option<String>,
    run_id: Option<String>,
    search: Option<String>,
    page: Option<usize>,
    page_size: Option<usize>,
}

/// Run row plus its derived wall-clock duration.
#[derive(Debug, Serialize)]
struct RunView {
    #[serde(flatten)]
    run: RunRecord,
    duration_seconds: Option<f64>,
}

impl From<RunRecord> for RunView {
    fn from(run: RunRecord) -> Self {
        Self {
            duration_seconds: run.duration_seconds(),
            run,
        }
    }
}

async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<EventListParams>,
) -> ApiResult<Json<Page<ProductionRecord>>> {
    let query = params.into_query()?;
    Ok(Json(state.store.list_production(&query).await?))
}

async fn get_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ProductionRecord>> {
    state
        .store
        .get_production(id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn patch_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(patch): Json<EventPatch>,
) -> ApiResult<Json<ProductionRecord>> {
    if patch.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
        return Err(ApiError::BadRequest("title may not be blank".to_string()));
    }
    let updated = state
        .store
        .update_production(id, &patch)
        .await?
        .ok_or(ApiError::NotFound)?;
    info!(id, uuid = %updated.uuid, "production event edited");
    Ok(Json(updated))
}

async fn delete_event(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    if state.store.delete_production(id).await? {
        info!(id, "production event deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

async fn toggle_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<JsonValue>> {
    let is_active = state
        .store
        .toggle_active(id)
        .await?
        .ok_or(ApiError::NotFound)?;
    info!(id, is_active, "production event toggled");
    Ok(Json(json!({ "is_active": is_active })))
}

fn facet_json(key: &str, facets: Vec<FacetCount>) -> JsonValue {
    JsonValue::Array(
        facets
            .into_iter()
            .map(|f| json!({ key: f.value, "count": f.count }))
            .collect(),
    )
}

async fn city_facets(State(state): State<Arc<AppState>>) -> ApiResult<Json<JsonValue>> {
    let facets = state.store.production_facets(EventFacet::City).await?;
    Ok(Json(facet_json("city", facets)))
}

async fn source_facets(State(state): State<Arc<AppState>>) -> ApiResult<Json<JsonValue>> {
    let facets = state.store.production_facets(EventFacet::Source).await?;
    Ok(Json(facet_json("source", facets)))
}

async fn list_staging(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StagingListParams>,
) -> ApiResult<Json<Page<StagingRecord>>> {
    Ok(Json(state.store.list_staging(&params.into_query()).await?))
}

async fn get_staging(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<StagingRecord>> {
    state
        .store
        .get_staging(id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RunListParams>,
) -> ApiResult<Json<Page<RunView>>> {
    let status = non_empty(params.status)
        .map(|s| s.parse::<RunStatus>())
        .transpose()
        .map_err(|e| ApiError::BadRequest(format!("invalid status: {e}")))?;
    let query = RunQuery {
        run_type: non_empty(params.run_type),
        source: non_empty(params.source),
        status,
        pagination: Pagination::new(params.page, params.page_size),
    };
    Ok(Json(state.store.list_runs(&query).await?.map(RunView::from)))
}

async fn get_run(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<Json<RunView>> {
    state
        .store
        .get_run(id)
        .await?
        .map(|run| Json(RunView::from(run)))
        .ok_or(ApiError::NotFound)
}

async fn list_errors(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ErrorListParams>,
) -> ApiResult<Json<Page<ErrorLogEntry>>> {
    let error_type = non_empty(params.error_type)
        .map(|s| s.parse::<ErrorCategory>())
        .transpose()
        .map_err(|e| ApiError::BadRequest(format!("invalid error_type: {e}")))?;
    let query = ErrorQuery {
        error_type,
        source: non_empty(params.source),
        run_id: non_empty(params.run_id),
        search: non_empty(params.search),
        pagination: Pagination::new(params.page, params.page_size),
    };
    Ok(Json(state.store.list_errors(&query).await?))
}

async fn get_error(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ErrorLogEntry>> {
    state
        .store
        .get_error(id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn dashboard_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<JsonValue>> {
    let stats = state.store.dashboard_stats().await?;
    Ok(Json(json!({
        "total_events": stats.total_events,
        "active_events": stats.active_events,
        "events_by_city": facet_json("city", stats.events_by_city),
        "events_by_source": facet_json("source", stats.events_by_source),
        "recent_etl_runs": stats.recent_etl_runs.into_iter().map(RunView::from).collect::<Vec<_>>(),
        "staging_count": stats.staging_count,
    })))
}

struct FacetRow {
    label: String,
    count: u64,
}

struct RunRow {
    run_type: String,
    status: String,
    started_at: String,
    inserted: u64,
    updated: u64,
    unchanged: u64,
    errors: u64,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    total_events: u64,
    active_events: u64,
    staging_count: u64,
    events_by_city: Vec<FacetRow>,
    events_by_source: Vec<FacetRow>,
    recent_runs: Vec<RunRow>,
}

impl From<DashboardStats> for IndexTemplate {
    fn from(stats: DashboardStats) -> Self {
        let rows = |facets: Vec<FacetCount>| {
            facets
                .into_iter()
                .map(|f| FacetRow {
                    label: f.value.unwrap_or_else(|| "(none)".to_string()),
                    count: f.count,
                })
                .collect()
        };
        Self {
            total_events: stats.total_events,
            active_events: stats.active_events,
            staging_count: stats.staging_count,
            events_by_city: rows(stats.events_by_city),
            events_by_source: rows(stats.events_by_source),
            recent_runs: stats
                .recent_etl_runs
                .into_iter()
                .map(|r| RunRow {
                    run_type: r.run_type,
                    status: r.status.to_string(),
                    started_at: r.started_at.format("%Y-%m-%d %H:%M UTC").to_string(),
                    inserted: r.inserted_count,
                    updated: r.updated_count,
                    unchanged: r.unchanged_count,
                    errors: r.error_count,
                })
                .collect(),
        }
    }
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.dashboard_stats().await {
        Ok(stats) => render_html(IndexTemplate::from(stats)),
        Err(err) => server_error(err.into()),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "page render failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
