use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use catalog_core::{
    Backoff, BoundedResultPager, CatalogRecord, CatalogSynchronizer, CheckpointStore,
    HttpPageSource, NumericField, NumericFilters, PageSource, PagerConfig, Remaining,
    RetryingSource, SledStore, SyncConfig,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Deserialize, Default)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    #[serde(default)]
    pub min_members: f64,
    #[serde(default)]
    pub max_members: f64,
    #[serde(default)]
    pub min_activity_24h: f64,
    #[serde(default)]
    pub max_activity_24h: f64,
    #[serde(default)]
    pub min_volume_24h: f64,
    #[serde(default)]
    pub max_volume_24h: f64,
    #[serde(default)]
    pub min_gained_24h: f64,
    #[serde(default)]
    pub max_gained_24h: f64,
    #[serde(default)]
    pub min_lost_24h: f64,
    #[serde(default)]
    pub max_lost_24h: f64,
    #[serde(default)]
    pub min_share_value: f64,
    #[serde(default)]
    pub max_share_value: f64,
}

impl SearchParams {
    fn filters(&self) -> NumericFilters {
        NumericFilters::new()
            .min(NumericField::Members, self.min_members)
            .max(NumericField::Members, self.max_members)
            .min(NumericField::Activity24h, self.min_activity_24h)
            .max(NumericField::Activity24h, self.max_activity_24h)
            .min(NumericField::Volume24h, self.min_volume_24h)
            .max(NumericField::Volume24h, self.max_volume_24h)
            .min(NumericField::Gained24h, self.min_gained_24h)
            .max(NumericField::Gained24h, self.max_gained_24h)
            .min(NumericField::Lost24h, self.min_lost_24h)
            .max(NumericField::Lost24h, self.max_lost_24h)
            .min(NumericField::ShareValue, self.min_share_value)
            .max(NumericField::ShareValue, self.max_share_value)
    }
}

#[derive(Deserialize, Default)]
pub struct SyncParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Serialize)]
pub struct SearchResponse {
    /// False while a sync is in progress or the snapshot is empty; results
    /// then come from the last completed snapshot.
    pub ready: bool,
    pub query: String,
    pub took_s: f64,
    pub total_hits: usize,
    pub results: Vec<SearchHit>,
    pub remaining: &'static str,
}

#[derive(Serialize)]
pub struct MoreResponse {
    pub revealed: usize,
    pub results: Vec<SearchHit>,
    pub remaining: &'static str,
}

#[derive(Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub record: CatalogRecord,
    /// Name with the query fragment wrapped in `<em>`.
    pub highlighted: String,
}

/// The pager serves one consumer: every `/search` starts a new result set
/// and `/search/more` continues it.
struct Session {
    pager: BoundedResultPager<CatalogRecord>,
    query: String,
}

pub struct AppState<Src, St> {
    pub sync: Arc<CatalogSynchronizer<Src, St>>,
    session: Arc<Mutex<Session>>,
    pub admin_token: Option<String>,
}

impl<Src, St> Clone for AppState<Src, St> {
    fn clone(&self) -> Self {
        Self {
            sync: self.sync.clone(),
            session: self.session.clone(),
            admin_token: self.admin_token.clone(),
        }
    }
}

impl<Src, St> AppState<Src, St> {
    pub fn new(
        sync: Arc<CatalogSynchronizer<Src, St>>,
        pager: PagerConfig,
        admin_token: Option<String>,
    ) -> Self {
        let session = Session { pager: BoundedResultPager::new(pager), query: String::new() };
        Self { sync, session: Arc::new(Mutex::new(session)), admin_token }
    }
}

pub type HttpSynchronizer = CatalogSynchronizer<RetryingSource<HttpPageSource>, SledStore>;

/// Open the store, wire the HTTP source and build the router. Reads
/// `ADMIN_TOKEN` and `CORS_ALLOW_ORIGIN` from the environment.
pub fn build_app(store_dir: &str, source_url: &str, config: SyncConfig) -> Result<Router> {
    let store = Arc::new(SledStore::open(store_dir)?);
    let source = HttpPageSource::new(source_url, "catalog-server/0.1", Duration::from_secs(12))?;
    let source = RetryingSource::new(source, 3, Backoff::default());
    let sync: Arc<HttpSynchronizer> = Arc::new(CatalogSynchronizer::new(source, store, config));
    let health = sync.check_sync_health()?;
    tracing::info!(
        ready = health.ready,
        records = health.metadata.as_ref().map(|m| m.count),
        "catalog store opened"
    );

    let state = AppState::new(sync, PagerConfig::default(), std::env::var("ADMIN_TOKEN").ok());
    Ok(router(state))
}

pub fn router<Src, St>(state: AppState<Src, St>) -> Router
where
    Src: PageSource + 'static,
    St: CheckpointStore + 'static,
{
    // CORS: read CORS_ALLOW_ORIGIN (comma-separated) or allow Any by default
    let cors = match std::env::var("CORS_ALLOW_ORIGIN") {
        Ok(val) => {
            let origins: Vec<_> = val.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new()
                    .allow_origin(AllowOrigin::list(origins))
                    .allow_methods(Any)
                    .allow_headers(Any)
            }
        }
        Err(_) => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    };

    Router::new()
        .route("/health", get(health_handler::<Src, St>))
        .route("/search", get(search_handler::<Src, St>))
        .route("/search/more", get(more_handler::<Src, St>))
        .route("/record/:id", get(record_handler::<Src, St>))
        .route("/sync", post(sync_handler::<Src, St>))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

type ApiError = (StatusCode, String);

fn internal(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

pub async fn health_handler<Src, St>(
    State(state): State<AppState<Src, St>>,
) -> Result<Json<serde_json::Value>, ApiError>
where
    Src: PageSource,
    St: CheckpointStore,
{
    let health = state.sync.check_sync_health().map_err(internal)?;
    Ok(Json(serde_json::json!({
        "ready": health.ready,
        "syncing": state.sync.is_running(),
        "metadata": health.metadata,
    })))
}

/// Query the working copy. Answers 503 until a sync has completed once, so
/// a store that was never synchronized is not mistaken for an empty catalog.
pub async fn search_handler<Src, St>(
    State(state): State<AppState<Src, St>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError>
where
    Src: PageSource,
    St: CheckpointStore,
{
    let start = std::time::Instant::now();
    let health = state.sync.check_sync_health().map_err(internal)?;
    if health.metadata.is_none() {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "catalog not synchronized yet".into()));
    }
    let index = state.sync.index();
    index.ensure_loaded().map_err(internal)?;
    let results = index.query(&params.q, &params.filters());
    let total_hits = results.len();

    let mut session = state.session.lock();
    session.query = params.q.clone();
    session.pager.reset(results);
    let reveal = session.pager.reveal_next();
    let remaining = reveal.remaining;
    let batch = reveal.batch.to_vec();
    let hits = to_hits(batch, &params.q);

    let elapsed = start.elapsed();
    Ok(Json(SearchResponse {
        ready: health.ready,
        query: params.q,
        took_s: elapsed.as_secs_f64(),
        total_hits,
        results: hits,
        remaining: remaining.as_str(),
    }))
}

pub async fn more_handler<Src, St>(State(state): State<AppState<Src, St>>) -> Json<MoreResponse>
where
    Src: PageSource,
    St: CheckpointStore,
{
    let mut session = state.session.lock();
    let reveal = session.pager.reveal_next();
    let remaining: Remaining = reveal.remaining;
    let batch = reveal.batch.to_vec();
    let hits = to_hits(batch, &session.query);
    Json(MoreResponse {
        revealed: session.pager.revealed(),
        results: hits,
        remaining: remaining.as_str(),
    })
}

pub async fn record_handler<Src, St>(
    State(state): State<AppState<Src, St>>,
    Path(id): Path<String>,
) -> Json<serde_json::Value>
where
    Src: PageSource,
    St: CheckpointStore,
{
    match state.sync.index().get(&id) {
        Some(record) => Json(serde_json::to_value(record).unwrap_or_default()),
        None => Json(serde_json::json!({ "error": "not found" })),
    }
}

/// Start a sync in the background. Admin only. 409 when a run is already
/// in flight.
pub async fn sync_handler<Src, St>(
    State(state): State<AppState<Src, St>>,
    headers: HeaderMap,
    Query(params): Query<SyncParams>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError>
where
    Src: PageSource + 'static,
    St: CheckpointStore + 'static,
{
    authorize(state.admin_token.as_deref(), &headers)?;
    let force = params.force;
    match state.sync.spawn_sync(force) {
        Some(_detached) => {
            let body = serde_json::json!({ "status": "started", "force": force });
            Ok((StatusCode::ACCEPTED, Json(body)))
        }
        None => Ok((StatusCode::CONFLICT, Json(serde_json::json!({ "status": "busy" })))),
    }
}

fn to_hits(batch: Vec<CatalogRecord>, query: &str) -> Vec<SearchHit> {
    let pattern = highlighter(query);
    batch
        .into_iter()
        .map(|record| {
            let highlighted = match &pattern {
                Some(re) => emphasize(re, &record.name),
                None => record.name.clone(),
            };
            SearchHit { record, highlighted }
        })
        .collect()
}

fn emphasize(re: &regex::Regex, name: &str) -> String {
    re.replace_all(name, |caps: &regex::Captures| format!("<em>{}</em>", &caps[0])).into_owned()
}

fn highlighter(query: &str) -> Option<regex::Regex> {
    let q = query.trim();
    if q.chars().count() < catalog_core::search::MIN_TEXT_QUERY_CHARS {
        return None;
    }
    regex::RegexBuilder::new(&regex::escape(q)).case_insensitive(true).build().ok()
}

fn authorize(required: Option<&str>, headers: &HeaderMap) -> Result<(), ApiError> {
    let required = match required {
        Some(t) => t,
        None => return Err((StatusCode::UNAUTHORIZED, "ADMIN_TOKEN not set".into())),
    };
    let provided = headers.get("X-ADMIN-TOKEN").and_then(|v| v.to_str().ok()).unwrap_or("");
    if provided == required {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, "invalid admin token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highlights_case_insensitively() {
        let re = highlighter("nor").unwrap();
        assert_eq!(emphasize(&re, "Northern"), "<em>Nor</em>thern");
        assert!(highlighter("n").is_none());
    }

    #[test]
    fn rejects_missing_or_wrong_token() {
        let mut headers = HeaderMap::new();
        assert!(authorize(None, &headers).is_err());
        headers.insert("x-admin-token", "nope".parse().unwrap());
        assert!(authorize(Some("secret"), &headers).is_err());
        headers.insert("x-admin-token", "secret".parse().unwrap());
        assert!(authorize(Some("secret"), &headers).is_ok());
    }
}
