use crate::analytics::{SummaryCache, WardSummary};
use crate::config::AppConfig;
use crate::data::{load_catalog, Catalog, LoadProgress, ProgressSnapshot};
use crate::interaction::{ClickQuery, Dispatch, Dispatcher};
use crate::popup::PopupRenderer;
use crate::style::{build_style, MapStyle};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use geojson::FeatureCollection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tera::Tera;
use tokio::sync::OnceCell;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub struct AppState {
    pub config: AppConfig,
    pub views: Tera,
    pub popups: PopupRenderer,
    pub progress: Arc<LoadProgress>,
    pub catalog: OnceCell<Arc<Catalog>>,
    pub summaries: SummaryCache,
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Self> {
        let pattern = format!("{}/**/*.html", config.server.views_dir.display());
        let views = Tera::new(&pattern)
            .with_context(|| format!("Failed to load views from {}", pattern))?;
        Self::with_views(config, views)
    }

    pub fn with_views(config: AppConfig, views: Tera) -> Result<Self> {
        Ok(Self {
            progress: Arc::new(LoadProgress::for_config(&config)),
            config,
            views,
            popups: PopupRenderer::new()?,
            catalog: OnceCell::new(),
            summaries: SummaryCache::default(),
        })
    }

    fn catalog(&self) -> Result<&Arc<Catalog>, ApiError> {
        self.catalog.get().ok_or(ApiError::Loading(self.progress.snapshot()))
    }
}

/// Failures surfaced to HTTP clients as `{ "error": ... }`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Loading(ProgressSnapshot),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(what) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": format!("{what} not found") }))).into_response()
            }
            ApiError::Loading(progress) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "map data is still loading", "progress": progress })),
            )
                .into_response(),
            ApiError::Internal(err) => {
                error!("request failed: {:#}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response()
            }
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let static_files = ServeDir::new(&state.config.server.public_dir);

    Router::new()
        .route("/", get(|| async { Redirect::to("/map") }))
        .route("/map", get(map_page))
        .route("/leaflet", get(leaflet_page))
        .route("/api/status", get(status_handler))
        .route("/api/layers", get(layers_handler))
        .route("/api/datasets/:id", get(dataset_handler))
        .route("/api/click", get(click_handler))
        .route("/api/wards/:id", get(ward_handler))
        .route("/api/elevation", get(elevation_handler))
        .fallback_service(static_files)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Loads the catalog on a blocking thread and publishes it when done.
pub fn spawn_loader(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let loader_state = state.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            load_catalog(&loader_state.config, &loader_state.progress)
        })
        .await;

        match loaded {
            Ok(catalog) => {
                info!(
                    trees = catalog.trees.len(),
                    wards = catalog.wards.len(),
                    schools = catalog.schools.as_ref().map(Vec::len).unwrap_or(0),
                    "Map initialization complete"
                );
                let _ = state.catalog.set(Arc::new(catalog));
            }
            Err(e) => error!("Data loader panicked: {}", e),
        }
    })
}

pub async fn start_server(config: AppConfig) -> Result<()> {
    let addr = config.bind_addr()?;
    if config.server.mapbox_token.is_none() {
        tracing::warn!("MAPBOX_TOKEN is not set; the map page will not authenticate");
    }

    let state = Arc::new(AppState::new(config)?);
    spawn_loader(state.clone());

    let app = build_router(state);

    info!("✅ Server running at http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn render(views: &Tera, template: &str, ctx: &tera::Context) -> Result<Html<String>, ApiError> {
    views.render(template, ctx)
        .map(Html)
        .with_context(|| format!("Failed to render {template}"))
        .map_err(ApiError::from)
}

async fn map_page(State(state): State<Arc<AppState>>) -> Result<Html<String>, ApiError> {
    let mut ctx = tera::Context::new();
    ctx.insert("mapbox_token", &state.config.server.mapbox_token.clone().unwrap_or_default());
    ctx.insert("map", &json!({
        "style": state.config.map.style,
        "center": state.config.map.center,
        "zoom": state.config.map.zoom,
    }));
    render(&state.views, "map.html", &ctx)
}

async fn leaflet_page(State(state): State<Arc<AppState>>) -> Result<Html<String>, ApiError> {
    let datasets: Vec<_> = state.config.input.datasets.iter()
        .map(|d| json!({ "id": d.id, "label": d.label, "color": d.color }))
        .collect();
    let mut ctx = tera::Context::new();
    ctx.insert("center", &state.config.map.center);
    ctx.insert("zoom", &state.config.map.zoom);
    ctx.insert("datasets", &datasets);
    render(&state.views, "leaflet.html", &ctx)
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    progress: ProgressSnapshot,
    ready: bool,
    bounds: Option<[[f64; 2]; 2]>,
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let catalog = state.catalog.get();
    Json(StatusResponse {
        progress: state.progress.snapshot(),
        ready: catalog.is_some(),
        bounds: catalog.and_then(|c| c.bounds_array()),
    })
}

async fn layers_handler(State(state): State<Arc<AppState>>) -> Result<Json<MapStyle>, ApiError> {
    let catalog = state.catalog()?;
    Ok(Json(build_style(&state.config, &catalog.availability())))
}

async fn dataset_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<FeatureCollection>, ApiError> {
    let catalog = state.catalog()?;
    catalog.collections.get(&id)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("dataset '{id}'")))
}

#[derive(Deserialize)]
pub struct ClickParams {
    lng: f64,
    lat: f64,
    #[serde(default = "default_click_zoom")]
    zoom: f64,
    /// Comma separated toggle ids that are switched off.
    #[serde(default)]
    hidden: Option<String>,
}

fn default_click_zoom() -> f64 {
    14.0
}

impl From<ClickParams> for ClickQuery {
    fn from(params: ClickParams) -> Self {
        let mut query = ClickQuery::new(params.lng, params.lat, params.zoom);
        query.hidden = params.hidden
            .iter()
            .flat_map(|h| h.split(','))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        query
    }
}

async fn click_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ClickParams>,
) -> Result<Json<Dispatch>, ApiError> {
    let catalog = state.catalog()?;
    let dispatcher = Dispatcher {
        config: &state.config,
        catalog: catalog.as_ref(),
        popups: &state.popups,
        summaries: &state.summaries,
    };
    let dispatch = dispatcher.dispatch(&params.into()).await?;
    Ok(Json(dispatch))
}

async fn ward_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<usize>,
) -> Result<Json<Arc<WardSummary>>, ApiError> {
    let catalog = state.catalog()?;
    let ward = catalog.ward(id).ok_or_else(|| ApiError::NotFound(format!("ward {id}")))?;
    let summary = state.summaries
        .get_or_compute(catalog, ward, &state.config.analytics)
        .await;
    Ok(Json(summary))
}

#[derive(Deserialize)]
pub struct ElevationParams {
    lng: f64,
    lat: f64,
}

async fn elevation_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ElevationParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let catalog = state.catalog()?;
    let elevation = catalog.elevation
        .as_deref()
        .and_then(|source| source.elevation_at(params.lng, params.lat));
    Ok(Json(json!({ "lng": params.lng, "lat": params.lat, "elevation": elevation })))
}
