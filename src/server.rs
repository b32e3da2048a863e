use crate::aggregate::Summary;
use crate::config::AppConfig;
use crate::data::{FetchScope, Fetched};
use crate::spatial::{self, SpatialIndex};
use crate::types::{FeatureCollection, Properties};
use crate::variables::{self, Heatmap, Topic, VariableDescriptor, TOPICS};
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use geo::Point;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::info;

pub struct AppState {
    pub collection: FeatureCollection,
    /// Whether the collection honours the requested filter.
    pub scope: FetchScope,
    pub index: SpatialIndex,
}

impl AppState {
    pub fn new(fetched: Fetched) -> Self {
        let Fetched { collection, scope } = fetched;
        info!("Building spatial index for {} manzanas...", collection.len());
        let index = SpatialIndex::build(&collection.features);
        Self {
            collection,
            scope,
            index,
        }
    }

    fn summarize(&self, indices: Vec<usize>) -> SelectionSummary {
        let selected = spatial::select(&self.collection.features, &indices);
        SelectionSummary {
            summary: Summary::compute(&selected),
            selected: indices,
        }
    }
}

type ApiError = (StatusCode, String);

#[derive(Deserialize)]
pub struct LensParams {
    lat: Option<f64>,
    lon: Option<f64>,
    radius_km: Option<f64>,
}

#[derive(Deserialize)]
pub struct PointParams {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Serialize)]
pub struct SelectionSummary {
    /// Indices into `/api/features`.
    pub selected: Vec<usize>,
    pub summary: Summary,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    manzanas: usize,
    scope: FetchScope,
    /// True when a spatial filter was dropped and every manzana was loaded.
    degraded: bool,
}

#[derive(Debug, Serialize)]
pub struct PickResponse {
    index: usize,
    properties: Properties,
}

/// Lens radius used when the client sends a centre but no radius.
const DEFAULT_RADIUS_KM: f64 = 0.5;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/features", get(features_handler))
        .route("/api/topics", get(topics_handler))
        .route("/api/variables", get(variables_handler))
        .route("/api/summary", get(summary_handler))
        .route("/api/summary/polygon", post(polygon_summary_handler))
        .route("/api/pick", get(pick_handler))
        .route("/api/heatmap/:variable", get(heatmap_handler))
        .with_state(state)
}

pub async fn start_server(config: AppConfig, fetched: Fetched) -> Result<()> {
    let state = Arc::new(AppState::new(fetched));

    let mut app = router(state);
    if let Some(static_dir) = &config.server.static_dir {
        app = app.fallback_service(ServeDir::new(static_dir));
    }
    let app = app.layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([127, 0, 0, 1], config.server.port));
    info!("Starting server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        manzanas: state.collection.len(),
        scope: state.scope,
        degraded: state.scope == FetchScope::Degraded,
    })
}

async fn features_handler(State(state): State<Arc<AppState>>) -> Json<FeatureCollection> {
    Json(state.collection.clone())
}

async fn topics_handler() -> Json<Vec<Topic>> {
    Json(TOPICS.to_vec())
}

async fn variables_handler() -> Json<Vec<VariableDescriptor>> {
    Json(
        variables::HEATMAP_VARIABLES
            .iter()
            .map(|v| v.descriptor())
            .collect(),
    )
}

/// Radius lens around `lat`/`lon`; without a centre, the whole collection.
async fn summary_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LensParams>,
) -> Result<Json<SelectionSummary>, ApiError> {
    let indices = match (params.lat, params.lon) {
        (Some(lat), Some(lon)) => {
            let radius_km = params.radius_km.unwrap_or(DEFAULT_RADIUS_KM);
            if !radius_km.is_finite() || radius_km < 0.0 {
                return Err((
                    StatusCode::BAD_REQUEST,
                    format!("invalid radius_km: {}", radius_km),
                ));
            }
            state.index.within_radius(Point::new(lon, lat), radius_km)
        }
        (None, None) => (0..state.collection.len()).collect(),
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                "lat and lon must be given together".to_string(),
            ))
        }
    };
    Ok(Json(state.summarize(indices)))
}

async fn polygon_summary_handler(
    State(state): State<Arc<AppState>>,
    Json(geometry): Json<Value>,
) -> Result<Json<SelectionSummary>, ApiError> {
    let drawn = spatial::to_multipolygon(&geometry).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            "body must be a GeoJSON Polygon or MultiPolygon".to_string(),
        )
    })?;
    let indices = state.index.within_polygon(&drawn);
    Ok(Json(state.summarize(indices)))
}

async fn pick_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PointParams>,
) -> Json<Option<PickResponse>> {
    let picked = state
        .index
        .pick(Point::new(params.lon, params.lat))
        .and_then(|index| {
            state.collection.features.get(index).map(|f| PickResponse {
                index,
                properties: f.properties.clone(),
            })
        });
    Json(picked)
}

async fn heatmap_handler(
    State(state): State<Arc<AppState>>,
    Path(variable): Path<String>,
) -> Result<Json<Heatmap>, ApiError> {
    let variable = variables::find_variable(&variable).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            format!("unknown heatmap variable: {}", variable),
        )
    })?;
    Ok(Json(variables::heatmap(variable, &state.collection.features)))
}
