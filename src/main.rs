//! # Nearby Cities Service
//!
//! A REST API that lists the cities around a named city, a coordinate or the
//! caller's IP address.
//!
//! ## API Endpoints
//!
//! * `GET /` - Cities near the caller's IP address
//! * `GET /search?city=<name>` - Cities near a named city
//! * `GET /nearby?lat=<lat>&lng=<lng>` - Cities near a coordinate
//! * `GET /geokey/{key}` - Bounding box of a geohash key
//! * `GET /health` - Index state
//!
//! The search endpoints accept `radius` (km), `strict=true` to drop
//! candidates beyond the radius, and `format=geojson`.
//!
//! ## Configuration
//!
//! See [`nearby_cities::Config`] for the environment variables. Logging is
//! controlled with `RUST_LOG`.
use axum::{
    Json, Router,
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};

use nearby_cities::{
    BoundingBox, BuildOutcome, CityStore, Config, IndexBuilder, IndexState, NearbyCities,
    NearbyError, NearbyQuery, ProximityEngine, decode_key, load_cities, load_ip_ranges,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const NO_MATCH: &str = "No matching city found.";
const INTERNAL_ERROR: &str = "Oops! Something went wrong. Please try again later.";

struct AppState {
    engine: ProximityEngine,
    index_state: IndexState,
    radius_km: f64,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    city: String,
    radius: Option<f64>,
    strict: Option<bool>,
    format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NearbyParams {
    lat: f64,
    lng: f64,
    radius: Option<f64>,
    strict: Option<bool>,
    format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpParams {
    radius: Option<f64>,
    strict: Option<bool>,
    format: Option<String>,
}

#[derive(Debug, Serialize)]
struct Health {
    state: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), NearbyError> {
    let config = Config::from_env()?;
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let store = CityStore::open(&config.db_path)?;
    let mut builder = IndexBuilder::new(store.clone())?;
    let outcome = builder.build(|store| {
        if let Some(path) = &config.ip2location_csv {
            store.load_ip_ranges(load_ip_ranges(path)?)?;
        }
        load_cities(&config.cities_csv)
    })?;
    match outcome {
        BuildOutcome::Built { cities, elapsed } => {
            info!("indexed {} cities in {:?}", cities, elapsed)
        }
        BuildOutcome::Skipped => info!("using existing index at {:?}", config.db_path),
    }

    let shared_state = Arc::new(AppState {
        engine: ProximityEngine::from_index(&builder)?.with_cache_radius(config.radius_km)?,
        index_state: builder.state().clone(),
        radius_km: config.radius_km,
    });

    let app = Router::new()
        .route("/", get(nearby_by_ip))
        .route("/search", get(search))
        .route("/nearby", get(nearby))
        .route("/geokey/{key}", get(geokey))
        .route("/health", get(health))
        .with_state(Arc::clone(&shared_state))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!("server is listening on {}", config.listen_addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    store.flush()?;
    info!("server has stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("failed to listen for SIGTERM: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutting down server");
}

fn nearby_query(state: &AppState, radius: Option<f64>, strict: Option<bool>) -> NearbyQuery {
    NearbyQuery {
        radius_km: radius.unwrap_or(state.radius_km),
        strict: strict.unwrap_or(false),
    }
}

fn error_response(e: NearbyError) -> (StatusCode, String) {
    if e.is_validation() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else {
        error!("query failed: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR.to_string())
    }
}

fn render(
    result: Result<Option<NearbyCities>, NearbyError>,
    format: Option<&str>,
) -> Result<Response, (StatusCode, String)> {
    match result.map_err(error_response)? {
        Some(nearby) if format == Some("geojson") => {
            Ok(Json(nearby.to_feature_collection()).into_response())
        }
        Some(nearby) => Ok(Json(nearby).into_response()),
        None => Err((StatusCode::NOT_FOUND, NO_MATCH.to_string())),
    }
}

/// The caller's address: `X-Real-IP`, then the first `X-Forwarded-For` hop,
/// then the socket peer.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    header("x-real-ip")
        .or_else(|| {
            header("x-forwarded-for")
                .and_then(|v| v.split(',').next().map(|hop| hop.trim().to_string()))
        })
        .unwrap_or_else(|| peer.ip().to_string())
}

async fn nearby_by_ip(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<IpParams>,
) -> Result<Response, (StatusCode, String)> {
    let ip = client_ip(&headers, peer);
    let query = nearby_query(&state, params.radius, params.strict);
    render(
        state.engine.find_nearby_ip(&ip, &query),
        params.format.as_deref(),
    )
}

async fn search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<Response, (StatusCode, String)> {
    let query = nearby_query(&state, params.radius, params.strict);
    render(
        state.engine.find_nearby_city(&params.city, &query),
        params.format.as_deref(),
    )
}

async fn nearby(
    State(state): State<Arc<AppState>>,
    Query(params): Query<NearbyParams>,
) -> Result<Response, (StatusCode, String)> {
    let query = nearby_query(&state, params.radius, params.strict);
    render(
        state
            .engine
            .find_nearby(params.lat, params.lng, &query)
            .map(Some),
        params.format.as_deref(),
    )
}

async fn geokey(Path(key): Path<String>) -> Result<Json<BoundingBox>, (StatusCode, String)> {
    decode_key(&key).map(Json).map_err(error_response)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        state: format!("{:?}", state.index_state),
    })
}
