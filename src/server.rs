//! Metainfo HTTP server (§4.6): four GET-only endpoints plus `/metrics`.
//!
//! `/metainfo/<id>` never regenerates a descriptor on demand — for a
//! multi-TB artifact that can take minutes, and this handler must return
//! promptly either way. It serves whichever of the active-torrent map or
//! the on-disk `.torrent` cache has it, in that order, or 404.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::error_handling::HandleErrorLayer;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tower::{BoxError, ServiceBuilder};
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::distributor::Distributor;
use crate::metainfo;
use crate::metrics;
use crate::types::ArtifactId;

/// Recommended write timeout for `/metainfo/<id>` (§4.6): generous enough
/// for a multi-MB descriptor to reach the slowest peer on the fleet.
const METAINFO_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Read/idle timeout for every other endpoint (§4.6): none of them do
/// more than an in-memory lookup or a shallow directory walk.
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct ServerState {
    pub distributor: Arc<Distributor>,
    pub metrics_handle: PrometheusHandle,
}

pub fn router(state: ServerState) -> Router {
    // `/metainfo/<id>` gets a generous write timeout (a multi-MB descriptor
    // to the slowest peer on the fleet); every other endpoint is a cheap
    // in-memory lookup or shallow directory walk and gets the short
    // read/idle timeout instead (§4.6, §5). `HandleErrorLayer` is required
    // alongside `TimeoutLayer` because a fired timeout makes the wrapped
    // service fallible, and axum's router itself must stay infallible.
    let metainfo_routes = Router::new()
        .route("/metainfo/*id", get(get_metainfo))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_timeout_error))
                .layer(TimeoutLayer::new(METAINFO_RESPONSE_TIMEOUT)),
        );

    let other_routes = Router::new()
        .route("/health", get(get_health))
        .route("/stats", get(get_stats))
        .route("/models", get(get_models))
        .route("/metrics", get(get_metrics))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_timeout_error))
                .layer(TimeoutLayer::new(DEFAULT_RESPONSE_TIMEOUT)),
        );

    metainfo_routes.merge(other_routes).with_state(state)
}

async fn handle_timeout_error(err: BoxError) -> Response {
    if err.is::<tower::timeout::error::Elapsed>() {
        StatusCode::REQUEST_TIMEOUT.into_response()
    } else {
        warn!(error = %err, "unhandled error in http middleware stack");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }
}

async fn get_metainfo(State(state): State<ServerState>, Path(raw_id): Path<String>) -> Response {
    debug!(path = %raw_id, "metainfo request");
    let started = Instant::now();

    let id = match ArtifactId::parse(&raw_id) {
        Ok(id) => id,
        Err(_) => {
            warn!(raw_id = %raw_id, "rejected path-unsafe metainfo request");
            metrics::metainfo_request(&state.distributor.config().namespace, 400);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let namespace = state.distributor.config().namespace.clone();

    let (status, response) = if let Some(bytes) = state.distributor.active_metainfo_bytes(&id) {
        (200, metainfo_response(&id, bytes))
    } else {
        match metainfo::load_from_cache(state.distributor.config().data_dir.as_path(), &id) {
            Ok(Some(cached)) => match cached.to_bytes() {
                Ok(bytes) => (200, metainfo_response(&id, bytes)),
                Err(err) => {
                    warn!(artifact_id = %id, error = %err, "failed to re-encode cached metainfo");
                    (500, StatusCode::INTERNAL_SERVER_ERROR.into_response())
                }
            },
            Ok(None) => (404, StatusCode::NOT_FOUND.into_response()),
            Err(err) => {
                warn!(artifact_id = %id, error = %err, "failed to read cached metainfo");
                (500, StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
        }
    };

    metrics::metainfo_request(&namespace, status);
    metrics::metainfo_latency(&namespace, id.as_str(), started.elapsed());
    response
}

fn metainfo_response(id: &ArtifactId, bytes: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-bittorrent".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{id}.torrent\""),
            ),
            (header::CONTENT_LENGTH, bytes.len().to_string()),
        ],
        bytes,
    )
        .into_response()
}

async fn get_health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct StatsResponse {
    active_torrents: usize,
    total_bytes_uploaded: u64,
    total_bytes_downloaded: u64,
    active_peers: usize,
}

async fn get_stats(State(state): State<ServerState>) -> Response {
    let stats = state.distributor.aggregate_stats();
    axum::Json(StatsResponse {
        active_torrents: stats.active_torrents,
        total_bytes_uploaded: stats.total_bytes_uploaded,
        total_bytes_downloaded: stats.total_bytes_downloaded,
        active_peers: stats.active_peers,
    })
    .into_response()
}

#[derive(Serialize)]
struct ModelEntry {
    hash: String,
    seeding: bool,
}

async fn get_models(State(state): State<ServerState>) -> Response {
    let data_dir: PathBuf = state.distributor.config().data_dir.clone();
    let mut models = Vec::new();

    let entries = WalkDir::new(&data_dir).min_depth(1).max_depth(1);
    for entry in entries {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_dir() && !entry.path_is_symlink() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".torrent.tmp") || name.ends_with(".torrent") {
            continue;
        }
        let Ok(id) = ArtifactId::parse(&name) else {
            continue;
        };
        models.push(ModelEntry {
            seeding: state.distributor.is_seeding(&id),
            hash: name,
        });
    }

    axum::Json(models).into_response()
}

async fn get_metrics(State(state): State<ServerState>) -> Response {
    state.metrics_handle.render().into_response()
}
