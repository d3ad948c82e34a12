//! Prometheus metrics and the metrics/probe HTTP server.
//!
//! All collectors live in a [`Metrics`] value that owns its own registry,
//! so tests can create as many instances as they like.

use crate::controller::ControllerState;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

const NAMESPACE: &str = "featured_operator";
const SUBSYSTEM: &str = "featureflag";

/// Outcome label values for `syncs_total`
pub const RESULT_SUCCESS: &str = "success";
/// Sync failed and the key was requeued with backoff
pub const RESULT_REQUEUED: &str = "requeued";
/// Sync failed permanently and the key was dropped
pub const RESULT_DROPPED: &str = "dropped";

/// Controller metrics
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    /// ConfigMaps confirmed as managed by a FeatureFlag
    pub configmaps: IntCounter,
    /// ConfigMaps created by the reconciler
    pub configmap_created: IntCounter,
    /// Delete notifications for FeatureFlag-owned ConfigMaps
    pub configmap_deleted: IntCounter,
    /// Finished syncs by result
    pub syncs: IntCounterVec,
    /// Keys waiting in the work queue
    pub workqueue_depth: IntGauge,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE).subsystem(SUBSYSTEM)
}

impl Metrics {
    /// Creates and registers all collectors in a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let configmaps = IntCounter::with_opts(opts("configmaps", "Number of ConfigMaps managed by FeatureFlags"))?;
        let configmap_created = IntCounter::with_opts(opts("configmap_created", "Number of ConfigMaps created"))?;
        let configmap_deleted = IntCounter::with_opts(opts("configmap_deleted", "Number of managed ConfigMaps deleted"))?;
        let syncs = IntCounterVec::new(opts("syncs_total", "Number of finished syncs by result"), &["result"])?;
        let workqueue_depth = IntGauge::with_opts(opts("workqueue_depth", "Number of keys waiting in the work queue"))?;

        registry.register(Box::new(configmaps.clone()))?;
        registry.register(Box::new(configmap_created.clone()))?;
        registry.register(Box::new(configmap_deleted.clone()))?;
        registry.register(Box::new(syncs.clone()))?;
        registry.register(Box::new(workqueue_depth.clone()))?;

        Ok(Self {
            registry,
            configmaps,
            configmap_created,
            configmap_deleted,
            syncs,
            workqueue_depth,
        })
    }

    /// Counts a finished sync under `result`.
    pub fn observe_sync(&self, result: &str) {
        self.syncs.with_label_values(&[result]).inc();
    }

    /// Renders every registered metric in the text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[derive(Clone)]
struct ServerState {
    metrics: Arc<Metrics>,
    controller_state: watch::Receiver<ControllerState>,
}

/// Builds the metrics and probe routes.
pub fn router(
    metrics: Arc<Metrics>,
    controller_state: watch::Receiver<ControllerState>,
    metrics_path: &str,
) -> Router {
    Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(ServerState {
            metrics,
            controller_state,
        })
}

/// Serves [`router`] on `address` until `shutdown` resolves.
pub async fn serve(
    address: &str,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!("Serving metrics and probes on {}", listener.local_addr()?);
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

async fn metrics_handler(State(state): State<ServerState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(state): State<ServerState>) -> StatusCode {
    if *state.controller_state.borrow() == ControllerState::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
