//! FeatureFlag Controller
//!
//! Watches FeatureFlag resources and keeps, for each of them, a ConfigMap of
//! the configured name in the same namespace, owned by the flag:
//! - missing ConfigMaps are created with a controller owner reference
//! - ConfigMaps not controlled by the flag are reported, never adopted
//! - the flag's status records the confirmed ConfigMap
//!
//! ## Usage
//!
//! ```bash
//! featureflag-controller --workers 4 --namespace team-a
//!
//! # Verbose logging
//! RUST_LOG=featureflag_controller=debug featureflag-controller
//! ```

mod backoff;
mod cache;
mod config;
mod controller;
mod error;
mod events;
mod expectations;
mod key;
mod metrics;
mod reconciler;
mod router;
mod store;
mod workqueue;

#[cfg(test)]
mod test_utils;

use crate::backoff::ExponentialBackoff;
use crate::cache::{watch_stream, CacheFeeder, NOTIFICATION_BUFFER};
use crate::config::Config;
use crate::controller::Controller;
use crate::events::KubeEventSink;
use crate::metrics::Metrics;
use crate::reconciler::Reconciler;
use crate::router::EventRouter;
use crate::store::KubeClusterStore;
use crate::workqueue::WorkQueue;
use anyhow::anyhow;
use clap::Parser;
use crds::{FeatureFlag, FEATURE_FLAG_KIND};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(&config);
    config.validate()?;

    info!("Starting FeatureFlag Controller");
    info!("Configuration:");
    info!("  Workers: {}", config.workers);
    info!("  Namespace: {}", config.watch_namespace().unwrap_or("all namespaces"));
    info!("  Resync interval: {:?}", config.resync_interval());
    info!("  Metrics: {}{}", config.metrics_address, config.metrics_path);

    // kube's rustls client needs a process-wide crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let stop = spawn_signal_handler();

    let (flag_api, config_map_api): (Api<FeatureFlag>, Api<ConfigMap>) = match config.watch_namespace() {
        Some(ns) => (Api::namespaced(client.clone(), ns), Api::namespaced(client.clone(), ns)),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    // Caches feed the router over bounded channels
    let (flag_tx, flag_rx) = mpsc::channel(NOTIFICATION_BUFFER);
    let (config_map_tx, config_map_rx) = mpsc::channel(NOTIFICATION_BUFFER);
    let flag_feeder = CacheFeeder::new(FEATURE_FLAG_KIND, flag_tx);
    let config_map_feeder = CacheFeeder::new("ConfigMap", config_map_tx);
    let flags = flag_feeder.cache();
    let config_maps = config_map_feeder.cache();

    let resync = config.resync_interval();
    let flag_cache_task = tokio::spawn(async move {
        if let Err(e) = flag_feeder.run(watch_stream(flag_api), resync).await {
            error!("FeatureFlag cache stopped: {}", e);
        }
    });
    let config_map_cache_task = tokio::spawn(async move {
        if let Err(e) = config_map_feeder.run(watch_stream(config_map_api), resync).await {
            error!("ConfigMap cache stopped: {}", e);
        }
    });

    let metrics = Arc::new(Metrics::new()?);
    let queue = Arc::new(WorkQueue::new(
        "featureflags",
        ExponentialBackoff::new(config.backoff_base(), config.backoff_max()),
    ));

    let router = EventRouter::new(flags.clone(), queue.clone(), metrics.clone());
    let router_task = tokio::spawn(router.run(flag_rx, config_map_rx));

    let reconciler = Arc::new(Reconciler::new(
        flags.clone(),
        config_maps.clone(),
        Arc::new(KubeClusterStore::new(client.clone())),
        Arc::new(KubeEventSink::new(client, std::env::var("POD_NAME").ok())),
        metrics.clone(),
    ));
    let controller = Controller::new(reconciler, queue, flags, config_maps, metrics.clone());

    let server = {
        let app = metrics::router(metrics, controller.state(), &config.metrics_path);
        let address = config.metrics_address.clone();
        let stop = stop.clone();
        tokio::spawn(async move { metrics::serve(&address, app, wait_for_stop(stop)).await })
    };

    let result = controller.run(config.workers, wait_for_stop(stop)).await;

    flag_cache_task.abort();
    config_map_cache_task.abort();
    router_task.abort();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Metrics server failed: {}", e),
        Err(e) => error!("Metrics server task failed: {}", e),
    }

    result?;
    info!("FeatureFlag Controller stopped");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Fires the returned receiver on the first SIGINT/SIGTERM; exits the process
/// with status 1 on the second.
fn spawn_signal_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Received shutdown signal, initiating graceful shutdown...");
        tx.send_replace(true);

        shutdown_signal().await;
        warn!("Received second shutdown signal, exiting immediately");
        std::process::exit(1);
    });
    rx
}

async fn wait_for_stop(mut stop: watch::Receiver<bool>) {
    // The sender lives for the whole process; an error means it is gone and
    // nobody can ask us to stop any more.
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
