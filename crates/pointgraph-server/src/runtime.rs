//! Server runtime orchestration.
//!
//! Wires the store to a bus: one dispatcher task per subscription, a worker
//! pool behind a bounded queue, and the periodic verify and metrics tasks.

use crate::bus::{Bus, BusError};
use crate::config::ServerConfig;
use crate::handler::{
    spawn_dispatcher, spawn_workers, Handler, HandlerMetrics, Job, QUEUE_CAPACITY,
};
use crate::store::Store;
use pointgraph_core::Point;
use pointgraph_proto::{encode_points, SubjectScheme};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

/// Handle to a running server.
pub struct ServerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    metrics: Arc<HandlerMetrics>,
}

impl ServerHandle {
    /// Handler metrics shared with the workers.
    #[must_use]
    pub fn metrics(&self) -> Arc<HandlerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Stop accepting messages and wait for queued commands to finish.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down server");
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "Server task failed");
            }
        }
        tracing::info!("Server stopped");
    }
}

/// Start serving `store` on `bus`.
///
/// # Errors
///
/// Returns error if a subscription cannot be registered.
pub async fn start<B: Bus>(
    store: Arc<Store>,
    bus: B,
    config: &ServerConfig,
) -> Result<ServerHandle, BusError> {
    let scheme = config.subject_scheme();
    let handler = Arc::new(Handler::new(
        Arc::clone(&store),
        bus.clone(),
        scheme.clone(),
        config.transport_uri.clone(),
    ));
    let metrics = handler.metrics();
    let subs = handler.subscribe_all().await?;

    let (shutdown, shutdown_rx) = watch::channel(false);
    let (queue, jobs) = mpsc::channel::<Job>(QUEUE_CAPACITY);

    let mut tasks = Vec::new();
    for sub in subs {
        tasks.push(spawn_dispatcher(
            bus.clone(),
            scheme.clone(),
            sub,
            queue.clone(),
            shutdown_rx.clone(),
        ));
    }
    drop(queue);
    tasks.extend(spawn_workers(handler, jobs, config.workers));

    if let Some(period) = config.verify_interval {
        tasks.push(spawn_verify(Arc::clone(&store), period, shutdown_rx.clone()));
    }
    if let Some(period) = config.metrics_interval {
        tasks.push(spawn_metrics(
            store,
            bus,
            scheme,
            Arc::clone(&metrics),
            period,
            shutdown_rx,
        ));
    }

    tracing::info!(workers = config.workers, "Server running");
    Ok(ServerHandle {
        shutdown,
        tasks,
        metrics,
    })
}

fn spawn_verify(
    store: Arc<Store>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            match store.verify(true, false) {
                Ok(report) if report.mismatches.is_empty() => {
                    tracing::debug!(checked = report.checked, "Store verified");
                }
                Ok(report) => {
                    tracing::warn!(
                        checked = report.checked,
                        mismatches = report.mismatches.len(),
                        "Edge hash mismatches found"
                    );
                }
                Err(err) => tracing::warn!(error = %err, "Periodic verify failed"),
            }
        }
    })
}

fn spawn_metrics<B: Bus>(
    store: Arc<Store>,
    bus: B,
    scheme: SubjectScheme,
    metrics: Arc<HandlerMetrics>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let reports = metrics.take();
            for r in &reports {
                tracing::info!(metric = r.typ.as_str(), count = r.count, avg_ms = r.avg_ms, "Handler cycle");
            }
            let Some(root) = store.root_id() else {
                continue;
            };
            let points: Vec<Point> = reports
                .into_iter()
                .map(|r| Point::value(r.typ, r.avg_ms))
                .collect();
            let payload = match encode_points(&points) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(error = %err, "Cannot encode metrics");
                    continue;
                }
            };
            if let Err(err) = bus.publish(&scheme.node_points(&root), payload).await {
                tracing::warn!(error = %err, "Metrics publish failed");
            }
        }
    })
}
