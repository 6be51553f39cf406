//! Sync protocol handler.
//!
//! Inbound messages are decoded into [`Command`]s by one dispatcher task per
//! subscription and queued to a fixed pool of workers. A worker applies the
//! command to the store, fans successful updates out to every ancestor on the
//! `upstream` subjects, and finally replies to the sender.

use crate::bus::{Bus, BusError, Message, Subscription};
use crate::store::{Store, StoreError};
use chrono::Utc;
use pointgraph_core::{stamp_all, Point, PointType};
use pointgraph_proto::{
    ack_error, ack_ok, decode_points, encode_points, to_cbor, MessageError, NodeFilter,
    NodesResponse, Subject, SubjectScheme, VerifyResponse,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinError, JoinHandle};

/// Capacity of the command queue between dispatchers and workers.
pub const QUEUE_CAPACITY: usize = 1024;

/// A decoded request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Merge points into a node
    NodePoints {
        /// Target node
        node: String,
        /// Points to merge
        points: Vec<Point>,
    },
    /// Merge points into an edge
    EdgePoints {
        /// Down node
        node: String,
        /// Up node
        parent: String,
        /// Points to merge
        points: Vec<Point>,
    },
    /// Node query
    Nodes {
        /// Parent selector
        parent: String,
        /// Node selector
        node: String,
        /// Query filters
        filter: NodeFilter,
    },
    /// Credential check
    AuthUser {
        /// User email
        email: String,
        /// User password
        pass: String,
    },
    /// Connection info request
    TransportUri,
    /// Hash verification
    Verify {
        /// Write corrected hashes back
        repair: bool,
    },
}

/// Kinds of command tracked by [`HandlerMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Node point updates
    NodePoints,
    /// Edge point updates
    EdgePoints,
    /// Node queries
    Nodes,
    /// Everything else
    Other,
}

impl Command {
    /// Decode a bus message.
    ///
    /// # Errors
    ///
    /// Returns error for subjects outside the scheme and malformed payloads.
    pub fn decode(scheme: &SubjectScheme, msg: &Message) -> Result<Self, HandlerError> {
        let subject = scheme
            .parse(&msg.subject)
            .ok_or_else(|| HandlerError::UnknownSubject(msg.subject.clone()))?;
        let cmd = match subject {
            Subject::NodePoints { node } => Command::NodePoints {
                node,
                points: decode_points(&msg.payload)?,
            },
            Subject::EdgePoints { node, parent } => Command::EdgePoints {
                node,
                parent,
                points: decode_points(&msg.payload)?,
            },
            Subject::Nodes { parent, node } => Command::Nodes {
                parent,
                node,
                filter: NodeFilter::from_points(&decode_points(&msg.payload)?),
            },
            Subject::AuthUser => {
                let points = decode_points(&msg.payload)?;
                let text = |typ: PointType| {
                    points
                        .iter()
                        .find(|p| p.typ == typ)
                        .map(|p| p.text.clone())
                        .ok_or(HandlerError::MissingCredentials)
                };
                Command::AuthUser {
                    email: text(PointType::Email)?,
                    pass: text(PointType::Pass)?,
                }
            }
            Subject::TransportUri => Command::TransportUri,
            Subject::StoreVerify => Command::Verify { repair: false },
            Subject::StoreMaint => Command::Verify { repair: true },
            Subject::UpstreamNode { .. } | Subject::UpstreamEdge { .. } => {
                return Err(HandlerError::UnknownSubject(msg.subject.clone()));
            }
        };
        Ok(cmd)
    }

    /// Metrics bucket of this command.
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::NodePoints { .. } => CommandKind::NodePoints,
            Command::EdgePoints { .. } => CommandKind::EdgePoints,
            Command::Nodes { .. } => CommandKind::Nodes,
            _ => CommandKind::Other,
        }
    }
}

/// Errors for handler operations.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Subject is not handled here
    #[error("unknown subject: {0}")]
    UnknownSubject(String),
    /// Payload could not be decoded
    #[error(transparent)]
    Decode(#[from] MessageError),
    /// Credential check without email or password
    #[error("email and pass points are required")]
    MissingCredentials,
    /// Store rejected the command
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Bus failure
    #[error(transparent)]
    Bus(#[from] BusError),
    /// Store call panicked or was cancelled
    #[error("store task failed: {0}")]
    Task(#[from] JoinError),
}

/// Reply payload reporting `err` in the format expected for `subject`.
fn error_reply(subject: Option<&Subject>, err: &dyn std::fmt::Display) -> Vec<u8> {
    let encoded = match subject {
        Some(Subject::Nodes { .. } | Subject::AuthUser) => to_cbor(&NodesResponse::err(err)),
        Some(Subject::StoreVerify | Subject::StoreMaint) => to_cbor(&VerifyResponse {
            error: err.to_string(),
            ..VerifyResponse::default()
        }),
        _ => Ok(ack_error(err)),
    };
    encoded.unwrap_or_else(|_| ack_error(err))
}

#[derive(Debug, Default)]
struct CycleCounter {
    count: AtomicU64,
    micros: AtomicU64,
}

impl CycleCounter {
    fn record(&self, elapsed: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.micros.fetch_add(micros, Ordering::Relaxed);
    }

    fn take(&self) -> (u64, u64) {
        (
            self.count.swap(0, Ordering::Relaxed),
            self.micros.swap(0, Ordering::Relaxed),
        )
    }
}

/// Average handling time for one command kind over a reporting period.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Point type the average is reported under
    pub typ: PointType,
    /// Commands handled
    pub count: u64,
    /// Average handling time in milliseconds
    pub avg_ms: f64,
}

/// Per-command-kind handling times.
#[derive(Debug, Default)]
pub struct HandlerMetrics {
    node_points: CycleCounter,
    edge_points: CycleCounter,
    nodes: CycleCounter,
}

impl HandlerMetrics {
    /// Record one handled command.
    pub fn record(&self, kind: CommandKind, elapsed: Duration) {
        match kind {
            CommandKind::NodePoints => self.node_points.record(elapsed),
            CommandKind::EdgePoints => self.edge_points.record(elapsed),
            CommandKind::Nodes => self.nodes.record(elapsed),
            CommandKind::Other => {}
        }
    }

    /// Read and reset the counters.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn take(&self) -> Vec<CycleReport> {
        [
            (PointType::MetricCycleNodePoint, &self.node_points),
            (PointType::MetricCycleEdgePoint, &self.edge_points),
            (PointType::MetricCycleNodes, &self.nodes),
        ]
        .into_iter()
        .map(|(typ, counter)| {
            let (count, micros) = counter.take();
            let avg_ms = if count == 0 {
                0.0
            } else {
                micros as f64 / count as f64 / 1000.0
            };
            CycleReport { typ, count, avg_ms }
        })
        .collect()
    }
}

/// A queued command with the subject to answer on.
#[derive(Debug)]
pub struct Job {
    /// Decoded command
    pub command: Command,
    /// Reply subject, if the sender waits for one
    pub reply: Option<String>,
}

/// Applies commands to the store and talks back over the bus.
pub struct Handler<B: Bus> {
    store: Arc<Store>,
    bus: B,
    scheme: SubjectScheme,
    transport_uri: String,
    metrics: Arc<HandlerMetrics>,
}

impl<B: Bus> Handler<B> {
    /// Create a handler.
    #[must_use]
    pub fn new(store: Arc<Store>, bus: B, scheme: SubjectScheme, transport_uri: String) -> Self {
        Self {
            store,
            bus,
            scheme,
            transport_uri,
            metrics: Arc::new(HandlerMetrics::default()),
        }
    }

    /// Shared metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<HandlerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run a store call on the blocking pool so SQLite commits never stall
    /// the async workers.
    async fn on_store<T, F>(&self, call: F) -> Result<T, HandlerError>
    where
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        Ok(tokio::task::spawn_blocking(move || call(&store)).await??)
    }

    /// Run a command: apply it, fan out, and build the reply payload.
    pub async fn execute(&self, command: Command) -> Vec<u8> {
        let kind = command.kind();
        let started = Instant::now();
        let reply = match command {
            Command::NodePoints { node, points } => {
                let points = stamp_all(points, Utc::now());
                let (id, batch) = (node.clone(), points.clone());
                match self
                    .on_store(move |store| store.apply_node_points(&id, batch))
                    .await
                {
                    Ok(_) => {
                        self.fan_out(&node, None, &points, false).await;
                        ack_ok()
                    }
                    Err(err) => {
                        tracing::warn!(node_id = %node, error = %err, "Node points rejected");
                        ack_error(err)
                    }
                }
            }
            Command::EdgePoints {
                node,
                parent,
                points,
            } => {
                let points = stamp_all(points, Utc::now());
                let (id, up, batch) = (node.clone(), parent.clone(), points.clone());
                match self
                    .on_store(move |store| store.apply_edge_points(&id, &up, batch))
                    .await
                {
                    Ok(update) => {
                        self.fan_out(&node, Some(&update.up), &points, true).await;
                        ack_ok()
                    }
                    Err(err) => {
                        tracing::warn!(node_id = %node, %parent, error = %err, "Edge points rejected");
                        ack_error(err)
                    }
                }
            }
            Command::Nodes {
                parent,
                node,
                filter,
            } => {
                let resp = match self
                    .on_store(move |store| store.get_nodes(&parent, &node, &filter))
                    .await
                {
                    Ok(nodes) => NodesResponse::ok(nodes),
                    Err(err) => NodesResponse::err(err),
                };
                encode_or_error(&resp)
            }
            Command::AuthUser { email, pass } => {
                let resp = match self
                    .on_store(move |store| Ok(store.user_check(&email, &pass)))
                    .await
                {
                    Ok(nodes) => {
                        tracing::debug!(matches = nodes.len(), "Credential check");
                        NodesResponse::ok(nodes)
                    }
                    Err(err) => NodesResponse::err(err),
                };
                encode_or_error(&resp)
            }
            Command::TransportUri => self.transport_uri.clone().into_bytes(),
            Command::Verify { repair } => {
                let resp = match self
                    .on_store(move |store| store.verify(true, repair))
                    .await
                {
                    Ok(report) => VerifyResponse::from(report),
                    Err(err) => VerifyResponse {
                        error: err.to_string(),
                        ..VerifyResponse::default()
                    },
                };
                encode_or_error(&resp)
            }
        };
        self.metrics.record(kind, started.elapsed());
        reply
    }

    /// Publish an update to the node and every ancestor along every path.
    ///
    /// Failures are logged; the local merge stays in place.
    async fn fan_out(&self, node: &str, parent: Option<&str>, points: &[Point], edge: bool) {
        let id = node.to_string();
        let ancestors = match self
            .on_store(move |store| store.upstream_walk(&id, edge))
            .await
        {
            Ok(ancestors) => ancestors,
            Err(err) => {
                tracing::warn!(node_id = %node, error = %err, "Upstream walk failed");
                return;
            }
        };
        let payload = match encode_points(points) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(node_id = %node, error = %err, "Cannot encode fan-out");
                return;
            }
        };
        for ancestor in ancestors {
            let subject = match parent {
                Some(p) => self.scheme.upstream_edge(&ancestor, node, p),
                None => self.scheme.upstream_node(&ancestor, node),
            };
            tracing::debug!(subject, "Fan-out");
            if let Err(err) = self.bus.publish(&subject, payload.clone()).await {
                tracing::warn!(subject, error = %err, "Fan-out publish failed");
            }
        }
    }

    /// Execute a job and send its reply.
    pub async fn process(&self, job: Job) {
        let payload = self.execute(job.command).await;
        if let Some(reply) = job.reply {
            if let Err(err) = self.bus.publish(&reply, payload).await {
                tracing::warn!(reply, error = %err, "Reply failed");
            }
        }
    }

    /// Subscribe to every request subject.
    ///
    /// # Errors
    ///
    /// Returns error if any subscription fails.
    pub async fn subscribe_all(&self) -> Result<Vec<Subscription>, BusError> {
        let patterns = [
            self.scheme.node_points_wildcard(),
            self.scheme.edge_points_wildcard(),
            self.scheme.nodes_wildcard(),
            self.scheme.auth_user(),
            self.scheme.auth_transport_uri(),
            self.scheme.store_verify(),
            self.scheme.store_maint(),
        ];
        let mut subs = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            subs.push(self.bus.subscribe(&pattern).await?);
        }
        Ok(subs)
    }
}

fn encode_or_error<T: serde::Serialize>(value: &T) -> Vec<u8> {
    to_cbor(value).unwrap_or_else(|err| {
        tracing::warn!(error = %err, "Cannot encode reply");
        to_cbor(&NodesResponse::err(err)).unwrap_or_default()
    })
}

/// Decode messages from one subscription and queue them for the workers.
///
/// Malformed messages are answered with an error and skipped. Returns when
/// the subscription ends or shutdown is signalled; dropping the subscription
/// and the queue sender at that point lets the workers drain and exit.
pub fn spawn_dispatcher<B: Bus>(
    bus: B,
    scheme: SubjectScheme,
    mut sub: Subscription,
    queue: mpsc::Sender<Job>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                msg = sub.next() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            match Command::decode(&scheme, &msg) {
                Ok(command) => {
                    tracing::debug!(subject = %msg.subject, ?command, "Dispatching");
                    let job = Job {
                        command,
                        reply: msg.reply,
                    };
                    if queue.send(job).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(subject = %msg.subject, error = %err, "Malformed message");
                    if let Some(reply) = msg.reply {
                        let payload = error_reply(scheme.parse(&msg.subject).as_ref(), &err);
                        if let Err(err) = bus.publish(&reply, payload).await {
                            tracing::warn!(reply, error = %err, "Error reply failed");
                        }
                    }
                }
            }
        }
        tracing::debug!(pattern = sub.pattern(), "Dispatcher stopped");
    })
}

/// Start `count` workers pulling from a shared queue.
pub fn spawn_workers<B: Bus>(
    handler: Arc<Handler<B>>,
    queue: mpsc::Receiver<Job>,
    count: usize,
) -> Vec<JoinHandle<()>> {
    let queue = Arc::new(Mutex::new(queue));
    (0..count.max(1))
        .map(|worker| {
            let handler = Arc::clone(&handler);
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                loop {
                    let job = queue.lock().await.recv().await;
                    match job {
                        Some(job) => handler.process(job).await,
                        None => break,
                    }
                }
                tracing::debug!(worker, "Worker stopped");
            })
        })
        .collect()
}
