//! Node/edge store: merge engine and hash maintenance.
//!
//! Every mutation runs under the cache write lock: points are merged into a
//! [`Txn`] overlay, affected edge hashes are recomputed up to the root, the
//! resulting batch is committed to persistence, and only then is the overlay
//! applied to the cache. A failed commit leaves the cache untouched.

use crate::cache::{Cache, GraphView, Txn};
use crate::persistence::{Meta, MemoryStore, Persistence, PersistenceError, Snapshot};
use chrono::Utc;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use pointgraph_core::hash::hex;
use pointgraph_core::{
    edge_hash, stamp_all, validate_id, Edge, HashMode, ModelError, Node, Point, PointType,
    Points, NONE, ROOT,
};
use pointgraph_proto::{HashMismatch, VerifyResponse};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// Maximum depth of any walk through the graph.
pub const MAX_DEPTH: usize = 100;

/// Errors raised by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Node or edge does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// Identifier cannot be used
    #[error("invalid id: {0:?}")]
    InvalidId(String),
    /// Query selectors do not form a valid query
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// Edge would make a node its own ancestor
    #[error("edge {down} -> {up} would create a cycle")]
    CycleDetected {
        /// Child of the rejected edge
        down: String,
        /// Parent of the rejected edge
        up: String,
    },
    /// Attempt to tombstone the root
    #[error("cannot delete root node {0}")]
    RootDelete(String),
    /// Edge from a node to itself
    #[error("node {0} cannot be its own parent")]
    SelfEdge(String),
    /// Walk exceeded [`MAX_DEPTH`]
    #[error("recursion limit reached")]
    RecursionLimit,
    /// Durable write or read failed
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    /// Point failed validation
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Full store contents for backup and restore.
pub type Dump = Snapshot;

/// Outcome of a verify pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Edges checked
    pub checked: usize,
    /// Edges whose stored hash was wrong
    pub mismatches: Vec<HashMismatch>,
    /// Whether the mismatches were written back
    pub repaired: bool,
}

impl From<VerifyReport> for VerifyResponse {
    fn from(r: VerifyReport) -> Self {
        VerifyResponse {
            checked: r.checked,
            mismatches: r.mismatches,
            repaired: r.repaired,
            error: String::new(),
        }
    }
}

/// Result of an edge update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeUpdate {
    /// Parent the update was applied under, after resolving defaults
    pub up: String,
    /// Whether any point won against stored state
    pub changed: bool,
}

/// Counts of what a store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of nodes
    pub nodes: usize,
    /// Number of edges
    pub edges: usize,
}

/// The node/edge store.
pub struct Store {
    cache: RwLock<Cache>,
    db: Mutex<Box<dyn Persistence>>,
    hash_mode: HashMode,
}

impl Store {
    /// Open a store over a persistence engine, loading its contents.
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be read.
    pub fn open(db: Box<dyn Persistence>, hash_mode: HashMode) -> Result<Self, StoreError> {
        let snapshot = db.load()?;
        let cache = Cache::from_snapshot(snapshot);
        let (nodes, edges) = cache.counts();
        tracing::info!(
            nodes,
            edges,
            root_id = %cache.root_id(),
            ?hash_mode,
            "Store opened"
        );
        Ok(Self {
            cache: RwLock::new(cache),
            db: Mutex::new(db),
            hash_mode,
        })
    }

    /// Open an empty volatile store.
    #[must_use]
    pub fn in_memory(hash_mode: HashMode) -> Self {
        Self {
            cache: RwLock::new(Cache::default()),
            db: Mutex::new(Box::new(MemoryStore::new())),
            hash_mode,
        }
    }

    /// Hash mode in use.
    #[must_use]
    pub fn hash_mode(&self) -> HashMode {
        self.hash_mode
    }

    /// Current root ID, if any.
    #[must_use]
    pub fn root_id(&self) -> Option<String> {
        let cache = self.cache.read();
        let root = cache.root_id();
        (!root.is_empty()).then(|| root.to_string())
    }

    /// Node and edge counts.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let (nodes, edges) = self.cache.read().counts();
        StoreStats { nodes, edges }
    }

    /// Store metadata.
    #[must_use]
    pub fn meta(&self) -> Meta {
        self.cache.read().meta().clone()
    }

    /// Read access for queries.
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Cache> {
        self.cache.read()
    }

    /// Merge points into a node, creating it if needed.
    ///
    /// The first node written to an empty store becomes the root. Returns
    /// `true` if any point won against stored state.
    ///
    /// # Errors
    ///
    /// Returns error for malformed input or if the write cannot be persisted.
    pub fn apply_node_points(&self, id: &str, points: Vec<Point>) -> Result<bool, StoreError> {
        let id = self.resolve_node_id(id)?;
        let points = prepare(points)?;

        let mut cache = self.cache.write();
        let mut txn = Txn::new(&cache);

        if txn.root_id().is_empty() {
            bootstrap_root(&mut txn, &id);
        }

        let won = txn.merge_node(&id, points);
        let start: Vec<String> = txn
            .up_edges(&id)
            .iter()
            .filter(|e| !won.is_empty() || e.hash.is_empty())
            .map(|e| e.id.clone())
            .collect();
        rehash(&mut txn, self.hash_mode, start)?;

        let staged = txn.finish();
        if staged.is_empty() {
            tracing::debug!(node_id = %id, "No node points changed");
            return Ok(false);
        }
        self.db.lock().commit(&staged.batch)?;
        cache.apply(staged);
        tracing::debug!(node_id = %id, changed = won.len(), "Node points applied");
        Ok(true)
    }

    /// Merge points into the edge between `down` and `up`, creating it if
    /// needed.
    ///
    /// An empty or `none` parent resolves to the root when one exists. A
    /// `nodeType` point in the batch is applied to the down node. The
    /// returned update names the resolved parent.
    ///
    /// # Errors
    ///
    /// Returns error for malformed input, cycles, self edges, attempts to
    /// tombstone the root, or if the write cannot be persisted.
    pub fn apply_edge_points(
        &self,
        down: &str,
        up: &str,
        points: Vec<Point>,
    ) -> Result<EdgeUpdate, StoreError> {
        let down = self.resolve_node_id(down)?;
        let points = prepare(points)?;
        let (node_points, edge_points): (Vec<Point>, Vec<Point>) = points
            .into_iter()
            .partition(|p| p.typ == PointType::NodeType);

        let mut cache = self.cache.write();
        let mut txn = Txn::new(&cache);

        let up = resolve_parent(&txn, &down, up)?;
        if up == down {
            return Err(StoreError::SelfEdge(down));
        }

        if txn.root_id().is_empty() {
            if up == NONE {
                txn.set_root(&down);
                tracing::info!(root_id = %down, "Root assigned");
            } else {
                bootstrap_root(&mut txn, &up);
            }
        }

        let deleting = edge_points
            .iter()
            .any(|p| p.typ == PointType::Tombstone && p.is_set());
        if deleting && down == txn.root_id() {
            return Err(StoreError::RootDelete(down));
        }

        let existing = txn.edge_between(&down, &up).map(|e| e.id.clone());
        let edge_id = match existing {
            Some(id) => id,
            None => {
                if up != NONE && is_ancestor(&txn, &down, &up)? {
                    return Err(StoreError::CycleDetected { down, up });
                }
                let id = Uuid::new_v4().to_string();
                txn.create_edge(&id, &up, &down);
                tracing::debug!(edge_id = %id, %up, %down, "Edge created");
                id
            }
        };

        txn.ensure_node(&down);
        let mut start = Vec::new();
        if !txn.merge_node(&down, node_points).is_empty() {
            start.extend(txn.up_edges(&down).iter().map(|e| e.id.clone()));
        }
        let won = txn.merge_edge(&edge_id, edge_points);
        if !won.is_empty() || existing_hash_empty(&txn, &edge_id) {
            start.push(edge_id.clone());
        }
        start.sort();
        start.dedup();
        rehash(&mut txn, self.hash_mode, start)?;

        let staged = txn.finish();
        if staged.is_empty() {
            tracing::debug!(%down, %up, "No edge points changed");
            return Ok(EdgeUpdate { up, changed: false });
        }
        self.db.lock().commit(&staged.batch)?;
        cache.apply(staged);
        tracing::debug!(%down, %up, changed = won.len(), "Edge points applied");
        Ok(EdgeUpdate { up, changed: true })
    }

    /// Check edge hashes from the root down.
    ///
    /// With `recurse` every edge reachable from the root is recomputed from
    /// scratch, children first, tombstoned edges included. Without it only the
    /// root's own edge is checked against its children's stored hashes. Edges
    /// not reachable from the root are never reported. With `repair` the
    /// recomputed hashes are written back.
    ///
    /// # Errors
    ///
    /// Returns error on a walk deeper than [`MAX_DEPTH`] or if repairs cannot
    /// be persisted.
    pub fn verify(&self, recurse: bool, repair: bool) -> Result<VerifyReport, StoreError> {
        if !repair {
            let cache = self.cache.read();
            let (report, _) = check_hashes(&cache, self.hash_mode, recurse)?;
            return Ok(report);
        }

        let mut cache = self.cache.write();
        let (mut report, computed) = check_hashes(&cache, self.hash_mode, recurse)?;
        if report.mismatches.is_empty() {
            return Ok(report);
        }

        let mut txn = Txn::new(&cache);
        for m in &report.mismatches {
            if let Some(hash) = computed.get(&m.edge_id) {
                txn.set_hash(&m.edge_id, hash.clone());
            }
        }
        let staged = txn.finish();
        self.db.lock().commit(&staged.batch)?;
        cache.apply(staged);
        for m in &report.mismatches {
            tracing::info!(
                edge_id = %m.edge_id,
                up = %m.up,
                down = %m.down,
                stored = %hex(&m.stored),
                computed = %hex(&m.computed),
                "Repaired edge hash"
            );
        }
        report.repaired = true;
        Ok(report)
    }

    /// Export the full store contents.
    #[must_use]
    pub fn dump(&self) -> Dump {
        let cache = self.cache.read();
        let mut nodes: Vec<Node> = cache
            .nodes()
            .filter(|n| !n.points.is_empty())
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let mut edges: Vec<Edge> = cache.edges().cloned().collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        Dump {
            meta: cache.meta().clone(),
            nodes,
            edges,
        }
    }

    /// Merge a dump into the store.
    ///
    /// Points are merged last-writer-wins, edges are matched by their
    /// endpoints, and the dump's root is adopted if the store has none.
    /// Hashes are then rebuilt with a repairing verify.
    ///
    /// # Errors
    ///
    /// Returns error if the dump holds invalid points or the import cannot be
    /// persisted.
    pub fn import(&self, dump: Dump) -> Result<VerifyReport, StoreError> {
        {
            let mut cache = self.cache.write();
            let mut txn = Txn::new(&cache);

            if txn.root_id().is_empty() && !dump.meta.root_id.is_empty() {
                txn.set_root(&dump.meta.root_id);
            }
            for node in dump.nodes {
                let points = prepare(node.points.into_vec())?;
                txn.merge_node(&node.id, points);
            }
            for edge in dump.edges {
                let id = match txn.edge_between(&edge.down, &edge.up) {
                    Some(existing) => existing.id.clone(),
                    None => {
                        txn.create_edge(&edge.id, &edge.up, &edge.down);
                        edge.id.clone()
                    }
                };
                txn.ensure_node(&edge.down);
                let points = prepare(edge.points.into_vec())?;
                txn.merge_edge(&id, points);
            }

            let staged = txn.finish();
            self.db.lock().commit(&staged.batch)?;
            cache.apply(staged);
        }
        tracing::info!("Dump imported, rebuilding hashes");
        self.verify(true, true)
    }

    fn resolve_node_id(&self, id: &str) -> Result<String, StoreError> {
        if id == ROOT {
            return self
                .root_id()
                .ok_or_else(|| StoreError::NotFound("root".to_string()));
        }
        validate_id(id).map_err(|_| StoreError::InvalidId(id.to_string()))?;
        Ok(id.to_string())
    }
}

/// Validate a batch and stamp zero timestamps.
fn prepare(points: Vec<Point>) -> Result<Vec<Point>, StoreError> {
    for p in &points {
        p.typ.validate(p)?;
    }
    Ok(stamp_all(points, Utc::now()))
}

fn resolve_parent(view: &impl GraphView, down: &str, up: &str) -> Result<String, StoreError> {
    let root = view.root_id();
    if up.is_empty() || up == NONE {
        if !root.is_empty() && root != down {
            return Ok(root.to_string());
        }
        return Ok(NONE.to_string());
    }
    if up == ROOT {
        if root.is_empty() {
            return Err(StoreError::NotFound("root".to_string()));
        }
        return Ok(root.to_string());
    }
    validate_id(up).map_err(|_| StoreError::InvalidId(up.to_string()))?;
    Ok(up.to_string())
}

/// Make `id` the root and give it the edge above it.
fn bootstrap_root(txn: &mut Txn<'_>, id: &str) {
    txn.set_root(id);
    txn.ensure_node(id);
    if txn.edge_between(id, NONE).is_none() {
        let edge_id = Uuid::new_v4().to_string();
        txn.create_edge(&edge_id, NONE, id);
        let stamp = Point::value(PointType::Tombstone, 0.0).with_time(Utc::now());
        txn.merge_edge(&edge_id, vec![stamp]);
    }
    tracing::info!(root_id = %id, "Root assigned");
}

fn existing_hash_empty(view: &impl GraphView, edge_id: &str) -> bool {
    view.edge(edge_id).is_some_and(|e| e.hash.is_empty())
}

/// Whether `ancestor` is reachable upward from `id`.
pub(crate) fn is_ancestor(
    view: &impl GraphView,
    ancestor: &str,
    id: &str,
) -> Result<bool, StoreError> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([(id.to_string(), 0usize)]);
    while let Some((cur, depth)) = queue.pop_front() {
        if cur == ancestor {
            return Ok(true);
        }
        if depth > MAX_DEPTH {
            return Err(StoreError::RecursionLimit);
        }
        if !seen.insert(cur.clone()) {
            continue;
        }
        for e in view.up_edges(&cur) {
            if e.up != NONE {
                queue.push_back((e.up.clone(), depth + 1));
            }
        }
    }
    Ok(false)
}

/// Hash of an edge from its current points and its child edges' stored hashes.
pub(crate) fn compute_edge_hash(view: &impl GraphView, mode: HashMode, edge: &Edge) -> Vec<u8> {
    let empty = Points::new();
    let node_points = view.node(&edge.down).map_or(&empty, |n| &n.points);
    let children = view.down_edges(&edge.down);
    edge_hash(
        mode,
        &edge.points,
        node_points,
        children.iter().map(|e| e.hash.as_slice()),
    )
}

/// Recompute hashes starting at `start` and walking toward the root until
/// nothing changes.
fn rehash(txn: &mut Txn<'_>, mode: HashMode, start: Vec<String>) -> Result<(), StoreError> {
    let mut queue: VecDeque<(String, usize)> = start.into_iter().map(|id| (id, 0)).collect();
    while let Some((edge_id, depth)) = queue.pop_front() {
        if depth > MAX_DEPTH {
            return Err(StoreError::RecursionLimit);
        }
        let Some(edge) = txn.edge(&edge_id) else {
            continue;
        };
        let hash = compute_edge_hash(&*txn, mode, edge);
        if hash == edge.hash {
            continue;
        }
        let up = edge.up.clone();
        txn.set_hash(&edge_id, hash);
        if up != NONE {
            for parent in txn.up_edges(&up) {
                queue.push_back((parent.id.clone(), depth + 1));
            }
        }
    }
    Ok(())
}

/// Recompute hashes below the root and list disagreements.
fn check_hashes(
    cache: &Cache,
    mode: HashMode,
    recurse: bool,
) -> Result<(VerifyReport, HashMap<String, Vec<u8>>), StoreError> {
    let mut computed: HashMap<String, Vec<u8>> = HashMap::new();
    let root = cache.root_id();
    if root.is_empty() {
        return Ok((VerifyReport::default(), computed));
    }
    for edge in cache.up_edges(root) {
        if recurse {
            recompute(cache, mode, &edge.id, 0, &mut computed)?;
        } else {
            computed.insert(edge.id.clone(), compute_edge_hash(cache, mode, edge));
        }
    }

    let mut report = VerifyReport {
        checked: computed.len(),
        ..VerifyReport::default()
    };
    let mut ids: Vec<&String> = computed.keys().collect();
    ids.sort();
    for id in ids {
        let Some(edge) = cache.edge(id) else {
            continue;
        };
        let hash = &computed[id];
        if *hash != edge.hash {
            tracing::warn!(
                edge_id = %edge.id,
                up = %edge.up,
                down = %edge.down,
                "Edge hash mismatch"
            );
            report.mismatches.push(HashMismatch {
                edge_id: edge.id.clone(),
                up: edge.up.clone(),
                down: edge.down.clone(),
                stored: edge.hash.clone(),
                computed: hash.clone(),
            });
        }
    }
    Ok((report, computed))
}

fn recompute(
    cache: &Cache,
    mode: HashMode,
    edge_id: &str,
    depth: usize,
    computed: &mut HashMap<String, Vec<u8>>,
) -> Result<Vec<u8>, StoreError> {
    if let Some(hash) = computed.get(edge_id) {
        return Ok(hash.clone());
    }
    if depth > MAX_DEPTH {
        return Err(StoreError::RecursionLimit);
    }
    let Some(edge) = cache.edge(edge_id) else {
        return Err(StoreError::NotFound(edge_id.to_string()));
    };

    let mut child_hashes = Vec::new();
    for child in cache.down_edges(&edge.down) {
        child_hashes.push(recompute(cache, mode, &child.id, depth + 1, computed)?);
    }
    let empty = Points::new();
    let node_points = cache.node(&edge.down).map_or(&empty, |n| &n.points);
    let hash = edge_hash(
        mode,
        &edge.points,
        node_points,
        child_hashes.iter().map(Vec::as_slice),
    );
    computed.insert(edge_id.to_string(), hash.clone());
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqliteStore;
    use chrono::{DateTime, TimeZone};
    use pointgraph_core::ALL;
    use pointgraph_proto::NodeFilter;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn value(v: f64, secs: i64) -> Point {
        Point::value(PointType::Value, v).with_time(at(secs))
    }

    fn tombstone(set: bool, secs: i64) -> Point {
        Point::value(PointType::Tombstone, if set { 1.0 } else { 0.0 }).with_time(at(secs))
    }

    fn hash_of(store: &Store, down: &str, up: &str) -> Vec<u8> {
        store
            .read()
            .edge_between(down, up)
            .map(|e| e.hash.clone())
            .unwrap()
    }

    /// r -> a -> a1, r -> b
    fn tree() -> Store {
        let store = Store::in_memory(HashMode::Timestamps);
        store.apply_node_points("r", vec![value(0.0, 1)]).unwrap();
        store.apply_edge_points("a", "r", vec![tombstone(false, 2)]).unwrap();
        store.apply_edge_points("b", "r", vec![tombstone(false, 3)]).unwrap();
        store.apply_edge_points("a1", "a", vec![tombstone(false, 4)]).unwrap();
        store
    }

    #[test]
    fn first_node_becomes_root() {
        let store = Store::in_memory(HashMode::Timestamps);
        assert_eq!(store.root_id(), None);
        assert!(store.apply_node_points("r", vec![value(1.0, 1)]).unwrap());
        assert_eq!(store.root_id().as_deref(), Some("r"));
        assert!(store.read().edge_between("r", NONE).is_some());

        store.apply_node_points("other", vec![value(1.0, 1)]).unwrap();
        assert_eq!(store.root_id().as_deref(), Some("r"));
    }

    #[test]
    fn edge_without_parent_goes_under_root() {
        let store = tree();
        let update = store.apply_edge_points("c", NONE, vec![tombstone(false, 5)]).unwrap();
        assert_eq!(update.up, "r");
        assert!(update.changed);
        assert!(store.read().edge_between("c", "r").is_some());
        store.apply_edge_points("d", "", vec![tombstone(false, 5)]).unwrap();
        assert!(store.read().edge_between("d", "r").is_some());
    }

    #[test]
    fn node_change_rehashes_ancestors_only() {
        let store = tree();
        let before_a1 = hash_of(&store, "a1", "a");
        let before_a = hash_of(&store, "a", "r");
        let before_b = hash_of(&store, "b", "r");
        let before_r = hash_of(&store, "r", NONE);

        store.apply_node_points("a1", vec![value(7.0, 10)]).unwrap();

        assert_ne!(hash_of(&store, "a1", "a"), before_a1);
        assert_ne!(hash_of(&store, "a", "r"), before_a);
        assert_ne!(hash_of(&store, "r", NONE), before_r);
        assert_eq!(hash_of(&store, "b", "r"), before_b);
    }

    #[test]
    fn replay_is_noop() {
        let store = tree();
        let batch = vec![value(3.0, 10), Point::text(PointType::Description, "x").with_time(at(11))];
        assert!(store.apply_node_points("a", batch.clone()).unwrap());
        let hash = hash_of(&store, "r", NONE);
        assert!(!store.apply_node_points("a", batch).unwrap());
        assert_eq!(hash_of(&store, "r", NONE), hash);
    }

    #[test]
    fn stale_point_keeps_value() {
        let store = tree();
        store.apply_node_points("a", vec![value(1.0, 20)]).unwrap();
        assert!(!store.apply_node_points("a", vec![value(9.0, 10)]).unwrap());
        let nodes = store.get_nodes("r", "a", &NodeFilter::default()).unwrap();
        assert_eq!(nodes[0].points.value(&PointType::Value), Some(1.0));
    }

    #[test]
    fn zero_times_are_stamped() {
        let store = tree();
        store
            .apply_node_points("a", vec![Point::value(PointType::Value, 4.0)])
            .unwrap();
        let node = store.read().node("a").cloned().unwrap();
        let p = node.points.find(&PointType::Value, "0").unwrap();
        assert!(!p.is_unstamped());
    }

    #[test]
    fn cycles_are_rejected() {
        let store = tree();
        let err = store
            .apply_edge_points("r", "a1", vec![tombstone(false, 9)])
            .unwrap_err();
        assert!(matches!(err, StoreError::CycleDetected { .. }));
        let err = store
            .apply_edge_points("a", "a1", vec![tombstone(false, 9)])
            .unwrap_err();
        assert!(matches!(err, StoreError::CycleDetected { .. }));
        let err = store
            .apply_edge_points("a", "a", vec![tombstone(false, 9)])
            .unwrap_err();
        assert!(matches!(err, StoreError::SelfEdge(_)));
    }

    #[test]
    fn root_cannot_be_deleted() {
        let store = tree();
        let err = store
            .apply_edge_points("r", NONE, vec![tombstone(true, 9)])
            .unwrap_err();
        assert!(matches!(err, StoreError::RootDelete(_)));
    }

    #[test]
    fn invalid_input_rejected() {
        let store = tree();
        assert!(matches!(
            store.apply_node_points("a.b", vec![value(1.0, 1)]),
            Err(StoreError::InvalidId(_))
        ));
        assert!(matches!(
            store.apply_node_points("a", vec![Point::value(PointType::Tombstone, 3.0)]),
            Err(StoreError::Model(_))
        ));
    }

    #[test]
    fn node_type_in_edge_batch_lands_on_node() {
        let store = tree();
        store
            .apply_edge_points(
                "u1",
                "r",
                vec![
                    Point::text(PointType::NodeType, "user").with_time(at(5)),
                    tombstone(false, 5),
                ],
            )
            .unwrap();
        let cache = store.read();
        assert_eq!(cache.node("u1").unwrap().typ, "user");
        let edge = cache.edge_between("u1", "r").unwrap();
        assert!(edge.points.first(&PointType::NodeType).is_none());
    }

    #[test]
    fn multiple_parents_share_node() {
        let store = tree();
        store.apply_edge_points("a1", "b", vec![tombstone(false, 6)]).unwrap();
        let before_b = hash_of(&store, "b", "r");
        let before_a = hash_of(&store, "a", "r");
        store.apply_node_points("a1", vec![value(2.0, 7)]).unwrap();
        assert_ne!(hash_of(&store, "b", "r"), before_b);
        assert_ne!(hash_of(&store, "a", "r"), before_a);
        assert!(store.verify(true, false).unwrap().mismatches.is_empty());
    }

    #[test]
    fn verify_detects_and_repairs() {
        let store = tree();
        let report = store.verify(true, false).unwrap();
        assert_eq!(report.checked, 4);
        assert!(report.mismatches.is_empty());

        // corrupt a stored hash behind the store's back
        corrupt(&store, "a1", "a");

        let report = store.verify(true, false).unwrap();
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].down, "a1");
        assert!(!report.repaired);
        assert_eq!(store.verify(true, false).unwrap().mismatches.len(), 1);

        let report = store.verify(true, true).unwrap();
        assert!(report.repaired);
        assert!(store.verify(true, false).unwrap().mismatches.is_empty());
    }

    #[test]
    fn values_mode_store_verifies_clean() {
        let store = Store::in_memory(HashMode::Values);
        store.apply_node_points("r", vec![value(1.0, 1)]).unwrap();
        store.apply_edge_points("n", "r", vec![tombstone(false, 1)]).unwrap();
        assert!(store.verify(true, false).unwrap().mismatches.is_empty());
        assert_eq!(store.hash_mode(), HashMode::Values);
    }

    /// Reopen a copy of `source` whose `a1` value was rewritten in place,
    /// keeping its timestamp.
    fn reopen_with_rewrite(source: &Store) -> Store {
        let mut dump = source.dump();
        for node in dump.nodes.iter_mut().filter(|n| n.id == "a1") {
            let mut points = node.points.clone().into_vec();
            for p in points.iter_mut().filter(|p| p.typ == PointType::Value) {
                p.value = 99.0;
            }
            node.points = Points::from(points);
        }
        Store::open(Box::new(SnapshotStore(dump)), source.hash_mode()).unwrap()
    }

    fn tree_with_value(mode: HashMode) -> Store {
        let store = Store::in_memory(mode);
        store.apply_node_points("r", vec![value(0.0, 1)]).unwrap();
        store.apply_edge_points("a", "r", vec![tombstone(false, 2)]).unwrap();
        store.apply_edge_points("a1", "a", vec![tombstone(false, 3)]).unwrap();
        store.apply_node_points("a1", vec![value(1.0, 10)]).unwrap();
        store
    }

    #[test]
    fn values_mode_detects_same_timestamp_rewrite() {
        let source = tree_with_value(HashMode::Values);
        let store = reopen_with_rewrite(&source);
        let before = hash_of(&store, "r", NONE);

        let report = store.verify(true, false).unwrap();
        let downs: Vec<&str> = report.mismatches.iter().map(|m| m.down.as_str()).collect();
        assert!(downs.contains(&"a1"), "{downs:?}");
        assert!(downs.contains(&"r"), "{downs:?}");

        assert!(store.verify(true, true).unwrap().repaired);
        assert_ne!(hash_of(&store, "r", NONE), before);
        assert!(store.verify(true, false).unwrap().mismatches.is_empty());
    }

    #[test]
    fn timestamps_mode_ignores_same_timestamp_rewrite() {
        let source = tree_with_value(HashMode::Timestamps);
        let store = reopen_with_rewrite(&source);
        let before = hash_of(&store, "r", NONE);

        assert!(store.verify(true, false).unwrap().mismatches.is_empty());
        assert!(!store.verify(true, true).unwrap().repaired);
        assert_eq!(hash_of(&store, "r", NONE), before);
    }

    fn corrupt(store: &Store, down: &str, up: &str) {
        let mut cache = store.cache.write();
        let id = cache.edge_between(down, up).unwrap().id.clone();
        let mut txn = Txn::new(&cache);
        txn.set_hash(&id, vec![0; 16]);
        let staged = txn.finish();
        cache.apply(staged);
    }

    #[test]
    fn shallow_verify_checks_root_edge_only() {
        let store = tree();
        corrupt(&store, "a1", "a");
        let report = store.verify(false, false).unwrap();
        assert_eq!(report.checked, 1);
        assert!(report.mismatches.is_empty());

        corrupt(&store, "r", NONE);
        let report = store.verify(false, true).unwrap();
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].down, "r");
        assert!(report.repaired);
        assert_eq!(store.verify(true, false).unwrap().mismatches.len(), 1);
    }

    #[test]
    fn verify_skips_edges_unreachable_from_root() {
        let store = tree();
        store
            .apply_edge_points("x", "detached", vec![tombstone(false, 5)])
            .unwrap();
        corrupt(&store, "x", "detached");

        let report = store.verify(true, false).unwrap();
        assert_eq!(report.checked, 4);
        assert!(report.mismatches.is_empty());
    }

    #[test]
    fn verify_includes_tombstoned_edges() {
        let store = tree();
        store.apply_edge_points("a1", "a", vec![tombstone(true, 9)]).unwrap();
        corrupt(&store, "a1", "a");
        let report = store.verify(true, false).unwrap();
        assert_eq!(report.checked, 4);
        assert_eq!(report.mismatches.len(), 1);
    }

    #[test]
    fn verify_empty_store() {
        let store = Store::in_memory(HashMode::Timestamps);
        assert_eq!(store.verify(true, true).unwrap(), VerifyReport::default());
    }

    #[test]
    fn out_of_range_times_are_rejected() {
        let store = tree();
        let far = Utc.with_ymd_and_hms(2300, 1, 1, 0, 0, 0).unwrap();
        let err = store
            .apply_node_points("a", vec![Point::value(PointType::Value, 1.0).with_time(far)])
            .unwrap_err();
        assert!(matches!(err, StoreError::Model(ModelError::InvalidPoint { .. })));
        assert!(store
            .apply_edge_points("a", "r", vec![tombstone(false, 0).with_time(far)])
            .is_err());
        assert!(store.verify(true, false).unwrap().mismatches.is_empty());
    }

    struct SnapshotStore(Snapshot);

    impl Persistence for SnapshotStore {
        fn load(&self) -> Result<Snapshot, PersistenceError> {
            Ok(self.0.clone())
        }

        fn commit(&mut self, _: &crate::persistence::WriteBatch) -> Result<(), PersistenceError> {
            Ok(())
        }
    }

    struct FailingStore;

    impl Persistence for FailingStore {
        fn load(&self) -> Result<Snapshot, PersistenceError> {
            Ok(Snapshot::default())
        }

        fn commit(&mut self, _: &crate::persistence::WriteBatch) -> Result<(), PersistenceError> {
            Err(PersistenceError::Write("disk full".into()))
        }
    }

    #[test]
    fn failed_commit_leaves_cache_untouched() {
        let store = Store::open(Box::new(FailingStore), HashMode::Timestamps).unwrap();
        let err = store.apply_node_points("r", vec![value(1.0, 1)]).unwrap_err();
        assert!(matches!(err, StoreError::Persistence(_)));
        assert_eq!(store.root_id(), None);
        assert!(store.read().node("r").is_none());
        assert_eq!(store.stats(), StoreStats { nodes: 0, edges: 0 });
    }

    #[test]
    fn reload_from_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.db");
        let hash = {
            let db = SqliteStore::open(&path).unwrap();
            let store = Store::open(Box::new(db), HashMode::Timestamps).unwrap();
            store.apply_node_points("r", vec![value(1.0, 1)]).unwrap();
            store.apply_edge_points("n1", "r", vec![tombstone(false, 2)]).unwrap();
            store.apply_node_points("n1", vec![value(5.0, 3)]).unwrap();
            hash_of(&store, "r", NONE)
        };

        let db = SqliteStore::open(&path).unwrap();
        let store = Store::open(Box::new(db), HashMode::Timestamps).unwrap();
        assert_eq!(store.root_id().as_deref(), Some("r"));
        assert_eq!(hash_of(&store, "r", NONE), hash);
        assert!(store.verify(true, false).unwrap().mismatches.is_empty());
        let nodes = store.get_nodes("r", "n1", &NodeFilter::default()).unwrap();
        assert_eq!(nodes[0].points.value(&PointType::Value), Some(5.0));
    }

    #[test]
    fn dump_import_round_trip() {
        let source = tree();
        source.apply_node_points("a1", vec![value(8.0, 30)]).unwrap();
        let dump = source.dump();
        let json = serde_json::to_string(&dump).unwrap();

        let target = Store::in_memory(HashMode::Timestamps);
        let report = target.import(serde_json::from_str(&json).unwrap()).unwrap();
        assert!(report.mismatches.is_empty() || report.repaired);
        assert_eq!(target.root_id().as_deref(), Some("r"));
        assert_eq!(hash_of(&target, "r", NONE), hash_of(&source, "r", NONE));

        let all = target
            .get_nodes("r", ALL, &NodeFilter::default())
            .unwrap();
        assert_eq!(all.len(), 3);

        // importing again changes nothing
        let report = target.import(source.dump()).unwrap();
        assert!(report.mismatches.is_empty());
    }
}
