//! In-memory node and edge cache.
//!
//! The cache is the authoritative view of the graph once the store is open.
//! Mutations never touch it directly: they go through a [`Txn`] overlay that
//! records every changed node and edge, produces a [`WriteBatch`], and is
//! applied to the cache only after the batch is durable.

use crate::persistence::{EdgeRecord, Meta, Snapshot, WriteBatch};
use pointgraph_core::{Edge, Node, Point};
use std::collections::{HashMap, HashSet};

/// Read access shared by the cache and transaction overlays.
pub trait GraphView {
    /// Current root ID, empty if none.
    fn root_id(&self) -> &str;

    /// Look up a node.
    fn node(&self, id: &str) -> Option<&Node>;

    /// Look up an edge.
    fn edge(&self, id: &str) -> Option<&Edge>;

    /// Edges whose down node is `id` (the node's parents).
    fn up_edges(&self, id: &str) -> Vec<&Edge>;

    /// Edges whose up node is `id` (the node's children).
    fn down_edges(&self, id: &str) -> Vec<&Edge>;

    /// Edge between a child and a parent.
    fn edge_between(&self, down: &str, up: &str) -> Option<&Edge> {
        self.up_edges(down).into_iter().find(|e| e.up == up)
    }
}

/// Authoritative in-memory graph.
#[derive(Debug, Default)]
pub struct Cache {
    meta: Meta,
    nodes: HashMap<String, Node>,
    edges: HashMap<String, Edge>,
    by_down: HashMap<String, Vec<String>>,
    by_up: HashMap<String, Vec<String>>,
}

impl Cache {
    /// Build the cache from a persisted snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut cache = Cache {
            meta: snapshot.meta,
            ..Cache::default()
        };
        for node in snapshot.nodes {
            cache.nodes.insert(node.id.clone(), node);
        }
        for edge in snapshot.edges {
            cache.insert_edge(edge);
        }
        // nodes only referenced by edges have no stored points
        let missing: Vec<String> = cache
            .edges
            .values()
            .map(|e| e.down.clone())
            .filter(|id| !cache.nodes.contains_key(id))
            .collect();
        for id in missing {
            cache.nodes.insert(id.clone(), Node::new(id));
        }
        cache
    }

    /// Store metadata.
    #[must_use]
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Iterate over all nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Iterate over all edges.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    /// Number of nodes and edges.
    #[must_use]
    pub fn counts(&self) -> (usize, usize) {
        (self.nodes.len(), self.edges.len())
    }

    fn insert_edge(&mut self, edge: Edge) {
        if !self.edges.contains_key(&edge.id) {
            self.by_down
                .entry(edge.down.clone())
                .or_default()
                .push(edge.id.clone());
            self.by_up
                .entry(edge.up.clone())
                .or_default()
                .push(edge.id.clone());
        }
        self.edges.insert(edge.id.clone(), edge);
    }

    /// Apply a committed transaction.
    pub fn apply(&mut self, staged: Staged) {
        if let Some(root) = staged.root_id {
            self.meta.root_id = root;
        }
        for (id, node) in staged.nodes {
            self.nodes.insert(id, node);
        }
        for (_, edge) in staged.edges {
            self.insert_edge(edge);
        }
    }

    fn edges_by<'a>(&'a self, index: &HashMap<String, Vec<String>>, id: &str) -> Vec<&'a Edge> {
        index
            .get(id)
            .map(|ids| ids.iter().filter_map(|e| self.edges.get(e)).collect())
            .unwrap_or_default()
    }
}

impl GraphView for Cache {
    fn root_id(&self) -> &str {
        &self.meta.root_id
    }

    fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.get(id)
    }

    fn up_edges(&self, id: &str) -> Vec<&Edge> {
        self.edges_by(&self.by_down, id)
    }

    fn down_edges(&self, id: &str) -> Vec<&Edge> {
        self.edges_by(&self.by_up, id)
    }
}

/// Staging overlay over a borrowed cache.
pub struct Txn<'a> {
    cache: &'a Cache,
    root_id: Option<String>,
    nodes: HashMap<String, Node>,
    edges: HashMap<String, Edge>,
    new_by_down: HashMap<String, Vec<String>>,
    new_by_up: HashMap<String, Vec<String>>,
    node_points: HashMap<String, Vec<Point>>,
    edge_points: HashMap<String, Vec<Point>>,
    dirty_edges: HashSet<String>,
}

/// Changes of a finished transaction, ready to commit.
#[derive(Debug, Default)]
pub struct Staged {
    /// Rows and points to persist
    pub batch: WriteBatch,
    root_id: Option<String>,
    nodes: HashMap<String, Node>,
    edges: HashMap<String, Edge>,
}

impl Staged {
    /// Whether the transaction changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

impl<'a> Txn<'a> {
    /// Start a transaction over the cache.
    #[must_use]
    pub fn new(cache: &'a Cache) -> Self {
        Self {
            cache,
            root_id: None,
            nodes: HashMap::new(),
            edges: HashMap::new(),
            new_by_down: HashMap::new(),
            new_by_up: HashMap::new(),
            node_points: HashMap::new(),
            edge_points: HashMap::new(),
            dirty_edges: HashSet::new(),
        }
    }

    /// Make `id` the root.
    pub fn set_root(&mut self, id: &str) {
        self.root_id = Some(id.to_string());
    }

    /// Ensure a node exists, creating an empty one if needed.
    pub fn ensure_node(&mut self, id: &str) {
        if self.node(id).is_none() {
            self.nodes.insert(id.to_string(), Node::new(id));
        }
    }

    /// Merge points into a node, creating it if needed.
    ///
    /// Returns the points that won against stored state.
    pub fn merge_node(&mut self, id: &str, points: Vec<Point>) -> Vec<Point> {
        let node = self.node_mut(id);
        let won: Vec<Point> = points
            .into_iter()
            .filter(|p| node.merge([p.clone()]))
            .collect();
        if !won.is_empty() {
            self.node_points
                .entry(id.to_string())
                .or_default()
                .extend(won.iter().cloned());
        }
        won
    }

    /// Create an edge. The caller checks it does not already exist.
    pub fn create_edge(&mut self, id: &str, up: &str, down: &str) {
        let edge = Edge::new(id, up, down);
        self.new_by_down
            .entry(down.to_string())
            .or_default()
            .push(id.to_string());
        self.new_by_up
            .entry(up.to_string())
            .or_default()
            .push(id.to_string());
        self.edges.insert(id.to_string(), edge);
        self.dirty_edges.insert(id.to_string());
    }

    /// Merge points into an existing edge.
    ///
    /// Returns the points that won against stored state.
    pub fn merge_edge(&mut self, id: &str, points: Vec<Point>) -> Vec<Point> {
        let Some(edge) = self.edge_mut(id) else {
            return Vec::new();
        };
        let won: Vec<Point> = points
            .into_iter()
            .filter(|p| edge.points.merge(p.clone()))
            .collect();
        if !won.is_empty() {
            self.edge_points
                .entry(id.to_string())
                .or_default()
                .extend(won.iter().cloned());
        }
        won
    }

    /// Store a new hash on an edge.
    pub fn set_hash(&mut self, id: &str, hash: Vec<u8>) {
        if let Some(edge) = self.edge_mut(id) {
            edge.hash = hash;
            self.dirty_edges.insert(id.to_string());
        }
    }

    fn node_mut(&mut self, id: &str) -> &mut Node {
        let cache = self.cache;
        self.nodes
            .entry(id.to_string())
            .or_insert_with(|| cache.node(id).cloned().unwrap_or_else(|| Node::new(id)))
    }

    fn edge_mut(&mut self, id: &str) -> Option<&mut Edge> {
        if !self.edges.contains_key(id) {
            let edge = self.cache.edge(id)?.clone();
            self.edges.insert(id.to_string(), edge);
        }
        self.edges.get_mut(id)
    }

    fn merged_edges<'s>(
        &'s self,
        cached: Vec<&'s Edge>,
        new: Option<&'s Vec<String>>,
    ) -> Vec<&'s Edge> {
        let mut out: Vec<&Edge> = cached
            .into_iter()
            .map(|e| self.edges.get(&e.id).unwrap_or(e))
            .collect();
        if let Some(ids) = new {
            out.extend(ids.iter().filter_map(|id| self.edges.get(id)));
        }
        out
    }

    /// Finish the transaction and collect its changes.
    #[must_use]
    pub fn finish(self) -> Staged {
        let mut batch = WriteBatch {
            root_id: self.root_id.clone(),
            ..WriteBatch::default()
        };

        let mut node_points: Vec<_> = self.node_points.into_iter().collect();
        node_points.sort_by(|a, b| a.0.cmp(&b.0));
        batch.node_points = node_points;

        let mut dirty: Vec<&String> = self.dirty_edges.iter().collect();
        dirty.sort();
        batch.edges = dirty
            .into_iter()
            .filter_map(|id| self.edges.get(id))
            .map(EdgeRecord::from)
            .collect();

        let mut edge_points: Vec<_> = self.edge_points.into_iter().collect();
        edge_points.sort_by(|a, b| a.0.cmp(&b.0));
        batch.edge_points = edge_points;

        Staged {
            batch,
            root_id: self.root_id,
            nodes: self.nodes,
            edges: self.edges,
        }
    }
}

impl GraphView for Txn<'_> {
    fn root_id(&self) -> &str {
        self.root_id
            .as_deref()
            .unwrap_or_else(|| self.cache.root_id())
    }

    fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id).or_else(|| self.cache.node(id))
    }

    fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.get(id).or_else(|| self.cache.edge(id))
    }

    fn up_edges(&self, id: &str) -> Vec<&Edge> {
        self.merged_edges(self.cache.up_edges(id), self.new_by_down.get(id))
    }

    fn down_edges(&self, id: &str) -> Vec<&Edge> {
        self.merged_edges(self.cache.down_edges(id), self.new_by_up.get(id))
    }
}
