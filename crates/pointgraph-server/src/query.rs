//! Queries and graph traversal.

use crate::cache::{Cache, GraphView};
use crate::store::{Store, StoreError, MAX_DEPTH};
use pointgraph_core::node::NODE_TYPE_USER;
use pointgraph_core::{edge_hash, Edge, Node, NodeEdge, PointType, Points, ALL, NONE, ROOT};
use pointgraph_proto::NodeFilter;
use std::collections::{HashSet, VecDeque};

impl Store {
    /// Look up nodes by parent and node selectors.
    ///
    /// - `parent == "none"`: the node alone, hashed against an empty up edge
    /// - `parent == "all"`: one entry per edge above the node
    /// - `parent == <id>`: the edge between that parent and the node
    /// - `id == "all"`: descendants of `parent`, recursively unless the
    ///   filter says otherwise
    ///
    /// `root` is accepted for either selector. Tombstoned edges are left out
    /// unless the filter includes deleted edges, and so is everything below
    /// them.
    ///
    /// # Errors
    ///
    /// Returns error if a named node or edge does not exist, the selectors
    /// are contradictory, or a walk exceeds the depth limit.
    pub fn get_nodes(
        &self,
        parent: &str,
        id: &str,
        filter: &NodeFilter,
    ) -> Result<Vec<NodeEdge>, StoreError> {
        let cache = self.read();
        let parent = resolve_root(&cache, parent)?;
        let id = resolve_root(&cache, id)?;

        if id == ALL {
            if parent == ALL || parent == NONE {
                return Err(StoreError::InvalidQuery(format!(
                    "cannot list all nodes under {parent:?}"
                )));
            }
            if cache.node(&parent).is_none() {
                return Err(StoreError::NotFound(parent));
            }
            let mut out = Vec::new();
            let mut seen = HashSet::new();
            let mut visited = HashSet::new();
            descendants(&cache, &parent, filter, 0, &mut seen, &mut visited, &mut out)?;
            return Ok(out);
        }

        let visible = |e: &&Edge| filter.include_deleted || !e.is_tombstone();
        let nodes = match parent.as_str() {
            NONE => {
                let node = cache
                    .node(&id)
                    .ok_or_else(|| StoreError::NotFound(id.clone()))?;
                let children = cache.down_edges(&id);
                let hash = edge_hash(
                    self.hash_mode(),
                    &Points::new(),
                    &node.points,
                    children.iter().map(|e| e.hash.as_slice()),
                );
                vec![NodeEdge {
                    id: node.id.clone(),
                    typ: node.typ.clone(),
                    parent: NONE.to_string(),
                    hash,
                    points: node.points.clone(),
                    edge_points: Points::new(),
                }]
            }
            ALL => {
                let edges = cache.up_edges(&id);
                if edges.is_empty() && cache.node(&id).is_none() {
                    return Err(StoreError::NotFound(id));
                }
                let mut edges: Vec<&Edge> = edges.into_iter().filter(visible).collect();
                edges.sort_by(|a, b| a.up.cmp(&b.up));
                edges
                    .into_iter()
                    .map(|e| node_edge(&cache, e))
                    .collect()
            }
            p => {
                let edge = cache
                    .edge_between(&id, p)
                    .ok_or_else(|| StoreError::NotFound(format!("{p}/{id}")))?;
                std::iter::once(edge)
                    .filter(visible)
                    .map(|e| node_edge(&cache, e))
                    .collect()
            }
        };

        Ok(nodes
            .into_iter()
            .filter(|n: &NodeEdge| filter.accepts_type(&n.typ))
            .collect())
    }

    /// The node seen without edge context.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the node does not exist.
    pub fn get_node(&self, id: &str) -> Result<NodeEdge, StoreError> {
        self.get_nodes(NONE, id, &NodeFilter::default())?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// IDs of the node's parents.
    #[must_use]
    pub fn parents(&self, id: &str, include_deleted: bool) -> Vec<String> {
        let cache = self.read();
        let mut ups: Vec<String> = cache
            .up_edges(id)
            .into_iter()
            .filter(|e| include_deleted || !e.is_tombstone())
            .map(|e| e.up.clone())
            .collect();
        ups.sort();
        ups
    }

    /// Hops from the node up to the root along live edges.
    ///
    /// `None` if the node is not connected to the root.
    #[must_use]
    pub fn min_dist_to_root(&self, id: &str) -> Option<usize> {
        min_dist(&self.read(), id)
    }

    /// Ancestors that should see an update of `id`, starting with `id`
    /// itself.
    ///
    /// Every path to the root is walked, so an ancestor reachable along two
    /// paths appears twice. The walk stops at the `none` sentinel.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecursionLimit`] if a path is deeper than the
    /// depth limit.
    pub fn upstream_walk(&self, id: &str, include_deleted: bool) -> Result<Vec<String>, StoreError> {
        let cache = self.read();
        let mut out = vec![id.to_string()];
        walk_up(&cache, id, include_deleted, 0, &mut out)?;
        Ok(out)
    }

    /// Live views of every user node whose email and password match, closest
    /// to the root first.
    #[must_use]
    pub fn user_check(&self, email: &str, pass: &str) -> Vec<NodeEdge> {
        let cache = self.read();
        let mut found: Vec<(usize, NodeEdge)> = Vec::new();
        for node in cache.nodes() {
            let matches = node.typ == NODE_TYPE_USER
                && node.points.text(&PointType::Email) == Some(email)
                && node.points.text(&PointType::Pass) == Some(pass);
            if !matches {
                continue;
            }
            for edge in cache.up_edges(&node.id) {
                if edge.is_tombstone() {
                    continue;
                }
                let dist = if edge.up == NONE {
                    0
                } else {
                    min_dist(&cache, &edge.up).map_or(usize::MAX, |d| d + 1)
                };
                found.push((dist, NodeEdge::from_parts(node, edge)));
            }
        }
        found.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.id.cmp(&b.1.id))
                .then_with(|| a.1.parent.cmp(&b.1.parent))
        });
        found.into_iter().map(|(_, ne)| ne).collect()
    }
}

fn resolve_root(cache: &Cache, selector: &str) -> Result<String, StoreError> {
    if selector != ROOT {
        return Ok(selector.to_string());
    }
    let root = cache.root_id();
    if root.is_empty() {
        Err(StoreError::NotFound("root".to_string()))
    } else {
        Ok(root.to_string())
    }
}

fn node_edge(cache: &Cache, edge: &Edge) -> NodeEdge {
    match cache.node(&edge.down) {
        Some(node) => NodeEdge::from_parts(node, edge),
        None => NodeEdge::from_parts(&Node::new(edge.down.clone()), edge),
    }
}

fn descendants(
    cache: &Cache,
    parent: &str,
    filter: &NodeFilter,
    depth: usize,
    seen: &mut HashSet<(String, String)>,
    visited: &mut HashSet<String>,
    out: &mut Vec<NodeEdge>,
) -> Result<(), StoreError> {
    if depth > MAX_DEPTH {
        return Err(StoreError::RecursionLimit);
    }
    let mut edges = cache.down_edges(parent);
    edges.sort_by(|a, b| a.down.cmp(&b.down));
    for edge in edges {
        if edge.is_tombstone() && !filter.include_deleted {
            continue;
        }
        let ne = node_edge(cache, edge);
        if filter.accepts_type(&ne.typ) && seen.insert((ne.id.clone(), ne.parent.clone())) {
            out.push(ne);
        }
        if filter.recursive && visited.insert(edge.down.clone()) {
            descendants(cache, &edge.down, filter, depth + 1, seen, visited, out)?;
        }
    }
    Ok(())
}

fn walk_up(
    cache: &Cache,
    id: &str,
    include_deleted: bool,
    depth: usize,
    out: &mut Vec<String>,
) -> Result<(), StoreError> {
    if depth > MAX_DEPTH {
        return Err(StoreError::RecursionLimit);
    }
    let mut edges = cache.up_edges(id);
    edges.sort_by(|a, b| a.up.cmp(&b.up));
    for edge in edges {
        if edge.up == NONE || (edge.is_tombstone() && !include_deleted) {
            continue;
        }
        out.push(edge.up.clone());
        walk_up(cache, &edge.up, include_deleted, depth + 1, out)?;
    }
    Ok(())
}

fn min_dist(cache: &Cache, id: &str) -> Option<usize> {
    let root = cache.root_id();
    if root.is_empty() {
        return None;
    }
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([(id.to_string(), 0usize)]);
    while let Some((cur, dist)) = queue.pop_front() {
        if cur == root {
            return Some(dist);
        }
        if !seen.insert(cur.clone()) {
            continue;
        }
        for edge in cache.up_edges(&cur) {
            if edge.up != NONE && !edge.is_tombstone() {
                queue.push_back((edge.up.clone(), dist + 1));
            }
        }
    }
    None
}
