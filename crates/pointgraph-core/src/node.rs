//! Nodes, edges and the combined view returned by queries.

use crate::merge::{ModelError, PointType};
use crate::point::{Point, Points};
use serde::{Deserialize, Serialize};

/// Parent sentinel marking the top of the graph.
pub const NONE: &str = "none";

/// Selector matching every parent or every node.
pub const ALL: &str = "all";

/// Selector resolved to the current root node.
pub const ROOT: &str = "root";

/// Node type of a device.
pub const NODE_TYPE_DEVICE: &str = "device";

/// Node type of a user.
pub const NODE_TYPE_USER: &str = "user";

/// Node type of a group.
pub const NODE_TYPE_GROUP: &str = "group";

/// Check that an identifier can be used as a node ID and as a subject token.
///
/// # Errors
///
/// Returns [`ModelError::InvalidId`] for empty IDs, reserved selectors and
/// IDs containing subject separators, wildcards or whitespace.
pub fn validate_id(id: &str) -> Result<(), ModelError> {
    let bad = id.is_empty()
        || id == NONE
        || id == ALL
        || id == ROOT
        || id
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c == '/' || c.is_whitespace());
    if bad {
        Err(ModelError::InvalidId(id.to_string()))
    } else {
        Ok(())
    }
}

/// A graph entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node ID
    pub id: String,
    /// Node type, mirrored from the `nodeType` point
    #[serde(rename = "type")]
    pub typ: String,
    /// Node points
    pub points: Points,
}

impl Node {
    /// Create an empty node.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            typ: String::new(),
            points: Points::new(),
        }
    }

    /// Merge points into the node. Returns `true` if anything changed.
    pub fn merge(&mut self, points: impl IntoIterator<Item = Point>) -> bool {
        let changed = self.points.merge_all(points);
        if changed {
            self.sync_type();
        }
        changed
    }

    fn sync_type(&mut self) {
        if let Some(t) = self.points.text(&PointType::NodeType) {
            t.clone_into(&mut self.typ);
        }
    }
}

/// A directed parent to child relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Edge ID
    pub id: String,
    /// Parent node ID, or [`NONE`] for the root edge
    pub up: String,
    /// Child node ID
    pub down: String,
    /// Relationship-scoped points
    pub points: Points,
    /// Rolling integrity hash of the subtree below this edge
    #[serde(default)]
    pub hash: Vec<u8>,
}

impl Edge {
    /// Create an edge with no points and an empty hash.
    #[must_use]
    pub fn new(id: impl Into<String>, up: impl Into<String>, down: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            up: up.into(),
            down: down.into(),
            points: Points::new(),
            hash: Vec::new(),
        }
    }

    /// Whether the edge is soft-deleted.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.points.flag(&PointType::Tombstone)
    }

    /// Whether this is the edge above the root.
    #[must_use]
    pub fn is_root_edge(&self) -> bool {
        self.up == NONE
    }
}

/// A node seen through one of its incident edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEdge {
    /// Node ID
    pub id: String,
    /// Node type
    #[serde(rename = "type")]
    pub typ: String,
    /// Parent of the edge this view was taken through
    pub parent: String,
    /// Hash of that edge
    #[serde(default)]
    pub hash: Vec<u8>,
    /// Node points
    pub points: Points,
    /// Edge points
    #[serde(default)]
    pub edge_points: Points,
}

impl NodeEdge {
    /// Combine a node with one of its edges.
    #[must_use]
    pub fn from_parts(node: &Node, edge: &Edge) -> Self {
        Self {
            id: node.id.clone(),
            typ: node.typ.clone(),
            parent: edge.up.clone(),
            hash: edge.hash.clone(),
            points: node.points.clone(),
            edge_points: edge.points.clone(),
        }
    }

    /// Whether the edge this view was taken through is tombstoned.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.edge_points.flag(&PointType::Tombstone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn node_type_follows_point() {
        let t1 = Utc.timestamp_opt(100, 0).unwrap();
        let t2 = Utc.timestamp_opt(200, 0).unwrap();
        let mut node = Node::new("n1");
        assert!(node.merge([Point::text(PointType::NodeType, NODE_TYPE_DEVICE).with_time(t1)]));
        assert_eq!(node.typ, NODE_TYPE_DEVICE);
        assert!(node.merge([Point::text(PointType::NodeType, NODE_TYPE_GROUP).with_time(t2)]));
        assert_eq!(node.typ, NODE_TYPE_GROUP);
        assert!(!node.merge([Point::text(PointType::NodeType, NODE_TYPE_USER).with_time(t1)]));
        assert_eq!(node.typ, NODE_TYPE_GROUP);
    }

    #[test]
    fn edge_tombstone_flag() {
        let mut edge = Edge::new("e1", "a", "b");
        assert!(!edge.is_tombstone());
        let t = Utc.timestamp_opt(100, 0).unwrap();
        edge.points
            .merge(Point::value(PointType::Tombstone, 1.0).with_time(t));
        assert!(edge.is_tombstone());
    }

    #[test]
    fn id_validation() {
        assert!(validate_id("abc-123").is_ok());
        for bad in ["", "a.b", "a*", "x>", "a b", "none", "all", "root", "a/b"] {
            assert!(validate_id(bad).is_err(), "{bad} accepted");
        }
    }
}
