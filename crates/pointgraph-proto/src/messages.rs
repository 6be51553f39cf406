//! Wire messages exchanged over the bus.
//!
//! Every payload is CBOR. Point updates carry a bare point array; queries and
//! admin requests reply with the structured responses below. Update
//! acknowledgements are plain bytes: empty means success, anything else is a
//! UTF-8 error string.

use pointgraph_core::{NodeEdge, Point, PointType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Serialize any message to CBOR bytes.
///
/// # Errors
///
/// Returns error if serialization fails.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, MessageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|e| MessageError::Serialize(e.to_string()))?;
    Ok(bytes)
}

/// Deserialize any message from CBOR bytes.
///
/// # Errors
///
/// Returns error if deserialization fails.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MessageError> {
    ciborium::from_reader(bytes).map_err(|e| MessageError::Deserialize(e.to_string()))
}

/// Encode a point batch.
///
/// # Errors
///
/// Returns error if serialization fails.
pub fn encode_points(points: &[Point]) -> Result<Vec<u8>, MessageError> {
    to_cbor(&points)
}

/// Decode a point batch. An empty payload is an empty batch.
///
/// # Errors
///
/// Returns error if the payload is not a point array.
pub fn decode_points(bytes: &[u8]) -> Result<Vec<Point>, MessageError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    from_cbor(bytes)
}

/// Successful acknowledgement payload.
#[must_use]
pub fn ack_ok() -> Vec<u8> {
    Vec::new()
}

/// Failed acknowledgement payload.
#[must_use]
pub fn ack_error(err: impl std::fmt::Display) -> Vec<u8> {
    err.to_string().into_bytes()
}

/// Interpret an acknowledgement payload.
///
/// # Errors
///
/// Returns the remote error text for a non-empty payload.
pub fn parse_ack(bytes: &[u8]) -> Result<(), String> {
    if bytes.is_empty() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Reply to a node query or credential check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodesResponse {
    /// Matching nodes
    pub nodes: Vec<NodeEdge>,
    /// Error text, empty on success
    #[serde(default)]
    pub error: String,
}

impl NodesResponse {
    /// Successful response.
    #[must_use]
    pub fn ok(nodes: Vec<NodeEdge>) -> Self {
        Self {
            nodes,
            error: String::new(),
        }
    }

    /// Failed response.
    #[must_use]
    pub fn err(error: impl std::fmt::Display) -> Self {
        Self {
            nodes: Vec::new(),
            error: error.to_string(),
        }
    }

    /// Split into nodes or the remote error.
    ///
    /// # Errors
    ///
    /// Returns the remote error text when set.
    pub fn into_result(self) -> Result<Vec<NodeEdge>, String> {
        if self.error.is_empty() {
            Ok(self.nodes)
        } else {
            Err(self.error)
        }
    }
}

/// Point type carrying the non-recursive flag of a query filter.
pub const FILTER_RECURSIVE: &str = "recursive";

/// Optional filters of a node query.
///
/// On the wire a filter is a point array: a `nodeType` point selects the
/// type, `tombstone = 1` includes deleted edges, `recursive = 0` limits an
/// `all` query to direct children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFilter {
    /// Only return nodes of this type
    pub typ: Option<String>,
    /// Include tombstoned edges
    pub include_deleted: bool,
    /// Walk the whole subtree for `all` queries
    pub recursive: bool,
}

impl Default for NodeFilter {
    fn default() -> Self {
        Self {
            typ: None,
            include_deleted: false,
            recursive: true,
        }
    }
}

impl NodeFilter {
    /// Filter on a node type.
    #[must_use]
    pub fn of_type(typ: impl Into<String>) -> Self {
        Self {
            typ: Some(typ.into()),
            ..Self::default()
        }
    }

    /// Whether a node type passes the filter.
    #[must_use]
    pub fn accepts_type(&self, typ: &str) -> bool {
        self.typ.as_deref().map_or(true, |t| t == typ)
    }

    /// Build the filter from query points. Unknown points are ignored.
    #[must_use]
    pub fn from_points(points: &[Point]) -> Self {
        let mut filter = Self::default();
        for p in points {
            match &p.typ {
                PointType::NodeType if !p.text.is_empty() => filter.typ = Some(p.text.clone()),
                PointType::Tombstone => filter.include_deleted = p.is_set(),
                PointType::Custom(name) if name == FILTER_RECURSIVE => {
                    filter.recursive = p.is_set();
                }
                _ => {}
            }
        }
        filter
    }

    /// Express the filter as query points. The default filter is empty.
    #[must_use]
    pub fn to_points(&self) -> Vec<Point> {
        let mut points = Vec::new();
        if let Some(t) = &self.typ {
            points.push(Point::text(PointType::NodeType, t.clone()));
        }
        if self.include_deleted {
            points.push(Point::value(PointType::Tombstone, 1.0));
        }
        if !self.recursive {
            points.push(Point::value(PointType::Custom(FILTER_RECURSIVE.into()), 0.0));
        }
        points
    }
}

/// One edge whose stored hash disagreed with the recomputed one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashMismatch {
    /// Edge ID
    pub edge_id: String,
    /// Up node
    pub up: String,
    /// Down node
    pub down: String,
    /// Hash found in the store
    pub stored: Vec<u8>,
    /// Hash recomputed from the subtree
    pub computed: Vec<u8>,
}

/// Result of a verify or maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResponse {
    /// Number of edges checked
    pub checked: usize,
    /// Edges whose hash was wrong
    pub mismatches: Vec<HashMismatch>,
    /// Whether mismatches were repaired
    pub repaired: bool,
    /// Error text, empty on success
    #[serde(default)]
    pub error: String,
}

/// Request/reply envelope for transports without native reply subjects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Subject the receiver should reply on
    pub reply: Option<String>,
    /// Wrapped payload
    pub data: Vec<u8>,
}

impl Envelope {
    /// Serialize to CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_cbor(&self) -> Result<Vec<u8>, MessageError> {
        to_cbor(self)
    }

    /// Deserialize from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_cbor(bytes: &[u8]) -> Result<Self, MessageError> {
        from_cbor(bytes)
    }
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
}
