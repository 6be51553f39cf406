//! Per-type merge semantics for points.
//!
//! Every point type maps to exactly one merge strategy and one validation
//! rule. Device-defined measurement types land in [`PointType::Custom`] and
//! are merged as plain last-writer-wins facts.
//!
//! # Merge Rules
//!
//! | Point Type | Strategy | Validation |
//! |------------|----------|------------|
//! | `nodeType` | LWW, surfaced as `Node::typ`, excluded from hashing | non-empty text |
//! | `tombstone` | LWW flag | value is 0 or 1 |
//! | everything else | LWW | none |

use crate::point::{is_representable, Point};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The type of a point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PointType {
    /// Type of the owning node (device, user, group, ...)
    NodeType,
    /// Soft-delete marker
    Tombstone,
    /// Human readable description
    Description,
    /// Generic measured value
    Value,
    /// Requested set point
    ValueSet,
    /// User first name
    FirstName,
    /// User last name
    LastName,
    /// User email, used for authentication
    Email,
    /// User phone number
    Phone,
    /// User password, used for authentication
    Pass,
    /// Role on a user edge
    Role,
    /// Average node-points handling time
    MetricCycleNodePoint,
    /// Average edge-points handling time
    MetricCycleEdgePoint,
    /// Average node query handling time
    MetricCycleNodes,
    /// Device-defined type
    Custom(String),
}

/// Merge strategy for a given point type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Last-Writer-Wins: strictly later timestamp replaces the stored point
    Lww,
    /// LWW, and the winning text is lifted into a node field
    NodeField,
    /// LWW on a boolean carried in `value`
    Flag,
}

impl PointType {
    /// Wire name of this type.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            PointType::NodeType => "nodeType",
            PointType::Tombstone => "tombstone",
            PointType::Description => "description",
            PointType::Value => "value",
            PointType::ValueSet => "valueSet",
            PointType::FirstName => "firstName",
            PointType::LastName => "lastName",
            PointType::Email => "email",
            PointType::Phone => "phone",
            PointType::Pass => "pass",
            PointType::Role => "role",
            PointType::MetricCycleNodePoint => "metricCycleNodePoint",
            PointType::MetricCycleEdgePoint => "metricCycleEdgePoint",
            PointType::MetricCycleNodes => "metricCycleNodes",
            PointType::Custom(s) => s,
        }
    }

    /// Parse a wire name. Unknown names become [`PointType::Custom`].
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "nodeType" => PointType::NodeType,
            "tombstone" => PointType::Tombstone,
            "description" => PointType::Description,
            "value" => PointType::Value,
            "valueSet" => PointType::ValueSet,
            "firstName" => PointType::FirstName,
            "lastName" => PointType::LastName,
            "email" => PointType::Email,
            "phone" => PointType::Phone,
            "pass" => PointType::Pass,
            "role" => PointType::Role,
            "metricCycleNodePoint" => PointType::MetricCycleNodePoint,
            "metricCycleEdgePoint" => PointType::MetricCycleEdgePoint,
            "metricCycleNodes" => PointType::MetricCycleNodes,
            other => PointType::Custom(other.to_string()),
        }
    }

    /// Get the merge strategy for this point type.
    #[must_use]
    pub fn merge_strategy(&self) -> MergeStrategy {
        match self {
            PointType::NodeType => MergeStrategy::NodeField,
            PointType::Tombstone => MergeStrategy::Flag,
            _ => MergeStrategy::Lww,
        }
    }

    /// Whether points of this type contribute to edge hashes.
    #[must_use]
    pub fn is_hashed(&self) -> bool {
        !matches!(self, PointType::NodeType)
    }

    /// Check that a point of this type is well formed.
    ///
    /// # Errors
    ///
    /// Returns error if the point violates the rule for its type.
    pub fn validate(&self, point: &Point) -> Result<(), ModelError> {
        if !is_representable(point.time) {
            return Err(ModelError::InvalidPoint {
                typ: self.to_string(),
                reason: format!("time {} is outside the nanosecond range", point.time),
            });
        }
        match self.merge_strategy() {
            MergeStrategy::NodeField if point.text.is_empty() => Err(ModelError::InvalidPoint {
                typ: self.to_string(),
                reason: "text must not be empty".to_string(),
            }),
            MergeStrategy::Flag if point.value != 0.0 && point.value != 1.0 => {
                Err(ModelError::InvalidPoint {
                    typ: self.to_string(),
                    reason: format!("flag value must be 0 or 1, got {}", point.value),
                })
            }
            _ => match self {
                PointType::Custom(s) if s.is_empty() => Err(ModelError::EmptyType),
                _ => Ok(()),
            },
        }
    }
}

impl From<String> for PointType {
    fn from(s: String) -> Self {
        PointType::parse(&s)
    }
}

impl From<&str> for PointType {
    fn from(s: &str) -> Self {
        PointType::parse(s)
    }
}

impl From<PointType> for String {
    fn from(t: PointType) -> Self {
        match t {
            PointType::Custom(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for PointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by model validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    /// Point type string was empty
    #[error("point type must not be empty")]
    EmptyType,
    /// Point failed the validation rule for its type
    #[error("invalid {typ} point: {reason}")]
    InvalidPoint {
        /// Offending point type
        typ: String,
        /// Why it was rejected
        reason: String,
    },
    /// Node or edge identifier cannot be used
    #[error("invalid id {0:?}")]
    InvalidId(String),
}
