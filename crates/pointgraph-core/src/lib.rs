//! # Pointgraph Core
//!
//! Data model and merge semantics for the pointgraph store.
//!
//! This crate provides:
//! - Points: timestamped facts identified by `(type, key)`
//! - Nodes and edges forming a multi-parent DAG
//! - Per-type merge strategies with strict last-writer-wins
//! - The rolling edge hash used to detect downstream change

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod hash;
pub mod merge;
pub mod node;
pub mod point;

pub use hash::{edge_hash, HashMode, HASH_LEN};
pub use merge::{MergeStrategy, ModelError, PointType};
pub use node::{validate_id, Edge, Node, NodeEdge, ALL, NONE, ROOT};
pub use point::{is_representable, stamp_all, Point, Points, DEFAULT_KEY};
