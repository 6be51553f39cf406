//! # Pointgraph Protocol
//!
//! Subject scheme and wire messages for pointgraph synchronization.
//!
//! ## Messages
//!
//! - Point batches: CBOR arrays of points, for node and edge updates
//! - `NodesResponse`: reply to node queries and credential checks
//! - `VerifyResponse`: reply to hash verification and maintenance
//! - `Envelope`: request/reply wrapper for transports without reply subjects
//!
//! ## Subjects
//!
//! `points.{node}[.{parent}]`, `nodes.{parent}.{node}`,
//! `upstream.{ancestor}.{node}[.{parent}]`, `auth.*`, `admin.*`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod subjects;

pub use messages::{
    ack_error, ack_ok, decode_points, encode_points, from_cbor, parse_ack, to_cbor, Envelope,
    HashMismatch, MessageError, NodeFilter, NodesResponse, VerifyResponse,
};
pub use subjects::{subject_matches, Subject, SubjectScheme};
