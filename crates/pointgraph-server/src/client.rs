//! Typed client for the sync protocol.

use crate::bus::{Bus, BusError};
use chrono::Utc;
use crate::config::ServerConfig;
use pointgraph_core::{stamp_all, NodeEdge, Point, PointType, ALL, NONE};
use pointgraph_proto::{
    decode_points, encode_points, from_cbor, parse_ack, MessageError, NodeFilter, NodesResponse,
    SubjectScheme, VerifyResponse,
};
use std::time::Duration;

/// Errors for client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport failure
    #[error(transparent)]
    Bus(#[from] BusError),
    /// Request or reply could not be encoded
    #[error(transparent)]
    Message(#[from] MessageError),
    /// The server answered with an error
    #[error("remote error: {0}")]
    Remote(String),
}

/// Sends updates and queries over a [`Bus`].
#[derive(Clone)]
pub struct Client<B: Bus> {
    bus: B,
    scheme: SubjectScheme,
    timeout: Duration,
}

impl<B: Bus> Client<B> {
    /// Create a client using the default subject scheme.
    #[must_use]
    pub fn new(bus: B, timeout: Duration) -> Self {
        Self::with_scheme(bus, SubjectScheme::default(), timeout)
    }

    /// Create a client using a custom subject scheme.
    #[must_use]
    pub fn with_scheme(bus: B, scheme: SubjectScheme, timeout: Duration) -> Self {
        Self {
            bus,
            scheme,
            timeout,
        }
    }

    /// Create a client that talks to a server started with `config`, using
    /// its subject prefix and request timeout.
    #[must_use]
    pub fn from_config(bus: B, config: &ServerConfig) -> Self {
        Self::with_scheme(bus, config.subject_scheme(), config.request_timeout)
    }

    /// How long requests wait for a reply.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send node points.
    ///
    /// With `ack` the call waits for the server to apply them.
    ///
    /// # Errors
    ///
    /// Returns error on transport failure, timeout, or a rejected update.
    pub async fn send_node_points(
        &self,
        node: &str,
        points: Vec<Point>,
        ack: bool,
    ) -> Result<(), ClientError> {
        let subject = self.scheme.node_points(node);
        self.send(&subject, points, ack).await
    }

    /// Send edge points for the edge `parent -> node`.
    ///
    /// # Errors
    ///
    /// Returns error on transport failure, timeout, or a rejected update.
    pub async fn send_edge_points(
        &self,
        node: &str,
        parent: &str,
        points: Vec<Point>,
        ack: bool,
    ) -> Result<(), ClientError> {
        let subject = self.scheme.edge_points(node, parent);
        self.send(&subject, points, ack).await
    }

    async fn send(&self, subject: &str, points: Vec<Point>, ack: bool) -> Result<(), ClientError> {
        let payload = encode_points(&stamp_all(points, Utc::now()))?;
        if !ack {
            self.bus.publish(subject, payload).await?;
            return Ok(());
        }
        let reply = self.bus.request(subject, payload, self.timeout).await?;
        parse_ack(&reply).map_err(ClientError::Remote)
    }

    /// Query nodes.
    ///
    /// # Errors
    ///
    /// Returns error on transport failure, timeout, or a failed query.
    pub async fn get_nodes(
        &self,
        parent: &str,
        node: &str,
        filter: &NodeFilter,
    ) -> Result<Vec<NodeEdge>, ClientError> {
        let payload = encode_points(&filter.to_points())?;
        let reply = self
            .bus
            .request(&self.scheme.nodes(parent, node), payload, self.timeout)
            .await?;
        let resp: NodesResponse = from_cbor(&reply)?;
        resp.into_result().map_err(ClientError::Remote)
    }

    /// Fetch a single node without edge context.
    ///
    /// # Errors
    ///
    /// Returns error if the node does not exist.
    pub async fn get_node(&self, id: &str) -> Result<NodeEdge, ClientError> {
        self.get_nodes(NONE, id, &NodeFilter::default())
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::Remote(format!("not found: {id}")))
    }

    /// Direct children of `parent`, optionally restricted to one node type.
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or a failed query.
    pub async fn get_children(
        &self,
        parent: &str,
        typ: Option<&str>,
        include_deleted: bool,
    ) -> Result<Vec<NodeEdge>, ClientError> {
        let filter = NodeFilter {
            typ: typ.map(str::to_string),
            include_deleted,
            recursive: false,
        };
        self.get_nodes(parent, ALL, &filter).await
    }

    /// Tombstone the edge `parent -> id`.
    ///
    /// # Errors
    ///
    /// Returns error if the server rejects the update.
    pub async fn delete_node(&self, id: &str, parent: &str) -> Result<(), ClientError> {
        self.send_edge_points(id, parent, vec![tombstone(true)], true)
            .await
    }

    /// Link `id` under `new_parent` and tombstone its edge to `old_parent`.
    ///
    /// # Errors
    ///
    /// Returns error if either update is rejected.
    pub async fn move_node(
        &self,
        id: &str,
        old_parent: &str,
        new_parent: &str,
    ) -> Result<(), ClientError> {
        if old_parent == new_parent {
            return Ok(());
        }
        self.mirror_node(id, new_parent).await?;
        self.delete_node(id, old_parent).await
    }

    /// Add `new_parent` as an additional parent of `id`.
    ///
    /// # Errors
    ///
    /// Returns error if the server rejects the update.
    pub async fn mirror_node(&self, id: &str, new_parent: &str) -> Result<(), ClientError> {
        self.send_edge_points(id, new_parent, vec![tombstone(false)], true)
            .await
    }

    /// Look up user nodes matching the credentials, closest to root first.
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or timeout.
    pub async fn user_check(&self, email: &str, pass: &str) -> Result<Vec<NodeEdge>, ClientError> {
        let payload = encode_points(&[
            Point::text(PointType::Email, email),
            Point::text(PointType::Pass, pass),
        ])?;
        let reply = self
            .bus
            .request(&self.scheme.auth_user(), payload, self.timeout)
            .await?;
        let resp: NodesResponse = from_cbor(&reply)?;
        resp.into_result().map_err(ClientError::Remote)
    }

    /// Connection URI advertised by the server.
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or timeout.
    pub async fn transport_uri(&self) -> Result<String, ClientError> {
        let reply = self
            .bus
            .request(&self.scheme.auth_transport_uri(), Vec::new(), self.timeout)
            .await?;
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }

    /// Read-only hash verification.
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or a failed verify.
    pub async fn store_verify(&self) -> Result<VerifyResponse, ClientError> {
        self.verify(&self.scheme.store_verify()).await
    }

    /// Hash verification that repairs mismatches.
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or a failed repair.
    pub async fn store_maint(&self) -> Result<VerifyResponse, ClientError> {
        self.verify(&self.scheme.store_maint()).await
    }

    async fn verify(&self, subject: &str) -> Result<VerifyResponse, ClientError> {
        let reply = self.bus.request(subject, Vec::new(), self.timeout).await?;
        let resp: VerifyResponse = from_cbor(&reply)?;
        if resp.error.is_empty() {
            Ok(resp)
        } else {
            Err(ClientError::Remote(resp.error))
        }
    }
}

/// Decode a fan-out payload received on an `upstream` subject.
///
/// # Errors
///
/// Returns error if the payload is not a point array.
pub fn decode_upstream(payload: &[u8]) -> Result<Vec<Point>, ClientError> {
    Ok(decode_points(payload)?)
}

fn tombstone(deleted: bool) -> Point {
    Point::value(PointType::Tombstone, if deleted { 1.0 } else { 0.0 })
}
