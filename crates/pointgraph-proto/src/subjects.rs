//! Message-bus subject scheme.
//!
//! Subjects are dot-separated token lists:
//!
//! | Subject | Meaning |
//! |---------|---------|
//! | `points.{node}` | node point update |
//! | `points.{node}.{parent}` | edge point update |
//! | `nodes.{parent}.{node}` | node query |
//! | `upstream.{ancestor}.{node}[.{parent}]` | fan-out broadcast |
//! | `auth.user`, `auth.getTransportURI` | credential check, connection info |
//! | `admin.storeVerify`, `admin.storeMaint` | hash verification, repair |
//!
//! An optional prefix namespaces every subject (`{prefix}.points.{node}`).
//! Wildcards follow NATS rules: `*` matches one token, `>` matches one or
//! more trailing tokens.

use serde::{Deserialize, Serialize};

/// Single-token wildcard.
pub const WILDCARD_ONE: &str = "*";

/// Trailing wildcard.
pub const WILDCARD_TAIL: &str = ">";

/// Subject scheme configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectScheme {
    /// Optional namespace prepended to every subject
    pub prefix: Option<String>,
}

impl SubjectScheme {
    /// Create a scheme with the given namespace.
    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
        }
    }

    fn build(&self, tokens: &[&str]) -> String {
        let body = tokens.join(".");
        match &self.prefix {
            Some(p) => format!("{p}.{body}"),
            None => body,
        }
    }

    /// Subject for point updates of a node.
    #[must_use]
    pub fn node_points(&self, node: &str) -> String {
        self.build(&["points", node])
    }

    /// Subject for point updates of the edge between `node` and `parent`.
    #[must_use]
    pub fn edge_points(&self, node: &str, parent: &str) -> String {
        self.build(&["points", node, parent])
    }

    /// Subject for a node query.
    #[must_use]
    pub fn nodes(&self, parent: &str, node: &str) -> String {
        self.build(&["nodes", parent, node])
    }

    /// Fan-out subject for a node update seen at `ancestor`.
    #[must_use]
    pub fn upstream_node(&self, ancestor: &str, node: &str) -> String {
        self.build(&["upstream", ancestor, node])
    }

    /// Fan-out subject for an edge update seen at `ancestor`.
    #[must_use]
    pub fn upstream_edge(&self, ancestor: &str, node: &str, parent: &str) -> String {
        self.build(&["upstream", ancestor, node, parent])
    }

    /// Credential check subject.
    #[must_use]
    pub fn auth_user(&self) -> String {
        self.build(&["auth", "user"])
    }

    /// Connection info subject.
    #[must_use]
    pub fn auth_transport_uri(&self) -> String {
        self.build(&["auth", "getTransportURI"])
    }

    /// Read-only hash verification subject.
    #[must_use]
    pub fn store_verify(&self) -> String {
        self.build(&["admin", "storeVerify"])
    }

    /// Repairing hash verification subject.
    #[must_use]
    pub fn store_maint(&self) -> String {
        self.build(&["admin", "storeMaint"])
    }

    /// Wildcard for all node point updates.
    #[must_use]
    pub fn node_points_wildcard(&self) -> String {
        self.build(&["points", WILDCARD_ONE])
    }

    /// Wildcard for all edge point updates.
    #[must_use]
    pub fn edge_points_wildcard(&self) -> String {
        self.build(&["points", WILDCARD_ONE, WILDCARD_ONE])
    }

    /// Wildcard for all node queries.
    #[must_use]
    pub fn nodes_wildcard(&self) -> String {
        self.build(&["nodes", WILDCARD_ONE, WILDCARD_ONE])
    }

    /// Wildcard for every fan-out broadcast reaching `ancestor`.
    #[must_use]
    pub fn upstream_wildcard(&self, ancestor: &str) -> String {
        self.build(&["upstream", ancestor, WILDCARD_TAIL])
    }

    /// Parse a subject into its components.
    ///
    /// Returns `None` for subjects outside this scheme.
    #[must_use]
    pub fn parse(&self, subject: &str) -> Option<Subject> {
        let body = match &self.prefix {
            Some(p) => subject.strip_prefix(p.as_str())?.strip_prefix('.')?,
            None => subject,
        };
        let parts: Vec<&str> = body.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }

        let owned = |s: &str| s.to_string();
        let parsed = match parts.as_slice() {
            ["points", node] => Subject::NodePoints { node: owned(node) },
            ["points", node, parent] => Subject::EdgePoints {
                node: owned(node),
                parent: owned(parent),
            },
            ["nodes", parent, node] => Subject::Nodes {
                parent: owned(parent),
                node: owned(node),
            },
            ["upstream", ancestor, node] => Subject::UpstreamNode {
                ancestor: owned(ancestor),
                node: owned(node),
            },
            ["upstream", ancestor, node, parent] => Subject::UpstreamEdge {
                ancestor: owned(ancestor),
                node: owned(node),
                parent: owned(parent),
            },
            ["auth", "user"] => Subject::AuthUser,
            ["auth", "getTransportURI"] => Subject::TransportUri,
            ["admin", "storeVerify"] => Subject::StoreVerify,
            ["admin", "storeMaint"] => Subject::StoreMaint,
            _ => return None,
        };
        Some(parsed)
    }
}

/// A parsed subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    /// Node point update
    NodePoints {
        /// Target node
        node: String,
    },
    /// Edge point update
    EdgePoints {
        /// Down node
        node: String,
        /// Up node
        parent: String,
    },
    /// Node query
    Nodes {
        /// Parent selector
        parent: String,
        /// Node selector
        node: String,
    },
    /// Fan-out of a node update
    UpstreamNode {
        /// Ancestor the broadcast is addressed to
        ancestor: String,
        /// Updated node
        node: String,
    },
    /// Fan-out of an edge update
    UpstreamEdge {
        /// Ancestor the broadcast is addressed to
        ancestor: String,
        /// Down node of the updated edge
        node: String,
        /// Up node of the updated edge
        parent: String,
    },
    /// Credential check
    AuthUser,
    /// Connection info request
    TransportUri,
    /// Read-only verification
    StoreVerify,
    /// Repairing verification
    StoreMaint,
}

/// Check whether `subject` matches a subscription `pattern`.
#[must_use]
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(WILDCARD_TAIL), Some(_)) => return true,
            (Some(WILDCARD_ONE), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_generation() {
        let scheme = SubjectScheme::default();
        assert_eq!(scheme.node_points("n1"), "points.n1");
        assert_eq!(scheme.edge_points("n1", "p1"), "points.n1.p1");
        assert_eq!(scheme.nodes("all", "n1"), "nodes.all.n1");
        assert_eq!(scheme.upstream_edge("r", "n1", "p1"), "upstream.r.n1.p1");
        assert_eq!(scheme.auth_transport_uri(), "auth.getTransportURI");
    }

    #[test]
    fn prefixed_subjects() {
        let scheme = SubjectScheme::with_prefix("site-a");
        let subject = scheme.upstream_node("root1", "dev9");
        assert_eq!(subject, "site-a.upstream.root1.dev9");
        assert_eq!(
            scheme.parse(&subject),
            Some(Subject::UpstreamNode {
                ancestor: "root1".into(),
                node: "dev9".into()
            })
        );
        assert_eq!(scheme.parse("upstream.root1.dev9"), None);
        assert_eq!(SubjectScheme::with_prefix("").prefix, None);
    }

    #[test]
    fn subject_parsing() {
        let scheme = SubjectScheme::default();
        assert_eq!(
            scheme.parse("points.n1.p1"),
            Some(Subject::EdgePoints {
                node: "n1".into(),
                parent: "p1".into()
            })
        );
        assert_eq!(scheme.parse("admin.storeMaint"), Some(Subject::StoreMaint));
        assert_eq!(scheme.parse("points..p1"), None);
        assert_eq!(scheme.parse("bogus.thing"), None);
    }

    #[test]
    fn wildcard_matching() {
        assert!(subject_matches("points.*", "points.n1"));
        assert!(!subject_matches("points.*", "points.n1.p1"));
        assert!(subject_matches("points.*.*", "points.n1.p1"));
        assert!(subject_matches("upstream.r.>", "upstream.r.n1"));
        assert!(subject_matches("upstream.r.>", "upstream.r.n1.p1"));
        assert!(!subject_matches("upstream.r.>", "upstream.r"));
        assert!(!subject_matches("upstream.a.>", "upstream.b.n1"));
        assert!(subject_matches("auth.user", "auth.user"));
    }
}
