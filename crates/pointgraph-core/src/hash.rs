//! Rolling edge hash.
//!
//! The hash of an edge summarises everything below it: the points on the
//! edge, the points on its down node, and the hashes of the down node's own
//! child edges. Child hashes are folded in sorted by value so the result does
//! not depend on edge insertion order.
//!
//! In the default [`HashMode::Timestamps`] mode only point timestamps are
//! digested. A value rewritten with a timestamp it already had is therefore
//! not detected. [`HashMode::Values`] also folds in the point contents.

use crate::point::{Point, Points};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Length in bytes of an edge hash.
pub const HASH_LEN: usize = 16;

/// What the edge hash digests for each point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashMode {
    /// Point timestamps only
    #[default]
    Timestamps,
    /// Timestamps plus type, key, value, text and data
    Values,
}

impl FromStr for HashMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "timestamps" => Ok(HashMode::Timestamps),
            "values" => Ok(HashMode::Values),
            other => Err(format!("unknown hash mode: {other}")),
        }
    }
}

/// Compute the hash of an edge.
///
/// `up_points` are the edge's own points, `node_points` the down node's
/// points and `down_hashes` the stored hashes of the down node's child edges.
#[must_use]
pub fn edge_hash<'a>(
    mode: HashMode,
    up_points: &Points,
    node_points: &Points,
    down_hashes: impl IntoIterator<Item = &'a [u8]>,
) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new();

    for p in up_points {
        fold_point(&mut hasher, mode, p);
    }

    for p in node_points.iter().filter(|p| p.typ.is_hashed()) {
        fold_point(&mut hasher, mode, p);
    }

    let mut down: Vec<&[u8]> = down_hashes.into_iter().collect();
    down.sort_unstable();
    for h in down {
        hasher.update(h);
    }

    hasher.finalize().as_bytes()[..HASH_LEN].to_vec()
}

fn fold_point(hasher: &mut blake3::Hasher, mode: HashMode, p: &Point) {
    hasher.update(&p.time_nanos().to_le_bytes());
    if mode == HashMode::Values {
        fold_bytes(hasher, p.typ.as_str().as_bytes());
        fold_bytes(hasher, p.key.as_bytes());
        hasher.update(&p.value.to_bits().to_le_bytes());
        fold_bytes(hasher, p.text.as_bytes());
        fold_bytes(hasher, &p.data);
        hasher.update(&[u8::from(p.tombstone)]);
    }
}

// length-prefixed so adjacent fields cannot alias
fn fold_bytes(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Render a hash as lowercase hex for logs and diagnostics.
#[must_use]
pub fn hex(hash: &[u8]) -> String {
    use std::fmt::Write;
    hash.iter().fold(String::with_capacity(hash.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::PointType;
    use chrono::{TimeZone, Utc};

    fn pts(entries: &[(PointType, f64, i64)]) -> Points {
        entries
            .iter()
            .map(|(t, v, s)| {
                Point::value(t.clone(), *v).with_time(Utc.timestamp_opt(*s, 0).unwrap())
            })
            .collect()
    }

    #[test]
    fn down_hash_order_does_not_matter() {
        let up = pts(&[(PointType::Tombstone, 0.0, 1)]);
        let node = pts(&[(PointType::Value, 1.0, 2)]);
        let a = vec![1u8; HASH_LEN];
        let b = vec![2u8; HASH_LEN];
        let h1 = edge_hash(HashMode::Timestamps, &up, &node, [a.as_slice(), b.as_slice()]);
        let h2 = edge_hash(HashMode::Timestamps, &up, &node, [b.as_slice(), a.as_slice()]);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), HASH_LEN);
    }

    #[test]
    fn timestamp_change_changes_hash() {
        let up = Points::new();
        let n1 = pts(&[(PointType::Value, 1.0, 2)]);
        let n2 = pts(&[(PointType::Value, 1.0, 3)]);
        assert_ne!(
            edge_hash(HashMode::Timestamps, &up, &n1, []),
            edge_hash(HashMode::Timestamps, &up, &n2, [])
        );
    }

    #[test]
    fn value_only_change_needs_values_mode() {
        let up = Points::new();
        let n1 = pts(&[(PointType::Value, 1.0, 2)]);
        let n2 = pts(&[(PointType::Value, 5.0, 2)]);
        assert_eq!(
            edge_hash(HashMode::Timestamps, &up, &n1, []),
            edge_hash(HashMode::Timestamps, &up, &n2, [])
        );
        assert_ne!(
            edge_hash(HashMode::Values, &up, &n1, []),
            edge_hash(HashMode::Values, &up, &n2, [])
        );
    }

    #[test]
    fn node_type_is_ignored() {
        let up = Points::new();
        let plain = pts(&[(PointType::Value, 1.0, 2)]);
        let mut typed = plain.clone();
        typed.merge(
            Point::text(PointType::NodeType, "device").with_time(Utc.timestamp_opt(9, 0).unwrap()),
        );
        assert_eq!(
            edge_hash(HashMode::Timestamps, &up, &plain, []),
            edge_hash(HashMode::Timestamps, &up, &typed, [])
        );
    }

    #[test]
    fn hash_mode_parse() {
        assert_eq!("values".parse::<HashMode>(), Ok(HashMode::Values));
        assert_eq!("Timestamps".parse::<HashMode>(), Ok(HashMode::Timestamps));
        assert!("md5".parse::<HashMode>().is_err());
    }

    #[test]
    fn hex_rendering() {
        assert_eq!(hex(&[0x00, 0xab, 0x10]), "00ab10");
    }
}
