//! Points: atomic timestamped facts and the sets that hold them.
//!
//! A point is identified by `(type, key)`. A [`Points`] set keeps at most one
//! point per identity and merges incoming points with strict last-writer-wins:
//! an incoming point replaces the stored one only when its timestamp is
//! strictly later.

use crate::merge::PointType;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Key used when a point type has a single instance.
pub const DEFAULT_KEY: &str = "0";

fn default_key() -> String {
    DEFAULT_KEY.to_string()
}

fn zero_time() -> DateTime<Utc> {
    Utc.timestamp_nanos(0)
}

/// An atomic, timestamped fact about a node or an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Point type
    #[serde(rename = "type")]
    pub typ: PointType,
    /// Instance key within the type
    #[serde(default = "default_key")]
    pub key: String,
    /// Time of the observation; the Unix epoch means "not yet stamped"
    #[serde(default = "zero_time")]
    pub time: DateTime<Utc>,
    /// Numeric value
    #[serde(default)]
    pub value: f64,
    /// Text value
    #[serde(default)]
    pub text: String,
    /// Opaque binary value
    #[serde(default)]
    pub data: Vec<u8>,
    /// Point-level soft delete
    #[serde(default)]
    pub tombstone: bool,
    /// Originating node or process
    #[serde(default)]
    pub origin: String,
}

impl Point {
    /// Create an unstamped point with the default key.
    #[must_use]
    pub fn new(typ: PointType) -> Self {
        Self {
            typ,
            key: default_key(),
            time: zero_time(),
            value: 0.0,
            text: String::new(),
            data: Vec::new(),
            tombstone: false,
            origin: String::new(),
        }
    }

    /// Create an unstamped point carrying a numeric value.
    #[must_use]
    pub fn value(typ: PointType, value: f64) -> Self {
        Self {
            value,
            ..Self::new(typ)
        }
    }

    /// Create an unstamped point carrying text.
    #[must_use]
    pub fn text(typ: PointType, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::new(typ)
        }
    }

    /// Set the key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Set the timestamp.
    #[must_use]
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    /// Set the origin.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Whether the point still carries the zero timestamp.
    #[must_use]
    pub fn is_unstamped(&self) -> bool {
        self.time == zero_time()
    }

    /// Replace a zero timestamp with `now`. Returns `true` if stamped.
    pub fn stamp(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_unstamped() {
            self.time = now;
            true
        } else {
            false
        }
    }

    /// Merge identity of this point.
    #[must_use]
    pub fn identity(&self) -> (&PointType, &str) {
        (&self.typ, &self.key)
    }

    /// Timestamp as signed Unix nanoseconds.
    #[must_use]
    pub fn time_nanos(&self) -> i64 {
        to_nanos(self.time)
    }

    /// Numeric value interpreted as a boolean flag.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.value != 0.0
    }

    fn time_order(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.typ.cmp(&other.typ))
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// Stamp every zero timestamp in a batch with `now`.
#[must_use]
pub fn stamp_all(mut points: Vec<Point>, now: DateTime<Utc>) -> Vec<Point> {
    for p in &mut points {
        p.stamp(now);
    }
    points
}

/// Whether a timestamp fits in signed 64-bit Unix nanoseconds.
#[must_use]
pub fn is_representable(time: DateTime<Utc>) -> bool {
    time.timestamp_nanos_opt().is_some()
}

/// Convert a timestamp to Unix nanoseconds, saturating outside the `i64` range.
///
/// Validated points never saturate; see [`is_representable`].
#[must_use]
pub fn to_nanos(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or(if time.timestamp() < 0 {
        i64::MIN
    } else {
        i64::MAX
    })
}

/// Convert Unix nanoseconds back to a timestamp.
#[must_use]
pub fn from_nanos(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

/// A set of points, unique by `(type, key)` and sorted by time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Point>", into = "Vec<Point>")]
pub struct Points(Vec<Point>);

impl Points {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one point with last-writer-wins.
    ///
    /// Returns `true` if the set changed. A point whose timestamp equals the
    /// stored one is ignored.
    pub fn merge(&mut self, point: Point) -> bool {
        match self
            .0
            .iter_mut()
            .find(|p| p.typ == point.typ && p.key == point.key)
        {
            Some(existing) if point.time > existing.time => *existing = point,
            Some(_) => return false,
            None => self.0.push(point),
        }
        self.sort_by_time();
        true
    }

    /// Merge every point of a batch. Returns `true` if any point won.
    pub fn merge_all(&mut self, points: impl IntoIterator<Item = Point>) -> bool {
        points
            .into_iter()
            .fold(false, |changed, p| self.merge(p) | changed)
    }

    /// Find the point with the given identity.
    #[must_use]
    pub fn find(&self, typ: &PointType, key: &str) -> Option<&Point> {
        self.0.iter().find(|p| &p.typ == typ && p.key == key)
    }

    /// Find the first point of a type, whatever its key.
    #[must_use]
    pub fn first(&self, typ: &PointType) -> Option<&Point> {
        self.0.iter().find(|p| &p.typ == typ)
    }

    /// Numeric value of the default-key point of a type.
    #[must_use]
    pub fn value(&self, typ: &PointType) -> Option<f64> {
        self.find(typ, DEFAULT_KEY).map(|p| p.value)
    }

    /// Text of the default-key point of a type.
    #[must_use]
    pub fn text(&self, typ: &PointType) -> Option<&str> {
        self.find(typ, DEFAULT_KEY).map(|p| p.text.as_str())
    }

    /// Whether the default-key point of a type is set to a non-zero value.
    #[must_use]
    pub fn flag(&self, typ: &PointType) -> bool {
        self.find(typ, DEFAULT_KEY).is_some_and(Point::is_set)
    }

    /// Points not individually tombstoned.
    pub fn live(&self) -> impl Iterator<Item = &Point> {
        self.0.iter().filter(|p| !p.tombstone)
    }

    /// Iterate in time order.
    pub fn iter(&self) -> std::slice::Iter<'_, Point> {
        self.0.iter()
    }

    /// Number of points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[Point] {
        &self.0
    }

    /// Consume into a vector in time order.
    #[must_use]
    pub fn into_vec(self) -> Vec<Point> {
        self.0
    }

    fn sort_by_time(&mut self) {
        self.0.sort_by(Point::time_order);
    }
}

impl FromIterator<Point> for Points {
    fn from_iter<I: IntoIterator<Item = Point>>(iter: I) -> Self {
        let mut points = Points::new();
        points.merge_all(iter);
        points
    }
}

impl From<Vec<Point>> for Points {
    fn from(points: Vec<Point>) -> Self {
        points.into_iter().collect()
    }
}

impl From<Points> for Vec<Point> {
    fn from(points: Points) -> Self {
        points.0
    }
}

impl<'a> IntoIterator for &'a Points {
    type Item = &'a Point;
    type IntoIter = std::slice::Iter<'a, Point>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for Points {
    type Item = Point;
    type IntoIter = std::vec::IntoIter<Point>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn value_at(v: f64, secs: i64) -> Point {
        Point::value(PointType::Value, v).with_time(at(secs))
    }

    #[test]
    fn later_point_wins() {
        let mut points = Points::new();
        assert!(points.merge(value_at(1.0, 10)));
        assert!(points.merge(value_at(2.0, 20)));
        assert_eq!(points.value(&PointType::Value), Some(2.0));
        assert_eq!(points.len(), 1);
    }

    #[test]
    fn older_point_ignored() {
        let mut points = Points::new();
        points.merge(value_at(1.0, 10));
        assert!(!points.merge(value_at(5.0, 5)));
        assert_eq!(points.value(&PointType::Value), Some(1.0));
    }

    #[test]
    fn equal_timestamp_keeps_existing() {
        let mut points = Points::new();
        points.merge(value_at(1.0, 10).with_origin("a"));
        assert!(!points.merge(value_at(9.0, 10).with_origin("b")));
        let p = points.find(&PointType::Value, DEFAULT_KEY).unwrap();
        assert_eq!(p.value, 1.0);
        assert_eq!(p.origin, "a");
    }

    #[test]
    fn keys_are_distinct_identities() {
        let mut points = Points::new();
        points.merge(value_at(1.0, 10).with_key("0"));
        points.merge(value_at(2.0, 5).with_key("1"));
        assert_eq!(points.len(), 2);
        // sorted by time
        assert_eq!(points.as_slice()[0].key, "1");
    }

    #[test]
    fn merge_is_order_independent() {
        let batch = vec![
            value_at(1.0, 10),
            value_at(3.0, 30),
            value_at(2.0, 20),
            Point::text(PointType::Description, "old").with_time(at(1)),
            Point::text(PointType::Description, "new").with_time(at(2)),
            Point::value(PointType::Custom("temp".into()), 20.5).with_time(at(7)),
        ];

        let expected: Points = batch.clone().into_iter().collect();
        assert_eq!(expected.value(&PointType::Value), Some(3.0));
        assert_eq!(expected.text(&PointType::Description), Some("new"));

        // every rotation and its reverse
        for shift in 0..batch.len() {
            let mut rotated = batch.clone();
            rotated.rotate_left(shift);
            let forward: Points = rotated.clone().into_iter().collect();
            rotated.reverse();
            let backward: Points = rotated.into_iter().collect();
            assert_eq!(forward, expected);
            assert_eq!(backward, expected);
        }
    }

    #[test]
    fn stamp_only_zero_times() {
        let mut p = Point::new(PointType::Value);
        assert!(p.is_unstamped());
        assert!(p.stamp(at(1)));
        assert!(!p.stamp(at(2)));
        assert_eq!(p.time, at(1));
    }

    #[test]
    fn stamp_all_uses_one_instant() {
        let batch = vec![
            Point::new(PointType::Value),
            Point::new(PointType::Description),
            value_at(1.0, 5),
        ];
        let stamped = stamp_all(batch, at(9));
        assert_eq!(stamped[0].time, at(9));
        assert_eq!(stamped[1].time, at(9));
        assert_eq!(stamped[2].time, at(5));
    }

    #[test]
    fn representable_range() {
        assert!(is_representable(at(0)));
        let far = Utc.with_ymd_and_hms(2300, 1, 1, 0, 0, 0).unwrap();
        assert!(!is_representable(far));
    }

    #[test]
    fn nanos_round_trip() {
        let t = at(42);
        assert_eq!(from_nanos(to_nanos(t)), t);
    }
}
