//! Durable storage of nodes, edges and store metadata.
//!
//! The store keeps its authoritative state in memory and hands every
//! mutation to a [`Persistence`] engine as a [`WriteBatch`] committed in one
//! transaction. Engines only need to load everything at startup and upsert
//! points by `(scope, type, key)`.

use pointgraph_core::point::{from_nanos, to_nanos};
use pointgraph_core::{Edge, Node, Point, PointType, Points};
use rusqlite::{Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 1;

/// Single-row store metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Schema version
    pub version: i64,
    /// Root node ID, empty until the first node is written
    pub root_id: String,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            root_id: String::new(),
        }
    }
}

/// Everything an engine holds, as loaded at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Store metadata
    pub meta: Meta,
    /// All nodes
    pub nodes: Vec<Node>,
    /// All edges
    pub edges: Vec<Edge>,
}

/// Row-level description of an edge, without its points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRecord {
    /// Edge ID
    pub id: String,
    /// Up node
    pub up: String,
    /// Down node
    pub down: String,
    /// Stored hash
    pub hash: Vec<u8>,
}

impl From<&Edge> for EdgeRecord {
    fn from(edge: &Edge) -> Self {
        Self {
            id: edge.id.clone(),
            up: edge.up.clone(),
            down: edge.down.clone(),
            hash: edge.hash.clone(),
        }
    }
}

/// Mutations committed atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    /// New root ID, if the root changed
    pub root_id: Option<String>,
    /// Points to upsert, per node
    pub node_points: Vec<(String, Vec<Point>)>,
    /// Edge rows to upsert (new edges and hash changes)
    pub edges: Vec<EdgeRecord>,
    /// Points to upsert, per edge
    pub edge_points: Vec<(String, Vec<Point>)>,
}

impl WriteBatch {
    /// Whether the batch carries no mutation.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root_id.is_none()
            && self.node_points.is_empty()
            && self.edges.is_empty()
            && self.edge_points.is_empty()
    }
}

/// A durable storage engine.
pub trait Persistence: Send {
    /// Load the full store contents.
    ///
    /// # Errors
    ///
    /// Returns error if the stored data cannot be read.
    fn load(&self) -> Result<Snapshot, PersistenceError>;

    /// Apply a batch in a single transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails; nothing from the batch is applied.
    fn commit(&mut self, batch: &WriteBatch) -> Result<(), PersistenceError>;
}

/// Errors raised by persistence engines.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// `SQLite` failure
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Stored data could not be interpreted
    #[error("corrupt store: {0}")]
    Corrupt(String),
    /// Engine refused the write
    #[error("write failed: {0}")]
    Write(String),
}

/// `SQLite`-backed persistence store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), PersistenceError> {
        self.conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS meta (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                version INTEGER NOT NULL,
                root_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS edges (
                id TEXT PRIMARY KEY,
                up TEXT NOT NULL,
                down TEXT NOT NULL,
                hash BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_edges_up ON edges(up);
            CREATE INDEX IF NOT EXISTS idx_edges_down ON edges(down);

            CREATE TABLE IF NOT EXISTS node_points (
                node_id TEXT NOT NULL,
                type TEXT NOT NULL,
                key TEXT NOT NULL,
                time INTEGER NOT NULL,
                value REAL NOT NULL,
                text TEXT NOT NULL,
                data BLOB NOT NULL,
                tombstone INTEGER NOT NULL,
                origin TEXT NOT NULL,
                PRIMARY KEY (node_id, type, key)
            );

            CREATE TABLE IF NOT EXISTS edge_points (
                edge_id TEXT NOT NULL,
                type TEXT NOT NULL,
                key TEXT NOT NULL,
                time INTEGER NOT NULL,
                value REAL NOT NULL,
                text TEXT NOT NULL,
                data BLOB NOT NULL,
                tombstone INTEGER NOT NULL,
                origin TEXT NOT NULL,
                PRIMARY KEY (edge_id, type, key)
            );
            ",
        )?;

        self.conn.execute(
            "INSERT OR IGNORE INTO meta (id, version, root_id) VALUES (0, ?1, '')",
            [SCHEMA_VERSION],
        )?;

        let version: i64 = self
            .conn
            .query_row("SELECT version FROM meta WHERE id = 0", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(PersistenceError::Corrupt(format!(
                "schema version {version} is newer than supported {SCHEMA_VERSION}"
            )));
        }

        Ok(())
    }

    fn load_points(
        &self,
        table: &str,
        scope: &str,
    ) -> Result<HashMap<String, Points>, PersistenceError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {scope}, type, key, time, value, text, data, tombstone, origin FROM {table}"
        ))?;
        let rows = stmt.query_map([], |row| {
            let point = Point {
                typ: PointType::parse(&row.get::<_, String>(1)?),
                key: row.get(2)?,
                time: from_nanos(row.get(3)?),
                value: row.get(4)?,
                text: row.get(5)?,
                data: row.get(6)?,
                tombstone: row.get(7)?,
                origin: row.get(8)?,
            };
            Ok((row.get::<_, String>(0)?, point))
        })?;

        let mut grouped: HashMap<String, Points> = HashMap::new();
        for row in rows {
            let (id, point) = row?;
            grouped.entry(id).or_default().merge(point);
        }
        Ok(grouped)
    }
}

fn upsert_points(
    tx: &Transaction<'_>,
    table: &str,
    scope: &str,
    id: &str,
    points: &[Point],
) -> Result<(), PersistenceError> {
    let mut stmt = tx.prepare_cached(&format!(
        r"
        INSERT INTO {table} ({scope}, type, key, time, value, text, data, tombstone, origin)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT ({scope}, type, key) DO UPDATE SET
            time = excluded.time,
            value = excluded.value,
            text = excluded.text,
            data = excluded.data,
            tombstone = excluded.tombstone,
            origin = excluded.origin
        "
    ))?;
    for p in points {
        stmt.execute(rusqlite::params![
            id,
            p.typ.as_str(),
            p.key,
            to_nanos(p.time),
            p.value,
            p.text,
            p.data,
            p.tombstone,
            p.origin,
        ])?;
    }
    Ok(())
}

impl Persistence for SqliteStore {
    fn load(&self) -> Result<Snapshot, PersistenceError> {
        let meta = self
            .conn
            .query_row("SELECT version, root_id FROM meta WHERE id = 0", [], |row| {
                Ok(Meta {
                    version: row.get(0)?,
                    root_id: row.get(1)?,
                })
            })
            .optional()?
            .unwrap_or_default();

        let node_points = self.load_points("node_points", "node_id")?;
        let mut edge_points = self.load_points("edge_points", "edge_id")?;

        let mut nodes: Vec<Node> = node_points
            .into_iter()
            .map(|(id, points)| {
                let mut node = Node::new(id);
                node.merge(points);
                node
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let mut stmt = self
            .conn
            .prepare("SELECT id, up, down, hash FROM edges ORDER BY id")?;
        let edges = stmt
            .query_map([], |row| {
                Ok(EdgeRecord {
                    id: row.get(0)?,
                    up: row.get(1)?,
                    down: row.get(2)?,
                    hash: row.get(3)?,
                })
            })?
            .map(|row| {
                let rec = row?;
                let mut edge = Edge::new(rec.id, rec.up, rec.down);
                edge.hash = rec.hash;
                edge.points = edge_points.remove(&edge.id).unwrap_or_default();
                Ok(edge)
            })
            .collect::<Result<Vec<_>, PersistenceError>>()?;

        if let Some(orphan) = edge_points.keys().next() {
            return Err(PersistenceError::Corrupt(format!(
                "points stored for unknown edge {orphan}"
            )));
        }

        Ok(Snapshot { meta, nodes, edges })
    }

    fn commit(&mut self, batch: &WriteBatch) -> Result<(), PersistenceError> {
        if batch.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;

        if let Some(root) = &batch.root_id {
            tx.execute("UPDATE meta SET root_id = ?1 WHERE id = 0", [root])?;
        }

        for (id, points) in &batch.node_points {
            upsert_points(&tx, "node_points", "node_id", id, points)?;
        }

        {
            let mut stmt = tx.prepare_cached(
                r"
                INSERT INTO edges (id, up, down, hash) VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT (id) DO UPDATE SET hash = excluded.hash
                ",
            )?;
            for e in &batch.edges {
                stmt.execute((&e.id, &e.up, &e.down, &e.hash))?;
            }
        }

        for (id, points) in &batch.edge_points {
            upsert_points(&tx, "edge_points", "edge_id", id, points)?;
        }

        tx.commit()?;
        Ok(())
    }
}

/// Volatile engine with the same contract as [`SqliteStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    meta: Meta,
    node_points: HashMap<String, Vec<Point>>,
    edges: HashMap<String, EdgeRecord>,
    edge_points: HashMap<String, Vec<Point>>,
}

impl MemoryStore {
    /// Create an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn upsert_vec(stored: &mut Vec<Point>, incoming: &[Point]) {
    for p in incoming {
        match stored.iter_mut().find(|s| s.typ == p.typ && s.key == p.key) {
            Some(s) => *s = p.clone(),
            None => stored.push(p.clone()),
        }
    }
}

impl Persistence for MemoryStore {
    fn load(&self) -> Result<Snapshot, PersistenceError> {
        let mut nodes: Vec<Node> = self
            .node_points
            .iter()
            .map(|(id, points)| {
                let mut node = Node::new(id.clone());
                node.merge(points.iter().cloned());
                node
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let mut edges: Vec<Edge> = self
            .edges
            .values()
            .map(|rec| {
                let mut edge = Edge::new(rec.id.clone(), rec.up.clone(), rec.down.clone());
                edge.hash = rec.hash.clone();
                if let Some(points) = self.edge_points.get(&rec.id) {
                    edge.points = points.iter().cloned().collect();
                }
                edge
            })
            .collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(Snapshot {
            meta: self.meta.clone(),
            nodes,
            edges,
        })
    }

    fn commit(&mut self, batch: &WriteBatch) -> Result<(), PersistenceError> {
        if let Some(root) = &batch.root_id {
            self.meta.root_id.clone_from(root);
        }
        for (id, points) in &batch.node_points {
            upsert_vec(self.node_points.entry(id.clone()).or_default(), points);
        }
        for e in &batch.edges {
            self.edges
                .entry(e.id.clone())
                .and_modify(|stored| stored.hash.clone_from(&e.hash))
                .or_insert_with(|| e.clone());
        }
        for (id, points) in &batch.edge_points {
            upsert_vec(self.edge_points.entry(id.clone()).or_default(), points);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample_batch() -> WriteBatch {
        let t = Utc.timestamp_opt(1_700_000_000, 5).unwrap();
        WriteBatch {
            root_id: Some("r".into()),
            node_points: vec![(
                "r".into(),
                vec![
                    Point::text(PointType::NodeType, "device").with_time(t),
                    Point::value(PointType::Value, 3.5).with_time(t),
                ],
            )],
            edges: vec![EdgeRecord {
                id: "e0".into(),
                up: "none".into(),
                down: "r".into(),
                hash: vec![1, 2, 3],
            }],
            edge_points: vec![(
                "e0".into(),
                vec![Point::value(PointType::Tombstone, 0.0).with_time(t)],
            )],
        }
    }

    fn check_engine(engine: &mut dyn Persistence) {
        engine.commit(&sample_batch()).unwrap();

        let t2 = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        engine
            .commit(&WriteBatch {
                node_points: vec![(
                    "r".into(),
                    vec![Point::value(PointType::Value, 7.0).with_time(t2)],
                )],
                edges: vec![EdgeRecord {
                    id: "e0".into(),
                    up: "none".into(),
                    down: "r".into(),
                    hash: vec![9],
                }],
                ..WriteBatch::default()
            })
            .unwrap();

        let snap = engine.load().unwrap();
        assert_eq!(snap.meta.root_id, "r");
        assert_eq!(snap.nodes.len(), 1);
        assert_eq!(snap.nodes[0].typ, "device");
        assert_eq!(snap.nodes[0].points.value(&PointType::Value), Some(7.0));
        assert_eq!(snap.nodes[0].points.len(), 2);
        assert_eq!(snap.edges.len(), 1);
        assert_eq!(snap.edges[0].hash, vec![9]);
        assert!(!snap.edges[0].is_tombstone());
        assert_eq!(snap.edges[0].points.len(), 1);
    }

    #[test]
    fn sqlite_store_basic_operations() {
        let mut store = SqliteStore::in_memory().unwrap();
        check_engine(&mut store);
    }

    #[test]
    fn memory_store_basic_operations() {
        let mut store = MemoryStore::new();
        check_engine(&mut store);
    }

    #[test]
    fn sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let mut store = SqliteStore::open(&path).unwrap();
            store.commit(&sample_batch()).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let snap = store.load().unwrap();
        assert_eq!(snap.meta.root_id, "r");
        assert_eq!(snap.meta.version, SCHEMA_VERSION);
        assert_eq!(
            snap.nodes[0].points.find(&PointType::Value, "0").unwrap().time,
            Utc.timestamp_opt(1_700_000_000, 5).unwrap()
        );
    }

    #[test]
    fn empty_store_loads_default_meta() {
        let store = SqliteStore::in_memory().unwrap();
        let snap = store.load().unwrap();
        assert!(snap.meta.root_id.is_empty());
        assert!(snap.nodes.is_empty());
        assert!(snap.edges.is_empty());
    }
}
