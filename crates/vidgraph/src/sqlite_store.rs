//! SQLite-backed [`GraphStore`] implementation.
//!
//! Nodes live in `graph_nodes` keyed by natural key; relationships in
//! `graph_relationships` keyed by `(from_key, rel_type, to_key)`. Properties
//! are stored as a JSON object and merged in Rust, so a node upsert is a
//! read followed by an insert or update inside the same transaction.
//!
//! Writes open an `sqlx::Transaction` with `BEGIN IMMEDIATE`, taking
//! SQLite's write lock up front. Two deltas therefore never interleave, and
//! a writer that cannot get the lock within the busy timeout fails fast
//! with [`IngestError::TransactionConflict`] instead of deadlocking on
//! upgrade.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool};

use vidgraph_core::delta::{merge_properties, GraphDelta, Properties, WriteReport};
use vidgraph_core::error::IngestError;
use vidgraph_core::store::{GraphEdge, GraphNode, GraphSnapshot, GraphStats, GraphStore};

/// SQLite result codes that mean another connection holds the lock.
const BUSY_CODES: &[&str] = &["5", "6", "261", "262", "517"];

/// Map a sqlx error onto the pipeline taxonomy.
///
/// Lock contention is a conflict; pool exhaustion and transport errors mean
/// the store is unavailable; constraint failures are violations. Anything
/// else (decode errors, bad SQL) is internal.
pub fn classify_sqlx_error(err: sqlx::Error) -> IngestError {
    match err {
        sqlx::Error::Database(ref db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            let message = db.message().to_string();
            if BUSY_CODES.contains(&code.as_str()) || message.contains("database is locked") {
                IngestError::TransactionConflict(message)
            } else if matches!(
                db.kind(),
                sqlx::error::ErrorKind::UniqueViolation
                    | sqlx::error::ErrorKind::ForeignKeyViolation
                    | sqlx::error::ErrorKind::NotNullViolation
                    | sqlx::error::ErrorKind::CheckViolation
            ) {
                IngestError::ConstraintViolation(message)
            } else {
                IngestError::Internal(format!("sqlite error {}: {}", code, message))
            }
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_) => IngestError::StoreUnavailable(err.to_string()),
        other => IngestError::Internal(other.to_string()),
    }
}

fn parse_properties(json: &str) -> Result<Properties, IngestError> {
    serde_json::from_str(json)
        .map_err(|e| IngestError::Internal(format!("stored properties are not valid JSON: {}", e)))
}

fn properties_json(props: &Properties) -> Result<String, IngestError> {
    serde_json::to_string(props).map_err(|e| IngestError::Internal(e.to_string()))
}

fn node_from_row(row: &SqliteRow) -> Result<GraphNode, IngestError> {
    let json: String = row.get("properties_json");
    Ok(GraphNode {
        natural_key: row.get("natural_key"),
        label: row.get("label"),
        properties: parse_properties(&json)?,
    })
}

fn edge_from_row(row: &SqliteRow) -> Result<GraphEdge, IngestError> {
    let json: String = row.get("properties_json");
    Ok(GraphEdge {
        from_key: row.get("from_key"),
        relation_type: row.get("rel_type"),
        to_key: row.get("to_key"),
        properties: parse_properties(&json)?,
    })
}

/// SQLite implementation of the [`GraphStore`] trait.
pub struct SqliteGraphStore {
    pool: SqlitePool,
}

impl SqliteGraphStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn upsert_delta(
    conn: &mut SqliteConnection,
    delta: &GraphDelta,
) -> Result<WriteReport, IngestError> {
    let now = chrono::Utc::now().timestamp_millis();
    let mut report = WriteReport {
        attempts: 1,
        ..Default::default()
    };

    for node in delta.nodes() {
        let existing = sqlx::query(
            "SELECT label, properties_json FROM graph_nodes WHERE natural_key = ?",
        )
        .bind(&node.natural_key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(classify_sqlx_error)?;

        match existing {
            Some(row) => {
                let label: String = row.get("label");
                if label != node.label {
                    return Err(IngestError::ConstraintViolation(format!(
                        "node {} already exists with label {}, not {}",
                        node.natural_key, label, node.label
                    )));
                }
                let json: String = row.get("properties_json");
                let mut props = parse_properties(&json)?;
                merge_properties(&mut props, &node.properties);
                sqlx::query(
                    "UPDATE graph_nodes SET properties_json = ?, updated_at = ? WHERE natural_key = ?",
                )
                .bind(properties_json(&props)?)
                .bind(now)
                .bind(&node.natural_key)
                .execute(&mut *conn)
                .await
                .map_err(classify_sqlx_error)?;
                report.nodes_updated += 1;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO graph_nodes (natural_key, label, properties_json, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&node.natural_key)
                .bind(&node.label)
                .bind(properties_json(&node.properties)?)
                .bind(now)
                .bind(now)
                .execute(&mut *conn)
                .await
                .map_err(classify_sqlx_error)?;
                report.nodes_created += 1;
            }
        }
    }

    for rel in delta.relationships() {
        let found: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM graph_nodes WHERE natural_key IN (?, ?)",
        )
        .bind(&rel.from_key)
        .bind(&rel.to_key)
        .fetch_one(&mut *conn)
        .await
        .map_err(classify_sqlx_error)?;
        let expected = if rel.from_key == rel.to_key { 1 } else { 2 };
        if found < expected {
            return Err(IngestError::ConstraintViolation(format!(
                "relationship {} -[{}]-> {} references an unknown node",
                rel.from_key, rel.relation_type, rel.to_key
            )));
        }

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT properties_json FROM graph_relationships WHERE from_key = ? AND rel_type = ? AND to_key = ?",
        )
        .bind(&rel.from_key)
        .bind(&rel.relation_type)
        .bind(&rel.to_key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(classify_sqlx_error)?;

        match existing {
            Some(json) => {
                let mut props = parse_properties(&json)?;
                merge_properties(&mut props, &rel.properties);
                sqlx::query(
                    r#"
                    UPDATE graph_relationships SET properties_json = ?, updated_at = ?
                    WHERE from_key = ? AND rel_type = ? AND to_key = ?
                    "#,
                )
                .bind(properties_json(&props)?)
                .bind(now)
                .bind(&rel.from_key)
                .bind(&rel.relation_type)
                .bind(&rel.to_key)
                .execute(&mut *conn)
                .await
                .map_err(classify_sqlx_error)?;
                report.relationships_updated += 1;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO graph_relationships
                        (from_key, rel_type, to_key, properties_json, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&rel.from_key)
                .bind(&rel.relation_type)
                .bind(&rel.to_key)
                .bind(properties_json(&rel.properties)?)
                .bind(now)
                .bind(now)
                .execute(&mut *conn)
                .await
                .map_err(classify_sqlx_error)?;
                report.relationships_created += 1;
            }
        }
    }

    Ok(report)
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn apply_delta(&self, delta: &GraphDelta) -> Result<WriteReport, IngestError> {
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(classify_sqlx_error)?;

        // Dropping `tx` on any early return (or when this future is dropped)
        // rolls the transaction back before the connection is reused.
        let report = upsert_delta(&mut tx, delta).await?;
        tx.commit().await.map_err(classify_sqlx_error)?;
        Ok(report)
    }

    async fn get_node(&self, natural_key: &str) -> Result<Option<GraphNode>, IngestError> {
        let row = sqlx::query(
            "SELECT natural_key, label, properties_json FROM graph_nodes WHERE natural_key = ?",
        )
        .bind(natural_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        row.as_ref().map(node_from_row).transpose()
    }

    async fn neighbors(&self, natural_key: &str) -> Result<Vec<GraphEdge>, IngestError> {
        let rows = sqlx::query(
            r#"
            SELECT from_key, rel_type, to_key, properties_json FROM graph_relationships
            WHERE from_key = ?1 OR to_key = ?1
            ORDER BY from_key, rel_type, to_key
            "#,
        )
        .bind(natural_key)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        rows.iter().map(edge_from_row).collect()
    }

    async fn nodes_by_label(
        &self,
        label: &str,
        limit: usize,
    ) -> Result<Vec<GraphNode>, IngestError> {
        let rows = sqlx::query(
            r#"
            SELECT natural_key, label, properties_json FROM graph_nodes
            WHERE label = ? ORDER BY natural_key LIMIT ?
            "#,
        )
        .bind(label)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        rows.iter().map(node_from_row).collect()
    }

    async fn nodes_by_property(
        &self,
        label: &str,
        property: &str,
        value: &str,
        limit: usize,
    ) -> Result<Vec<GraphNode>, IngestError> {
        // SQLite narrows to nodes carrying the property; value comparison
        // follows the typed rules in `PropertyValue::matches_text`.
        let rows = sqlx::query(
            r#"
            SELECT natural_key, label, properties_json FROM graph_nodes
            WHERE label = ?
              AND EXISTS (SELECT 1 FROM json_each(graph_nodes.properties_json) WHERE key = ?)
            ORDER BY natural_key
            "#,
        )
        .bind(label)
        .bind(property)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        let mut nodes = Vec::new();
        for row in &rows {
            if nodes.len() == limit {
                break;
            }
            let node = node_from_row(row)?;
            if node.properties.get(property).is_some_and(|p| p.matches_text(value)) {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    async fn snapshot(&self, limit: usize) -> Result<GraphSnapshot, IngestError> {
        let node_rows = sqlx::query(
            "SELECT natural_key, label, properties_json FROM graph_nodes ORDER BY natural_key LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        let edge_rows = sqlx::query(
            r#"
            WITH shown AS (SELECT natural_key FROM graph_nodes ORDER BY natural_key LIMIT ?1)
            SELECT from_key, rel_type, to_key, properties_json FROM graph_relationships
            WHERE from_key IN (SELECT natural_key FROM shown)
              AND to_key IN (SELECT natural_key FROM shown)
            ORDER BY from_key, rel_type, to_key
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        Ok(GraphSnapshot {
            nodes: node_rows.iter().map(node_from_row).collect::<Result<_, _>>()?,
            relationships: edge_rows.iter().map(edge_from_row).collect::<Result<_, _>>()?,
        })
    }

    async fn stats(&self) -> Result<GraphStats, IngestError> {
        let nodes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM graph_nodes")
            .fetch_one(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        let relationships: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM graph_relationships")
            .fetch_one(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(GraphStats {
            nodes: nodes as u64,
            relationships: relationships as u64,
        })
    }
}
