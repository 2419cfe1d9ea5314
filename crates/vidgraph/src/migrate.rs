//! Database schema migrations.
//!
//! Every statement is `CREATE … IF NOT EXISTS`, so running the migrations
//! repeatedly (`vidgraph init`, then every `serve`) is safe.
//!
//! | Table | Contents |
//! |-------|----------|
//! | `upload_jobs` | Job bookkeeping, timestamps in Unix milliseconds |
//! | `graph_nodes` | One row per natural key; properties as a JSON object |
//! | `graph_relationships` | One row per `(from_key, rel_type, to_key)` |

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    run_migrations_on(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply the schema on an existing pool.
pub async fn run_migrations_on(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS upload_jobs (
            id TEXT PRIMARY KEY,
            source_filename TEXT NOT NULL,
            content_type TEXT NOT NULL,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            content_hash TEXT,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            error_kind TEXT,
            error_message TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS graph_nodes (
            natural_key TEXT PRIMARY KEY,
            label TEXT NOT NULL,
            properties_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS graph_relationships (
            from_key TEXT NOT NULL,
            rel_type TEXT NOT NULL,
            to_key TEXT NOT NULL,
            properties_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (from_key, rel_type, to_key),
            FOREIGN KEY (from_key) REFERENCES graph_nodes(natural_key),
            FOREIGN KEY (to_key) REFERENCES graph_nodes(natural_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_upload_jobs_hash ON upload_jobs(content_hash)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_upload_jobs_created ON upload_jobs(created_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_graph_nodes_label ON graph_nodes(label)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_graph_relationships_to ON graph_relationships(to_key)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
