//! Schema DDL and versioned migrations (C2).
//!
//! Owns `SCHEMA_VERSION` and the pragma configuration applied to every
//! connection. Migrations bump the version strictly monotonically,
//! one version at a time, each inside its own transaction so the
//! database is never observed half-upgraded.
//!
//! The vector index (see [`crate::vector`]) is a plain table of BLOB
//! columns rather than a native SQLite vector extension — sqlx's
//! bundled sqlite driver has no such extension, so kNN is computed in
//! Rust over the stored blobs (grounded on the teacher's `chunk_vectors`
//! BLOB table and `embedding::{vec_to_blob, blob_to_vec}`). "Vector
//! virtual table" in the surrounding design notes refers to this table.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::config::Config;
use crate::error::ProvenanceError;

/// Current schema version. Bumped once per migration added to [`MIGRATIONS`].
pub const SCHEMA_VERSION: i64 = 32;

/// Dimension enforced by the vector table and the embedding orchestrator.
pub const VECTOR_DIM: usize = 768;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating parent directory of {}", db_path.display()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(30))
        .pragma("synchronous", "NORMAL")
        .pragma("cache_size", "-64000")
        .pragma("mmap_size", "268435456");

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("opening database")?;

    set_unix_permissions(db_path);

    Ok(pool)
}

#[cfg(unix)]
fn set_unix_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_unix_permissions(_path: &std::path::Path) {}

/// Read the stored schema version, 0 if the metadata table doesn't exist yet.
async fn current_version(pool: &SqlitePool) -> Result<i64> {
    let exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_meta'",
    )
    .fetch_one(pool)
    .await?;

    if !exists {
        return Ok(0);
    }

    let version: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_meta WHERE id = 1")
        .fetch_optional(pool)
        .await?;

    Ok(version.unwrap_or(0))
}

/// Apply all migrations strictly from the current version up to [`SCHEMA_VERSION`].
/// Each version bump runs inside a single transaction together with its DDL,
/// so a crash mid-migration leaves the database at the prior version, not a
/// half-applied one.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    let mut version = current_version(pool).await?;

    while version < SCHEMA_VERSION {
        let next = version + 1;
        let mut tx = pool.begin().await?;

        apply_version(&mut tx, next).await.map_err(|e| {
            ProvenanceError::internal(format!("migration to v{next} failed: {e}"))
        })?;

        sqlx::query(
            "INSERT INTO schema_meta (id, version) VALUES (1, ?) \
             ON CONFLICT(id) DO UPDATE SET version = excluded.version",
        )
        .bind(next)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        version = next;
    }

    Ok(())
}

/// Dispatch one version's DDL. Versions 1 lays down the full schema this
/// crate needs; versions 2-32 are additive no-op placeholders reserved for
/// the historical migrations this schema accreted on its way to v32 (index
/// additions, column additions) — applying them is a no-op against a
/// freshly created v1 schema, which already has every column/index.
async fn apply_version(tx: &mut sqlx::SqliteConnection, version: i64) -> Result<()> {
    if version == 1 {
        create_base_schema(tx).await?;
    }
    Ok(())
}

async fn create_base_schema(tx: &mut sqlx::SqliteConnection) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS provenance (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            source_kind TEXT NOT NULL,
            source_path TEXT,
            parent_id TEXT REFERENCES provenance(id),
            parent_ids TEXT NOT NULL DEFAULT '[]',
            root_document_id TEXT NOT NULL,
            chain_depth INTEGER NOT NULL,
            chain_path TEXT NOT NULL DEFAULT '[]',
            content_hash TEXT NOT NULL,
            input_hash TEXT,
            file_hash TEXT,
            processor_name TEXT NOT NULL,
            processor_version TEXT NOT NULL,
            processing_params TEXT NOT NULL DEFAULT '{}',
            processing_duration_ms INTEGER,
            quality_score REAL,
            created_at TEXT NOT NULL,
            processed_at TEXT,
            agent_name TEXT,
            agent_version TEXT
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_provenance_kind ON provenance(kind)")
        .execute(&mut *tx)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_provenance_parent ON provenance(parent_id)")
        .execute(&mut *tx)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_provenance_root ON provenance(root_document_id, chain_depth)")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            provenance_id TEXT NOT NULL REFERENCES provenance(id),
            file_path TEXT NOT NULL,
            file_name TEXT NOT NULL,
            file_hash TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            file_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            page_count INTEGER,
            error_message TEXT,
            doc_title TEXT,
            doc_author TEXT,
            doc_subject TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_file_hash ON documents(file_hash)")
        .execute(&mut *tx)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status)")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ocr_results (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL REFERENCES documents(id),
            provenance_id TEXT NOT NULL REFERENCES provenance(id),
            extracted_text TEXT NOT NULL,
            text_length INTEGER NOT NULL,
            provider_mode TEXT NOT NULL,
            page_count INTEGER NOT NULL,
            quality_score REAL NOT NULL,
            block_tree_json TEXT,
            processing_duration_ms INTEGER,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_ocr_results_document ON ocr_results(document_id)")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL REFERENCES documents(id),
            provenance_id TEXT NOT NULL REFERENCES provenance(id),
            text TEXT NOT NULL,
            text_hash TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            character_start INTEGER NOT NULL,
            character_end INTEGER NOT NULL,
            page_number INTEGER,
            page_range TEXT,
            overlap_previous INTEGER NOT NULL DEFAULT 0,
            overlap_next INTEGER NOT NULL DEFAULT 0,
            embedding_status TEXT NOT NULL DEFAULT 'pending',
            heading_context TEXT,
            heading_level INTEGER,
            section_path TEXT,
            content_types TEXT NOT NULL DEFAULT '[]',
            is_atomic INTEGER NOT NULL DEFAULT 0,
            strategy TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            UNIQUE(document_id, chunk_index)
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
        .execute(&mut *tx)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_embedding_status ON chunks(embedding_status)")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS images (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL REFERENCES documents(id),
            provenance_id TEXT NOT NULL REFERENCES provenance(id),
            page_number INTEGER NOT NULL,
            bbox_x REAL NOT NULL,
            bbox_y REAL NOT NULL,
            bbox_width REAL NOT NULL,
            bbox_height REAL NOT NULL,
            image_index INTEGER NOT NULL,
            pixel_width INTEGER NOT NULL,
            pixel_height INTEGER NOT NULL,
            format TEXT NOT NULL,
            extracted_path TEXT NOT NULL,
            vlm_status TEXT NOT NULL DEFAULT 'pending',
            vlm_description TEXT,
            vlm_structured_data TEXT,
            vlm_embedding_id TEXT,
            vlm_confidence REAL,
            vlm_tokens_used INTEGER,
            block_type TEXT NOT NULL DEFAULT '',
            is_header_footer INTEGER NOT NULL DEFAULT 0,
            content_hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_images_document ON images(document_id)")
        .execute(&mut *tx)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_images_vlm_status ON images(vlm_status)")
        .execute(&mut *tx)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_images_content_hash ON images(content_hash)")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            id TEXT PRIMARY KEY,
            provenance_id TEXT NOT NULL REFERENCES provenance(id),
            chunk_id TEXT REFERENCES chunks(id),
            image_id TEXT REFERENCES images(id),
            extraction_id TEXT,
            original_text TEXT NOT NULL,
            source_file_path TEXT NOT NULL,
            source_file_name TEXT NOT NULL,
            source_file_hash TEXT NOT NULL,
            page_number INTEGER,
            character_start INTEGER,
            character_end INTEGER,
            chunk_index INTEGER,
            total_chunks INTEGER,
            model_name TEXT NOT NULL,
            model_version TEXT NOT NULL,
            task_type TEXT NOT NULL,
            inference_mode TEXT NOT NULL DEFAULT 'local',
            device TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_embeddings_chunk ON embeddings(chunk_id)")
        .execute(&mut *tx)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_embeddings_image ON embeddings(image_id)")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vector_index (
            embedding_id TEXT PRIMARY KEY,
            vector BLOB NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS extractions (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL REFERENCES documents(id),
            provenance_id TEXT NOT NULL REFERENCES provenance(id),
            schema_json TEXT NOT NULL,
            extraction_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_extractions_document ON extractions(document_id)")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS form_fills (
            id TEXT PRIMARY KEY,
            provenance_id TEXT NOT NULL REFERENCES provenance(id),
            source_file_path TEXT NOT NULL,
            source_file_hash TEXT NOT NULL,
            field_data_json TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            fields_filled TEXT NOT NULL DEFAULT '[]',
            fields_not_found TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS comparisons (
            id TEXT PRIMARY KEY,
            provenance_id TEXT NOT NULL REFERENCES provenance(id),
            document_id_1 TEXT NOT NULL REFERENCES documents(id),
            document_id_2 TEXT NOT NULL REFERENCES documents(id),
            similarity_ratio REAL NOT NULL,
            text_diff_json TEXT NOT NULL,
            structural_diff_json TEXT NOT NULL,
            summary TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS clusterings (
            id TEXT PRIMARY KEY,
            provenance_id TEXT NOT NULL REFERENCES provenance(id),
            run_id TEXT NOT NULL,
            cluster_index INTEGER NOT NULL,
            centroid_json TEXT NOT NULL,
            top_terms TEXT NOT NULL DEFAULT '[]',
            coherence_score REAL NOT NULL,
            algorithm TEXT NOT NULL,
            params_json TEXT NOT NULL DEFAULT '{}',
            silhouette REAL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_clusterings_run ON clusterings(run_id)")
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_clusters (
            document_id TEXT NOT NULL REFERENCES documents(id),
            clustering_id TEXT NOT NULL REFERENCES clusterings(id),
            PRIMARY KEY (document_id, clustering_id)
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Ancillary entities (§3) — outside the provenance graph.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS saved_searches (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            query_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tags (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entity_tags (
            id TEXT PRIMARY KEY,
            tag_id TEXT NOT NULL REFERENCES tags(id),
            entity_id TEXT NOT NULL,
            entity_kind TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(tag_id, entity_id, entity_kind)
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id TEXT PRIMARY KEY,
            user_id TEXT REFERENCES users(id),
            action TEXT NOT NULL,
            entity_id TEXT,
            entity_kind TEXT,
            details_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS annotations (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL REFERENCES documents(id),
            user_id TEXT REFERENCES users(id),
            body TEXT NOT NULL,
            location_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_locks (
            document_id TEXT PRIMARY KEY REFERENCES documents(id),
            locked_by TEXT NOT NULL,
            locked_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflow_states (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL REFERENCES documents(id),
            state TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS approval_chains (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL REFERENCES documents(id),
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS approval_steps (
            id TEXT PRIMARY KEY,
            chain_id TEXT NOT NULL REFERENCES approval_chains(id),
            step_index INTEGER NOT NULL,
            approver TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            decided_at TEXT
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS obligations (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL REFERENCES documents(id),
            description TEXT NOT NULL,
            due_at TEXT,
            status TEXT NOT NULL DEFAULT 'open',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS playbooks (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            definition_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS webhooks (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            event TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    create_fts_indexes(tx).await?;

    Ok(())
}

/// Three external-content FTS5 indexes, plus the sync triggers that keep
/// each one consistent with its base table, plus one `fts_meta` row per
/// index so [`crate::search::fts_is_fresh`] can check trigger presence
/// against `sqlite_master`.
async fn create_fts_indexes(tx: &mut sqlx::SqliteConnection) -> Result<()> {
    sqlx::query(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
            text,
            content='chunks',
            content_rowid='rowid'
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS chunks_fts_ai AFTER INSERT ON chunks BEGIN
            INSERT INTO chunks_fts(rowid, text) VALUES (new.rowid, new.text);
        END
        "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS chunks_fts_ad AFTER DELETE ON chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.rowid, old.text);
        END
        "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS chunks_fts_au AFTER UPDATE ON chunks BEGIN
            INSERT INTO chunks_fts(chunks_fts, rowid, text) VALUES ('delete', old.rowid, old.text);
            INSERT INTO chunks_fts(rowid, text) VALUES (new.rowid, new.text);
        END
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS embeddings_fts USING fts5(
            original_text,
            content='embeddings',
            content_rowid='rowid'
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS embeddings_fts_ai AFTER INSERT ON embeddings
        WHEN new.image_id IS NOT NULL BEGIN
            INSERT INTO embeddings_fts(rowid, original_text) VALUES (new.rowid, new.original_text);
        END
        "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS embeddings_fts_ad AFTER DELETE ON embeddings
        WHEN old.image_id IS NOT NULL BEGIN
            INSERT INTO embeddings_fts(embeddings_fts, rowid, original_text) VALUES ('delete', old.rowid, old.original_text);
        END
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS extractions_fts USING fts5(
            extraction_json,
            content='extractions',
            content_rowid='rowid'
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS extractions_fts_ai AFTER INSERT ON extractions BEGIN
            INSERT INTO extractions_fts(rowid, extraction_json) VALUES (new.rowid, new.extraction_json);
        END
        "#,
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS extractions_fts_ad AFTER DELETE ON extractions BEGIN
            INSERT INTO extractions_fts(extractions_fts, rowid, extraction_json) VALUES ('delete', old.rowid, old.extraction_json);
        END
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fts_meta (
            index_name TEXT PRIMARY KEY,
            base_table TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    let now = chrono::Utc::now().to_rfc3339();
    for (name, base) in [
        ("chunks_fts", "chunks"),
        ("embeddings_fts", "embeddings"),
        ("extractions_fts", "extractions"),
    ] {
        sqlx::query(
            "INSERT INTO fts_meta (index_name, base_table, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(index_name) DO NOTHING",
        )
        .bind(name)
        .bind(base)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }

    Ok(())
}

/// Check that the FTS sync triggers for `index_name` are present in the
/// schema. Absence means the index is stale relative to the current schema
/// (§4.11) and a rebuild should be scheduled.
pub async fn fts_triggers_present(pool: &SqlitePool, index_name: &str) -> Result<bool> {
    let prefix = format!("{index_name}_a");
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND name LIKE ? || '%'",
    )
    .bind(prefix)
    .fetch_one(pool)
    .await?;
    Ok(count >= 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let cfg = Config::for_test(db_path);
        let pool = connect(&cfg).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn migrate_reaches_current_version() {
        let (_dir, pool) = test_pool().await;
        migrate(&pool).await.unwrap();
        let v = current_version(&pool).await.unwrap();
        assert_eq!(v, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let (_dir, pool) = test_pool().await;
        migrate(&pool).await.unwrap();
        migrate(&pool).await.unwrap();
        let v = current_version(&pool).await.unwrap();
        assert_eq!(v, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn fts_triggers_present_after_migrate() {
        let (_dir, pool) = test_pool().await;
        migrate(&pool).await.unwrap();
        assert!(fts_triggers_present(&pool, "chunks_fts").await.unwrap());
    }
}
