//! Vector index (C4).
//!
//! One float32 vector of fixed dimension per embedding id, stored as a
//! little-endian BLOB in the `vector_index` table laid down by
//! [`crate::schema`]. kNN is a brute-force cosine-distance scan — grounded
//! directly on the teacher's `embedding::{vec_to_blob, blob_to_vec,
//! cosine_similarity}` — rather than a native SQLite vector extension,
//! which sqlx's bundled sqlite driver doesn't provide.

use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::error::ProvenanceError;
use crate::schema::VECTOR_DIM;

/// Encode a vector as little-endian `f32` bytes, as the teacher's
/// `vec_to_blob` does.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Reverse of [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`; `0.0` for empty or mismatched-length
/// vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

fn check_dimension(vec: &[f32]) -> Result<(), ProvenanceError> {
    if vec.len() != VECTOR_DIM {
        return Err(ProvenanceError::validation(format!(
            "vector has dimension {}, expected {VECTOR_DIM}",
            vec.len()
        )));
    }
    Ok(())
}

/// Write one vector under a caller-owned transaction, for orchestrators
/// (C9/C10) that must flush vectors inside the same write transaction as
/// the provenance/entity rows they accompany — a separate pool connection
/// would block on SQLite's single-writer lock until the outer transaction
/// commits.
pub async fn store_tx(
    tx: &mut Transaction<'_, Sqlite>,
    embedding_id: &str,
    vec: &[f32],
) -> anyhow::Result<()> {
    check_dimension(vec)?;
    let blob = vec_to_blob(vec);
    sqlx::query(
        "INSERT INTO vector_index (embedding_id, vector) VALUES (?, ?) \
         ON CONFLICT(embedding_id) DO UPDATE SET vector = excluded.vector",
    )
    .bind(embedding_id)
    .bind(blob)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub struct VectorIndex {
    pool: SqlitePool,
}

impl VectorIndex {
    pub fn new(pool: SqlitePool) -> Self {
        VectorIndex { pool }
    }

    pub async fn store(&self, embedding_id: &str, vec: &[f32]) -> anyhow::Result<()> {
        check_dimension(vec)?;
        let blob = vec_to_blob(vec);
        sqlx::query(
            "INSERT INTO vector_index (embedding_id, vector) VALUES (?, ?) \
             ON CONFLICT(embedding_id) DO UPDATE SET vector = excluded.vector",
        )
        .bind(embedding_id)
        .bind(blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store a batch in a single transaction, for orchestrator throughput
    /// (§4.9's "flush every 50 pairs").
    pub async fn batch_store(&self, batch: &[(String, Vec<f32>)]) -> anyhow::Result<()> {
        for (_, vec) in batch {
            check_dimension(vec)?;
        }
        let mut tx = self.pool.begin().await?;
        for (id, vec) in batch {
            let blob = vec_to_blob(vec);
            sqlx::query(
                "INSERT INTO vector_index (embedding_id, vector) VALUES (?, ?) \
                 ON CONFLICT(embedding_id) DO UPDATE SET vector = excluded.vector",
            )
            .bind(id)
            .bind(blob)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn count(&self) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vector_index")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn delete(&self, embedding_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM vector_index WHERE embedding_id = ?")
            .bind(embedding_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// k-nearest by ascending cosine distance (`1.0 - cosine_similarity`),
    /// optionally restricted to `filter_ids`. A brute-force scan over every
    /// stored vector — acceptable at the scale this store targets; see
    /// §4.4's "opaque to callers" note on the distance metric.
    pub async fn knn(
        &self,
        query_vec: &[f32],
        k: usize,
        filter_ids: Option<&[String]>,
    ) -> anyhow::Result<Vec<(String, f32)>> {
        check_dimension(query_vec)?;

        let rows = sqlx::query("SELECT embedding_id, vector FROM vector_index")
            .fetch_all(&self.pool)
            .await?;

        let filter: Option<std::collections::HashSet<&str>> =
            filter_ids.map(|ids| ids.iter().map(String::as_str).collect());

        let mut scored: Vec<(String, f32)> = rows
            .iter()
            .filter_map(|row| {
                let id: String = row.get("embedding_id");
                if let Some(f) = &filter {
                    if !f.contains(id.as_str()) {
                        return None;
                    }
                }
                let blob: Vec<u8> = row.get("vector");
                let vec = blob_to_vec(&blob);
                let distance = 1.0 - cosine_similarity(query_vec, &vec);
                Some((id, distance))
            })
            .collect();

        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::schema;

    async fn test_index() -> (tempfile::TempDir, VectorIndex) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::for_test(dir.path().join("t.db"));
        let pool = schema::connect(&cfg).await.unwrap();
        schema::migrate(&pool).await.unwrap();
        (dir, VectorIndex::new(pool))
    }

    fn dummy_vec(seed: f32) -> Vec<f32> {
        let mut v = vec![0.0f32; VECTOR_DIM];
        v[0] = seed;
        v[1] = 1.0 - seed.min(1.0);
        v
    }

    #[test]
    fn blob_roundtrips() {
        let v = vec![1.0f32, -2.5, 3.125];
        let blob = vec_to_blob(&v);
        assert_eq!(blob.len(), 12);
        assert_eq!(blob_to_vec(&blob), v);
    }

    #[test]
    fn cosine_identical_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn store_rejects_wrong_dimension() {
        let (_dir, idx) = test_index().await;
        let err = idx.store("e1", &[1.0, 2.0]).await.unwrap_err();
        assert!(err.to_string().contains("dimension"));
    }

    #[tokio::test]
    async fn knn_orders_by_ascending_distance() {
        let (_dir, idx) = test_index().await;
        idx.store("near", &dummy_vec(1.0)).await.unwrap();
        idx.store("far", &dummy_vec(0.0)).await.unwrap();

        let results = idx.knn(&dummy_vec(1.0), 2, None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "near");
        assert!(results[0].1 <= results[1].1);
    }

    #[tokio::test]
    async fn knn_respects_filter_ids() {
        let (_dir, idx) = test_index().await;
        idx.store("a", &dummy_vec(1.0)).await.unwrap();
        idx.store("b", &dummy_vec(0.5)).await.unwrap();

        let filter = vec!["b".to_string()];
        let results = idx.knn(&dummy_vec(1.0), 5, Some(&filter)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "b");
    }
}
