//! Typed row↔record store (C3).
//!
//! One method per entity operation: insert, get-by-id, get-by-alternate-key,
//! list-with-filters, update-status, delete. [`Store::transaction`] runs a
//! closure under a write transaction; SQLite has no true nested transactions,
//! so composition here means callers simply share the same `&mut
//! SqliteConnection` handed to them — there is only ever one outer
//! transaction open at a time, matching the teacher's own
//! `pool.begin()` / `&mut *tx` usage in `ingest.rs::replace_chunks`.
//!
//! Row→record conversion strictly parses the JSON-valued columns
//! (`parent_ids`, `chain_path`, `processing_params`, `content_types`,
//! `fields_filled`, `fields_not_found`, `top_terms`) and rejects corrupt
//! values with a typed error (§9) — callers never see a raw JSON string.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::error::ProvenanceError;
use crate::models::*;

pub struct Store {
    pool: SqlitePool,
}

fn parse_json_err<T: serde::de::DeserializeOwned>(
    column: &str,
    raw: &str,
) -> Result<T, ProvenanceError> {
    serde_json::from_str(raw).map_err(|e| ProvenanceError::Internal {
        message: format!("corrupt JSON in column {column}: {e}"),
    })
}

fn parse_rfc3339(column: &str, raw: &str) -> Result<DateTime<Utc>, ProvenanceError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| ProvenanceError::Internal {
            message: format!("corrupt timestamp in column {column}: {e}"),
        })
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Store { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run `f` under a write transaction. Any error returned by `f` rolls
    /// back the whole unit (§7 propagation policy). `f` returns a boxed
    /// future rather than an `async fn` borrow so the transaction handle
    /// can be passed straight through to the per-entity `insert_*` helpers,
    /// which each take `&mut Transaction<'_, Sqlite>` directly.
    pub async fn transaction<F, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: for<'c> FnOnce(
            &'c mut Transaction<'static, Sqlite>,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<T>> + 'c>>,
    {
        let mut tx = self.pool.begin().await?;
        let result = f(&mut tx).await?;
        tx.commit().await?;
        Ok(result)
    }

    // ---------------- Provenance ----------------

    pub async fn insert_provenance(
        tx: &mut Transaction<'_, Sqlite>,
        p: &Provenance,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO provenance (
                id, kind, source_kind, source_path, parent_id, parent_ids,
                root_document_id, chain_depth, chain_path, content_hash,
                input_hash, file_hash, processor_name, processor_version,
                processing_params, processing_duration_ms, quality_score,
                created_at, processed_at, agent_name, agent_version
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&p.id)
        .bind(p.kind.as_str())
        .bind(p.source_kind.as_str())
        .bind(&p.source_path)
        .bind(&p.parent_id)
        .bind(serde_json::to_string(&p.parent_ids)?)
        .bind(&p.root_document_id)
        .bind(p.chain_depth)
        .bind(serde_json::to_string(&p.chain_path)?)
        .bind(&p.content_hash)
        .bind(&p.input_hash)
        .bind(&p.file_hash)
        .bind(&p.processor_name)
        .bind(&p.processor_version)
        .bind(serde_json::to_string(&p.processing_params)?)
        .bind(p.processing_duration_ms)
        .bind(p.quality_score)
        .bind(p.created_at.to_rfc3339())
        .bind(p.processed_at.map(|d| d.to_rfc3339()))
        .bind(&p.agent_name)
        .bind(&p.agent_version)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn get_provenance(&self, id: &str) -> anyhow::Result<Option<Provenance>> {
        let row = sqlx::query("SELECT * FROM provenance WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_provenance(&r)).transpose()
    }

    pub async fn children_of(&self, parent_id: &str) -> anyhow::Result<Vec<Provenance>> {
        let rows = sqlx::query("SELECT * FROM provenance WHERE parent_id = ? ORDER BY created_at")
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_provenance).collect()
    }

    pub async fn by_root(&self, root_document_id: &str) -> anyhow::Result<Vec<Provenance>> {
        let rows = sqlx::query(
            "SELECT * FROM provenance WHERE root_document_id = ? ORDER BY chain_depth ASC, created_at ASC",
        )
        .bind(root_document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_provenance).collect()
    }

    pub async fn all_provenance_by_depth(&self) -> anyhow::Result<Vec<Provenance>> {
        let rows = sqlx::query("SELECT * FROM provenance ORDER BY chain_depth ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_provenance).collect()
    }

    // ---------------- Documents ----------------

    pub async fn insert_document(
        tx: &mut Transaction<'_, Sqlite>,
        d: &Document,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (
                id, provenance_id, file_path, file_name, file_hash, file_size,
                file_type, status, page_count, error_message, doc_title,
                doc_author, doc_subject, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&d.id)
        .bind(&d.provenance_id)
        .bind(&d.file_path)
        .bind(&d.file_name)
        .bind(&d.file_hash)
        .bind(d.file_size)
        .bind(&d.file_type)
        .bind(d.status.as_str())
        .bind(d.page_count)
        .bind(&d.error_message)
        .bind(&d.doc_title)
        .bind(&d.doc_author)
        .bind(&d.doc_subject)
        .bind(d.created_at.to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn get_document(&self, id: &str) -> anyhow::Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_document(&r)).transpose()
    }

    pub async fn get_document_by_provenance_id(
        &self,
        provenance_id: &str,
    ) -> anyhow::Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE provenance_id = ?")
            .bind(provenance_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_document(&r)).transpose()
    }

    pub async fn get_document_by_hash(&self, file_hash: &str) -> anyhow::Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE file_hash = ?")
            .bind(file_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_document(&r)).transpose()
    }

    pub async fn list_documents(&self, limit: i64) -> anyhow::Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY created_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_document).collect()
    }

    pub async fn update_document_status(
        &self,
        id: &str,
        status: DocumentStatus,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE documents SET status = ?, error_message = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(error_message)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_document_page_count(&self, id: &str, page_count: i64) -> anyhow::Result<()> {
        sqlx::query("UPDATE documents SET page_count = ? WHERE id = ?")
            .bind(page_count)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Cascade delete a document: embeddings (text and image), chunks,
    /// extractions, images, OCR results, the document row, and their vector
    /// entries — in that order (§4.3).
    pub async fn delete_document_cascade(&self, document_id: &str) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM vector_index WHERE embedding_id IN (
                SELECT id FROM embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)
                   OR image_id IN (SELECT id FROM images WHERE document_id = ?)
            )
            "#,
        )
        .bind(document_id)
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?) \
             OR image_id IN (SELECT id FROM images WHERE document_id = ?)",
        )
        .bind(document_id)
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM extractions WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM images WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM ocr_results WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // ---------------- OCR results ----------------

    pub async fn insert_ocr_result(
        tx: &mut Transaction<'_, Sqlite>,
        o: &OcrResult,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ocr_results (
                id, document_id, provenance_id, extracted_text, text_length,
                provider_mode, page_count, quality_score, block_tree_json,
                processing_duration_ms, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&o.id)
        .bind(&o.document_id)
        .bind(&o.provenance_id)
        .bind(&o.extracted_text)
        .bind(o.text_length)
        .bind(o.provider_mode.as_str())
        .bind(o.page_count)
        .bind(o.quality_score)
        .bind(&o.block_tree_json)
        .bind(o.processing_duration_ms)
        .bind(o.created_at.to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn get_ocr_result_by_document(
        &self,
        document_id: &str,
    ) -> anyhow::Result<Option<OcrResult>> {
        let row = sqlx::query(
            "SELECT * FROM ocr_results WHERE document_id = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_ocr_result(&r)).transpose()
    }

    pub async fn get_ocr_result_by_provenance_id(
        &self,
        provenance_id: &str,
    ) -> anyhow::Result<Option<OcrResult>> {
        let row = sqlx::query("SELECT * FROM ocr_results WHERE provenance_id = ?")
            .bind(provenance_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_ocr_result(&r)).transpose()
    }

    // ---------------- Chunks ----------------

    pub async fn insert_chunk(tx: &mut Transaction<'_, Sqlite>, c: &Chunk) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chunks (
                id, document_id, provenance_id, text, text_hash, chunk_index,
                character_start, character_end, page_number, page_range,
                overlap_previous, overlap_next, embedding_status,
                heading_context, heading_level, section_path, content_types,
                is_atomic, strategy, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&c.id)
        .bind(&c.document_id)
        .bind(&c.provenance_id)
        .bind(&c.text)
        .bind(&c.text_hash)
        .bind(c.chunk_index)
        .bind(c.character_start)
        .bind(c.character_end)
        .bind(c.page_number)
        .bind(&c.page_range)
        .bind(c.overlap_previous)
        .bind(c.overlap_next)
        .bind(c.embedding_status.as_str())
        .bind(&c.section.heading_context)
        .bind(c.section.heading_level)
        .bind(&c.section.section_path)
        .bind(serde_json::to_string(&c.section.content_types)?)
        .bind(c.section.is_atomic)
        .bind(&c.section.strategy)
        .bind(c.created_at.to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn list_chunks_by_document(&self, document_id: &str) -> anyhow::Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    pub async fn get_chunk(&self, id: &str) -> anyhow::Result<Option<Chunk>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_chunk(&r)).transpose()
    }

    pub async fn get_chunk_by_provenance_id(
        &self,
        provenance_id: &str,
    ) -> anyhow::Result<Option<Chunk>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE provenance_id = ?")
            .bind(provenance_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_chunk(&r)).transpose()
    }

    pub async fn list_chunks_pending_embedding(&self, limit: i64) -> anyhow::Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE embedding_status = 'pending' ORDER BY created_at ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    pub async fn update_chunk_embedding_status(
        tx: &mut Transaction<'_, Sqlite>,
        chunk_id: &str,
        status: EmbeddingStatus,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE chunks SET embedding_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(chunk_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    // ---------------- Images ----------------

    pub async fn insert_image(tx: &mut Transaction<'_, Sqlite>, img: &Image) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO images (
                id, document_id, provenance_id, page_number, bbox_x, bbox_y,
                bbox_width, bbox_height, image_index, pixel_width,
                pixel_height, format, extracted_path, vlm_status,
                vlm_description, vlm_structured_data, vlm_embedding_id,
                vlm_confidence, vlm_tokens_used, block_type, is_header_footer,
                content_hash, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&img.id)
        .bind(&img.document_id)
        .bind(&img.provenance_id)
        .bind(img.page_number)
        .bind(img.bbox.x)
        .bind(img.bbox.y)
        .bind(img.bbox.width)
        .bind(img.bbox.height)
        .bind(img.image_index)
        .bind(img.pixel_width)
        .bind(img.pixel_height)
        .bind(&img.format)
        .bind(&img.extracted_path)
        .bind(img.vlm_status.as_str())
        .bind(&img.vlm_description)
        .bind(&img.vlm_structured_data)
        .bind(&img.vlm_embedding_id)
        .bind(img.vlm_confidence)
        .bind(img.vlm_tokens_used)
        .bind(&img.block_type)
        .bind(img.is_header_footer)
        .bind(&img.content_hash)
        .bind(img.created_at.to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn get_image(&self, id: &str) -> anyhow::Result<Option<Image>> {
        let row = sqlx::query("SELECT * FROM images WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_image(&r)).transpose()
    }

    /// Look up an image by its own provenance id (IMAGE kind), or by the
    /// provenance id of a child VLM_DESCRIPTION record — both resolve to the
    /// same image row, since VLM_DESCRIPTION has no entity table of its own
    /// (§4.6's "vlm_description of the parent IMAGE").
    pub async fn get_image_by_provenance_id(
        &self,
        provenance_id: &str,
    ) -> anyhow::Result<Option<Image>> {
        let row = sqlx::query("SELECT * FROM images WHERE provenance_id = ?")
            .bind(provenance_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_image(&r)).transpose()
    }

    pub async fn list_images_by_document(&self, document_id: &str) -> anyhow::Result<Vec<Image>> {
        let rows = sqlx::query("SELECT * FROM images WHERE document_id = ? ORDER BY image_index ASC")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_image).collect()
    }

    pub async fn list_pending_images(&self, limit: i64) -> anyhow::Result<Vec<Image>> {
        let rows = sqlx::query(
            "SELECT * FROM images WHERE vlm_status = 'pending' ORDER BY created_at ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_image).collect()
    }

    /// Same as [`Self::list_pending_images`] but scoped to one document, for
    /// the VLM pipeline (C10) running as part of that document's ingest.
    pub async fn list_pending_images_for_document(
        &self,
        document_id: &str,
        limit: i64,
    ) -> anyhow::Result<Vec<Image>> {
        let rows = sqlx::query(
            "SELECT * FROM images WHERE document_id = ? AND vlm_status = 'pending' ORDER BY created_at ASC LIMIT ?",
        )
        .bind(document_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_image).collect()
    }

    pub async fn find_processed_image_by_content_hash(
        &self,
        content_hash: &str,
    ) -> anyhow::Result<Option<Image>> {
        let row = sqlx::query(
            "SELECT * FROM images WHERE content_hash = ? AND vlm_status = 'complete' LIMIT 1",
        )
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_image(&r)).transpose()
    }

    /// CAS pending→processing. Returns `true` if this call won the claim.
    pub async fn set_image_processing(&self, image_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE images SET vlm_status = 'processing' WHERE id = ? AND vlm_status = 'pending'",
        )
        .bind(image_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_image_status(
        &self,
        image_id: &str,
        status: VlmStatus,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE images SET vlm_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(image_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_image_vlm_fields(
        tx: &mut Transaction<'_, Sqlite>,
        image_id: &str,
        description: &str,
        structured_data: &str,
        embedding_id: Option<&str>,
        confidence: f64,
        tokens_used: i64,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE images SET
                vlm_status = 'complete',
                vlm_description = ?,
                vlm_structured_data = ?,
                vlm_embedding_id = ?,
                vlm_confidence = ?,
                vlm_tokens_used = ?
            WHERE id = ?
            "#,
        )
        .bind(description)
        .bind(structured_data)
        .bind(embedding_id)
        .bind(confidence)
        .bind(tokens_used)
        .bind(image_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Reset images stuck in `processing` back to `pending`. Idempotent:
    /// calling it with no stuck images is a no-op (§8 idempotence).
    pub async fn reset_stuck_images(&self, document_id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE images SET vlm_status = 'pending' WHERE document_id = ? AND vlm_status = 'processing'",
        )
        .bind(document_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ---------------- Embeddings ----------------

    pub async fn insert_embedding(
        tx: &mut Transaction<'_, Sqlite>,
        e: &Embedding,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embeddings (
                id, provenance_id, chunk_id, image_id, extraction_id,
                original_text, source_file_path, source_file_name,
                source_file_hash, page_number, character_start, character_end,
                chunk_index, total_chunks, model_name, model_version,
                task_type, inference_mode, device, content_hash, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&e.id)
        .bind(&e.provenance_id)
        .bind(&e.chunk_id)
        .bind(&e.image_id)
        .bind(&e.extraction_id)
        .bind(&e.original_text)
        .bind(&e.source_file_path)
        .bind(&e.source_file_name)
        .bind(&e.source_file_hash)
        .bind(e.page_number)
        .bind(e.character_start)
        .bind(e.character_end)
        .bind(e.chunk_index)
        .bind(e.total_chunks)
        .bind(&e.model_name)
        .bind(&e.model_version)
        .bind(e.task_type.as_str())
        .bind(&e.inference_mode)
        .bind(&e.device)
        .bind(&e.content_hash)
        .bind(e.created_at.to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn get_embedding(&self, id: &str) -> anyhow::Result<Option<Embedding>> {
        let row = sqlx::query("SELECT * FROM embeddings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_embedding(&r)).transpose()
    }

    pub async fn get_embedding_by_provenance_id(
        &self,
        provenance_id: &str,
    ) -> anyhow::Result<Option<Embedding>> {
        let row = sqlx::query("SELECT * FROM embeddings WHERE provenance_id = ?")
            .bind(provenance_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_embedding(&r)).transpose()
    }

    pub async fn list_embeddings(&self) -> anyhow::Result<Vec<Embedding>> {
        let rows = sqlx::query("SELECT * FROM embeddings").fetch_all(&self.pool).await?;
        rows.iter().map(row_to_embedding).collect()
    }

    // ---------------- Extractions ----------------

    pub async fn insert_extraction(
        tx: &mut Transaction<'_, Sqlite>,
        e: &Extraction,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO extractions (id, document_id, provenance_id, schema_json, extraction_json, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&e.id)
        .bind(&e.document_id)
        .bind(&e.provenance_id)
        .bind(&e.schema_json)
        .bind(&e.extraction_json)
        .bind(e.created_at.to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn get_extraction(&self, id: &str) -> anyhow::Result<Option<Extraction>> {
        let row = sqlx::query("SELECT * FROM extractions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_extraction(&r)).transpose()
    }

    pub async fn get_extraction_by_provenance_id(
        &self,
        provenance_id: &str,
    ) -> anyhow::Result<Option<Extraction>> {
        let row = sqlx::query("SELECT * FROM extractions WHERE provenance_id = ?")
            .bind(provenance_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_extraction(&r)).transpose()
    }

    // ---------------- Form fills ----------------

    pub async fn insert_form_fill(
        tx: &mut Transaction<'_, Sqlite>,
        f: &FormFill,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO form_fills (
                id, provenance_id, source_file_path, source_file_hash,
                field_data_json, status, fields_filled, fields_not_found, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&f.id)
        .bind(&f.provenance_id)
        .bind(&f.source_file_path)
        .bind(&f.source_file_hash)
        .bind(&f.field_data_json)
        .bind(f.status.as_str())
        .bind(serde_json::to_string(&f.fields_filled)?)
        .bind(serde_json::to_string(&f.fields_not_found)?)
        .bind(f.created_at.to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn update_form_fill_status(
        &self,
        id: &str,
        status: FormFillStatus,
    ) -> anyhow::Result<()> {
        sqlx::query("UPDATE form_fills SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_form_fill(&self, id: &str) -> anyhow::Result<Option<FormFill>> {
        let row = sqlx::query("SELECT * FROM form_fills WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_form_fill(&r)).transpose()
    }

    pub async fn get_form_fill_by_provenance_id(
        &self,
        provenance_id: &str,
    ) -> anyhow::Result<Option<FormFill>> {
        let row = sqlx::query("SELECT * FROM form_fills WHERE provenance_id = ?")
            .bind(provenance_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_form_fill(&r)).transpose()
    }

    // ---------------- Comparisons ----------------

    pub async fn insert_comparison(
        tx: &mut Transaction<'_, Sqlite>,
        c: &Comparison,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO comparisons (
                id, provenance_id, document_id_1, document_id_2,
                similarity_ratio, text_diff_json, structural_diff_json, summary, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&c.id)
        .bind(&c.provenance_id)
        .bind(&c.document_id_1)
        .bind(&c.document_id_2)
        .bind(c.similarity_ratio)
        .bind(&c.text_diff_json)
        .bind(&c.structural_diff_json)
        .bind(&c.summary)
        .bind(c.created_at.to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn get_comparison(&self, id: &str) -> anyhow::Result<Option<Comparison>> {
        let row = sqlx::query("SELECT * FROM comparisons WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_comparison(&r)).transpose()
    }

    pub async fn get_comparison_by_provenance_id(
        &self,
        provenance_id: &str,
    ) -> anyhow::Result<Option<Comparison>> {
        let row = sqlx::query("SELECT * FROM comparisons WHERE provenance_id = ?")
            .bind(provenance_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_comparison(&r)).transpose()
    }

    // ---------------- Clusterings ----------------

    pub async fn insert_clustering(
        tx: &mut Transaction<'_, Sqlite>,
        c: &Clustering,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO clusterings (
                id, provenance_id, run_id, cluster_index, centroid_json,
                top_terms, coherence_score, algorithm, params_json, silhouette, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&c.id)
        .bind(&c.provenance_id)
        .bind(&c.run_id)
        .bind(c.cluster_index)
        .bind(&c.centroid_json)
        .bind(serde_json::to_string(&c.top_terms)?)
        .bind(c.coherence_score)
        .bind(&c.algorithm)
        .bind(&c.params_json)
        .bind(c.silhouette)
        .bind(c.created_at.to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn get_clustering(&self, id: &str) -> anyhow::Result<Option<Clustering>> {
        let row = sqlx::query("SELECT * FROM clusterings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_clustering(&r)).transpose()
    }

    pub async fn get_clustering_by_provenance_id(
        &self,
        provenance_id: &str,
    ) -> anyhow::Result<Option<Clustering>> {
        let row = sqlx::query("SELECT * FROM clusterings WHERE provenance_id = ?")
            .bind(provenance_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_clustering(&r)).transpose()
    }

    /// Resolve a metadata filter (document title/author/subject substring)
    /// to a set of document ids, for C11's metadata filter (§4.11). Returns
    /// the sentinel `"__no_match__"` alone when nothing matches, so the
    /// caller's `document_id IN (...)` clause yields zero rows instead of
    /// degenerating into "no filter" on an empty IN-list.
    pub async fn resolve_metadata_filter(&self, substring: &str) -> anyhow::Result<Vec<String>> {
        let pattern = format!("%{}%", substring.replace('%', "\\%").replace('_', "\\_"));
        let rows = sqlx::query(
            "SELECT id FROM documents WHERE doc_title LIKE ? ESCAPE '\\' \
             OR doc_author LIKE ? ESCAPE '\\' OR doc_subject LIKE ? ESCAPE '\\'",
        )
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Ok(vec!["__no_match__".to_string()]);
        }
        Ok(rows.iter().map(|r| r.get::<String, _>("id")).collect())
    }
}

// ---------------- Row conversion ----------------

fn row_to_provenance(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Provenance> {
    let kind_s: String = row.get("kind");
    let source_kind_s: String = row.get("source_kind");
    let parent_ids_s: String = row.get("parent_ids");
    let chain_path_s: String = row.get("chain_path");
    let processing_params_s: String = row.get("processing_params");
    let created_at_s: String = row.get("created_at");
    let processed_at_s: Option<String> = row.get("processed_at");

    Ok(Provenance {
        id: row.get("id"),
        kind: Kind::parse(&kind_s)
            .ok_or_else(|| ProvenanceError::internal(format!("unknown kind: {kind_s}")))?,
        source_kind: SourceKind::parse(&source_kind_s).ok_or_else(|| {
            ProvenanceError::internal(format!("unknown source_kind: {source_kind_s}"))
        })?,
        source_path: row.get("source_path"),
        parent_id: row.get("parent_id"),
        parent_ids: parse_json_err("parent_ids", &parent_ids_s)?,
        root_document_id: row.get("root_document_id"),
        chain_depth: row.get("chain_depth"),
        chain_path: parse_json_err("chain_path", &chain_path_s)?,
        content_hash: row.get("content_hash"),
        input_hash: row.get("input_hash"),
        file_hash: row.get("file_hash"),
        processor_name: row.get("processor_name"),
        processor_version: row.get("processor_version"),
        processing_params: parse_json_err::<BTreeMap<String, serde_json::Value>>(
            "processing_params",
            &processing_params_s,
        )?,
        processing_duration_ms: row.get("processing_duration_ms"),
        quality_score: row.get("quality_score"),
        created_at: parse_rfc3339("created_at", &created_at_s)?,
        processed_at: processed_at_s
            .map(|s| parse_rfc3339("processed_at", &s))
            .transpose()?,
        agent_name: row.get("agent_name"),
        agent_version: row.get("agent_version"),
    })
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Document> {
    let status_s: String = row.get("status");
    let created_at_s: String = row.get("created_at");
    Ok(Document {
        id: row.get("id"),
        provenance_id: row.get("provenance_id"),
        file_path: row.get("file_path"),
        file_name: row.get("file_name"),
        file_hash: row.get("file_hash"),
        file_size: row.get("file_size"),
        file_type: row.get("file_type"),
        status: DocumentStatus::parse(&status_s)
            .ok_or_else(|| ProvenanceError::internal(format!("unknown status: {status_s}")))?,
        page_count: row.get("page_count"),
        error_message: row.get("error_message"),
        doc_title: row.get("doc_title"),
        doc_author: row.get("doc_author"),
        doc_subject: row.get("doc_subject"),
        created_at: parse_rfc3339("created_at", &created_at_s)?,
    })
}

fn row_to_ocr_result(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<OcrResult> {
    let mode_s: String = row.get("provider_mode");
    let created_at_s: String = row.get("created_at");
    Ok(OcrResult {
        id: row.get("id"),
        document_id: row.get("document_id"),
        provenance_id: row.get("provenance_id"),
        extracted_text: row.get("extracted_text"),
        text_length: row.get("text_length"),
        provider_mode: OcrMode::parse(&mode_s)
            .ok_or_else(|| ProvenanceError::internal(format!("unknown ocr mode: {mode_s}")))?,
        page_count: row.get("page_count"),
        quality_score: row.get("quality_score"),
        block_tree_json: row.get("block_tree_json"),
        processing_duration_ms: row.get("processing_duration_ms"),
        created_at: parse_rfc3339("created_at", &created_at_s)?,
    })
}

pub(crate) fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Chunk> {
    let status_s: String = row.get("embedding_status");
    let content_types_s: String = row.get("content_types");
    let created_at_s: String = row.get("created_at");
    Ok(Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        provenance_id: row.get("provenance_id"),
        text: row.get("text"),
        text_hash: row.get("text_hash"),
        chunk_index: row.get("chunk_index"),
        character_start: row.get("character_start"),
        character_end: row.get("character_end"),
        page_number: row.get("page_number"),
        page_range: row.get("page_range"),
        overlap_previous: row.get("overlap_previous"),
        overlap_next: row.get("overlap_next"),
        embedding_status: EmbeddingStatus::parse(&status_s).ok_or_else(|| {
            ProvenanceError::internal(format!("unknown embedding status: {status_s}"))
        })?,
        section: SectionMetadata {
            heading_context: row.get("heading_context"),
            heading_level: row.get("heading_level"),
            section_path: row.get("section_path"),
            content_types: parse_json_err("content_types", &content_types_s)?,
            is_atomic: row.get("is_atomic"),
            strategy: row.get("strategy"),
        },
        created_at: parse_rfc3339("created_at", &created_at_s)?,
    })
}

fn row_to_image(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Image> {
    let status_s: String = row.get("vlm_status");
    let created_at_s: String = row.get("created_at");
    Ok(Image {
        id: row.get("id"),
        document_id: row.get("document_id"),
        provenance_id: row.get("provenance_id"),
        page_number: row.get("page_number"),
        bbox: BoundingBox {
            x: row.get("bbox_x"),
            y: row.get("bbox_y"),
            width: row.get("bbox_width"),
            height: row.get("bbox_height"),
        },
        image_index: row.get("image_index"),
        pixel_width: row.get("pixel_width"),
        pixel_height: row.get("pixel_height"),
        format: row.get("format"),
        extracted_path: row.get("extracted_path"),
        vlm_status: VlmStatus::parse(&status_s)
            .ok_or_else(|| ProvenanceError::internal(format!("unknown vlm status: {status_s}")))?,
        vlm_description: row.get("vlm_description"),
        vlm_structured_data: row.get("vlm_structured_data"),
        vlm_embedding_id: row.get("vlm_embedding_id"),
        vlm_confidence: row.get("vlm_confidence"),
        vlm_tokens_used: row.get("vlm_tokens_used"),
        block_type: row.get("block_type"),
        is_header_footer: row.get("is_header_footer"),
        content_hash: row.get("content_hash"),
        created_at: parse_rfc3339("created_at", &created_at_s)?,
    })
}

fn row_to_embedding(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Embedding> {
    let task_s: String = row.get("task_type");
    let created_at_s: String = row.get("created_at");
    Ok(Embedding {
        id: row.get("id"),
        provenance_id: row.get("provenance_id"),
        chunk_id: row.get("chunk_id"),
        image_id: row.get("image_id"),
        extraction_id: row.get("extraction_id"),
        original_text: row.get("original_text"),
        source_file_path: row.get("source_file_path"),
        source_file_name: row.get("source_file_name"),
        source_file_hash: row.get("source_file_hash"),
        page_number: row.get("page_number"),
        character_start: row.get("character_start"),
        character_end: row.get("character_end"),
        chunk_index: row.get("chunk_index"),
        total_chunks: row.get("total_chunks"),
        model_name: row.get("model_name"),
        model_version: row.get("model_version"),
        task_type: TaskType::parse(&task_s)
            .ok_or_else(|| ProvenanceError::internal(format!("unknown task type: {task_s}")))?,
        inference_mode: row.get("inference_mode"),
        device: row.get("device"),
        content_hash: row.get("content_hash"),
        created_at: parse_rfc3339("created_at", &created_at_s)?,
    })
}

fn row_to_extraction(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Extraction> {
    let created_at_s: String = row.get("created_at");
    Ok(Extraction {
        id: row.get("id"),
        document_id: row.get("document_id"),
        provenance_id: row.get("provenance_id"),
        schema_json: row.get("schema_json"),
        extraction_json: row.get("extraction_json"),
        created_at: parse_rfc3339("created_at", &created_at_s)?,
    })
}

fn row_to_form_fill(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<FormFill> {
    let status_s: String = row.get("status");
    let filled_s: String = row.get("fields_filled");
    let not_found_s: String = row.get("fields_not_found");
    let created_at_s: String = row.get("created_at");
    Ok(FormFill {
        id: row.get("id"),
        provenance_id: row.get("provenance_id"),
        source_file_path: row.get("source_file_path"),
        source_file_hash: row.get("source_file_hash"),
        field_data_json: row.get("field_data_json"),
        status: FormFillStatus::parse(&status_s).ok_or_else(|| {
            ProvenanceError::internal(format!("unknown form_fill status: {status_s}"))
        })?,
        fields_filled: parse_json_err("fields_filled", &filled_s)?,
        fields_not_found: parse_json_err("fields_not_found", &not_found_s)?,
        created_at: parse_rfc3339("created_at", &created_at_s)?,
    })
}

fn row_to_comparison(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Comparison> {
    let created_at_s: String = row.get("created_at");
    Ok(Comparison {
        id: row.get("id"),
        provenance_id: row.get("provenance_id"),
        document_id_1: row.get("document_id_1"),
        document_id_2: row.get("document_id_2"),
        similarity_ratio: row.get("similarity_ratio"),
        text_diff_json: row.get("text_diff_json"),
        structural_diff_json: row.get("structural_diff_json"),
        summary: row.get("summary"),
        created_at: parse_rfc3339("created_at", &created_at_s)?,
    })
}

fn row_to_clustering(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Clustering> {
    let top_terms_s: String = row.get("top_terms");
    let created_at_s: String = row.get("created_at");
    Ok(Clustering {
        id: row.get("id"),
        provenance_id: row.get("provenance_id"),
        run_id: row.get("run_id"),
        cluster_index: row.get("cluster_index"),
        centroid_json: row.get("centroid_json"),
        top_terms: parse_json_err("top_terms", &top_terms_s)?,
        coherence_score: row.get("coherence_score"),
        algorithm: row.get("algorithm"),
        params_json: row.get("params_json"),
        silhouette: row.get("silhouette"),
        created_at: parse_rfc3339("created_at", &created_at_s)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hash::hash_text;
    use crate::schema;
    use uuid::Uuid;

    async fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::for_test(dir.path().join("test.db"));
        let pool = schema::connect(&cfg).await.unwrap();
        schema::migrate(&pool).await.unwrap();
        (dir, Store::new(pool))
    }

    fn root_provenance(kind: Kind, content_hash: String) -> (String, Provenance) {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        (
            id.clone(),
            Provenance {
                id: id.clone(),
                kind,
                source_kind: SourceKind::File,
                source_path: None,
                parent_id: None,
                parent_ids: vec![],
                root_document_id: id,
                chain_depth: 0,
                chain_path: vec![kind.as_str().to_string()],
                content_hash,
                input_hash: None,
                file_hash: None,
                processor_name: "test".into(),
                processor_version: "1".into(),
                processing_params: BTreeMap::new(),
                processing_duration_ms: None,
                quality_score: None,
                created_at: now,
                processed_at: None,
                agent_name: None,
                agent_version: None,
            },
        )
    }

    #[tokio::test]
    async fn insert_and_get_document_roundtrips() {
        let (_dir, store) = test_store().await;
        let hash = hash_text(b"hello");
        let (prov_id, prov) = root_provenance(Kind::Document, hash.clone());
        let doc = Document {
            id: prov_id.clone(),
            provenance_id: prov_id.clone(),
            file_path: "/tmp/a.pdf".into(),
            file_name: "a.pdf".into(),
            file_hash: hash,
            file_size: 5,
            file_type: "pdf".into(),
            status: DocumentStatus::Pending,
            page_count: None,
            error_message: None,
            doc_title: None,
            doc_author: None,
            doc_subject: None,
            created_at: Utc::now(),
        };

        store
            .transaction(|tx| {
                let prov = prov.clone();
                let doc = doc.clone();
                Box::pin(async move {
                    Store::insert_provenance(tx, &prov).await?;
                    Store::insert_document(tx, &doc).await?;
                    Ok(())
                })
            })
            .await
            .unwrap();

        let fetched = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(fetched.file_name, "a.pdf");
        assert_eq!(fetched.status, DocumentStatus::Pending);
    }

    #[tokio::test]
    async fn set_image_processing_is_cas() {
        let (_dir, store) = test_store().await;
        let hash = hash_text(b"doc");
        let (doc_prov_id, doc_prov) = root_provenance(Kind::Document, hash.clone());
        let doc = Document {
            id: doc_prov_id.clone(),
            provenance_id: doc_prov_id.clone(),
            file_path: "/tmp/a.pdf".into(),
            file_name: "a.pdf".into(),
            file_hash: hash,
            file_size: 1,
            file_type: "pdf".into(),
            status: DocumentStatus::Complete,
            page_count: None,
            error_message: None,
            doc_title: None,
            doc_author: None,
            doc_subject: None,
            created_at: Utc::now(),
        };

        let img_prov_id = Uuid::new_v4().to_string();
        let img_prov = Provenance {
            id: img_prov_id.clone(),
            kind: Kind::Image,
            source_kind: SourceKind::ImageExtraction,
            source_path: None,
            parent_id: Some(doc_prov_id.clone()),
            parent_ids: vec![doc_prov_id.clone()],
            root_document_id: doc_prov_id.clone(),
            chain_depth: 2,
            chain_path: vec!["DOCUMENT".into(), "OCR_RESULT".into(), "IMAGE".into()],
            content_hash: hash_text(b"pixels"),
            input_hash: None,
            file_hash: None,
            processor_name: "test".into(),
            processor_version: "1".into(),
            processing_params: BTreeMap::new(),
            processing_duration_ms: None,
            quality_score: None,
            created_at: Utc::now(),
            processed_at: None,
            agent_name: None,
            agent_version: None,
        };
        let image = Image {
            id: Uuid::new_v4().to_string(),
            document_id: doc.id.clone(),
            provenance_id: img_prov_id.clone(),
            page_number: 1,
            bbox: BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0 },
            image_index: 0,
            pixel_width: 200,
            pixel_height: 200,
            format: "png".into(),
            extracted_path: "/tmp/img.png".into(),
            vlm_status: VlmStatus::Pending,
            vlm_description: None,
            vlm_structured_data: None,
            vlm_embedding_id: None,
            vlm_confidence: None,
            vlm_tokens_used: None,
            block_type: "Figure".into(),
            is_header_footer: false,
            content_hash: hash_text(b"pixels"),
            created_at: Utc::now(),
        };

        store
            .transaction(|tx| {
                let doc_prov = doc_prov.clone();
                let doc = doc.clone();
                let img_prov = img_prov.clone();
                let image = image.clone();
                Box::pin(async move {
                    Store::insert_provenance(tx, &doc_prov).await?;
                    Store::insert_document(tx, &doc).await?;
                    Store::insert_provenance(tx, &img_prov).await?;
                    Store::insert_image(tx, &image).await?;
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert!(store.set_image_processing(&image.id).await.unwrap());
        assert!(!store.set_image_processing(&image.id).await.unwrap());
    }
}
