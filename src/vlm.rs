//! VLM pipeline (C10).
//!
//! Drives pending `IMAGE` rows through an external vision-language service:
//! claim (CAS pending→processing), filter out images not worth spending a
//! VLM call on, dedup by content hash, resize oversized images, call the
//! service, then persist a `VLM_DESCRIPTION` provenance record (and,
//! usually, a dependent `EMBEDDING` one) alongside the updated row. No
//! teacher module shells out to an external multimodal service, so this is
//! new; grounded on C9's (`embedding.rs`) sub-batch/backoff shape and the
//! teacher's `embed_cmd.rs` non-fatal-per-item batch pattern (one item's
//! failure doesn't abort its neighbors, up to a cap).
//!
//! All progress and warning output goes to stderr, matching the rest of
//! the pipeline's logging convention (§4.10).

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::clients::{ImageOptimizer, VlmClient, VlmRequest};
use crate::config::Config;
use crate::embedding;
use crate::error::ProvenanceError;
use crate::hash::hash_text;
use crate::models::{Document, Embedding, Image, Kind, SourceKind, TaskType, VlmStatus};
use crate::provenance::{self, NewRecord};
use crate::store::Store;

const BACKOFF_SEED: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(32);
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// What happened to one claimed image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutcome {
    Completed,
    Deduped,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Default)]
pub struct VlmBatchSummary {
    pub completed: usize,
    pub deduped: usize,
    pub skipped: usize,
    pub failed: usize,
    pub aborted: bool,
    pub results: Vec<(String, ImageOutcome)>,
}

/// Reset images stuck in `processing` back to `pending` before a batch
/// starts (§4.10 "recovery step at pipeline start").
pub async fn recover_stuck(store: &Store, document_id: &str) -> anyhow::Result<u64> {
    let reset = store.reset_stuck_images(document_id).await?;
    if reset > 0 {
        eprintln!("vlm: reset {reset} stuck image(s) for document {document_id} back to pending");
    }
    Ok(reset)
}

/// Quick dimension-only checks that don't need the full optimizer (§4.10
/// step 2d). Returns a skip reason, or `None` if the image passes.
fn quick_dimension_check(image: &Image, cfg: &Config) -> Option<&'static str> {
    let (w, h) = (image.pixel_width, image.pixel_height);
    let longest = w.max(h) as u32;
    if longest < cfg.image_optimization.vlm_skip_below_size {
        return Some("below configured minimum size");
    }
    if longest < 100 {
        return Some("likely icon");
    }
    let (short, long) = if w < h { (w, h) } else { (h, w) };
    if short > 0 && (long as f64 / short as f64) > 6.0 {
        return Some("extreme aspect ratio");
    }
    None
}

fn is_figure_block(block_type: &str) -> bool {
    matches!(block_type, "Figure" | "FigureGroup")
}

/// Run §4.10's relevance filter for one image: header/footer skip, figure
/// pass-through, content-hash dedup, quick dimension checks, then the full
/// optimizer heuristic. Returns `Ok(None)` to proceed to inference, or
/// `Ok(Some(outcome))` for a terminal (skip/dedup) result that the caller
/// persists directly.
async fn apply_relevance_filter(
    store: &Store,
    image: &Image,
    cfg: &Config,
    optimizer: &dyn ImageOptimizer,
) -> anyhow::Result<Option<ImageOutcome>> {
    if !cfg.image_optimization.enabled {
        return Ok(None);
    }

    if image.is_header_footer {
        return Ok(Some(ImageOutcome::Skipped("header/footer block".to_string())));
    }

    if is_figure_block(&image.block_type) {
        return Ok(None);
    }

    if let Some(source) = store.find_processed_image_by_content_hash(&image.content_hash).await? {
        if source.id != image.id {
            return Ok(Some(dedup_from(&source)));
        }
    }

    if cfg.image_optimization.vlm_skip_logos_icons {
        if let Some(reason) = quick_dimension_check(image, cfg) {
            return Ok(Some(ImageOutcome::Skipped(reason.to_string())));
        }
    }

    match optimizer.check_relevance(Path::new(&image.extracted_path)).await {
        Ok(true) => Ok(None),
        Ok(false) => Ok(Some(ImageOutcome::Skipped("below relevance threshold".to_string()))),
        Err(e) => Ok(Some(ImageOutcome::Skipped(format!("optimizer check failed: {e}")))),
    }
}

fn dedup_from(_source: &Image) -> ImageOutcome {
    ImageOutcome::Deduped
}

/// Clone a source image's `EMBEDDING` (row, provenance, and stored vector)
/// onto `image` if the source has one, parented to the new dedup
/// `VLM_DESCRIPTION`. Returns `None` if the source never got an embedding
/// or its vector went missing.
async fn clone_source_embedding(
    store: &Store,
    image: &Image,
    vlm_prov: &crate::models::Provenance,
    source: &Image,
) -> anyhow::Result<Option<(crate::models::Provenance, Embedding, Vec<f32>)>> {
    let Some(source_embedding_id) = &source.vlm_embedding_id else {
        return Ok(None);
    };
    let Some(source_embedding) = store.get_embedding(source_embedding_id).await? else {
        return Ok(None);
    };
    let source_embedding_prov = store
        .get_provenance(&source_embedding.provenance_id)
        .await?
        .ok_or_else(|| ProvenanceError::ProvenanceNotFound { id: source_embedding.provenance_id.clone() })?;
    let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT vector FROM vector_index WHERE embedding_id = ?")
        .bind(source_embedding_id)
        .fetch_optional(store.pool())
        .await?;
    let Some((blob,)) = row else {
        return Ok(None);
    };
    let vector = crate::vector::blob_to_vec(&blob);

    let cloned_prov = provenance::create(NewRecord {
        kind: Kind::Embedding,
        source_kind: SourceKind::Embedding,
        source_path: None,
        parent: Some(vlm_prov.clone()),
        content_hash: source_embedding.content_hash.clone(),
        input_hash: source_embedding_prov.input_hash.clone(),
        file_hash: source_embedding_prov.file_hash.clone(),
        processor_name: source_embedding.model_name.clone(),
        processor_version: source_embedding.model_version.clone(),
        processing_params: Default::default(),
        processing_duration_ms: None,
        quality_score: None,
        agent_name: None,
        agent_version: None,
    })?;

    let cloned_embedding = Embedding {
        id: Uuid::new_v4().to_string(),
        provenance_id: cloned_prov.id.clone(),
        chunk_id: None,
        image_id: Some(image.id.clone()),
        extraction_id: None,
        original_text: source_embedding.original_text.clone(),
        source_file_path: source_embedding.source_file_path.clone(),
        source_file_name: source_embedding.source_file_name.clone(),
        source_file_hash: source_embedding.source_file_hash.clone(),
        page_number: source_embedding.page_number,
        character_start: source_embedding.character_start,
        character_end: source_embedding.character_end,
        chunk_index: source_embedding.chunk_index,
        total_chunks: source_embedding.total_chunks,
        model_name: source_embedding.model_name.clone(),
        model_version: source_embedding.model_version.clone(),
        task_type: TaskType::SearchDocument,
        inference_mode: source_embedding.inference_mode.clone(),
        device: source_embedding.device.clone(),
        content_hash: source_embedding.content_hash.clone(),
        created_at: Utc::now(),
    };

    Ok(Some((cloned_prov, cloned_embedding, vector)))
}

/// Copy a source image's VLM fields onto `image` by content-hash match,
/// attributing a new `VLM_DESCRIPTION` provenance with `source_kind =
/// VLM_DEDUP`, cloning its `EMBEDDING` provenance too if one exists
/// (§4.10 step 2c). Zero VLM tokens charged.
async fn persist_dedup(
    store: &Store,
    image: &Image,
    image_prov: &crate::models::Provenance,
    source: &Image,
) -> anyhow::Result<()> {
    let description = source.vlm_description.clone().unwrap_or_default();
    let content_hash = hash_text(description.as_bytes());

    let vlm_prov = provenance::create(NewRecord {
        kind: Kind::VlmDescription,
        source_kind: SourceKind::VlmDedup,
        source_path: None,
        parent: Some(image_prov.clone()),
        content_hash,
        input_hash: Some(source.content_hash.clone()),
        file_hash: None,
        processor_name: "vlm-dedup".to_string(),
        processor_version: "1".to_string(),
        processing_params: Default::default(),
        processing_duration_ms: None,
        quality_score: source.vlm_confidence,
        agent_name: None,
        agent_version: None,
    })?;

    let cloned = clone_source_embedding(store, image, &vlm_prov, source).await?;

    let description = source.vlm_description.clone().unwrap_or_default();
    let structured = source.vlm_structured_data.clone().unwrap_or_default();
    let confidence = source.vlm_confidence.unwrap_or(0.0);
    let image_id = image.id.clone();

    store
        .transaction(move |tx| {
            let vlm_prov = vlm_prov.clone();
            let cloned = cloned.clone();
            let description = description.clone();
            let structured = structured.clone();
            let image_id = image_id.clone();
            Box::pin(async move {
                Store::insert_provenance(tx, &vlm_prov).await?;
                let embedding_id = if let Some((cloned_prov, cloned_embedding, vector)) = &cloned {
                    Store::insert_provenance(tx, cloned_prov).await?;
                    Store::insert_embedding(tx, cloned_embedding).await?;
                    crate::vector::store_tx(tx, &cloned_embedding.id, vector).await?;
                    Some(cloned_embedding.id.clone())
                } else {
                    None
                };
                Store::update_image_vlm_fields(
                    tx,
                    &image_id,
                    &description,
                    &structured,
                    embedding_id.as_deref(),
                    confidence,
                    0,
                )
                .await?;
                Ok(())
            })
        })
        .await?;

    Ok(())
}

/// Resize `image` for inference if it exceeds the configured max dimension,
/// returning the path to use and a cleanup guard. The optimizer's output
/// path is removed once the caller is done with it regardless of outcome
/// (§4.10 step 3).
async fn maybe_resize(
    image: &Image,
    cfg: &Config,
    optimizer: &dyn ImageOptimizer,
) -> Result<(std::path::PathBuf, Option<std::path::PathBuf>), ProvenanceError> {
    let longest = image.pixel_width.max(image.pixel_height) as u32;
    if longest <= cfg.image_optimization.vlm_max_dimension {
        return Ok((std::path::PathBuf::from(&image.extracted_path), None));
    }
    let resized = optimizer
        .resize_for_inference(Path::new(&image.extracted_path), cfg.image_optimization.vlm_max_dimension)
        .await?;
    Ok((resized.clone(), Some(resized)))
}

/// Process one claimed image end to end: relevance filter, optional resize,
/// VLM inference, provenance creation, persistence. Returns the outcome;
/// errors from the VLM call itself count against the batch's consecutive
/// failure budget, skip/dedup outcomes do not.
#[allow(clippy::too_many_arguments)]
async fn process_claimed_image(
    store: &Store,
    image: &Image,
    document: &Document,
    cfg: &Config,
    vlm_client: &dyn VlmClient,
    optimizer: &dyn ImageOptimizer,
    embedding_command: &Path,
) -> Result<ImageOutcome, ProvenanceError> {
    if !Path::new(&image.extracted_path).exists() {
        return Ok(ImageOutcome::Failed("extracted_path missing from disk".to_string()));
    }

    let image_prov = store
        .get_provenance(&image.provenance_id)
        .await
        .map_err(|e| ProvenanceError::internal(e.to_string()))?
        .ok_or_else(|| ProvenanceError::ProvenanceNotFound { id: image.provenance_id.clone() })?;

    if let Some(outcome) = apply_relevance_filter(store, image, cfg, optimizer)
        .await
        .map_err(|e| ProvenanceError::internal(e.to_string()))?
    {
        if let ImageOutcome::Deduped = outcome {
            if let Some(source) = store
                .find_processed_image_by_content_hash(&image.content_hash)
                .await
                .map_err(|e| ProvenanceError::internal(e.to_string()))?
            {
                persist_dedup(store, image, &image_prov, &source)
                    .await
                    .map_err(|e| ProvenanceError::internal(e.to_string()))?;
            }
        } else if let ImageOutcome::Skipped(reason) = &outcome {
            store
                .transaction(move |tx| {
                    let reason = reason.clone();
                    let image_id = image.id.clone();
                    Box::pin(async move {
                        Store::update_image_vlm_fields(tx, &image_id, &format!("(skipped: {reason})"), "{}", None, 1.0, 0).await
                    })
                })
                .await
                .map_err(|e| ProvenanceError::internal(e.to_string()))?;
        }
        return Ok(outcome);
    }

    let (inference_path, cleanup) = maybe_resize(image, cfg, optimizer).await?;
    let result = vlm_client
        .describe(VlmRequest {
            image_path: &inference_path,
            context_text: None,
            universal_prompt: true,
        })
        .await;
    if let Some(tmp) = cleanup {
        let _ = std::fs::remove_file(tmp);
    }
    let vlm_result = result?;

    if vlm_result.analysis.confidence < cfg.image_optimization.vlm_min_relevance {
        eprintln!(
            "vlm: image {} described below min_confidence ({:.2} < {:.2}), keeping result",
            image.id, vlm_result.analysis.confidence, cfg.image_optimization.vlm_min_relevance
        );
    }

    let content_hash = hash_text(vlm_result.description.as_bytes());
    let vlm_prov = provenance::create(NewRecord {
        kind: Kind::VlmDescription,
        source_kind: SourceKind::Vlm,
        source_path: None,
        parent: Some(image_prov.clone()),
        content_hash,
        input_hash: Some(image.content_hash.clone()),
        file_hash: Some(document.file_hash.clone()),
        processor_name: vlm_result.model.clone(),
        processor_version: "1".to_string(),
        processing_params: Default::default(),
        processing_duration_ms: Some(vlm_result.duration_ms),
        quality_score: Some(vlm_result.analysis.confidence),
        agent_name: None,
        agent_version: None,
    })?;

    let structured_json = serde_json::to_string(&vlm_result.analysis)
        .map_err(|e| ProvenanceError::internal(format!("serializing VLM analysis: {e}")))?;

    let embed_input = {
        let mut text = vlm_result.description.clone();
        if !vlm_result.analysis.extracted_text.is_empty() {
            text.push(' ');
            text.push_str(&vlm_result.analysis.extracted_text.join(" "));
        }
        text
    };
    let embedding_outcome = embed_description(embedding_command, cfg, &embed_input, &vlm_prov, document).await;

    let image_id = image.id.clone();
    let description = vlm_result.description.clone();
    let tokens = vlm_result.tokens_used;
    let confidence = vlm_result.analysis.confidence;

    store
        .transaction(move |tx| {
            let vlm_prov = vlm_prov.clone();
            let structured_json = structured_json.clone();
            let description = description.clone();
            let image_id = image_id.clone();
            let embedding_outcome = embedding_outcome.clone();
            Box::pin(async move {
                Store::insert_provenance(tx, &vlm_prov).await?;
                let embedding_id = if let Some((emb_prov, embedding, vector)) = &embedding_outcome {
                    Store::insert_provenance(tx, emb_prov).await?;
                    Store::insert_embedding(tx, embedding).await?;
                    crate::vector::store_tx(tx, &embedding.id, vector).await?;
                    Some(embedding.id.clone())
                } else {
                    None
                };
                Store::update_image_vlm_fields(
                    tx,
                    &image_id,
                    &description,
                    &structured_json,
                    embedding_id.as_deref(),
                    confidence,
                    tokens,
                )
                .await?;
                Ok(())
            })
        })
        .await
        .map_err(|e| ProvenanceError::internal(e.to_string()))?;

    Ok(ImageOutcome::Completed)
}

/// Embed the VLM description text the same way C9 embeds chunks, producing
/// a depth-4 `EMBEDDING` provenance parented to the `VLM_DESCRIPTION` just
/// created (§4.10 step 5). A failure here is logged and treated as "no
/// embedding" rather than failing the whole image — the description and its
/// provenance are still worth keeping.
async fn embed_description(
    embedding_command: &Path,
    cfg: &Config,
    text: &str,
    vlm_prov: &crate::models::Provenance,
    document: &Document,
) -> Option<(crate::models::Provenance, Embedding, Vec<f32>)> {
    let vectors = match embedding::embed_texts(embedding_command, cfg, &[text.to_string()]).await {
        Ok(v) => v,
        Err(e) => {
            eprintln!("vlm: skipping description embedding: {e}");
            return None;
        }
    };
    let vector = vectors.into_iter().next()?;
    let (model_name, model_version) = crate::embedding::model_identity(embedding_command);
    let content_hash = hash_text(text.as_bytes());

    let prov = provenance::create(NewRecord {
        kind: Kind::Embedding,
        source_kind: SourceKind::Embedding,
        source_path: None,
        parent: Some(vlm_prov.clone()),
        content_hash: content_hash.clone(),
        input_hash: Some(vlm_prov.content_hash.clone()),
        file_hash: Some(document.file_hash.clone()),
        processor_name: model_name.clone(),
        processor_version: model_version.clone(),
        processing_params: Default::default(),
        processing_duration_ms: None,
        quality_score: None,
        agent_name: None,
        agent_version: None,
    })
    .ok()?;

    let embedding = Embedding {
        id: Uuid::new_v4().to_string(),
        provenance_id: prov.id.clone(),
        chunk_id: None,
        image_id: None,
        extraction_id: None,
        original_text: text.to_string(),
        source_file_path: document.file_path.clone(),
        source_file_name: document.file_name.clone(),
        source_file_hash: document.file_hash.clone(),
        page_number: None,
        character_start: None,
        character_end: None,
        chunk_index: None,
        total_chunks: None,
        model_name,
        model_version,
        task_type: TaskType::SearchDocument,
        inference_mode: "local".to_string(),
        device: cfg.embedding_device.clone().unwrap_or_else(|| "auto".to_string()),
        content_hash,
        created_at: Utc::now(),
    };

    Some((prov, embedding, vector))
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_CAP)
}

/// Drive up to `limit` pending images for `document_id` through the
/// pipeline, sequentially (§4.10 "no concurrency"), with exponential
/// backoff between failures and an abort-after-5-consecutive-failures
/// circuit breaker.
pub async fn process_pending(
    store: &Store,
    document: &Document,
    cfg: &Config,
    vlm_client: &dyn VlmClient,
    optimizer: &dyn ImageOptimizer,
    embedding_command: &Path,
    limit: i64,
) -> anyhow::Result<VlmBatchSummary> {
    recover_stuck(store, &document.id).await?;

    let pending = store.list_pending_images_for_document(&document.id, limit).await?;
    let mut summary = VlmBatchSummary::default();
    let mut backoff = BACKOFF_SEED;
    let mut consecutive_failures = 0u32;

    let mut iter = pending.into_iter().peekable();
    while let Some(image) = iter.next() {
        if !store.set_image_processing(&image.id).await? {
            continue; // lost the claim race; another worker has it
        }

        let outcome = process_claimed_image(store, &image, document, cfg, vlm_client, optimizer, embedding_command).await;

        match outcome {
            Ok(ImageOutcome::Completed) => {
                summary.completed += 1;
                summary.results.push((image.id.clone(), ImageOutcome::Completed));
                consecutive_failures = 0;
                backoff = BACKOFF_SEED;
            }
            Ok(ImageOutcome::Deduped) => {
                summary.deduped += 1;
                summary.results.push((image.id.clone(), ImageOutcome::Deduped));
                consecutive_failures = 0;
                backoff = BACKOFF_SEED;
            }
            Ok(outcome @ ImageOutcome::Skipped(_)) => {
                summary.skipped += 1;
                summary.results.push((image.id.clone(), outcome));
                consecutive_failures = 0;
                backoff = BACKOFF_SEED;
            }
            Ok(ImageOutcome::Failed(reason)) => {
                eprintln!("vlm: image {} failed: {reason}", image.id);
                store.set_image_status(&image.id, VlmStatus::Failed).await?;
                summary.failed += 1;
                summary.results.push((image.id.clone(), ImageOutcome::Failed(reason)));
                consecutive_failures += 1;
            }
            Err(e) => {
                eprintln!("vlm: image {} errored: {e}", image.id);
                store.set_image_status(&image.id, VlmStatus::Failed).await?;
                summary.failed += 1;
                summary.results.push((image.id.clone(), ImageOutcome::Failed(e.to_string())));
                consecutive_failures += 1;
            }
        }

        if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            eprintln!("vlm: aborting batch after {MAX_CONSECUTIVE_FAILURES} consecutive failures");
            summary.aborted = true;
            for remaining in iter {
                if store.set_image_processing(&remaining.id).await? {
                    store.set_image_status(&remaining.id, VlmStatus::Failed).await?;
                    summary.failed += 1;
                    summary.results.push((remaining.id.clone(), ImageOutcome::Failed("batch aborted".to_string())));
                }
            }
            break;
        }

        if consecutive_failures > 0 {
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff);
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ImageOptimizationConfig};

    fn test_image(pixel_width: i64, pixel_height: i64, block_type: &str, is_header_footer: bool) -> Image {
        Image {
            id: "img1".into(),
            document_id: "doc1".into(),
            provenance_id: "prov1".into(),
            page_number: 1,
            bbox: crate::models::BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0 },
            image_index: 0,
            pixel_width,
            pixel_height,
            format: "png".into(),
            extracted_path: "/tmp/does-not-exist.png".into(),
            vlm_status: VlmStatus::Pending,
            vlm_description: None,
            vlm_structured_data: None,
            vlm_embedding_id: None,
            vlm_confidence: None,
            vlm_tokens_used: None,
            block_type: block_type.to_string(),
            is_header_footer,
            content_hash: hash_text(b"pixels"),
            created_at: Utc::now(),
        }
    }

    fn test_cfg() -> Config {
        Config {
            db: crate::config::DbConfig { path: "test.db".into() },
            default_ocr_mode: Default::default(),
            max_concurrent: 3,
            embedding_batch_size: 32,
            embedding_device: None,
            image_optimization: ImageOptimizationConfig::default(),
            default_storage_path: "/tmp".into(),
        }
    }

    #[test]
    fn quick_dimension_check_flags_icons() {
        let cfg = test_cfg();
        let tiny = test_image(40, 40, "Text", false);
        assert_eq!(quick_dimension_check(&tiny, &cfg), Some("likely icon"));
    }

    #[test]
    fn quick_dimension_check_flags_below_floor() {
        let mut cfg = test_cfg();
        cfg.image_optimization.vlm_skip_below_size = 200;
        let img = test_image(150, 150, "Text", false);
        assert_eq!(quick_dimension_check(&img, &cfg), Some("below configured minimum size"));
    }

    #[test]
    fn quick_dimension_check_flags_extreme_aspect_ratio() {
        let cfg = test_cfg();
        let img = test_image(1000, 100, "Text", false);
        assert_eq!(quick_dimension_check(&img, &cfg), Some("extreme aspect ratio"));
    }

    #[test]
    fn quick_dimension_check_passes_normal_photo() {
        let cfg = test_cfg();
        let img = test_image(800, 600, "Text", false);
        assert_eq!(quick_dimension_check(&img, &cfg), None);
    }

    #[test]
    fn is_figure_block_recognizes_both_variants() {
        assert!(is_figure_block("Figure"));
        assert!(is_figure_block("FigureGroup"));
        assert!(!is_figure_block("Table"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = BACKOFF_SEED;
        for _ in 0..20 {
            b = next_backoff(b);
        }
        assert_eq!(b, BACKOFF_CAP);
    }
}
