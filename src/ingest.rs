//! Ingest orchestrator (§2/§4).
//!
//! Drives one document through the full pipeline: hash the file and create
//! its DOCUMENT provenance (depth 0), submit it to OCR and record the
//! OCR_RESULT (depth 1), run the chunk pipeline over the OCR markdown to
//! produce CHUNK and IMAGE rows (depth 2), then hand chunks to the
//! embedding orchestrator and images to the VLM pipeline (depths 3-4).
//! `document.status` tracks pending -> processing -> complete|failed
//! throughout; a failure at any stage marks the document failed with the
//! triggering error rather than leaving it stuck in `processing`.
//!
//! Grounded on the teacher's own `run_sync` shape (one function walking a
//! fixed sequence of stages, persisting status after each) generalized
//! from incremental connector sync to a single-document derivation chain.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use uuid::Uuid;

use crate::chunk::{self, ChunkInput};
use crate::clients::{ImageCandidate, ImageExtractor, ImageOptimizer, OcrClient, VlmClient};
use crate::config::Config;
use crate::embedding;
use crate::error::ProvenanceError;
use crate::hash;
use crate::models::{
    BoundingBox, Chunk, Document, DocumentStatus, Embedding, EmbeddingStatus, Image, Kind,
    OcrMode, OcrResult, SourceKind, VlmStatus,
};
use crate::provenance::{self, NewRecord};
use crate::store::Store;
use crate::vlm::{self, VlmBatchSummary};

/// Everything one `ingest` call produces, for callers (`main.rs`) to report
/// back to the user.
pub struct IngestOutcome {
    pub document: Document,
    pub ocr_result: OcrResult,
    pub chunks: Vec<Chunk>,
    pub images: Vec<Image>,
    pub embeddings: Vec<Embedding>,
    pub vlm_summary: VlmBatchSummary,
}

fn file_type_from_path(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn image_directory(cfg: &Config, document_id: &str) -> std::path::PathBuf {
    cfg.default_storage_path.join("images").join(document_id)
}

/// Resolve the configured default OCR mode into the model's own enum;
/// config validation already restricts `default_ocr_mode` to the same
/// three strings `OcrMode::parse` accepts, so a mismatch here would be a
/// config/model drift bug rather than a user input error.
fn default_ocr_mode(cfg: &Config) -> OcrMode {
    OcrMode::parse(cfg.default_ocr_mode.as_str())
        .expect("config default_ocr_mode must be a valid OcrMode")
}

/// Stage 1: hash the file, insert DOCUMENT provenance + row (§4.2/§4.3).
async fn start_document(store: &Store, file_path: &Path) -> Result<Document> {
    let file_hash = hash::hash_file(file_path)?;
    let bytes =
        std::fs::read(file_path).with_context(|| format!("reading {}", file_path.display()))?;
    let file_name = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    let prov = provenance::create(NewRecord {
        kind: Kind::Document,
        source_kind: SourceKind::File,
        source_path: Some(file_path.display().to_string()),
        parent: None,
        content_hash: file_hash.clone(),
        input_hash: None,
        file_hash: Some(file_hash.clone()),
        processor_name: "provctl".to_string(),
        processor_version: env!("CARGO_PKG_VERSION").to_string(),
        processing_params: Default::default(),
        processing_duration_ms: None,
        quality_score: None,
        agent_name: None,
        agent_version: None,
    })?;

    let document = Document {
        id: prov.id.clone(),
        provenance_id: prov.id.clone(),
        file_path: file_path.display().to_string(),
        file_name,
        file_hash,
        file_size: bytes.len() as i64,
        file_type: file_type_from_path(file_path),
        status: DocumentStatus::Pending,
        page_count: None,
        error_message: None,
        doc_title: None,
        doc_author: None,
        doc_subject: None,
        created_at: Utc::now(),
    };

    store
        .transaction(move |tx| {
            let prov = prov.clone();
            let document = document.clone();
            Box::pin(async move {
                Store::insert_provenance(tx, &prov).await?;
                Store::insert_document(tx, &document).await?;
                Ok(document)
            })
        })
        .await
}

/// Stage 2: submit the file to OCR, insert OCR_RESULT provenance + row
/// (§4.3/§6 "OCR client").
async fn run_ocr(
    store: &Store,
    document: &Document,
    ocr_client: &dyn OcrClient,
    mode: OcrMode,
) -> Result<OcrResult> {
    let doc_prov = store
        .get_provenance(&document.provenance_id)
        .await?
        .ok_or_else(|| ProvenanceError::ProvenanceNotFound { id: document.provenance_id.clone() })?;

    let bytes = std::fs::read(&document.file_path)
        .with_context(|| format!("reading {}", document.file_path))?;
    let submission = ocr_client.submit(&bytes, mode).await?;
    let text_length = submission.extracted_text.len() as i64;

    let content_hash = hash::hash_text(submission.extracted_text.as_bytes());
    let block_tree_json = submission
        .block_tree
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let prov = provenance::create(NewRecord {
        kind: Kind::OcrResult,
        source_kind: SourceKind::Ocr,
        source_path: None,
        parent: Some(doc_prov),
        content_hash,
        input_hash: None,
        file_hash: Some(document.file_hash.clone()),
        processor_name: "ocr".to_string(),
        processor_version: submission.request_id.clone(),
        processing_params: Default::default(),
        processing_duration_ms: Some(submission.duration_ms),
        quality_score: Some(submission.quality_score),
        agent_name: None,
        agent_version: None,
    })?;

    let ocr_result = OcrResult {
        id: Uuid::new_v4().to_string(),
        document_id: document.id.clone(),
        provenance_id: prov.id.clone(),
        extracted_text: submission.extracted_text,
        text_length,
        provider_mode: mode,
        page_count: submission.page_count,
        quality_score: submission.quality_score,
        block_tree_json,
        processing_duration_ms: Some(submission.duration_ms),
        created_at: Utc::now(),
    };

    store
        .transaction(move |tx| {
            let prov = prov.clone();
            let ocr_result = ocr_result.clone();
            Box::pin(async move {
                Store::insert_provenance(tx, &prov).await?;
                Store::insert_ocr_result(tx, &ocr_result).await?;
                Ok(ocr_result)
            })
        })
        .await
}

/// Deserialize `ocr_result.block_tree_json` into C8's block tree. A missing
/// or unparseable tree degrades to `None`, which runs the chunk pipeline in
/// its paragraph-only mode rather than failing ingestion.
fn parse_block_tree(ocr_result: &OcrResult) -> Option<Vec<chunk::Block>> {
    let raw = ocr_result.block_tree_json.as_ref()?;
    serde_json::from_str(raw).ok()
}

/// Stage 3: run the chunk pipeline, insert CHUNK provenance + rows, locate
/// figure/table candidates and extract IMAGE rows for each one the
/// extractor can produce pixels for (§4.8/§1 out-of-scope "document format
/// parsers" — a document whose format has no extractor wired up simply
/// yields zero images, not a failure).
async fn run_chunking(
    store: &Store,
    document: &Document,
    ocr_result: &OcrResult,
    image_extractor: Option<&dyn ImageExtractor>,
    cfg: &Config,
) -> Result<(Vec<Chunk>, Vec<Image>)> {
    let ocr_prov = store
        .get_provenance(&ocr_result.provenance_id)
        .await?
        .ok_or_else(|| {
            ProvenanceError::ProvenanceNotFound { id: ocr_result.provenance_id.clone() }
        })?;

    let block_tree = parse_block_tree(ocr_result);
    let block_slice = block_tree.as_deref();
    let page_offsets = chunk::derive_page_offsets(&ocr_result.extracted_text, block_slice);

    let output = chunk::run(ChunkInput {
        markdown: &ocr_result.extracted_text,
        block_tree: block_slice,
        page_offsets: &page_offsets,
        page_count: ocr_result.page_count,
        min_heading_merge_size: 40,
    });

    let repeated_texts = output.repeated_texts.clone();
    let drafts = output.chunks;

    let chunks = store
        .transaction(move |tx| {
            let ocr_prov = ocr_prov.clone();
            let document = document.clone();
            let drafts = drafts.clone();
            Box::pin(async move {
                let mut built = Vec::with_capacity(drafts.len());
                for (idx, draft) in drafts.into_iter().enumerate() {
                    let prov = provenance::create(NewRecord {
                        kind: Kind::Chunk,
                        source_kind: SourceKind::Chunking,
                        source_path: None,
                        parent: Some(ocr_prov.clone()),
                        content_hash: draft.text_hash.clone(),
                        input_hash: None,
                        file_hash: Some(document.file_hash.clone()),
                        processor_name: "chunk".to_string(),
                        processor_version: "1".to_string(),
                        processing_params: Default::default(),
                        processing_duration_ms: None,
                        quality_score: None,
                        agent_name: None,
                        agent_version: None,
                    })?;
                    Store::insert_provenance(tx, &prov).await?;

                    let chunk = Chunk {
                        id: Uuid::new_v4().to_string(),
                        document_id: document.id.clone(),
                        provenance_id: prov.id.clone(),
                        text: draft.text,
                        text_hash: draft.text_hash,
                        chunk_index: idx as i64,
                        character_start: draft.character_start,
                        character_end: draft.character_end,
                        page_number: draft.page_number,
                        page_range: draft.page_range,
                        overlap_previous: 0,
                        overlap_next: 0,
                        embedding_status: EmbeddingStatus::Pending,
                        section: draft.section,
                        created_at: Utc::now(),
                    };
                    Store::insert_chunk(tx, &chunk).await?;
                    built.push(chunk);
                }
                Ok(built)
            })
        })
        .await?;

    let mut images = Vec::new();
    if let (Some(extractor), Some(tree)) = (image_extractor, block_slice) {
        let candidates = chunk::image_candidate_blocks(tree);
        let source_path = Path::new(&document.file_path);
        let image_dir = image_directory(cfg, &document.id);
        std::fs::create_dir_all(&image_dir)
            .with_context(|| format!("creating {}", image_dir.display()))?;

        let ocr_prov_for_images = store
            .get_provenance(&ocr_result.provenance_id)
            .await?
            .ok_or_else(|| {
                ProvenanceError::ProvenanceNotFound { id: ocr_result.provenance_id.clone() }
            })?;

        for (index, (block, label)) in candidates.iter().enumerate() {
            let candidate = ImageCandidate {
                page_number: block.page.unwrap_or(1),
                bbox: BoundingBox { x: 0.0, y: 0.0, width: 0.0, height: 0.0 },
                block_type: *label,
                image_index: index as i64,
            };
            let extracted = match extractor.extract(source_path, &candidate).await {
                Ok(e) => e,
                Err(_) => continue,
            };

            let content_hash = hash::hash_text(&extracted.bytes);
            let file_name = format!("{index:04}.{}", extracted.format);
            let dest = image_dir.join(&file_name);
            std::fs::write(&dest, &extracted.bytes)
                .with_context(|| format!("writing {}", dest.display()))?;

            let prov = provenance::create(NewRecord {
                kind: Kind::Image,
                source_kind: SourceKind::ImageExtraction,
                source_path: None,
                parent: Some(ocr_prov_for_images.clone()),
                content_hash: content_hash.clone(),
                input_hash: None,
                file_hash: Some(document.file_hash.clone()),
                processor_name: "image_extraction".to_string(),
                processor_version: "1".to_string(),
                processing_params: Default::default(),
                processing_duration_ms: None,
                quality_score: None,
                agent_name: None,
                agent_version: None,
            })?;

            let is_header_footer = repeated_texts.iter().any(|t| t == block.text.trim());

            let image = Image {
                id: Uuid::new_v4().to_string(),
                document_id: document.id.clone(),
                provenance_id: prov.id.clone(),
                page_number: candidate.page_number,
                bbox: candidate.bbox.clone(),
                image_index: candidate.image_index,
                pixel_width: extracted.pixel_width,
                pixel_height: extracted.pixel_height,
                format: extracted.format,
                extracted_path: dest.display().to_string(),
                vlm_status: VlmStatus::Pending,
                vlm_description: None,
                vlm_structured_data: None,
                vlm_embedding_id: None,
                vlm_confidence: None,
                vlm_tokens_used: None,
                block_type: label.to_string(),
                is_header_footer,
                content_hash,
                created_at: Utc::now(),
            };

            let stored = store
                .transaction(move |tx| {
                    let prov = prov.clone();
                    let image = image.clone();
                    Box::pin(async move {
                        Store::insert_provenance(tx, &prov).await?;
                        Store::insert_image(tx, &image).await?;
                        Ok(image)
                    })
                })
                .await?;
            images.push(stored);
        }
    }

    Ok((chunks, images))
}

/// Run the full pipeline for `file_path`: document -> OCR -> chunks/images
/// -> embeddings/VLM descriptions. Updates `document.status` as each stage
/// completes; a failure at any stage after document creation marks it
/// `failed` with the error's message rather than leaving `processing` set
/// forever (§4.2 lifecycle).
#[allow(clippy::too_many_arguments)]
pub async fn ingest_document(
    store: &Store,
    cfg: &Config,
    embedding_command: &Path,
    file_path: &Path,
    ocr_mode: Option<OcrMode>,
    ocr_client: &dyn OcrClient,
    image_extractor: Option<&dyn ImageExtractor>,
    vlm_client: &dyn VlmClient,
    optimizer: &dyn ImageOptimizer,
) -> Result<IngestOutcome> {
    let document = start_document(store, file_path).await?;
    store
        .update_document_status(&document.id, DocumentStatus::Processing, None)
        .await?;

    let mode = ocr_mode.unwrap_or_else(|| default_ocr_mode(cfg));

    let result = run_pipeline_stages(
        store,
        cfg,
        embedding_command,
        &document,
        mode,
        ocr_client,
        image_extractor,
        vlm_client,
        optimizer,
    )
    .await;

    match result {
        Ok(outcome) => {
            store
                .update_document_status(&document.id, DocumentStatus::Complete, None)
                .await?;
            Ok(outcome)
        }
        Err(e) => {
            store
                .update_document_status(&document.id, DocumentStatus::Failed, Some(&e.to_string()))
                .await?;
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pipeline_stages(
    store: &Store,
    cfg: &Config,
    embedding_command: &Path,
    document: &Document,
    mode: OcrMode,
    ocr_client: &dyn OcrClient,
    image_extractor: Option<&dyn ImageExtractor>,
    vlm_client: &dyn VlmClient,
    optimizer: &dyn ImageOptimizer,
) -> Result<IngestOutcome> {
    let ocr_result = run_ocr(store, document, ocr_client, mode).await?;
    if ocr_result.page_count > 0 {
        store
            .update_document_page_count(&document.id, ocr_result.page_count)
            .await?;
    }

    let (chunks, images) = run_chunking(store, document, &ocr_result, image_extractor, cfg).await?;

    let embeddings = if chunks.is_empty() {
        Vec::new()
    } else {
        embedding::embed_chunks(store, embedding_command, cfg, document, &chunks).await?
    };

    let vlm_summary = if images.is_empty() {
        VlmBatchSummary::default()
    } else {
        vlm::process_pending(
            store,
            document,
            cfg,
            vlm_client,
            optimizer,
            embedding_command,
            images.len() as i64,
        )
        .await?
    };

    Ok(IngestOutcome {
        document: document.clone(),
        ocr_result,
        chunks,
        images,
        embeddings,
        vlm_summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_type_from_path_lowercases_extension() {
        assert_eq!(file_type_from_path(Path::new("/tmp/A.PDF")), "pdf");
        assert_eq!(file_type_from_path(Path::new("/tmp/no_ext")), "");
    }
}
