//! Consumed external-service interfaces (§6).
//!
//! Document OCR, VLM description, and image-optimization heuristics are all
//! named out of scope for in-process implementation (§1): the pipeline only
//! needs to know the *shape* of each call. These traits describe exactly
//! the operations §6 documents; callers (`ingest.rs`, `vlm.rs`) take a
//! `&dyn` reference to one and never construct a concrete provider here.
//! Grounded on the teacher's own pattern of keeping provider selection out
//! of the call sites that use a provider (`embedding::EmbeddingProvider`),
//! generalized to `async_trait` since these calls are genuinely async I/O
//! rather than the teacher's config-keyed dispatch.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProvenanceError;
use crate::models::OcrMode;

/// Result of `OcrClient::submit` (§6 "OCR client").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrSubmission {
    pub request_id: String,
    pub extracted_text: String,
    /// Opaque past C8's own deserialization; stored as-is in
    /// `ocr_results.block_tree_json`.
    pub block_tree: Option<serde_json::Value>,
    pub page_count: i64,
    pub quality_score: f64,
    pub duration_ms: i64,
    pub cost_cents: Option<f64>,
}

#[async_trait]
pub trait OcrClient: Send + Sync {
    async fn submit(&self, file_bytes: &[u8], mode: OcrMode) -> Result<OcrSubmission, ProvenanceError>;
}

/// The VLM's structured extraction block (§6 `analysis`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VlmAnalysis {
    pub image_type: Option<String>,
    pub primary_subject: Option<String>,
    #[serde(default)]
    pub extracted_text: Vec<String>,
    #[serde(default)]
    pub dates: Vec<String>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub numbers: Vec<String>,
    pub paragraph1: Option<String>,
    pub paragraph2: Option<String>,
    pub paragraph3: Option<String>,
    pub confidence: f64,
}

/// Result of `VlmClient::describe` (§6 "VLM client").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlmDescription {
    pub description: String,
    pub analysis: VlmAnalysis,
    pub tokens_used: i64,
    pub model: String,
    pub duration_ms: i64,
}

pub struct VlmRequest<'a> {
    pub image_path: &'a Path,
    pub context_text: Option<&'a str>,
    pub universal_prompt: bool,
}

#[async_trait]
pub trait VlmClient: Send + Sync {
    async fn describe(&self, request: VlmRequest<'_>) -> Result<VlmDescription, ProvenanceError>;
}

/// The color/diversity relevance pass and the resize step (§4.10 steps 2e
/// and 3) are themselves external heuristics in the source system — not
/// named in §6's enumerated interfaces, but consumed the same way. Kept
/// as a separate trait so a caller without an optimizer can pass a no-op
/// implementation that always considers images relevant and never resizes.
#[async_trait]
pub trait ImageOptimizer: Send + Sync {
    /// Full heuristic relevance check beyond the quick dimension checks
    /// `vlm.rs` already applies inline. `false` means skip the image.
    async fn check_relevance(&self, image_path: &Path) -> Result<bool, ProvenanceError>;

    /// Produce a resized copy for inference and return its path. The
    /// caller deletes the returned path once inference completes.
    async fn resize_for_inference(
        &self,
        image_path: &Path,
        max_dimension: u32,
    ) -> Result<PathBuf, ProvenanceError>;
}

/// One figure/table region C8 located in the OCR block tree, handed to
/// [`ImageExtractor::extract`] so it can crop the corresponding pixels out
/// of the source document. `page_number` and `bbox` come straight off the
/// block; `block_type` is `Figure`, `FigureGroup`, `Table`, or
/// `TableGroup`'s [`crate::chunk::BlockType::content_type_label`].
pub struct ImageCandidate<'a> {
    pub page_number: i64,
    pub bbox: crate::models::BoundingBox,
    pub block_type: &'a str,
    pub image_index: i64,
}

/// Bytes and metadata for one extracted image, ready to be written to disk
/// and hashed by the caller.
pub struct ExtractedImage {
    pub bytes: Vec<u8>,
    pub pixel_width: i64,
    pub pixel_height: i64,
    pub format: String,
}

/// Document-format parsing — rasterizing a page region into pixels — is
/// named out of scope (§1 "document format parsers"); C8 only locates
/// *where* a figure or table lives in the document, never what its pixels
/// look like. `ingest.rs` walks the candidates C8 produces and calls this
/// trait once per candidate; the pipeline proceeds with zero images for a
/// document whose source format has no extractor wired up, rather than
/// failing ingestion outright.
#[async_trait]
pub trait ImageExtractor: Send + Sync {
    async fn extract(
        &self,
        source_path: &Path,
        candidate: &ImageCandidate<'_>,
    ) -> Result<ExtractedImage, ProvenanceError>;
}
