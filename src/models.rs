//! Core data model (§3).
//!
//! The [`Provenance`] record is central: every artifact produced by the
//! pipeline (a document, an OCR pass, a chunk, an image, a description, an
//! embedding, ...) has exactly one row here recording its lineage. Entity
//! tables below carry the artifact-specific fields and point back at their
//! provenance row by id.
//!
//! JSON-valued columns (`parent_ids`, `chain_path`, `processing_params`,
//! `content_types`, ...) are parsed at the store boundary into the typed
//! shapes here — see §9's "dynamic JSON columns → tagged variants" design
//! note. Callers never see a raw JSON string for these fields.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The ten artifact kinds that can appear in the provenance graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Kind {
    Document,
    OcrResult,
    Chunk,
    Image,
    VlmDescription,
    Embedding,
    Extraction,
    FormFill,
    Comparison,
    Clustering,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Document => "DOCUMENT",
            Kind::OcrResult => "OCR_RESULT",
            Kind::Chunk => "CHUNK",
            Kind::Image => "IMAGE",
            Kind::VlmDescription => "VLM_DESCRIPTION",
            Kind::Embedding => "EMBEDDING",
            Kind::Extraction => "EXTRACTION",
            Kind::FormFill => "FORM_FILL",
            Kind::Comparison => "COMPARISON",
            Kind::Clustering => "CLUSTERING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "DOCUMENT" => Kind::Document,
            "OCR_RESULT" => Kind::OcrResult,
            "CHUNK" => Kind::Chunk,
            "IMAGE" => Kind::Image,
            "VLM_DESCRIPTION" => Kind::VlmDescription,
            "EMBEDDING" => Kind::Embedding,
            "EXTRACTION" => Kind::Extraction,
            "FORM_FILL" => Kind::FormFill,
            "COMPARISON" => Kind::Comparison,
            "CLUSTERING" => Kind::Clustering,
            _ => return None,
        })
    }

    /// True for the two kinds that are always their own root (§3 invariant 1).
    pub fn is_root(self) -> bool {
        matches!(self, Kind::Document | Kind::FormFill)
    }
}

/// The operation that produced a provenance record, distinct from the
/// record's `kind` (the artifact it produced). `VLM_DEDUP` is the only
/// source_kind with no 1:1 kind counterpart: it still produces a
/// `VLM_DESCRIPTION` record, just by copy instead of inference (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    File,
    Ocr,
    Chunking,
    ImageExtraction,
    Vlm,
    VlmDedup,
    Embedding,
    Extraction,
    FormFill,
    Comparison,
    Clustering,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::File => "FILE",
            SourceKind::Ocr => "OCR",
            SourceKind::Chunking => "CHUNKING",
            SourceKind::ImageExtraction => "IMAGE_EXTRACTION",
            SourceKind::Vlm => "VLM",
            SourceKind::VlmDedup => "VLM_DEDUP",
            SourceKind::Embedding => "EMBEDDING",
            SourceKind::Extraction => "EXTRACTION",
            SourceKind::FormFill => "FORM_FILL",
            SourceKind::Comparison => "COMPARISON",
            SourceKind::Clustering => "CLUSTERING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "FILE" => SourceKind::File,
            "OCR" => SourceKind::Ocr,
            "CHUNKING" => SourceKind::Chunking,
            "IMAGE_EXTRACTION" => SourceKind::ImageExtraction,
            "VLM" => SourceKind::Vlm,
            "VLM_DEDUP" => SourceKind::VlmDedup,
            "EMBEDDING" => SourceKind::Embedding,
            "EXTRACTION" => SourceKind::Extraction,
            "FORM_FILL" => SourceKind::FormFill,
            "COMPARISON" => SourceKind::Comparison,
            "CLUSTERING" => SourceKind::Clustering,
            _ => return None,
        })
    }
}

/// Arbitrary key/value map for `processing_params`. Stored as JSON text,
/// parsed into this at the store boundary (§9).
pub type ProcessingParams = BTreeMap<String, serde_json::Value>;

/// The central provenance record (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub id: String,
    pub kind: Kind,
    pub source_kind: SourceKind,
    pub source_path: Option<String>,
    pub parent_id: Option<String>,
    /// Ancestor ids, root exclusive to immediate-parent inclusive.
    pub parent_ids: Vec<String>,
    pub root_document_id: String,
    pub chain_depth: i64,
    /// Kind names from root to self.
    pub chain_path: Vec<String>,
    pub content_hash: String,
    pub input_hash: Option<String>,
    pub file_hash: Option<String>,
    pub processor_name: String,
    pub processor_version: String,
    pub processing_params: ProcessingParams,
    pub processing_duration_ms: Option<i64>,
    pub quality_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub agent_name: Option<String>,
    pub agent_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Complete => "complete",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => DocumentStatus::Pending,
            "processing" => DocumentStatus::Processing,
            "complete" => DocumentStatus::Complete,
            "failed" => DocumentStatus::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub provenance_id: String,
    pub file_path: String,
    pub file_name: String,
    pub file_hash: String,
    pub file_size: i64,
    pub file_type: String,
    pub status: DocumentStatus,
    pub page_count: Option<i64>,
    pub error_message: Option<String>,
    pub doc_title: Option<String>,
    pub doc_author: Option<String>,
    pub doc_subject: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OcrMode {
    Fast,
    Balanced,
    Accurate,
}

impl OcrMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OcrMode::Fast => "fast",
            OcrMode::Balanced => "balanced",
            OcrMode::Accurate => "accurate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "fast" => OcrMode::Fast,
            "balanced" => OcrMode::Balanced,
            "accurate" => OcrMode::Accurate,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResult {
    pub id: String,
    pub document_id: String,
    pub provenance_id: String,
    pub extracted_text: String,
    pub text_length: i64,
    pub provider_mode: OcrMode,
    pub page_count: i64,
    pub quality_score: f64,
    /// Serialized block tree, opaque past C8's deserialization.
    pub block_tree_json: Option<String>,
    pub processing_duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbeddingStatus {
    Pending,
    Complete,
    Failed,
}

impl EmbeddingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EmbeddingStatus::Pending => "pending",
            EmbeddingStatus::Complete => "complete",
            EmbeddingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => EmbeddingStatus::Pending,
            "complete" => EmbeddingStatus::Complete,
            "failed" => EmbeddingStatus::Failed,
            _ => return None,
        })
    }
}

/// Section-level metadata attached to a chunk by the chunk pipeline (C8).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SectionMetadata {
    pub heading_context: Option<String>,
    pub heading_level: Option<i64>,
    pub section_path: Option<String>,
    pub content_types: Vec<String>,
    pub is_atomic: bool,
    pub strategy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub provenance_id: String,
    pub text: String,
    pub text_hash: String,
    pub chunk_index: i64,
    pub character_start: i64,
    pub character_end: i64,
    pub page_number: Option<i64>,
    pub page_range: Option<String>,
    pub overlap_previous: i64,
    pub overlap_next: i64,
    pub embedding_status: EmbeddingStatus,
    pub section: SectionMetadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VlmStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl VlmStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VlmStatus::Pending => "pending",
            VlmStatus::Processing => "processing",
            VlmStatus::Complete => "complete",
            VlmStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => VlmStatus::Pending,
            "processing" => VlmStatus::Processing,
            "complete" => VlmStatus::Complete,
            "failed" => VlmStatus::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    pub document_id: String,
    pub provenance_id: String,
    pub page_number: i64,
    pub bbox: BoundingBox,
    pub image_index: i64,
    pub pixel_width: i64,
    pub pixel_height: i64,
    pub format: String,
    pub extracted_path: String,
    pub vlm_status: VlmStatus,
    pub vlm_description: Option<String>,
    pub vlm_structured_data: Option<String>,
    pub vlm_embedding_id: Option<String>,
    pub vlm_confidence: Option<f64>,
    pub vlm_tokens_used: Option<i64>,
    pub block_type: String,
    pub is_header_footer: bool,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    SearchDocument,
    SearchQuery,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::SearchDocument => "search_document",
            TaskType::SearchQuery => "search_query",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "search_document" => TaskType::SearchDocument,
            "search_query" => TaskType::SearchQuery,
            _ => return None,
        })
    }
}

/// Exactly one of `chunk_id`/`image_id`/`extraction_id` is `Some` (§8 invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub id: String,
    pub provenance_id: String,
    pub chunk_id: Option<String>,
    pub image_id: Option<String>,
    pub extraction_id: Option<String>,
    pub original_text: String,
    pub source_file_path: String,
    pub source_file_name: String,
    pub source_file_hash: String,
    pub page_number: Option<i64>,
    pub character_start: Option<i64>,
    pub character_end: Option<i64>,
    pub chunk_index: Option<i64>,
    pub total_chunks: Option<i64>,
    pub model_name: String,
    pub model_version: String,
    pub task_type: TaskType,
    /// Must be `"local"` per §3 — enforced at the store boundary, not just documented.
    pub inference_mode: String,
    pub device: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl Embedding {
    pub fn target_kind(&self) -> Option<&'static str> {
        if self.chunk_id.is_some() {
            Some("chunk")
        } else if self.image_id.is_some() {
            Some("image")
        } else if self.extraction_id.is_some() {
            Some("extraction")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    pub id: String,
    pub document_id: String,
    pub provenance_id: String,
    pub schema_json: String,
    pub extraction_json: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormFillStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl FormFillStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FormFillStatus::Pending => "pending",
            FormFillStatus::Processing => "processing",
            FormFillStatus::Complete => "complete",
            FormFillStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => FormFillStatus::Pending,
            "processing" => FormFillStatus::Processing,
            "complete" => FormFillStatus::Complete,
            "failed" => FormFillStatus::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormFill {
    pub id: String,
    pub provenance_id: String,
    pub source_file_path: String,
    pub source_file_hash: String,
    pub field_data_json: String,
    pub status: FormFillStatus,
    pub fields_filled: Vec<String>,
    pub fields_not_found: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comparison {
    pub id: String,
    pub provenance_id: String,
    pub document_id_1: String,
    pub document_id_2: String,
    pub similarity_ratio: f64,
    pub text_diff_json: String,
    pub structural_diff_json: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clustering {
    pub id: String,
    pub provenance_id: String,
    pub run_id: String,
    pub cluster_index: i64,
    pub centroid_json: String,
    pub top_terms: Vec<String>,
    pub coherence_score: f64,
    pub algorithm: String,
    pub params_json: String,
    pub silhouette: Option<f64>,
    pub created_at: DateTime<Utc>,
}

// ============ Ancillary entities (§3) — managed by C3, outside the graph ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedSearch {
    pub id: String,
    pub name: String,
    pub query_json: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityTag {
    pub id: String,
    pub tag_id: String,
    pub entity_id: String,
    pub entity_kind: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub user_id: Option<String>,
    pub action: String,
    pub entity_id: Option<String>,
    pub entity_kind: Option<String>,
    pub details_json: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    pub document_id: String,
    pub user_id: Option<String>,
    pub body: String,
    pub location_json: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentLock {
    pub document_id: String,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: String,
    pub document_id: String,
    pub state: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalChain {
    pub id: String,
    pub document_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub id: String,
    pub chain_id: String,
    pub step_index: i64,
    pub approver: String,
    pub status: String,
    pub decided_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Obligation {
    pub id: String,
    pub document_id: String,
    pub description: String,
    pub due_at: Option<DateTime<Utc>>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub id: String,
    pub name: String,
    pub definition_json: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub url: String,
    pub event: String,
    pub created_at: DateTime<Utc>,
}
