//! Typed error taxonomy (§7).
//!
//! The rest of the codebase is `anyhow`-only, the same as the teacher crate
//! this was grown from. That works for CLI-only propagation, but several
//! call sites (the CLI's process exit code, and anything that eventually
//! sits behind an HTTP/RPC boundary) need a *stable machine category* plus a
//! human recovery hint that survives past a formatted message. `anyhow`
//! alone can't express that without string-matching, so this one enum is
//! `thiserror`-backed and crosses component boundaries as a typed value;
//! everything else keeps using `anyhow::Result` exactly as before.

use thiserror::Error;

/// One variant per §7 taxonomy row. `category()` is the machine-readable
/// tag; `recovery_hint()` names the next operation an operator should try.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvenanceError {
    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("no database is selected")]
    DatabaseNotSelected,

    #[error("database not found: {name}")]
    DatabaseNotFound { name: String },

    #[error("database already exists: {name}")]
    DatabaseAlreadyExists { name: String },

    #[error("document not found: {id}")]
    DocumentNotFound { id: String },

    #[error("provenance record not found: {id}")]
    ProvenanceNotFound { id: String },

    #[error("provenance chain broken for {id}: {reason}")]
    ChainBroken { id: String, reason: String },

    #[error("integrity verification failed for {id}: expected {expected}, computed {computed}")]
    IntegrityVerificationFailed {
        id: String,
        expected: String,
        computed: String,
    },

    #[error("OCR API error: {message}")]
    OcrApiError { message: String },
    #[error("OCR rate limited")]
    OcrRateLimit,
    #[error("OCR request timed out")]
    OcrTimeout,

    #[error("GPU not available: {message}")]
    GpuNotAvailable { message: String },
    #[error("GPU out of memory: {message}")]
    GpuOutOfMemory { message: String },

    #[error("embedding failed: {message}")]
    EmbeddingFailed { message: String },
    #[error("embedding model error: {message}")]
    EmbeddingModelError { message: String },

    #[error("VLM API error: {message}")]
    VlmApiError { message: String },
    #[error("VLM rate limited")]
    VlmRateLimit,

    #[error("path not found: {path}")]
    PathNotFound { path: String },
    #[error("path is not a directory: {path}")]
    PathNotDirectory { path: String },
    #[error("permission denied: {path}")]
    PermissionDenied { path: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl ProvenanceError {
    /// The machine-readable category string used in the §7 taxonomy table.
    pub fn category(&self) -> &'static str {
        use ProvenanceError::*;
        match self {
            Validation { .. } => "validation_error",
            DatabaseNotSelected => "database_not_selected",
            DatabaseNotFound { .. } => "database_not_found",
            DatabaseAlreadyExists { .. } => "database_already_exists",
            DocumentNotFound { .. } => "document_not_found",
            ProvenanceNotFound { .. } => "provenance_not_found",
            ChainBroken { .. } => "provenance_chain_broken",
            IntegrityVerificationFailed { .. } => "integrity_verification_failed",
            OcrApiError { .. } => "ocr_api_error",
            OcrRateLimit => "ocr_rate_limit",
            OcrTimeout => "ocr_timeout",
            GpuNotAvailable { .. } => "gpu_not_available",
            GpuOutOfMemory { .. } => "gpu_out_of_memory",
            EmbeddingFailed { .. } => "embedding_failed",
            EmbeddingModelError { .. } => "embedding_model_error",
            VlmApiError { .. } => "vlm_api_error",
            VlmRateLimit => "vlm_rate_limit",
            PathNotFound { .. } => "path_not_found",
            PathNotDirectory { .. } => "path_not_directory",
            PermissionDenied { .. } => "permission_denied",
            Internal { .. } => "internal_error",
        }
    }

    /// A human-readable hint naming the next operation to try.
    pub fn recovery_hint(&self) -> &'static str {
        use ProvenanceError::*;
        match self {
            Validation { .. } => "check the argument shape against the operation's documented schema",
            DatabaseNotSelected => "list databases then select one",
            DatabaseNotFound { .. } => "list databases or create one with the given name",
            DatabaseAlreadyExists { .. } => "select the existing database instead of creating it",
            DocumentNotFound { .. } => "list documents in the selected database to find a valid id",
            ProvenanceNotFound { .. } => "the id may belong to a different database; verify the selection",
            ChainBroken { .. } => "run a chain integrity audit to locate the break",
            IntegrityVerificationFailed { .. } => "re-ingest the source artifact or accept the tamper finding",
            OcrApiError { .. } => "retry the OCR submission; check provider status if it persists",
            OcrRateLimit => "back off and retry the OCR submission later",
            OcrTimeout => "retry with a faster provider mode",
            GpuNotAvailable { .. } => "fall back to CPU inference or retry once a GPU is free",
            GpuOutOfMemory { .. } => "reduce the batch size and retry",
            EmbeddingFailed { .. } => "check the embedding worker logs and retry the batch",
            EmbeddingModelError { .. } => "verify the configured model name is installed on the worker",
            VlmApiError { .. } => "retry the VLM request; check provider status if it persists",
            VlmRateLimit => "back off and retry the VLM request later",
            PathNotFound { .. } => "verify the path exists and is spelled correctly",
            PathNotDirectory { .. } => "point the operation at a directory, not a file",
            PermissionDenied { .. } => "check file permissions or run with sufficient privileges",
            Internal { .. } => "this is unclassified; capture the message and file a bug",
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ProvenanceError::Validation { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ProvenanceError::Internal { message: message.into() }
    }
}

/// Wraps a [`ProvenanceError`] plus optional structured details, matching
/// §7's "category, message, optional details" propagation shape for call
/// sites that need to carry extra context (e.g. the verifier's
/// expected/computed pair) past the point where the error is logged.
#[derive(Debug, Clone)]
pub struct ErrorDetails {
    pub category: String,
    pub message: String,
    pub recovery_hint: String,
    pub details: serde_json::Value,
}

impl From<&ProvenanceError> for ErrorDetails {
    fn from(e: &ProvenanceError) -> Self {
        ErrorDetails {
            category: e.category().to_string(),
            message: e.to_string(),
            recovery_hint: e.recovery_hint().to_string(),
            details: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_and_hint_are_stable() {
        let e = ProvenanceError::DatabaseNotSelected;
        assert_eq!(e.category(), "database_not_selected");
        assert!(e.recovery_hint().contains("select"));
    }

    #[test]
    fn integrity_failure_carries_both_hashes() {
        let e = ProvenanceError::IntegrityVerificationFailed {
            id: "abc".into(),
            expected: "sha256:aa".into(),
            computed: "sha256:bb".into(),
        };
        assert_eq!(e.category(), "integrity_verification_failed");
        assert!(e.to_string().contains("sha256:aa"));
        assert!(e.to_string().contains("sha256:bb"));
    }
}
