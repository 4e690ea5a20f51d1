//! Verifier (C6).
//!
//! Re-derives the canonical artifact bytes for a provenance record's entity
//! row, re-hashes them, and compares against the stored expected hash. The
//! per-kind derivation table is reproduced exactly from §4.6. Grounded on
//! the same hash-chain walk-and-verify shape as [`crate::provenance`].

use serde::Serialize;

use crate::error::ProvenanceError;
use crate::hash::hash_text;
use crate::models::Kind;
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct RecordVerification {
    pub provenance_id: String,
    pub kind: String,
    pub expected_hash: String,
    pub computed_hash: String,
    pub passed: bool,
}

#[derive(Serialize)]
struct ComparisonDiffs {
    text_diff: serde_json::Value,
    structural_diff: serde_json::Value,
}

#[derive(Serialize)]
struct FormFillFields {
    fields_filled: Vec<String>,
    fields_not_found: Vec<String>,
}

/// Derive the canonical artifact bytes for one provenance record, per
/// §4.6's derivation table. Returns `(expected_hash, canonical_bytes)`.
async fn canonical_artifact(
    store: &Store,
    prov_id: &str,
    kind: Kind,
) -> anyhow::Result<(String, Vec<u8>)> {
    match kind {
        Kind::Document => {
            let doc = store
                .get_document_by_provenance_id(prov_id)
                .await?
                .ok_or_else(|| ProvenanceError::DocumentNotFound { id: prov_id.to_string() })?;
            let bytes = std::fs::read(&doc.file_path).map_err(|e| {
                ProvenanceError::internal(format!(
                    "reading {}: {e}",
                    doc.file_path
                ))
            })?;
            Ok((doc.file_hash, bytes))
        }
        Kind::OcrResult => {
            let ocr = store
                .get_ocr_result_by_provenance_id(prov_id)
                .await?
                .ok_or_else(|| ProvenanceError::ProvenanceNotFound { id: prov_id.to_string() })?;
            let prov = store.get_provenance(prov_id).await?.ok_or_else(|| {
                ProvenanceError::ProvenanceNotFound { id: prov_id.to_string() }
            })?;
            Ok((prov.content_hash, ocr.extracted_text.into_bytes()))
        }
        Kind::Chunk => {
            let chunk = store
                .get_chunk_by_provenance_id(prov_id)
                .await?
                .ok_or_else(|| ProvenanceError::ProvenanceNotFound { id: prov_id.to_string() })?;
            Ok((chunk.text_hash, chunk.text.into_bytes()))
        }
        Kind::Embedding => {
            let e = store
                .get_embedding_by_provenance_id(prov_id)
                .await?
                .ok_or_else(|| ProvenanceError::ProvenanceNotFound { id: prov_id.to_string() })?;
            Ok((e.content_hash, e.original_text.into_bytes()))
        }
        Kind::Image => {
            let img = store
                .get_image_by_provenance_id(prov_id)
                .await?
                .ok_or_else(|| ProvenanceError::ProvenanceNotFound { id: prov_id.to_string() })?;
            let bytes = std::fs::read(&img.extracted_path).map_err(|e| {
                ProvenanceError::internal(format!("reading {}: {e}", img.extracted_path))
            })?;
            Ok((img.content_hash, bytes))
        }
        Kind::VlmDescription => {
            // VLM_DESCRIPTION has no entity table of its own: its parent
            // provenance id (the IMAGE record) carries the description.
            let prov = store
                .get_provenance(prov_id)
                .await?
                .ok_or_else(|| ProvenanceError::ProvenanceNotFound { id: prov_id.to_string() })?;
            let parent_id = prov.parent_id.ok_or_else(|| {
                ProvenanceError::ChainBroken {
                    id: prov_id.to_string(),
                    reason: "VLM_DESCRIPTION has no parent".to_string(),
                }
            })?;
            let img = store
                .get_image_by_provenance_id(&parent_id)
                .await?
                .ok_or_else(|| ProvenanceError::ChainBroken {
                    id: prov_id.to_string(),
                    reason: format!("parent IMAGE {parent_id} not found"),
                })?;
            let description = img.vlm_description.unwrap_or_default();
            Ok((prov.content_hash, description.into_bytes()))
        }
        Kind::Comparison => {
            let c = store
                .get_comparison_by_provenance_id(prov_id)
                .await?
                .ok_or_else(|| ProvenanceError::ProvenanceNotFound { id: prov_id.to_string() })?;
            let diffs = ComparisonDiffs {
                text_diff: serde_json::from_str(&c.text_diff_json)?,
                structural_diff: serde_json::from_str(&c.structural_diff_json)?,
            };
            Ok((c.content_hash, serde_json::to_vec(&diffs)?))
        }
        Kind::Extraction => {
            let e = store
                .get_extraction_by_provenance_id(prov_id)
                .await?
                .ok_or_else(|| ProvenanceError::ProvenanceNotFound { id: prov_id.to_string() })?;
            let prov = store.get_provenance(prov_id).await?.unwrap();
            Ok((prov.content_hash, e.extraction_json.into_bytes()))
        }
        Kind::FormFill => {
            let f = store
                .get_form_fill_by_provenance_id(prov_id)
                .await?
                .ok_or_else(|| ProvenanceError::ProvenanceNotFound { id: prov_id.to_string() })?;
            let prov = store.get_provenance(prov_id).await?.unwrap();
            let fields = FormFillFields {
                fields_filled: f.fields_filled,
                fields_not_found: f.fields_not_found,
            };
            Ok((prov.content_hash, serde_json::to_vec(&fields)?))
        }
        Kind::Clustering => {
            let c = store
                .get_clustering_by_provenance_id(prov_id)
                .await?
                .ok_or_else(|| ProvenanceError::ProvenanceNotFound { id: prov_id.to_string() })?;
            let prov = store.get_provenance(prov_id).await?.ok_or_else(|| {
                ProvenanceError::ProvenanceNotFound { id: prov_id.to_string() }
            })?;
            let bytes = format!("{}:{}", c.centroid_json, c.run_id).into_bytes();
            Ok((prov.content_hash, bytes))
        }
    }
}

/// Verify a single record. Loads the provenance row, derives the canonical
/// artifact per kind, re-hashes, and compares.
pub async fn verify_record(store: &Store, provenance_id: &str) -> anyhow::Result<RecordVerification> {
    let prov = store
        .get_provenance(provenance_id)
        .await?
        .ok_or_else(|| ProvenanceError::ProvenanceNotFound { id: provenance_id.to_string() })?;

    let (expected_hash, bytes) = canonical_artifact(store, provenance_id, prov.kind).await?;
    let computed_hash = hash_text(&bytes);

    Ok(RecordVerification {
        provenance_id: provenance_id.to_string(),
        kind: prov.kind.as_str().to_string(),
        passed: computed_hash == expected_hash,
        expected_hash,
        computed_hash,
    })
}

#[derive(Debug, Serialize)]
pub struct ChainVerification {
    pub hashes_verified: u64,
    pub hashes_failed: u64,
    pub failed: Vec<RecordVerification>,
}

pub async fn verify_chain(store: &Store, provenance_id: &str) -> anyhow::Result<ChainVerification> {
    let chain = crate::provenance::chain(store, provenance_id).await?;

    let mut ids = vec![chain.current.id.clone()];
    ids.extend(chain.ancestors_root_last.iter().map(|p| p.id.clone()));

    let mut hashes_verified = 0u64;
    let mut hashes_failed = 0u64;
    let mut failed = Vec::new();

    for id in ids {
        let result = verify_record(store, &id).await?;
        if result.passed {
            hashes_verified += 1;
        } else {
            hashes_failed += 1;
            failed.push(result);
        }
    }

    Ok(ChainVerification { hashes_verified, hashes_failed, failed })
}

const MAX_FAILED_ITEMS: usize = 1000;
const MAX_CHAIN_ERRORS: usize = 10;

#[derive(Debug, Serialize)]
pub struct ChainError {
    pub provenance_id: String,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct DatabaseVerification {
    pub hashes_verified: u64,
    pub hashes_failed: u64,
    pub failed: Vec<RecordVerification>,
    pub failed_overflow: u64,
    pub chain_errors: Vec<ChainError>,
    pub chain_errors_overflow: u64,
}

/// Sweep all provenance ordered by chain_depth, verifying hashes and
/// parent-depth consistency. Caps both failure lists with overflow counters
/// so a badly corrupted database doesn't return an unbounded response.
pub async fn verify_database(store: &Store) -> anyhow::Result<DatabaseVerification> {
    let records = store.all_provenance_by_depth().await?;

    let mut hashes_verified = 0u64;
    let mut hashes_failed = 0u64;
    let mut failed = Vec::new();
    let mut failed_overflow = 0u64;
    let mut chain_errors = Vec::new();
    let mut chain_errors_overflow = 0u64;

    for record in &records {
        let result = verify_record(store, &record.id).await?;
        if result.passed {
            hashes_verified += 1;
        } else {
            hashes_failed += 1;
            if failed.len() < MAX_FAILED_ITEMS {
                failed.push(result);
            } else {
                failed_overflow += 1;
            }
        }

        if let Some(parent_id) = &record.parent_id {
            match store.get_provenance(parent_id).await? {
                Some(parent) if parent.chain_depth == record.chain_depth - 1 => {}
                Some(parent) => {
                    let err = ChainError {
                        provenance_id: record.id.clone(),
                        reason: format!(
                            "parent {} has chain_depth {}, expected {}",
                            parent_id,
                            parent.chain_depth,
                            record.chain_depth - 1
                        ),
                    };
                    push_chain_error(&mut chain_errors, &mut chain_errors_overflow, err);
                }
                None => {
                    let err = ChainError {
                        provenance_id: record.id.clone(),
                        reason: format!("parent {parent_id} does not exist"),
                    };
                    push_chain_error(&mut chain_errors, &mut chain_errors_overflow, err);
                }
            }
        }
    }

    Ok(DatabaseVerification {
        hashes_verified,
        hashes_failed,
        failed,
        failed_overflow,
        chain_errors,
        chain_errors_overflow,
    })
}

fn push_chain_error(errors: &mut Vec<ChainError>, overflow: &mut u64, err: ChainError) {
    if errors.len() < MAX_CHAIN_ERRORS {
        errors.push(err);
    } else {
        *overflow += 1;
    }
}
