//! Provenance graph (C5).
//!
//! Single entry point for creating provenance records: given a kind, its
//! immediate parent (if any), and the fields the caller already knows
//! (content_hash, processor identity, ...), fills in `parent_ids`,
//! `chain_depth`, and `chain_path` by walking the parent. Grounded
//! conceptually on `other_examples/`'s hash-chain walk-and-verify shape,
//! reimplemented against the sqlx store rather than a blockchain ledger.

use std::collections::HashSet;

use chrono::Utc;
use uuid::Uuid;

use crate::error::ProvenanceError;
use crate::models::{Kind, Provenance, ProcessingParams, SourceKind};
use crate::store::Store;

/// Expected chain_depth for each kind relative to its parent, per §3's
/// chain-depth table. `None` means depth is derived from the parent rather
/// than fixed (EMBEDDING's depth depends on whether its parent is a CHUNK
/// or a VLM_DESCRIPTION).
fn expected_depth(kind: Kind, parent_depth: i64) -> i64 {
    match kind {
        Kind::Document | Kind::FormFill => 0,
        Kind::OcrResult => 1,
        // CLUSTERING roots directly off DOCUMENT (no OCR_RESULT in its
        // path), landing at depth 1 — see DESIGN.md's Open Question
        // resolution on the chain-depth table's CLUSTERING row.
        Kind::Chunk | Kind::Image | Kind::Extraction | Kind::Comparison | Kind::Clustering => {
            parent_depth + 1
        }
        Kind::VlmDescription => parent_depth + 1,
        Kind::Embedding => parent_depth + 1,
    }
}

pub struct NewRecord {
    pub kind: Kind,
    pub source_kind: SourceKind,
    pub source_path: Option<String>,
    pub parent: Option<Provenance>,
    pub content_hash: String,
    pub input_hash: Option<String>,
    pub file_hash: Option<String>,
    pub processor_name: String,
    pub processor_version: String,
    pub processing_params: ProcessingParams,
    pub processing_duration_ms: Option<i64>,
    pub quality_score: Option<f64>,
    pub agent_name: Option<String>,
    pub agent_version: Option<String>,
}

/// Build a fully-populated [`Provenance`] record for `new`. Does not persist
/// it — callers insert it in the same transaction as the entity row it
/// describes (§4.3's "row and provenance row inserted together").
pub fn create(new: NewRecord) -> Result<Provenance, ProvenanceError> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();

    if new.kind.is_root() {
        if new.parent.is_some() {
            return Err(ProvenanceError::validation(format!(
                "{} is a root kind and must not have a parent",
                new.kind.as_str()
            )));
        }
        return Ok(Provenance {
            id: id.clone(),
            kind: new.kind,
            source_kind: new.source_kind,
            source_path: new.source_path,
            parent_id: None,
            parent_ids: vec![],
            root_document_id: id,
            chain_depth: 0,
            chain_path: vec![new.kind.as_str().to_string()],
            content_hash: new.content_hash,
            input_hash: new.input_hash,
            file_hash: new.file_hash,
            processor_name: new.processor_name,
            processor_version: new.processor_version,
            processing_params: new.processing_params,
            processing_duration_ms: new.processing_duration_ms,
            quality_score: new.quality_score,
            created_at: now,
            processed_at: Some(now),
            agent_name: new.agent_name,
            agent_version: new.agent_version,
        });
    }

    let parent = new.parent.ok_or_else(|| {
        ProvenanceError::validation(format!(
            "{} requires a parent provenance record",
            new.kind.as_str()
        ))
    })?;

    let depth = expected_depth(new.kind, parent.chain_depth);

    let mut parent_ids = parent.parent_ids.clone();
    parent_ids.push(parent.id.clone());

    let mut chain_path = parent.chain_path.clone();
    chain_path.push(new.kind.as_str().to_string());

    Ok(Provenance {
        id,
        kind: new.kind,
        source_kind: new.source_kind,
        source_path: new.source_path,
        parent_id: Some(parent.id.clone()),
        parent_ids,
        root_document_id: parent.root_document_id.clone(),
        chain_depth: depth,
        chain_path,
        content_hash: new.content_hash,
        input_hash: new.input_hash,
        file_hash: new.file_hash,
        processor_name: new.processor_name,
        processor_version: new.processor_version,
        processing_params: new.processing_params,
        processing_duration_ms: new.processing_duration_ms,
        quality_score: new.quality_score,
        created_at: now,
        processed_at: Some(now),
        agent_name: new.agent_name,
        agent_version: new.agent_version,
    })
}

pub struct Chain {
    pub current: Provenance,
    /// Root-last: immediate parent first, DOCUMENT/FORM_FILL root last.
    pub ancestors_root_last: Vec<Provenance>,
    pub root: Provenance,
    pub depth: i64,
    pub path_kinds: Vec<String>,
    pub is_complete: bool,
}

/// Walk `parent_id` from `id` to the root, detecting cycles (§4.5). A
/// repeated id during the walk is a broken chain, not a silent truncation.
pub async fn chain(store: &Store, id: &str) -> anyhow::Result<Chain> {
    let current = store
        .get_provenance(id)
        .await?
        .ok_or_else(|| ProvenanceError::ProvenanceNotFound { id: id.to_string() })?;

    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(current.id.clone());

    let mut ancestors_root_last = Vec::new();
    let mut cursor = current.clone();

    while let Some(parent_id) = cursor.parent_id.clone() {
        if !visited.insert(parent_id.clone()) {
            return Err(ProvenanceError::ChainBroken {
                id: id.to_string(),
                reason: format!("cycle detected at {parent_id}"),
            }
            .into());
        }
        let parent = store.get_provenance(&parent_id).await?.ok_or_else(|| {
            ProvenanceError::ChainBroken {
                id: id.to_string(),
                reason: format!("missing parent {parent_id}"),
            }
        })?;
        ancestors_root_last.push(parent.clone());
        cursor = parent;
    }

    let root = ancestors_root_last.last().cloned().unwrap_or_else(|| current.clone());
    let is_complete = (ancestors_root_last.len() as i64 + 1) == current.chain_depth + 1;

    Ok(Chain {
        depth: current.chain_depth,
        path_kinds: current.chain_path.clone(),
        root,
        ancestors_root_last,
        current,
        is_complete,
    })
}

pub async fn children(store: &Store, parent_id: &str) -> anyhow::Result<Vec<Provenance>> {
    store.children_of(parent_id).await
}

pub async fn by_root(store: &Store, root_document_id: &str) -> anyhow::Result<Vec<Provenance>> {
    store.by_root(root_document_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn base_new(kind: Kind, parent: Option<Provenance>) -> NewRecord {
        NewRecord {
            kind,
            source_kind: SourceKind::File,
            source_path: None,
            parent,
            content_hash: "sha256:".to_string() + &"a".repeat(64),
            input_hash: None,
            file_hash: None,
            processor_name: "test".into(),
            processor_version: "1".into(),
            processing_params: BTreeMap::new(),
            processing_duration_ms: None,
            quality_score: None,
            agent_name: None,
            agent_version: None,
        }
    }

    #[test]
    fn document_is_self_rooted() {
        let rec = create(base_new(Kind::Document, None)).unwrap();
        assert_eq!(rec.chain_depth, 0);
        assert!(rec.parent_id.is_none());
        assert_eq!(rec.root_document_id, rec.id);
        assert_eq!(rec.chain_path, vec!["DOCUMENT".to_string()]);
    }

    #[test]
    fn chunk_requires_parent() {
        let err = create(base_new(Kind::Chunk, None)).unwrap_err();
        assert_eq!(err.category(), "validation_error");
    }

    #[test]
    fn chunk_depth_is_parent_plus_one() {
        let doc = create(base_new(Kind::Document, None)).unwrap();
        let ocr = create(base_new(Kind::OcrResult, Some(doc.clone()))).unwrap();
        let chunk = create(base_new(Kind::Chunk, Some(ocr.clone()))).unwrap();
        assert_eq!(ocr.chain_depth, 1);
        assert_eq!(chunk.chain_depth, 2);
        assert_eq!(chunk.root_document_id, doc.id);
        assert_eq!(chunk.parent_ids, vec![doc.id.clone(), ocr.id.clone()]);
        assert_eq!(
            chunk.chain_path,
            vec!["DOCUMENT".to_string(), "OCR_RESULT".to_string(), "CHUNK".to_string()]
        );
    }

    #[test]
    fn embedding_depth_follows_actual_parent() {
        let doc = create(base_new(Kind::Document, None)).unwrap();
        let ocr = create(base_new(Kind::OcrResult, Some(doc.clone()))).unwrap();
        let chunk = create(base_new(Kind::Chunk, Some(ocr.clone()))).unwrap();
        let chunk_embedding = create(base_new(Kind::Embedding, Some(chunk.clone()))).unwrap();
        assert_eq!(chunk_embedding.chain_depth, 3);

        let image = create(base_new(Kind::Image, Some(ocr.clone()))).unwrap();
        let vlm = create(base_new(Kind::VlmDescription, Some(image.clone()))).unwrap();
        let vlm_embedding = create(base_new(Kind::Embedding, Some(vlm.clone()))).unwrap();
        assert_eq!(vlm.chain_depth, 3);
        assert_eq!(vlm_embedding.chain_depth, 4);
    }

    #[test]
    fn root_kind_rejects_explicit_parent() {
        let doc = create(base_new(Kind::Document, None)).unwrap();
        let err = create(base_new(Kind::FormFill, Some(doc))).unwrap_err();
        assert_eq!(err.category(), "validation_error");
    }
}
