//! Embedding orchestrator (C9).
//!
//! The teacher embeds texts in-process through an `EmbeddingProvider` trait
//! that dispatches to an HTTP API (`embed_texts`/`embed_query` over
//! `OpenAIProvider`). There is no HTTP provider here: local inference runs
//! in a subprocess worker invoked per call, per the contract in §4.9/§6 —
//! a JSON array on stdin, CLI flags for batch size/device, and a JSON result
//! object scanned for on stdout. The batching/dispatch shape
//! (`embed_texts` over many, `embed_query` over one) is kept from the
//! teacher; only the transport underneath changes.
//!
//! The worker's own executable path isn't one of §6's enumerated
//! configuration keys, so it is resolved the way a sibling tool would be:
//! from `EMBEDDING_WORKER_PATH` if set, else the bare name `embedding-worker`
//! looked up on `PATH` (documented in DESIGN.md).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use sqlx::{Sqlite, Transaction};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::Config;
use crate::error::ProvenanceError;
use crate::hash::hash_text;
use crate::models::{Chunk, Document, Embedding, EmbeddingStatus, Kind, SourceKind, TaskType};
use crate::provenance::{self, NewRecord};
use crate::schema::VECTOR_DIM;
use crate::store::Store;
use crate::vector;

const SUB_BATCH_SIZE: usize = 100;
const VECTOR_FLUSH_THRESHOLD: usize = 50;
const WORKER_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const KILL_GRACE: Duration = Duration::from_secs(5);
const STDERR_CAP: usize = 10 * 1024;

/// Resolve the embedding worker executable. Not part of the §6 config
/// surface since it names a local binary rather than a tunable; an
/// environment override keeps it out of the TOML config file entirely.
pub fn default_worker_command() -> PathBuf {
    std::env::var_os("EMBEDDING_WORKER_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("embedding-worker"))
}

#[derive(Debug, Deserialize)]
struct WorkerResult {
    success: bool,
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    device: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
}

/// Scan stdout lines from last to first for a line that parses as a
/// [`WorkerResult`], tolerating prelude noise (e.g. a framework's warmup
/// banner printed to stdout ahead of the JSON result).
fn parse_worker_output(stdout: &str) -> Result<WorkerResult, ProvenanceError> {
    for line in stdout.lines().rev() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Ok(result) = serde_json::from_str::<WorkerResult>(trimmed) {
            return Ok(result);
        }
    }
    Err(ProvenanceError::EmbeddingFailed {
        message: "embedding worker produced no parseable JSON result".to_string(),
    })
}

fn classify_failure(result: Option<&WorkerResult>, stderr_tail: &str) -> ProvenanceError {
    match result.and_then(|r| r.error_type.as_deref()) {
        Some("gpu_not_available") => ProvenanceError::GpuNotAvailable {
            message: result.and_then(|r| r.error.clone()).unwrap_or_else(|| stderr_tail.to_string()),
        },
        Some("model_not_found") => ProvenanceError::EmbeddingModelError {
            message: result.and_then(|r| r.error.clone()).unwrap_or_else(|| stderr_tail.to_string()),
        },
        _ => ProvenanceError::EmbeddingFailed {
            message: result
                .and_then(|r| r.error.clone())
                .unwrap_or_else(|| stderr_tail.to_string()),
        },
    }
}

fn send_sigterm(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

/// Spawn the worker, write `stdin_payload` (if any) and close the pipe,
/// then collect stdout/stderr while waiting on exit. On timeout, escalates
/// SIGTERM → 5s grace → SIGKILL rather than leaving the process to rot
/// (§9 "subprocess lifecycle → scoped acquisition").
async fn run_worker(
    command: &Path,
    args: &[String],
    stdin_payload: Option<&[u8]>,
) -> Result<(std::process::ExitStatus, Vec<u8>, Vec<u8>), ProvenanceError> {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdin(if stdin_payload.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| ProvenanceError::EmbeddingFailed {
        message: format!("spawning embedding worker {}: {e}", command.display()),
    })?;

    if let Some(payload) = stdin_payload {
        let mut stdin = child.stdin.take().expect("stdin piped");
        stdin.write_all(payload).await.map_err(|e| ProvenanceError::EmbeddingFailed {
            message: format!("writing embedding worker stdin: {e}"),
        })?;
        drop(stdin);
    }

    let mut stdout = child.stdout.take().expect("stdout piped");
    let mut stderr = child.stderr.take().expect("stderr piped");

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match stderr.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let remaining = STDERR_CAP.saturating_sub(buf.len());
                    if remaining > 0 {
                        buf.extend_from_slice(&chunk[..n.min(remaining)]);
                    }
                }
            }
        }
        buf
    });

    let status = match timeout(WORKER_TIMEOUT, child.wait()).await {
        Ok(result) => result.map_err(|e| ProvenanceError::EmbeddingFailed {
            message: format!("waiting on embedding worker: {e}"),
        })?,
        Err(_elapsed) => {
            if let Some(pid) = child.id() {
                send_sigterm(pid);
            }
            match timeout(KILL_GRACE, child.wait()).await {
                Ok(result) => result.map_err(|e| ProvenanceError::EmbeddingFailed {
                    message: format!("waiting on embedding worker after SIGTERM: {e}"),
                })?,
                Err(_elapsed) => {
                    let _ = child.start_kill();
                    child.wait().await.map_err(|e| ProvenanceError::EmbeddingFailed {
                        message: format!("waiting on embedding worker after SIGKILL: {e}"),
                    })?
                }
            }
        }
    };

    let stdout_buf = stdout_task.await.unwrap_or_default();
    let stderr_buf = stderr_task.await.unwrap_or_default();
    Ok((status, stdout_buf, stderr_buf))
}

fn batch_args(cfg: &Config) -> Vec<String> {
    let mut args = vec![
        "--stdin".to_string(),
        "--batch-size".to_string(),
        cfg.embedding_batch_size.to_string(),
        "--json".to_string(),
    ];
    if let Some(device) = &cfg.embedding_device {
        args.push("--device".to_string());
        args.push(device.clone());
    }
    args
}

async fn invoke_batch(
    command: &Path,
    cfg: &Config,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, ProvenanceError> {
    let payload = serde_json::to_vec(texts)
        .map_err(|e| ProvenanceError::internal(format!("serializing worker input: {e}")))?;

    let (status, stdout, stderr) = run_worker(command, &batch_args(cfg), Some(&payload)).await?;
    let stdout_text = String::from_utf8_lossy(&stdout);
    let stderr_text = String::from_utf8_lossy(&stderr);

    let parsed = parse_worker_output(&stdout_text);
    if !status.success() {
        return Err(classify_failure(parsed.ok().as_ref(), &stderr_text));
    }
    let result = parsed?;
    if !result.success {
        return Err(classify_failure(Some(&result), &stderr_text));
    }

    for v in &result.embeddings {
        if v.len() != VECTOR_DIM {
            return Err(ProvenanceError::EmbeddingFailed {
                message: format!(
                    "embedding worker returned a vector of dimension {}, expected {VECTOR_DIM}",
                    v.len()
                ),
            });
        }
    }
    Ok(result.embeddings)
}

/// Embed a batch of texts, sub-batching at [`SUB_BATCH_SIZE`] so a single
/// worker invocation never handles more than 100 inputs. Empty input never
/// invokes the worker (§8 boundary behavior).
pub async fn embed_texts(
    command: &Path,
    cfg: &Config,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, ProvenanceError> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    let mut out = Vec::with_capacity(texts.len());
    for sub_batch in texts.chunks(SUB_BATCH_SIZE) {
        let vectors = invoke_batch(command, cfg, sub_batch).await?;
        if vectors.len() != sub_batch.len() {
            return Err(ProvenanceError::EmbeddingFailed {
                message: format!(
                    "embedding worker returned {} vectors for {} inputs",
                    vectors.len(),
                    sub_batch.len()
                ),
            });
        }
        out.extend(vectors);
    }
    Ok(out)
}

/// Embed a single query string. Whitespace-only input fails fast with
/// `embedding_failed` rather than invoking the worker on nothing.
pub async fn embed_query(command: &Path, cfg: &Config, text: &str) -> Result<Vec<f32>, ProvenanceError> {
    if text.trim().is_empty() {
        return Err(ProvenanceError::EmbeddingFailed {
            message: "query text is empty".to_string(),
        });
    }

    let mut args = vec!["--query".to_string(), text.to_string(), "--json".to_string()];
    if let Some(device) = &cfg.embedding_device {
        args.push("--device".to_string());
        args.push(device.clone());
    }

    let (status, stdout, stderr) = run_worker(command, &args, None).await?;
    let stdout_text = String::from_utf8_lossy(&stdout);
    let stderr_text = String::from_utf8_lossy(&stderr);

    let parsed = parse_worker_output(&stdout_text);
    if !status.success() {
        return Err(classify_failure(parsed.ok().as_ref(), &stderr_text));
    }
    let result = parsed?;
    if !result.success {
        return Err(classify_failure(Some(&result), &stderr_text));
    }

    let vec = result
        .embeddings
        .into_iter()
        .next()
        .ok_or_else(|| ProvenanceError::EmbeddingFailed {
            message: "embedding worker returned no vector for query".to_string(),
        })?;
    if vec.len() != VECTOR_DIM {
        return Err(ProvenanceError::EmbeddingFailed {
            message: format!("query vector has dimension {}, expected {VECTOR_DIM}", vec.len()),
        });
    }
    Ok(vec)
}

/// The worker never reports a model identity (§4.9's result fields are
/// success/embeddings/count/elapsed_ms/device only), so `model_name` and
/// `model_version` are derived from the worker binary itself rather than
/// invented out of nothing — see DESIGN.md.
pub(crate) fn model_identity(command: &Path) -> (String, String) {
    let name = command
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "embedding-worker".to_string());
    (name, "1".to_string())
}

fn section_aware_input(chunk: &Chunk) -> String {
    let mut text = String::new();
    if let Some(path) = &chunk.section.section_path {
        text.push_str(&format!("[Section: {path}] "));
    } else if let Some(heading) = &chunk.section.heading_context {
        text.push_str(&format!("[Heading: {heading}] "));
    }
    if chunk.section.content_types.iter().any(|t| t == "table") {
        text.push_str("[Table] ");
    }
    if chunk.section.content_types.iter().any(|t| t == "code") {
        text.push_str("[Code] ");
    }
    text.push_str(&chunk.text);
    text
}

/// Embed every chunk in `chunks`, one batched worker call, then persist
/// EMBEDDING provenance + rows + vectors inside a single transaction
/// (§4.9). A count mismatch between the worker's output and the chunk
/// list fails the whole batch before any row is written.
pub async fn embed_chunks(
    store: &Store,
    command: &Path,
    cfg: &Config,
    document: &Document,
    chunks: &[Chunk],
) -> anyhow::Result<Vec<Embedding>> {
    if chunks.is_empty() {
        return Ok(Vec::new());
    }

    let inputs: Vec<String> = chunks.iter().map(section_aware_input).collect();
    let device = cfg.embedding_device.clone().unwrap_or_else(|| "auto".to_string());
    let (model_name, model_version) = model_identity(command);
    let vectors = embed_texts(command, cfg, &inputs).await?;
    if vectors.len() != chunks.len() {
        return Err(ProvenanceError::EmbeddingFailed {
            message: format!(
                "embedding worker returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            ),
        }
        .into());
    }

    let total_chunks = chunks.len() as i64;
    let chunk_provenance = lookup_chunk_provenance(store, chunks).await?;

    let result = store
        .transaction(move |tx| {
            Box::pin(async move {
                persist_chunk_embeddings(
                    tx,
                    chunks,
                    &vectors,
                    &chunk_provenance,
                    document,
                    total_chunks,
                    &model_name,
                    &model_version,
                    &device,
                )
                .await
            })
        })
        .await?;

    Ok(result)
}

/// Provenance rows for each chunk, fetched up front so the write
/// transaction never awaits I/O other than the database itself (§9
/// "async coroutines → task handles + sync transactions").
async fn lookup_chunk_provenance(
    store: &Store,
    chunks: &[Chunk],
) -> anyhow::Result<Vec<crate::models::Provenance>> {
    let mut out = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let prov = store
            .get_provenance(&chunk.provenance_id)
            .await?
            .ok_or_else(|| ProvenanceError::ProvenanceNotFound { id: chunk.provenance_id.clone() })?;
        out.push(prov);
    }
    Ok(out)
}

#[allow(clippy::too_many_arguments)]
async fn persist_chunk_embeddings(
    tx: &mut Transaction<'_, Sqlite>,
    chunks: &[Chunk],
    vectors: &[Vec<f32>],
    chunk_provenance: &[crate::models::Provenance],
    document: &Document,
    total_chunks: i64,
    model_name: &str,
    model_version: &str,
    device: &str,
) -> anyhow::Result<Vec<Embedding>> {
    let mut produced = Vec::with_capacity(chunks.len());
    let mut pending_vectors: Vec<(String, Vec<f32>)> = Vec::with_capacity(VECTOR_FLUSH_THRESHOLD);

    for ((chunk, vector), chunk_prov) in chunks.iter().zip(vectors.iter()).zip(chunk_provenance.iter()) {
        let content_hash = hash_text(chunk.text.as_bytes());
        let prov = provenance::create(NewRecord {
            kind: Kind::Embedding,
            source_kind: SourceKind::Embedding,
            source_path: None,
            parent: Some(chunk_prov.clone()),
            content_hash: content_hash.clone(),
            input_hash: Some(chunk.text_hash.clone()),
            file_hash: Some(document.file_hash.clone()),
            processor_name: model_name.to_string(),
            processor_version: model_version.to_string(),
            processing_params: Default::default(),
            processing_duration_ms: None,
            quality_score: None,
            agent_name: None,
            agent_version: None,
        })?;
        Store::insert_provenance(tx, &prov).await?;

        let embedding = Embedding {
            id: Uuid::new_v4().to_string(),
            provenance_id: prov.id.clone(),
            chunk_id: Some(chunk.id.clone()),
            image_id: None,
            extraction_id: None,
            original_text: chunk.text.clone(),
            source_file_path: document.file_path.clone(),
            source_file_name: document.file_name.clone(),
            source_file_hash: document.file_hash.clone(),
            page_number: chunk.page_number,
            character_start: Some(chunk.character_start),
            character_end: Some(chunk.character_end),
            chunk_index: Some(chunk.chunk_index),
            total_chunks: Some(total_chunks),
            model_name: model_name.to_string(),
            model_version: model_version.to_string(),
            task_type: TaskType::SearchDocument,
            inference_mode: "local".to_string(),
            device: device.to_string(),
            content_hash,
            created_at: Utc::now(),
        };
        Store::insert_embedding(tx, &embedding).await?;

        pending_vectors.push((embedding.id.clone(), vector.clone()));
        if pending_vectors.len() >= VECTOR_FLUSH_THRESHOLD {
            flush_vectors(tx, &mut pending_vectors).await?;
        }

        Store::update_chunk_embedding_status(tx, &chunk.id, EmbeddingStatus::Complete).await?;
        produced.push(embedding);
    }

    flush_vectors(tx, &mut pending_vectors).await?;
    Ok(produced)
}

async fn flush_vectors(
    tx: &mut Transaction<'_, Sqlite>,
    pending: &mut Vec<(String, Vec<f32>)>,
) -> anyhow::Result<()> {
    for (id, vec) in pending.drain(..) {
        vector::store_tx(tx, &id, &vec).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_worker_output_skips_prelude_noise() {
        let stdout = "Loading model...\nwarming up\n{\"success\": true, \"embeddings\": [[1.0, 2.0]], \"device\": \"cpu\"}\n";
        let result = parse_worker_output(stdout).unwrap();
        assert!(result.success);
        assert_eq!(result.embeddings, vec![vec![1.0, 2.0]]);
    }

    #[test]
    fn parse_worker_output_rejects_pure_noise() {
        let err = parse_worker_output("not json\nstill not json\n").unwrap_err();
        assert_eq!(err.category(), "embedding_failed");
    }

    #[test]
    fn classify_failure_maps_gpu_not_available() {
        let result = WorkerResult {
            success: false,
            embeddings: vec![],
            device: None,
            error: Some("no CUDA device".to_string()),
            error_type: Some("gpu_not_available".to_string()),
        };
        let err = classify_failure(Some(&result), "");
        assert_eq!(err.category(), "gpu_not_available");
    }

    #[test]
    fn classify_failure_defaults_to_embedding_failed() {
        let err = classify_failure(None, "some stderr tail");
        assert_eq!(err.category(), "embedding_failed");
    }

    #[test]
    fn section_aware_input_prefers_section_path_over_heading() {
        let mut chunk = test_chunk();
        chunk.section.section_path = Some("1.2 Methods".to_string());
        chunk.section.heading_context = Some("Methods".to_string());
        let text = section_aware_input(&chunk);
        assert!(text.starts_with("[Section: 1.2 Methods] "));
    }

    #[test]
    fn section_aware_input_tags_tables() {
        let mut chunk = test_chunk();
        chunk.section.content_types = vec!["table".to_string()];
        let text = section_aware_input(&chunk);
        assert!(text.contains("[Table]"));
    }

    fn test_chunk() -> Chunk {
        Chunk {
            id: "c1".to_string(),
            document_id: "d1".to_string(),
            provenance_id: "p1".to_string(),
            text: "hello world".to_string(),
            text_hash: hash_text(b"hello world"),
            chunk_index: 0,
            character_start: 0,
            character_end: 11,
            page_number: Some(1),
            page_range: None,
            overlap_previous: 0,
            overlap_next: 0,
            embedding_status: EmbeddingStatus::Pending,
            section: crate::models::SectionMetadata::default(),
            created_at: Utc::now(),
        }
    }
}
