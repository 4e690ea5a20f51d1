//! Provenance exporter (C7).
//!
//! Three formats (internal JSON, W3C PROV-JSON, CSV) over one of two
//! scopes: a single document's provenance subtree, or the whole database.
//! Grounded on the teacher's own `export.rs` for the atomic
//! write-then-rename file convention and the stdout-when-no-path fallback;
//! PROV-JSON and CSV are new, built in the same style.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};

use crate::models::Provenance;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Prov,
    Csv,
}

#[derive(Debug, Clone)]
pub enum ExportScope {
    Document(String),
    All,
}

/// Fetch the provenance set for a scope, ordered by chain_depth (the same
/// order `verify_database` sweeps in, so exports and verification agree on
/// record ordering).
async fn records_for_scope(store: &Store, scope: &ExportScope) -> Result<Vec<Provenance>> {
    let mut records = match scope {
        ExportScope::Document(root_document_id) => store.by_root(root_document_id).await?,
        ExportScope::All => store.all_provenance_by_depth().await?,
    };
    records.sort_by_key(|r| r.chain_depth);
    Ok(records)
}

fn scope_label(scope: &ExportScope) -> String {
    match scope {
        ExportScope::Document(id) => format!("document:{id}"),
        ExportScope::All => "database".to_string(),
    }
}

/// Export `scope` in `format`, writing to `output` if given or stdout
/// otherwise. Writes to a temp file alongside the target and renames into
/// place so a reader never observes a partial file.
pub async fn run_export(store: &Store, format: ExportFormat, scope: ExportScope, output: Option<&Path>) -> Result<()> {
    let records = records_for_scope(store, &scope).await?;
    let count = records.len();

    let rendered = match format {
        ExportFormat::Json => render_json(&scope, &records)?,
        ExportFormat::Prov => render_prov(&records)?,
        ExportFormat::Csv => render_csv(&records),
    };

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating export directory {}", parent.display()))?;
                }
            }
            let tmp_path = path.with_extension(format!(
                "{}.tmp",
                path.extension().and_then(|e| e.to_str()).unwrap_or("export")
            ));
            std::fs::write(&tmp_path, &rendered)
                .with_context(|| format!("writing export to {}", tmp_path.display()))?;
            std::fs::rename(&tmp_path, path)
                .with_context(|| format!("renaming export into place at {}", path.display()))?;
            eprintln!("Exported {} records ({}) to {}", count, scope_label(&scope), path.display());
        }
        None => {
            print!("{rendered}");
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct JsonHeader {
    format: &'static str,
    scope: String,
    count: usize,
    exported_at: String,
}

#[derive(Serialize)]
struct JsonExport {
    header: JsonHeader,
    records: Vec<Provenance>,
}

fn render_json(scope: &ExportScope, records: &[Provenance]) -> Result<String> {
    let export = JsonExport {
        header: JsonHeader {
            format: "internal",
            scope: scope_label(scope),
            count: records.len(),
            exported_at: chrono::Utc::now().to_rfc3339(),
        },
        records: records.to_vec(),
    };
    Ok(serde_json::to_string_pretty(&export)?)
}

/// W3C PROV-JSON: every provenance record is a prov:Entity; every
/// non-DOCUMENT record also produces a prov:Activity that generated it;
/// each distinct (processor_name, processor_version) pair becomes one
/// prov:SoftwareAgent.
fn render_prov(records: &[Provenance]) -> Result<String> {
    let mut entities = serde_json::Map::new();
    let mut activities = serde_json::Map::new();
    let mut agents: BTreeMap<String, ()> = BTreeMap::new();
    let mut was_derived_from = serde_json::Map::new();
    let mut was_generated_by = serde_json::Map::new();
    let mut was_attributed_to = serde_json::Map::new();

    for rec in records {
        let entity_id = format!("ocr:{}", rec.id);
        entities.insert(
            entity_id.clone(),
            json!({
                "prov:type": rec.kind.as_str(),
                "ocrp:contentHash": rec.content_hash,
                "ocrp:createdAt": rec.created_at.to_rfc3339(),
            }),
        );

        let agent_key = format!("{}@{}", rec.processor_name, rec.processor_version);
        let agent_id = format!("ocr:agent:{agent_key}");
        agents.insert(agent_id.clone(), ());
        was_attributed_to.insert(
            format!("_:attr{}", rec.id),
            json!({ "prov:entity": entity_id, "prov:agent": agent_id }),
        );

        if rec.kind != crate::models::Kind::Document {
            let activity_id = format!("ocr:activity:{}", rec.id);
            activities.insert(
                activity_id.clone(),
                json!({
                    "prov:type": rec.source_kind.as_str(),
                    "prov:startTime": rec.created_at.to_rfc3339(),
                    "prov:endTime": rec.processed_at.map(|t| t.to_rfc3339()),
                }),
            );
            was_generated_by.insert(
                format!("_:gen{}", rec.id),
                json!({ "prov:entity": entity_id, "prov:activity": activity_id }),
            );

            if let Some(parent_id) = &rec.parent_id {
                was_derived_from.insert(
                    format!("_:der{}", rec.id),
                    json!({
                        "prov:generatedEntity": entity_id,
                        "prov:usedEntity": format!("ocr:{parent_id}"),
                    }),
                );
            }
        }
    }

    let agent_entries: serde_json::Map<String, Value> = agents
        .keys()
        .map(|id| (id.clone(), json!({ "prov:type": "prov:SoftwareAgent" })))
        .collect();

    let doc = json!({
        "prefix": {
            "prov": "http://www.w3.org/ns/prov#",
            "ocr": "https://provenance-store.example/record/",
            "ocrp": "https://provenance-store.example/property/",
        },
        "entity": Value::Object(entities),
        "activity": Value::Object(activities),
        "agent": Value::Object(agent_entries),
        "wasDerivedFrom": Value::Object(was_derived_from),
        "wasGeneratedBy": Value::Object(was_generated_by),
        "wasAttributedTo": Value::Object(was_attributed_to),
    });

    Ok(serde_json::to_string_pretty(&doc)?)
}

const CSV_HEADER: &str = "id,kind,source_kind,parent_id,root_document_id,chain_depth,chain_path,content_hash,input_hash,file_hash,processor_name,processor_version,processing_params,processing_duration_ms,quality_score,created_at,processed_at,agent_name,agent_version,source_path,parent_ids";

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn render_csv(records: &[Provenance]) -> String {
    let mut out = String::new();
    out.push_str(CSV_HEADER);
    out.push('\n');

    for rec in records {
        let processing_params = serde_json::to_string(&rec.processing_params).unwrap_or_default();
        let fields: [String; 21] = [
            rec.id.clone(),
            rec.kind.as_str().to_string(),
            rec.source_kind.as_str().to_string(),
            rec.parent_id.clone().unwrap_or_default(),
            rec.root_document_id.clone(),
            rec.chain_depth.to_string(),
            rec.chain_path.join("|"),
            rec.content_hash.clone(),
            rec.input_hash.clone().unwrap_or_default(),
            rec.file_hash.clone().unwrap_or_default(),
            rec.processor_name.clone(),
            rec.processor_version.clone(),
            processing_params,
            rec.processing_duration_ms.map(|d| d.to_string()).unwrap_or_default(),
            rec.quality_score.map(|q| q.to_string()).unwrap_or_default(),
            rec.created_at.to_rfc3339(),
            rec.processed_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            rec.agent_name.clone().unwrap_or_default(),
            rec.agent_version.clone().unwrap_or_default(),
            rec.source_path.clone().unwrap_or_default(),
            rec.parent_ids.join("|"),
        ];
        out.push_str(&fields.iter().map(|f| csv_escape(f)).collect::<Vec<_>>().join(","));
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_escapes_commas_quotes_and_newlines() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("a\"b"), "\"a\"\"b\"");
        assert_eq!(csv_escape("a\nb"), "\"a\nb\"");
        assert_eq!(csv_escape("a\rb"), "\"a\rb\"");
    }

    #[test]
    fn csv_header_has_21_columns() {
        assert_eq!(CSV_HEADER.split(',').count(), 21);
    }

    #[test]
    fn scope_label_formats_document_and_all() {
        assert_eq!(scope_label(&ExportScope::All), "database");
        assert_eq!(scope_label(&ExportScope::Document("abc".to_string())), "document:abc");
    }
}
