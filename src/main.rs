//! # provctl
//!
//! CLI front end over [`provenance_store`]. Covers database lifecycle
//! (C12), integrity verification (C6), PROV-JSON/CSV/JSON export (C7),
//! and hybrid search (C11) — the operations that are fully self-contained.
//!
//! Ingest (C2-C10) is deliberately not wired up here: it needs an
//! OCR client, a VLM client, and an image extractor, all of which are
//! named external collaborators the core only consumes through narrow
//! traits (§1/§6) and never implements. A wrapper that has those
//! providers drives [`provenance_store::ingest::ingest_document`]
//! directly; `provctl` itself is not that wrapper.
//!
//! By convention a caller driving this binary as a subprocess (an MCP
//! wrapper, say) reserves stdout for its own structured output, so
//! diagnostics and warnings here go to stderr; only the command's actual
//! result (search hits, verification reports, exported documents) goes to
//! stdout.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use provenance_store::config::load_config;
use provenance_store::export::{self, ExportFormat, ExportScope};
use provenance_store::search::{self, SearchFilters, SearchMode, SearchRequest};
use provenance_store::session::Session;
use provenance_store::verify;

#[derive(Parser)]
#[command(name = "provctl", about = "Content-addressed provenance store", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "./config/provctl.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the set of databases under the configured storage root.
    Db {
        #[command(subcommand)]
        action: DbAction,
    },
    /// Re-derive and compare content hashes (§4.6).
    Verify {
        #[command(subcommand)]
        scope: VerifyScope,
    },
    /// Export the provenance graph.
    Export {
        /// `json`, `prov`, or `csv`.
        #[arg(long, default_value = "json")]
        format: String,
        /// Export one document's subtree instead of the whole database.
        #[arg(long)]
        document: Option<String>,
        /// Write to this path instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run a keyword, semantic, or hybrid search over the selected database.
    Search {
        query: String,
        /// `keyword`, `semantic`, or `hybrid`.
        #[arg(long, default_value = "keyword")]
        mode: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long, default_value_t = 0.5)]
        alpha: f64,
        #[arg(long)]
        section_path: Option<String>,
    },
}

#[derive(Subcommand)]
enum DbAction {
    /// Create a new, empty database.
    Create {
        name: String,
        #[arg(long)]
        select: bool,
    },
    /// Select a database as the process-wide current one.
    Select { name: String },
    /// List databases under the storage root.
    List,
    /// Delete a database file.
    Delete { name: String },
}

#[derive(Subcommand)]
enum VerifyScope {
    /// Verify a single provenance record's content hash.
    Record { provenance_id: String },
    /// Verify every record on a provenance chain from a record to its root.
    Chain { provenance_id: String },
    /// Sweep the whole database.
    Database,
}

fn search_mode(s: &str) -> Result<SearchMode> {
    Ok(match s {
        "keyword" => SearchMode::Keyword,
        "semantic" => SearchMode::Semantic,
        "hybrid" => SearchMode::Hybrid,
        other => bail!("unknown search mode '{other}' (expected keyword, semantic, or hybrid)"),
    })
}

fn export_format(s: &str) -> Result<ExportFormat> {
    Ok(match s {
        "json" => ExportFormat::Json,
        "prov" => ExportFormat::Prov,
        "csv" => ExportFormat::Csv,
        other => bail!("unknown export format '{other}' (expected json, prov, or csv)"),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    let mut session = Session::new(cfg);

    match cli.command {
        Commands::Db { action } => run_db(&mut session, action).await?,
        Commands::Verify { scope } => run_verify(&mut session, scope).await?,
        Commands::Export { format, document, output } => {
            run_export(&mut session, &format, document, output).await?
        }
        Commands::Search { query, mode, limit, alpha, section_path } => {
            run_search(&mut session, &query, &mode, limit, alpha, section_path).await?
        }
    }

    Ok(())
}

async fn run_db(session: &mut Session, action: DbAction) -> Result<()> {
    match action {
        DbAction::Create { name, select } => {
            session.create(&name, select).await?;
            println!("created {name}");
        }
        DbAction::Select { name } => {
            session.select(&name).await?;
            println!("selected {name}");
        }
        DbAction::List => {
            for name in session.list_databases()? {
                println!("{name}");
            }
        }
        DbAction::Delete { name } => {
            session.delete(&name)?;
            println!("deleted {name}");
        }
    }
    Ok(())
}

async fn run_verify(session: &mut Session, scope: VerifyScope) -> Result<()> {
    let (store, _) = session.require()?;
    match scope {
        VerifyScope::Record { provenance_id } => {
            let result = verify::verify_record(store, &provenance_id).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        VerifyScope::Chain { provenance_id } => {
            let result = verify::verify_chain(store, &provenance_id).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        VerifyScope::Database => {
            let result = verify::verify_database(store).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}

async fn run_export(
    session: &mut Session,
    format: &str,
    document: Option<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    let (store, _) = session.require()?;
    let format = export_format(format)?;
    let scope = match document {
        Some(id) => ExportScope::Document(id),
        None => ExportScope::All,
    };
    export::run_export(store, format, scope, output.as_deref()).await
}

async fn run_search(
    session: &mut Session,
    query: &str,
    mode: &str,
    limit: usize,
    alpha: f64,
    section_path: Option<String>,
) -> Result<()> {
    let config = session.config().clone();
    let (store, vector_index) = session.require()?;
    let mode = search_mode(mode)?;
    let worker_command = provenance_store::embedding::default_worker_command();

    let results = search::search(
        store,
        vector_index,
        &worker_command,
        &config,
        SearchRequest {
            mode,
            query,
            candidate_k_keyword: (limit * 4).max(40) as i64,
            candidate_k_vector: (limit * 4).max(40),
            final_limit: limit,
            hybrid_alpha: alpha,
            filters: SearchFilters { section_path, metadata: None, cluster_document_ids: None },
            pre_sanitized: false,
        },
    )
    .await?;

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
