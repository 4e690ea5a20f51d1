//! # provenance-store
//!
//! **A content-addressed provenance store for document-derivation
//! pipelines.**
//!
//! Every artifact a document-processing pipeline produces — the document
//! itself, an OCR pass over it, the chunks and images cut out of that OCR
//! output, the embeddings and VLM descriptions derived from those — gets
//! exactly one row in a shared provenance graph recording its content
//! hash, its parent, and its place in the derivation chain. The graph is
//! the thing this crate is for; everything else (chunking, embedding,
//! search) is built to keep it honest.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌───────────┐   ┌────────────┐
//! │ ingest   │──▶│ chunk   │──▶│ embedding  │──▶│  SQLite     │
//! │ OCR call │   │ images  │   │ vlm        │   │ FTS5 + vec  │
//! └──────────┘   └─────────┘   └───────────┘   └──────┬──────┘
//!                                                      │
//!                              ┌───────────────────────┤
//!                              ▼                       ▼
//!                        ┌───────────┐           ┌───────────┐
//!                        │  search   │           │  verify/  │
//!                        │ (C11)     │           │  export   │
//!                        └───────────┘           └───────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. [`ingest`] hashes an incoming file and creates its DOCUMENT
//!    provenance record (depth 0).
//! 2. The configured [`clients::OcrClient`] turns it into markdown; the
//!    result becomes an OCR_RESULT record (depth 1).
//! 3. [`chunk`] splits that markdown into atomic-region-respecting chunks
//!    and locates figure/table candidates; each becomes a CHUNK or IMAGE
//!    record (depth 2).
//! 4. [`embedding`] embeds chunks via a local subprocess worker; [`vlm`]
//!    describes images via the configured [`clients::VlmClient`] (depths
//!    3-4), deduplicating near-identical images through [`vlm`]'s
//!    zero-cost clone path.
//! 5. [`search`] serves keyword (FTS5/BM25), semantic (brute-force cosine
//!    kNN), and hybrid queries over the result.
//! 6. [`verify`] re-derives content hashes to catch tampering or bit rot;
//!    [`export`] serializes the graph as W3C PROV-JSON.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`env`] | Recognized environment variables (API keys, token limits) |
//! | [`error`] | Typed error taxonomy with machine-readable categories |
//! | [`hash`] | SHA-256 content hashing, `sha256:`-prefixed |
//! | [`models`] | Core data types: provenance records and entity tables |
//! | [`schema`] | Connection setup, pragma tuning, versioned migrations |
//! | [`store`] | CRUD over every entity table plus the provenance graph |
//! | [`provenance`] | Provenance record construction and chain walking |
//! | [`vector`] | Brute-force cosine-similarity vector index |
//! | [`chunk`] | Atomic-region-aware chunk pipeline and table extraction |
//! | [`clients`] | Consumed external interfaces: OCR, VLM, image extraction |
//! | [`embedding`] | Subprocess-based embedding orchestration |
//! | [`vlm`] | VLM description pipeline with relevance filtering and dedup |
//! | [`ingest`] | Full per-document pipeline orchestration |
//! | [`search`] | Keyword, semantic, and hybrid search with score normalization |
//! | [`session`] | Process-wide selected-database state |
//! | [`verify`] | Record, chain, and whole-database integrity verification |
//! | [`export`] | W3C PROV-JSON export |
//!
//! ## Configuration
//!
//! `provctl` is configured via a TOML file (default `config/provctl.toml`).
//! See [`config`] for all available options and [`config::load_config`] for
//! validation rules. Credentials and a small number of startup-fatal
//! tunables come from the environment instead — see [`env`].

pub mod chunk;
pub mod clients;
pub mod config;
pub mod embedding;
pub mod env;
pub mod error;
pub mod export;
pub mod hash;
pub mod ingest;
pub mod models;
pub mod provenance;
pub mod schema;
pub mod search;
pub mod session;
pub mod store;
pub mod vector;
pub mod verify;
pub mod vlm;
