//! # Trailblazer
//!
//! **A multi-source documentation ingestion and hybrid retrieval pipeline.**
//!
//! Trailblazer takes heterogeneous corpus inputs (a Confluence Cloud tenant,
//! a tree of DITA topics) already ingested and normalized into per-run
//! NDJSON artifacts, and advances them through a deterministic pipeline:
//!
//! ```text
//! ingest → normalize → enrich → chunk → embed → retrieve
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   ┌───────────────────┐   ┌───────────────┐
//! │ Run artifacts  │──▶│ enrich → chunk →  │──▶│  PostgreSQL    │
//! │ NDJSON per run │   │ preflight → embed │   │ pgvector + FTS │
//! └────────────────┘   └───────────────────┘   └───────┬───────┘
//!                                                      │
//!                                       ┌──────────────┴───┐
//!                                       │ hybrid retriever │
//!                                       │ dense+BM25+RRF   │
//!                                       └──────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. Source adapters write `normalize/normalized.ndjson` for a run and
//!    register the run in the `processed_runs` backlog ([`backlog`]).
//! 2. The **enricher** ([`enrich`]) adds deterministic rule-based metadata
//!    and a fingerprint per document.
//! 3. The **chunker** ([`chunk`]) splits Markdown into token-bounded chunks
//!    aligned to heading/paragraph boundaries; fenced code stays atomic.
//! 4. The **preflight validator** ([`preflight`]) certifies a run is ready
//!    to embed, or explains why it is blocked.
//! 5. The **embed loader** ([`embed_loader`]) upserts documents/chunks and
//!    vectors via an [`provider::EmbeddingProvider`], guarded by the
//!    [`manifest`] diff so unchanged runs are skipped.
//! 6. The **hybrid retriever** ([`retrieve`]) fuses dense pgvector search
//!    with BM25 by Reciprocal Rank Fusion, applies domain boosts, and packs
//!    the top hits into a context budget ([`pack`]).
//!
//! Workers coordinate over the backlog with `FOR UPDATE SKIP LOCKED`
//! claims ([`backlog`], [`pipeline`]); every phase reports through the
//! NDJSON event stream ([`events`]).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Artifact line shapes: normalized/enriched docs, chunks |
//! | [`artifacts`] | Run ids, phase directories, NDJSON streaming, hashing |
//! | [`events`] | Canonical NDJSON event stream with rotation |
//! | [`enrich`] | Rule-based enrichment, quality gating, fingerprints |
//! | [`chunk`] | Deterministic token-bounded chunker |
//! | [`manifest`] | Embed manifest and change-reason diffing |
//! | [`preflight`] | Per-run and plan-level embed readiness checks |
//! | [`provider`] | Embedding provider trait + dummy/remote impls |
//! | [`db`] | PostgreSQL pool management |
//! | [`migrate`] | Idempotent schema migrations |
//! | [`embed_loader`] | Document/chunk/embedding upserts with batching |
//! | [`backlog`] | Claim/mark worker coordination over processed runs |
//! | [`pipeline`] | Parallel worker pool draining the backlog |
//! | [`classify`] | Domain query detection and expansion |
//! | [`retrieve`] | Hybrid dense+BM25 retrieval with RRF and boosts |
//! | [`pack`] | Character-budgeted context packing |

pub mod artifacts;
pub mod backlog;
pub mod chunk;
pub mod classify;
pub mod config;
pub mod db;
pub mod embed_loader;
pub mod enrich;
pub mod events;
pub mod manifest;
pub mod migrate;
pub mod models;
pub mod pack;
pub mod pipeline;
pub mod preflight;
pub mod provider;
pub mod retrieve;
