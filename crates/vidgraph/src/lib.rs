//! # vidgraph
//!
//! **Upload-to-graph ingestion for video files.**
//!
//! An upload is streamed to content-addressed storage, its container headers
//! are read into a typed graph delta, and the delta is upserted into a
//! SQLite-backed property graph. Every upload is tracked by a job that moves
//! through `RECEIVED → STAGED → EXTRACTING → WRITING → COMPLETE` (or
//! `FAILED`).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌───────────┐   ┌─────────────┐
//! │  Upload  │──▶│ Extraction │──▶│   Graph   │──▶│   SQLite    │
//! │ Receiver │   │   Worker   │   │  Writer   │   │ graph_nodes │
//! └──────────┘   └────────────┘   └───────────┘   └─────────────┘
//!       ▲              driven by the Coordinator
//!  ┌────┴─────┐
//!  │ CLI/HTTP │
//!  └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite pool |
//! | [`migrate`] | Schema for jobs and the graph |
//! | [`receiver`] | Streaming, hashing, content-addressed staging |
//! | [`extraction`] | Media summary, delta mapping, deadline-bound worker |
//! | [`extractor_container`] | Built-in WebM/Matroska/MP4/AVI/Ogg header reader |
//! | [`extractor_ffprobe`] | Extractor backed by an external `ffprobe` |
//! | [`writer`] | Delta validation and conflict retry |
//! | [`sqlite_store`] | `GraphStore` over SQLite |
//! | [`sqlite_jobs`] | `JobStore` over SQLite |
//! | [`coordinator`] | Job state machine, retries, dedupe, cancellation |
//! | [`services`] | Component wiring from a `Config` |
//! | [`server`] | HTTP API |
//! | [`ingest_cmd`], [`query`] | CLI commands |
//!
//! Domain types, the error taxonomy and the store traits live in
//! [`vidgraph_core`].

pub mod config;
pub mod coordinator;
pub mod db;
pub mod extraction;
pub mod extractor_container;
pub mod extractor_ffprobe;
pub mod ingest_cmd;
pub mod migrate;
pub mod query;
pub mod receiver;
pub mod server;
pub mod services;
pub mod sqlite_jobs;
pub mod sqlite_store;
pub mod writer;
