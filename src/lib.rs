//! # Drivelens
//!
//! **Caption, embed, and semantically search every image in a cloud-drive
//! folder.**
//!
//! Drivelens ingests a user-supplied drive folder URL, enumerates every
//! image in it (recursively), generates a rich caption plus a vector
//! embedding for each via an external multimodal model, and exposes a
//! low-latency semantic and lexical search surface over the corpus. A
//! durable job queue drives processing; a sync engine keeps the corpus
//! aligned with the upstream drive.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌──────────────┐   ┌───────────────┐   ┌──────────┐
//! │ Ingest  │──▶│ Job Queue    │──▶│ Folder/Image  │──▶│ Postgres │
//! │ (URL)   │   │ (durable)    │   │   Workers     │   │ +pgvector│
//! └─────────┘   └──────────────┘   └──────┬────────┘   └────┬─────┘
//!                                         │                 │
//!                         Drive API ◀─────┤            ┌────▼─────┐
//!                         Caption/Embed ◀─┘            │  Search  │
//!                         (rate-limited)               │ lex/sem  │
//!                                                      └──────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **ingest coordinator** ([`ingest`]) validates the URL, lists the
//!    drive folder, creates `pending` rows, and enqueues a folder job.
//! 2. The **folder worker** ([`folder_worker`]) fans pending images out into
//!    batch jobs of five.
//! 3. The **image worker** ([`image_worker`]) runs the hot path per image:
//!    download → caption → embed → one atomic `completed` write, all under
//!    the process-wide rate limiters ([`limiter`]).
//! 4. The **sync engine** ([`sync`]) diffs the drive against the corpus,
//!    inserting new images and removing deleted ones.
//! 5. The **search engine** ([`search`]) classifies queries as filename or
//!    semantic lookups and queries the store accordingly, degrading
//!    gracefully when the vector backend is absent.
//! 6. The **recovery supervisor** ([`recovery`]) sweeps every minute for
//!    stuck rows and stalled jobs.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Typed error taxonomy shared across transports |
//! | [`models`] | Core data types: folders, images, job payloads |
//! | [`limiter`] | Sliding-window + burst rate limiters |
//! | [`drive`] | Drive adapter: URL parsing, listing, downloads, thumbnails |
//! | [`caption`] | Caption/embedding adapter and prompt-output parsing |
//! | [`store`] | Storage trait; Postgres and in-memory backends |
//! | [`queue`] | Durable queue trait; Postgres and in-memory backends |
//! | [`folder_worker`] / [`image_worker`] | Job handlers |
//! | [`workers`] | Polling worker pool and job dispatch |
//! | [`sync`] | Drive ↔ corpus reconciliation |
//! | [`search`] | Lexical/semantic dispatch, caption cleanup |
//! | [`ingest`] | Submission entry point and per-folder caps |
//! | [`recovery`] | Periodic self-healing sweep and manual retry |
//! | [`progress`] | In-memory per-folder progress/ETA |
//! | [`thumbs`] | Bounded TTL cache for short-lived thumbnail URLs |
//! | [`server`] | JSON HTTP API (Axum) |
//! | [`app`] | Composition root |
//! | [`db`] | Postgres connection pool |
//! | [`migrate`] | Idempotent schema migrations |

pub mod app;
pub mod caption;
pub mod config;
pub mod db;
pub mod drive;
pub mod error;
pub mod folder_worker;
pub mod image_worker;
pub mod ingest;
pub mod limiter;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod queue;
pub mod recovery;
pub mod search;
pub mod server;
pub mod store;
pub mod sync;
pub mod thumbs;
pub mod workers;
