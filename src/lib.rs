//! # SmoothBrain
//!
//! Turns read-it-later highlights into spaced-repetition flashcards.
//!
//! Each sync pulls documents changed since the last successful run from
//! the Readwise export API, creates one card per new highlight, asks a
//! language model for one question/answer pair per card with bounded
//! concurrency, and writes the results back to a local SQLite card store.
//! A whole run is one undo entry.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────┐   ┌──────────────┐   ┌───────────┐
//! │ Readwise │──▶│ fetch +     │──▶│ materialize  │──▶│  SQLite   │
//! │  export  │   │ filter      │   │ (pending)    │   │ card store│
//! └──────────┘   └─────────────┘   └──────┬───────┘   └─────▲─────┘
//!                                         ▼                 │
//!                                  ┌─────────────┐   ┌──────┴──────┐
//!                                  │  dispatch   │──▶│  reconcile  │
//!                                  │ (LLM, ≤ N)  │   │             │
//!                                  └─────────────┘   └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! smoothbrain init
//! smoothbrain sync
//! smoothbrain stats
//! smoothbrain export --output deck.tsv
//! smoothbrain undo
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`error`] | Typed errors for fetch, generation, and sync |
//! | [`readwise`] | Readwise export API client |
//! | [`fetch`] | Paginated fetch and document filtering |
//! | [`materialize`] | Idempotent card creation |
//! | [`completion`] | Prompting and the chat-completion client |
//! | [`dispatch`] | Bounded-concurrency request fan-out |
//! | [`reconcile`] | Applying generation results to cards |
//! | [`sync`] | The sync orchestrator |
//! | [`progress`] | Progress reporting and cancellation |
//! | [`sqlite_store`] | SQLite card store |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`stats`] | `smoothbrain stats` |
//! | [`export`] | Anki TSV export |
//!
//! The host-independent types (cards, facts, the undo log, the
//! [`CardStore`](smoothbrain_core::store::CardStore) trait) live in
//! `smoothbrain-core`.

pub mod completion;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod fetch;
pub mod logging;
pub mod materialize;
pub mod migrate;
pub mod progress;
pub mod readwise;
pub mod reconcile;
pub mod sqlite_store;
pub mod stats;
pub mod sync;
