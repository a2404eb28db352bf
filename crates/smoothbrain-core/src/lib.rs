//! # SmoothBrain Core
//!
//! Runtime-free logic for SmoothBrain: the highlight source model, the
//! persisted card record, completion parsing, markup rendering, the
//! bounded undo log, and the card store abstraction.
//!
//! This crate contains no tokio, sqlx, or HTTP dependencies. The
//! `smoothbrain` app crate supplies the SQLite store, the remote
//! clients, and the sync engine that drives everything here.

pub mod card;
pub mod facts;
pub mod markup;
pub mod models;
pub mod store;
pub mod undo;
