//! Storage abstraction for SmoothBrain.
//!
//! The [`CardStore`] trait covers everything the sync engine needs from
//! the host's persistence: card lookup by highlight key, card creation
//! and batched update, deck creation by name, the undo log with its
//! checkpoints, and the sync watermark.
//!
//! Every card mutation records exactly one undo step. Implementations
//! must be `Send + Sync`, but the engine only ever calls them from its
//! coordinating task.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::card::{Card, CardState, DeckId};
use crate::undo::CheckpointId;

/// What [`CardStore::undo_last`] reverted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UndoSummary {
    pub label: String,
    pub reverted_ops: usize,
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`ensure_deck`](CardStore::ensure_deck) | Get-or-create a deck by name |
/// | [`find_card`](CardStore::find_card) | Lookup-before-insert by highlight key |
/// | [`create_card`](CardStore::create_card) | Insert a new card |
/// | [`update_cards`](CardStore::update_cards) | Overwrite a batch of existing cards |
/// | [`open_checkpoint`](CardStore::open_checkpoint) | Start a named undo unit |
/// | [`merge_checkpoint`](CardStore::merge_checkpoint) | Fold later steps into the unit |
/// | [`undo_last`](CardStore::undo_last) | Revert the newest undo entry |
#[async_trait]
pub trait CardStore: Send + Sync {
    /// Return the id of the deck called `name`, creating it if needed.
    async fn ensure_deck(&self, name: &str) -> Result<DeckId>;

    async fn find_card(&self, highlight_id: &str) -> Result<Option<Card>>;

    /// Insert a new card. Fails if a card with the same key exists.
    async fn create_card(&self, card: &Card) -> Result<()>;

    /// Overwrite existing cards in one write, recorded as one undo step.
    async fn update_cards(&self, cards: &[Card]) -> Result<()>;

    /// Cards in `state`, in creation order.
    async fn cards_in_state(&self, state: CardState) -> Result<Vec<Card>>;

    /// Every card, in creation order.
    async fn all_cards(&self) -> Result<Vec<Card>>;

    async fn open_checkpoint(&self, name: &str) -> Result<CheckpointId>;

    async fn merge_checkpoint(&self, checkpoint: CheckpointId) -> Result<()>;

    /// Revert the newest undo entry. `None` when the log is empty.
    async fn undo_last(&self) -> Result<Option<UndoSummary>>;

    async fn load_watermark(&self) -> Result<Option<DateTime<Utc>>>;

    async fn save_watermark(&self, at: DateTime<Utc>) -> Result<()>;
}
