//! In-memory [`CardStore`] implementation for tests and dry runs.
//!
//! Cards live in a `Vec` behind `std::sync::RwLock`, which keeps
//! creation order for free. Lookups are linear; the store is meant for
//! fixtures of a few hundred cards at most.

use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::card::{Card, CardState, DeckId};
use crate::undo::{CheckpointId, UndoLog, UndoOp};

use super::{CardStore, UndoSummary};

#[derive(Default)]
struct Inner {
    decks: Vec<String>,
    cards: Vec<Card>,
    undo: UndoLog,
    watermark: Option<DateTime<Utc>>,
}

impl Inner {
    fn position(&self, highlight_id: &str) -> Option<usize> {
        self.cards.iter().position(|c| c.highlight_id == highlight_id)
    }

    fn revert(&mut self, op: UndoOp) {
        match op {
            UndoOp::Created { highlight_id } => {
                if let Some(pos) = self.position(&highlight_id) {
                    self.cards.remove(pos);
                }
            }
            UndoOp::Updated { before } => match self.position(&before.highlight_id) {
                Some(pos) => self.cards[pos] = *before,
                None => self.cards.push(*before),
            },
        }
    }
}

/// In-memory store for testing.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the undo log, for assertions.
    pub fn undo_log(&self) -> UndoLog {
        self.inner
            .read()
            .map(|inner| inner.undo.clone())
            .unwrap_or_default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

#[async_trait]
impl CardStore for InMemoryStore {
    async fn ensure_deck(&self, name: &str) -> Result<DeckId> {
        let mut inner = self.write()?;
        let idx = match inner.decks.iter().position(|d| d == name) {
            Some(idx) => idx,
            None => {
                inner.decks.push(name.to_string());
                inner.decks.len() - 1
            }
        };
        Ok(DeckId(idx as i64 + 1))
    }

    async fn find_card(&self, highlight_id: &str) -> Result<Option<Card>> {
        let inner = self.read()?;
        Ok(inner.position(highlight_id).map(|pos| inner.cards[pos].clone()))
    }

    async fn create_card(&self, card: &Card) -> Result<()> {
        let mut inner = self.write()?;
        if inner.position(&card.highlight_id).is_some() {
            bail!("card for highlight {} already exists", card.highlight_id);
        }
        inner.cards.push(card.clone());
        inner.undo.push_step(
            "Create card",
            vec![UndoOp::Created {
                highlight_id: card.highlight_id.clone(),
            }],
        );
        Ok(())
    }

    async fn update_cards(&self, cards: &[Card]) -> Result<()> {
        let mut inner = self.write()?;
        let mut ops = Vec::with_capacity(cards.len());
        for card in cards {
            let pos = inner
                .position(&card.highlight_id)
                .ok_or_else(|| anyhow!("no card for highlight {}", card.highlight_id))?;
            let before = std::mem::replace(&mut inner.cards[pos], card.clone());
            ops.push(UndoOp::Updated {
                before: Box::new(before),
            });
        }
        inner.undo.push_step("Update cards", ops);
        Ok(())
    }

    async fn cards_in_state(&self, state: CardState) -> Result<Vec<Card>> {
        let inner = self.read()?;
        Ok(inner
            .cards
            .iter()
            .filter(|c| c.state == state)
            .cloned()
            .collect())
    }

    async fn all_cards(&self) -> Result<Vec<Card>> {
        Ok(self.read()?.cards.clone())
    }

    async fn open_checkpoint(&self, name: &str) -> Result<CheckpointId> {
        Ok(self.write()?.undo.add_checkpoint(name))
    }

    async fn merge_checkpoint(&self, checkpoint: CheckpointId) -> Result<()> {
        self.write()?.undo.merge(checkpoint)?;
        Ok(())
    }

    async fn undo_last(&self) -> Result<Option<UndoSummary>> {
        let mut inner = self.write()?;
        let Some(entry) = inner.undo.pop_last() else {
            return Ok(None);
        };
        let label = entry.label().to_string();
        let ops = entry.into_ops();
        let reverted_ops = ops.len();
        for op in ops.into_iter().rev() {
            inner.revert(op);
        }
        Ok(Some(UndoSummary {
            label,
            reverted_ops,
        }))
    }

    async fn load_watermark(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read()?.watermark)
    }

    async fn save_watermark(&self, at: DateTime<Utc>) -> Result<()> {
        self.write()?.watermark = Some(at);
        Ok(())
    }
}
