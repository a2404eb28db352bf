//! Bounded undo log with named checkpoints.
//!
//! Every store mutation records an [`UndoEntry::Step`] holding the
//! operations needed to revert it. The log keeps at most
//! [`UNDO_CAPACITY`] entries and silently discards the oldest when that
//! is exceeded, so a long sync must fold its steps into its checkpoint
//! before the checkpoint itself falls off the front. The sync merges
//! every [`UNDO_MERGE_INTERVAL`] steps, which keeps
//! `checkpoint + steps <= UNDO_CAPACITY` at all times.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::card::Card;

/// Maximum number of entries retained.
pub const UNDO_CAPACITY: usize = 30;

/// Steps recorded after a checkpoint before they must be merged into it.
pub const UNDO_MERGE_INTERVAL: usize = UNDO_CAPACITY - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointId(pub u64);

/// A single reversible mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum UndoOp {
    /// A card was inserted; reverting deletes it.
    Created { highlight_id: String },
    /// A card was overwritten; reverting restores `before`.
    Updated { before: Box<Card> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UndoEntry {
    Checkpoint {
        id: CheckpointId,
        name: String,
        ops: Vec<UndoOp>,
    },
    Step {
        label: String,
        ops: Vec<UndoOp>,
    },
}

impl UndoEntry {
    pub fn label(&self) -> &str {
        match self {
            UndoEntry::Checkpoint { name, .. } => name,
            UndoEntry::Step { label, .. } => label,
        }
    }

    /// Operations in the order they were applied.
    pub fn ops(&self) -> &[UndoOp] {
        match self {
            UndoEntry::Checkpoint { ops, .. } | UndoEntry::Step { ops, .. } => ops,
        }
    }

    pub fn into_ops(self) -> Vec<UndoOp> {
        match self {
            UndoEntry::Checkpoint { ops, .. } | UndoEntry::Step { ops, .. } => ops,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UndoError {
    #[error("undo checkpoint {0:?} was discarded before it could be merged")]
    CheckpointDiscarded(CheckpointId),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UndoLog {
    entries: VecDeque<UndoEntry>,
    next_id: u64,
}

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Open a named checkpoint. Later steps can be folded into it with
    /// [`UndoLog::merge`].
    pub fn add_checkpoint(&mut self, name: impl Into<String>) -> CheckpointId {
        let id = CheckpointId(self.next_id);
        self.next_id += 1;
        self.push(UndoEntry::Checkpoint {
            id,
            name: name.into(),
            ops: Vec::new(),
        });
        id
    }

    /// Record one step. Steps without operations are not recorded.
    pub fn push_step(&mut self, label: impl Into<String>, ops: Vec<UndoOp>) {
        if ops.is_empty() {
            return;
        }
        self.push(UndoEntry::Step {
            label: label.into(),
            ops,
        });
    }

    fn push(&mut self, entry: UndoEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > UNDO_CAPACITY {
            self.entries.pop_front();
        }
    }

    fn position(&self, checkpoint: CheckpointId) -> Option<usize> {
        self.entries.iter().position(
            |e| matches!(e, UndoEntry::Checkpoint { id, .. } if *id == checkpoint),
        )
    }

    /// Number of entries recorded after `checkpoint`, or `None` if the
    /// checkpoint is no longer in the log.
    pub fn steps_since(&self, checkpoint: CheckpointId) -> Option<usize> {
        self.position(checkpoint)
            .map(|pos| self.entries.len() - pos - 1)
    }

    /// Fold every entry after `checkpoint` into it, leaving the
    /// checkpoint as the newest entry.
    pub fn merge(&mut self, checkpoint: CheckpointId) -> Result<(), UndoError> {
        let pos = self
            .position(checkpoint)
            .ok_or(UndoError::CheckpointDiscarded(checkpoint))?;

        let later: Vec<UndoEntry> = self.entries.drain(pos + 1..).collect();
        if let Some(UndoEntry::Checkpoint { ops, .. }) = self.entries.get_mut(pos) {
            for entry in later {
                ops.extend(entry.into_ops());
            }
        }
        Ok(())
    }

    /// Remove and return the newest entry.
    pub fn pop_last(&mut self) -> Option<UndoEntry> {
        self.entries.pop_back()
    }
}
