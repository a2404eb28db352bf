//! Card materialization: one card per highlight, created at most once.
//!
//! The lookup-before-insert on the highlight key makes
//! [`get_or_create`] idempotent. An existing card is returned untouched,
//! so a question generated on an earlier run is never overwritten here.

use anyhow::Result;
use tracing::debug;

use smoothbrain_core::card::{Card, DeckId};
use smoothbrain_core::models::{Document, Highlight};

use crate::progress::ProgressSink;
use crate::sync::UndoScope;

/// Return the card for `highlight`, creating it if this is the first sighting.
///
/// New cards are persisted immediately in `pending` state.
pub async fn get_or_create(
    scope: &mut UndoScope<'_>,
    deck_id: DeckId,
    document: &Document,
    highlight: &Highlight,
) -> Result<(Card, bool)> {
    if let Some(existing) = scope.store().find_card(&highlight.key()).await? {
        return Ok((existing, false));
    }

    let card = Card::new_pending(document, highlight, deck_id);
    scope.create_card(&card).await?;
    Ok((card, true))
}

#[derive(Debug, Default)]
pub struct MaterializeOutcome {
    pub created: Vec<Card>,
    pub existing: usize,
    pub highlights_seen: usize,
    pub documents_done: usize,
    pub cancelled: bool,
}

/// Materialize every highlight of every document, in source order.
///
/// Cancellation is polled between documents.
pub async fn materialize_documents(
    scope: &mut UndoScope<'_>,
    deck_id: DeckId,
    documents: &[Document],
    progress: &dyn ProgressSink,
) -> Result<MaterializeOutcome> {
    let mut outcome = MaterializeOutcome::default();
    let total = documents.len();

    for (i, document) in documents.iter().enumerate() {
        if progress.is_cancelled() {
            outcome.cancelled = true;
            break;
        }

        for highlight in &document.highlights {
            outcome.highlights_seen += 1;
            let (card, created) = get_or_create(scope, deck_id, document, highlight).await?;
            if created {
                outcome.created.push(card);
            } else {
                outcome.existing += 1;
            }
        }

        outcome.documents_done += 1;
        debug!(
            user_book_id = document.user_book_id,
            highlights = document.highlights.len(),
            "document materialized"
        );
        progress.report(
            &format!("Creating cards for document {} of {}", i + 1, total),
            i + 1,
            total,
        );
    }

    Ok(outcome)
}
