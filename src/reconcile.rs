//! Fan-in of generation results onto cards.
//!
//! Results are consumed as they complete. Each one is parsed into facts
//! and applied to its card: the first fact completes it, no fact
//! suspends it. A failed request or a malformed completion marks that
//! card failed and ends the loop with an error, since either usually
//! means the prompt or the model regressed for every card, not just one.
//!
//! Whatever way the loop ends, every card touched so far is written in
//! one batch, which is one undo step.

use tracing::{error, info, warn};

use smoothbrain_core::card::Card;
use smoothbrain_core::facts::parse_facts;

use crate::dispatch::InFlight;
use crate::error::{GenerationError, SyncError};
use crate::progress::ProgressSink;
use crate::sync::UndoScope;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub processed: usize,
    pub completed: usize,
    pub suspended: usize,
    pub failed: usize,
    /// Results never collected: cancelled, aborted, or crashed.
    pub left_pending: usize,
    pub cancelled: bool,
}

/// Drain `in_flight`, apply results, and flush touched cards through `scope`.
pub async fn reconcile(
    mut in_flight: InFlight,
    scope: &mut UndoScope<'_>,
    progress: &dyn ProgressSink,
) -> Result<ReconcileSummary, SyncError> {
    let total = in_flight.total();
    let mut touched: Vec<Card> = Vec::new();
    let mut summary = ReconcileSummary::default();

    let outcome = drain(&mut in_flight, &mut touched, &mut summary, total, progress).await;

    if outcome.is_err() || summary.cancelled {
        in_flight.cancel_unscheduled();
    }
    summary.left_pending += in_flight.detach().len();

    let flushed = scope.update_cards(&touched).await;
    info!(
        processed = summary.processed,
        completed = summary.completed,
        suspended = summary.suspended,
        failed = summary.failed,
        left_pending = summary.left_pending,
        cancelled = summary.cancelled,
        "reconciliation finished"
    );

    match (outcome, flushed) {
        (Err(e), Err(flush_err)) => {
            error!(error = ?flush_err, "could not persist reconciled cards after failure");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), Err(flush_err)) => Err(SyncError::Store(flush_err)),
        (Ok(()), Ok(())) => Ok(summary),
    }
}

async fn drain(
    in_flight: &mut InFlight,
    touched: &mut Vec<Card>,
    summary: &mut ReconcileSummary,
    total: usize,
    progress: &dyn ProgressSink,
) -> Result<(), SyncError> {
    while let Some(joined) = in_flight.next().await {
        let (mut card, result) = joined?;

        match result {
            Ok(raw) => match parse_facts(&raw) {
                Ok(facts) => match facts.first() {
                    Some(fact) => {
                        card.complete(fact);
                        summary.completed += 1;
                    }
                    None => {
                        card.suspend();
                        summary.suspended += 1;
                    }
                },
                Err(source) => {
                    error!(
                        highlight_id = %card.highlight_id,
                        raw = %raw,
                        error = %source,
                        "malformed completion"
                    );
                    card.fail(source.to_string());
                    summary.failed += 1;
                    let highlight_id = card.highlight_id.clone();
                    touched.push(card);
                    return Err(SyncError::GenerationParse {
                        highlight_id,
                        raw,
                        source,
                    });
                }
            },
            Err(GenerationError::Cancelled) => {
                // Only reached when the caller cancelled the batch before
                // handing it over; the card was never sent and stays pending.
                summary.left_pending += 1;
                continue;
            }
            Err(source) => {
                warn!(highlight_id = %card.highlight_id, error = %source, "generation failed");
                card.fail(source.to_string());
                summary.failed += 1;
                let highlight_id = card.highlight_id.clone();
                touched.push(card);
                return Err(SyncError::GenerationService {
                    highlight_id,
                    source,
                });
            }
        }

        touched.push(card);
        summary.processed += 1;
        progress.report(
            &format!("Generating question {} of {}", summary.processed, total),
            summary.processed,
            total,
        );

        if progress.is_cancelled() {
            summary.cancelled = true;
            break;
        }
    }
    Ok(())
}
