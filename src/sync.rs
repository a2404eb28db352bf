//! The sync orchestrator.
//!
//! ```text
//! Idle → FetchingSource → MaterializingCards → DispatchingGeneration
//!      → Reconciling → Finalizing → Idle
//! ```
//!
//! One run at a time per engine: a second call while a run is active
//! fails with [`SyncError::AlreadyRunning`]. Every run opens an undo
//! checkpoint before fetching and merges it in `Finalizing` on every
//! exit path, so a whole sync undoes as one entry. Steps are folded into
//! the checkpoint every [`UNDO_MERGE_INTERVAL`] writes to keep it inside
//! the undo log's capacity.
//!
//! The watermark is written only after a run that returned without error
//! and materialized every fetched document. A run cancelled during
//! reconciliation still advances it: its pending cards are retried on
//! the next run regardless of the watermark.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use smoothbrain_core::card::{Card, CardState};
use smoothbrain_core::store::CardStore;
use smoothbrain_core::undo::{CheckpointId, UNDO_MERGE_INTERVAL};

use crate::completion::CompletionClient;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::SyncError;
use crate::fetch::{fetch_documents, filter_documents};
use crate::materialize::materialize_documents;
use crate::progress::ProgressSink;
use crate::readwise::ExportSource;
use crate::reconcile::reconcile;

/// Where the engine is in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    FetchingSource,
    MaterializingCards,
    DispatchingGeneration,
    Reconciling,
    Finalizing,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::FetchingSource => "fetching_source",
            Phase::MaterializingCards => "materializing_cards",
            Phase::DispatchingGeneration => "dispatching_generation",
            Phase::Reconciling => "reconciling",
            Phase::Finalizing => "finalizing",
        }
    }
}

/// An open undo checkpoint. All card writes of a run go through it.
pub struct UndoScope<'a> {
    store: &'a dyn CardStore,
    checkpoint: CheckpointId,
    steps: usize,
}

impl<'a> UndoScope<'a> {
    pub async fn open(store: &'a dyn CardStore, name: &str) -> Result<UndoScope<'a>> {
        let checkpoint = store.open_checkpoint(name).await?;
        Ok(Self {
            store,
            checkpoint,
            steps: 0,
        })
    }

    pub fn store(&self) -> &'a dyn CardStore {
        self.store
    }

    pub async fn create_card(&mut self, card: &Card) -> Result<()> {
        self.store.create_card(card).await?;
        self.after_step().await
    }

    /// Write `cards` as one step. An empty batch writes nothing.
    pub async fn update_cards(&mut self, cards: &[Card]) -> Result<()> {
        if cards.is_empty() {
            return Ok(());
        }
        self.store.update_cards(cards).await?;
        self.after_step().await
    }

    async fn after_step(&mut self) -> Result<()> {
        self.steps += 1;
        if self.steps >= UNDO_MERGE_INTERVAL {
            self.store.merge_checkpoint(self.checkpoint).await?;
            debug!(steps = self.steps, "folded undo steps into checkpoint");
            self.steps = 0;
        }
        Ok(())
    }

    /// Merge outstanding steps and close the checkpoint.
    pub async fn close(self) -> Result<()> {
        self.store.merge_checkpoint(self.checkpoint).await
    }
}

/// Rejects a second concurrent run.
#[derive(Default)]
struct RunGuard(AtomicBool);

struct RunToken<'a>(&'a AtomicBool);

impl RunGuard {
    fn try_acquire(&self) -> Option<RunToken<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunToken(&self.0))
    }
}

impl Drop for RunToken<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Ignore the watermark and fetch everything.
    pub full: bool,
    /// Process at most this many documents (after filtering).
    pub limit: Option<usize>,
    /// Also re-submit cards in the `failed` state.
    pub retry_failed: bool,
    /// Fetch and count only. No writes, watermark untouched.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub documents_fetched: usize,
    pub documents_kept: usize,
    pub highlights_seen: usize,
    pub cards_created: usize,
    pub cards_existing: usize,
    pub retried_failed: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub suspended: usize,
    pub failed: usize,
    pub left_pending: usize,
    pub cancelled: bool,
    pub dry_run: bool,
    pub new_watermark: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub deck_name: String,
    pub concurrency: usize,
    pub max_documents: Option<usize>,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            deck_name: config.sync.deck_name.clone(),
            concurrency: config.generation.concurrency,
            max_documents: config.sync.max_documents,
        }
    }
}

pub struct SyncEngine {
    store: Arc<dyn CardStore>,
    source: Arc<dyn ExportSource>,
    dispatcher: Dispatcher,
    settings: EngineSettings,
    guard: RunGuard,
    phase: Mutex<Phase>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn CardStore>,
        source: Arc<dyn ExportSource>,
        client: Arc<dyn CompletionClient>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            source,
            dispatcher: Dispatcher::new(client, settings.concurrency),
            settings,
            guard: RunGuard::default(),
            phase: Mutex::new(Phase::Idle),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase.lock().map(|p| *p).unwrap_or(Phase::Idle)
    }

    fn set_phase(&self, next: Phase) {
        if let Ok(mut phase) = self.phase.lock() {
            debug!(from = phase.as_str(), to = next.as_str(), "phase");
            *phase = next;
        }
    }

    /// Run one sync.
    pub async fn run(
        &self,
        options: &RunOptions,
        progress: &dyn ProgressSink,
    ) -> Result<SyncReport, SyncError> {
        let _token = self.guard.try_acquire().ok_or(SyncError::AlreadyRunning)?;
        let run_id = Uuid::new_v4();
        let span = info_span!("sync", %run_id);

        async {
            let mut report = SyncReport {
                run_id: run_id.to_string(),
                dry_run: options.dry_run,
                ..SyncReport::default()
            };

            let result = if options.dry_run {
                self.dry_run(options, progress, &mut report).await
            } else {
                self.run_with_checkpoint(options, progress, &mut report)
                    .await
            };
            self.set_phase(Phase::Idle);

            match result {
                Ok(()) => {
                    info!(
                        created = report.cards_created,
                        completed = report.completed,
                        suspended = report.suspended,
                        left_pending = report.left_pending,
                        cancelled = report.cancelled,
                        "sync finished"
                    );
                    Ok(report)
                }
                Err(e) => {
                    error!(error = ?e, "sync failed");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_with_checkpoint(
        &self,
        options: &RunOptions,
        progress: &dyn ProgressSink,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let mut scope = UndoScope::open(self.store.as_ref(), "Sync highlights").await?;

        let result = self.run_phases(options, progress, &mut scope, report).await;

        self.set_phase(Phase::Finalizing);
        let closed = scope.close().await;

        let watermark = match (result, closed) {
            (Err(e), Err(close_err)) => {
                error!(error = ?close_err, "could not close undo checkpoint after failure");
                return Err(e);
            }
            (Err(e), Ok(())) => return Err(e),
            (Ok(_), Err(close_err)) => return Err(SyncError::Store(close_err)),
            (Ok(watermark), Ok(())) => watermark,
        };

        if let Some(at) = watermark {
            self.store.save_watermark(at).await?;
            report.new_watermark = Some(at);
            debug!(watermark = %at, "watermark advanced");
        }
        Ok(())
    }

    /// Returns the watermark to persist, if the run earned one.
    async fn run_phases(
        &self,
        options: &RunOptions,
        progress: &dyn ProgressSink,
        scope: &mut UndoScope<'_>,
        report: &mut SyncReport,
    ) -> Result<Option<DateTime<Utc>>, SyncError> {
        self.set_phase(Phase::FetchingSource);
        progress.report("Fetching highlights", 0, 0);
        let (documents, started_at, truncated) = self.fetch(options, report).await?;

        self.set_phase(Phase::MaterializingCards);
        let deck_id = self.store.ensure_deck(&self.settings.deck_name).await?;
        let outcome = materialize_documents(scope, deck_id, &documents, progress).await?;
        report.highlights_seen = outcome.highlights_seen;
        report.cards_created = outcome.created.len();
        report.cards_existing = outcome.existing;

        if outcome.cancelled {
            report.cancelled = true;
            info!(
                documents_done = outcome.documents_done,
                "cancelled while materializing"
            );
            return Ok(None);
        }

        self.set_phase(Phase::DispatchingGeneration);
        if options.retry_failed {
            let mut failed = self.store.cards_in_state(CardState::Failed).await?;
            for card in &mut failed {
                card.reset_for_retry();
            }
            scope.update_cards(&failed).await?;
            report.retried_failed = failed.len();
        }

        let pending = self.store.cards_in_state(CardState::Pending).await?;
        report.dispatched = pending.len();
        info!(
            cards = report.dispatched,
            concurrency = self.dispatcher.concurrency(),
            "dispatching generation"
        );
        let in_flight = self.dispatcher.dispatch(pending);

        self.set_phase(Phase::Reconciling);
        let summary = reconcile(in_flight, scope, progress).await?;
        report.completed = summary.completed;
        report.suspended = summary.suspended;
        report.failed = summary.failed;
        report.left_pending = summary.left_pending;
        report.cancelled = summary.cancelled;

        Ok(if truncated { None } else { Some(started_at) })
    }

    /// Fetch, filter, and cap. Returns the documents, the fetch start
    /// time, and whether the cap dropped any.
    async fn fetch(
        &self,
        options: &RunOptions,
        report: &mut SyncReport,
    ) -> Result<(Vec<smoothbrain_core::models::Document>, DateTime<Utc>, bool), SyncError> {
        let watermark = if options.full {
            None
        } else {
            self.store.load_watermark().await?
        };

        let fetched = fetch_documents(self.source.as_ref(), watermark).await?;
        report.documents_fetched = fetched.documents.len();

        let mut documents = filter_documents(fetched.documents);
        let mut truncated = false;
        if let Some(limit) = options.limit.or(self.settings.max_documents) {
            truncated = documents.len() > limit;
            documents.truncate(limit);
        }
        report.documents_kept = documents.len();

        info!(
            fetched = report.documents_fetched,
            kept = report.documents_kept,
            since = ?watermark,
            "documents ready"
        );
        Ok((documents, fetched.started_at, truncated))
    }

    async fn dry_run(
        &self,
        options: &RunOptions,
        progress: &dyn ProgressSink,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        self.set_phase(Phase::FetchingSource);
        progress.report("Fetching highlights", 0, 0);
        let (documents, _, _) = self.fetch(options, report).await?;

        for document in &documents {
            for highlight in &document.highlights {
                report.highlights_seen += 1;
                if self.store.find_card(&highlight.key()).await?.is_some() {
                    report.cards_existing += 1;
                } else {
                    report.cards_created += 1;
                }
            }
        }
        report.dispatched =
            report.cards_created + self.store.cards_in_state(CardState::Pending).await?.len();
        if options.retry_failed {
            report.dispatched += self.store.cards_in_state(CardState::Failed).await?.len();
        }
        Ok(())
    }

    /// Re-run generation for one card, whatever its state.
    pub async fn regenerate(
        &self,
        highlight_id: &str,
        progress: &dyn ProgressSink,
    ) -> Result<Card, SyncError> {
        let _token = self.guard.try_acquire().ok_or(SyncError::AlreadyRunning)?;
        let span = info_span!("regenerate", highlight_id = %highlight_id);

        let result = self
            .regenerate_card(highlight_id, progress)
            .instrument(span)
            .await;
        self.set_phase(Phase::Idle);

        if let Err(e) = &result {
            error!(error = ?e, highlight_id, "regenerate failed");
        }
        result
    }

    async fn regenerate_card(
        &self,
        highlight_id: &str,
        progress: &dyn ProgressSink,
    ) -> Result<Card, SyncError> {
        let mut card = self
            .store
            .find_card(highlight_id)
            .await?
            .ok_or_else(|| SyncError::UnknownCard(highlight_id.to_string()))?;

        let mut scope = UndoScope::open(self.store.as_ref(), "Regenerate card").await?;

        self.set_phase(Phase::DispatchingGeneration);
        card.reset_for_retry();
        let staged = scope.update_cards(std::slice::from_ref(&card)).await;
        let result = match staged {
            Ok(()) => {
                let in_flight = self.dispatcher.dispatch(vec![card]);
                self.set_phase(Phase::Reconciling);
                reconcile(in_flight, &mut scope, progress).await.map(|_| ())
            }
            Err(e) => Err(SyncError::Store(e)),
        };

        self.set_phase(Phase::Finalizing);
        let closed = scope.close().await;
        result?;
        closed?;

        self.store
            .find_card(highlight_id)
            .await?
            .ok_or_else(|| SyncError::UnknownCard(highlight_id.to_string()))
    }
}
