//! End-to-end sync runs against an in-memory store and scripted services.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use smoothbrain::completion::{CompletionClient, GenerationContext};
use smoothbrain::error::{FetchError, GenerationError, SyncError};
use smoothbrain::progress::{CancelFlag, NoProgress, ProgressSink};
use smoothbrain::readwise::{ExportPage, ExportSource};
use smoothbrain::sync::{EngineSettings, RunOptions, SyncEngine};
use smoothbrain_core::card::CardState;
use smoothbrain_core::models::Document;
use smoothbrain_core::store::memory::InMemoryStore;
use smoothbrain_core::store::CardStore;

// ============ Fakes ============

/// Serves stored documents two per page, honouring `updated_after`
/// strictly the way the export API does.
#[derive(Default)]
struct FakeSource {
    docs: Mutex<Vec<(DateTime<Utc>, Document)>>,
    seen_watermarks: Mutex<Vec<Option<DateTime<Utc>>>>,
    failing: AtomicBool,
}

impl FakeSource {
    fn add(&self, doc: Document) {
        self.docs.lock().unwrap().push((Utc::now(), doc));
    }

    fn last_watermark(&self) -> Option<DateTime<Utc>> {
        self.seen_watermarks.lock().unwrap().last().copied().flatten()
    }
}

#[async_trait]
impl ExportSource for FakeSource {
    async fn export_page(
        &self,
        updated_after: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<ExportPage, FetchError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(FetchError::Status {
                status: 503,
                body: "maintenance".to_string(),
            });
        }
        if cursor.is_none() {
            self.seen_watermarks.lock().unwrap().push(updated_after);
        }

        let visible: Vec<Document> = self
            .docs
            .lock()
            .unwrap()
            .iter()
            .filter(|(at, _)| updated_after.map_or(true, |w| *at > w))
            .map(|(_, d)| d.clone())
            .collect();

        let start: usize = cursor.map_or(0, |c| c.parse().unwrap());
        let end = (start + 2).min(visible.len());
        Ok(ExportPage {
            results: visible[start..end].to_vec(),
            next_page_cursor: (end < visible.len()).then(|| end.to_string()),
        })
    }
}

/// Replies per highlight text. Unscripted text gets a generic fact.
#[derive(Default)]
struct ScriptedClient {
    replies: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedClient {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn reply(&self, text: &str, reply: &str) {
        self.replies
            .lock()
            .unwrap()
            .insert(text.to_string(), reply.to_string());
    }

    fn fail_on(&self, text: &str) {
        self.failing.lock().unwrap().insert(text.to_string());
    }

    fn panic_on(&self, text: &str) {
        self.panicking.lock().unwrap().insert(text.to_string());
    }

    fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn generate(
        &self,
        prompt: &str,
        _context: &GenerationContext,
    ) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let crash = self.panicking.lock().unwrap().contains(prompt);
        if crash {
            panic!("completion client crashed on {:?}", prompt);
        }
        if self.failing.lock().unwrap().contains(prompt) {
            return Err(GenerationError::Status {
                status: 400,
                body: "context length exceeded".to_string(),
            });
        }
        let scripted = self.replies.lock().unwrap().get(prompt).cloned();
        Ok(scripted.unwrap_or_else(|| {
            json!([{ "question": format!("What does this say: {}?", prompt), "answer": prompt }])
                .to_string()
        }))
    }
}

/// Cancels once `after` generation results have been reported.
struct CancelAfter {
    after: usize,
    seen: AtomicUsize,
    flag: CancelFlag,
}

impl ProgressSink for CancelAfter {
    fn report(&self, message: &str, _completed: usize, _total: usize) {
        if message.starts_with("Generating") {
            let seen = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
            if seen >= self.after {
                self.flag.cancel();
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.flag.is_cancelled()
    }
}

// ============ Helpers ============

struct Harness {
    store: Arc<InMemoryStore>,
    source: Arc<FakeSource>,
    client: Arc<ScriptedClient>,
    engine: SyncEngine,
}

fn harness_with(client: ScriptedClient, concurrency: usize) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let source = Arc::new(FakeSource::default());
    let client = Arc::new(client);
    let engine = SyncEngine::new(
        store.clone(),
        source.clone(),
        client.clone(),
        EngineSettings {
            deck_name: "SmoothBrain".to_string(),
            concurrency,
            max_documents: None,
        },
    );
    Harness {
        store,
        source,
        client,
        engine,
    }
}

fn harness() -> Harness {
    harness_with(ScriptedClient::default(), 4)
}

fn doc(user_book_id: i64, title: &str, highlights: &[(i64, &str)]) -> Document {
    let highlights: Vec<_> = highlights
        .iter()
        .map(|(id, text)| json!({ "id": id, "text": text }))
        .collect();
    serde_json::from_value(json!({
        "user_book_id": user_book_id,
        "title": title,
        "category": "books",
        "source": "kindle",
        "highlights": highlights,
    }))
    .unwrap()
}

fn ten_highlights() -> Document {
    let texts: Vec<String> = (1..=10).map(|i| format!("fact number {}", i)).collect();
    let pairs: Vec<(i64, &str)> = texts
        .iter()
        .enumerate()
        .map(|(i, t)| (i as i64 + 1, t.as_str()))
        .collect();
    doc(1, "Ten Facts", &pairs)
}

async fn count(store: &InMemoryStore, state: CardState) -> usize {
    store.cards_in_state(state).await.unwrap().len()
}

// ============ Tests ============

#[tokio::test]
async fn test_highlight_becomes_completed_card() {
    let h = harness();
    let text = "The mitochondria is the powerhouse of the cell";
    let mut document = doc(7, "Cell Biology", &[(42, text)]);
    document.book_tags = serde_json::from_value(json!([{ "name": "biology" }])).unwrap();
    h.source.add(document);
    h.client.reply(
        text,
        r#"[{"question": "What is the powerhouse of the cell?", "answer": "The mitochondria"}]"#,
    );

    let report = h
        .engine
        .run(&RunOptions::default(), &NoProgress::default())
        .await
        .unwrap();

    assert_eq!(report.documents_kept, 1);
    assert_eq!(report.cards_created, 1);
    assert_eq!(report.completed, 1);
    assert!(report.new_watermark.is_some());

    let card = h.store.find_card("42").await.unwrap().unwrap();
    assert_eq!(card.state, CardState::Completed);
    assert_eq!(card.question, "What is the powerhouse of the cell?");
    assert_eq!(card.answer, "The mitochondria");
    assert_eq!(card.fields.text, text);
    assert_eq!(card.fields.title, "Cell Biology");
    assert_eq!(card.tags, vec!["biology".to_string()]);
    assert_eq!(card.deck_id, h.store.ensure_deck("SmoothBrain").await.unwrap());
}

#[tokio::test]
async fn test_second_full_sync_creates_nothing() {
    let h = harness();
    h.source.add(doc(1, "D", &[(1, "alpha"), (2, "beta")]));
    let full = RunOptions {
        full: true,
        ..RunOptions::default()
    };

    let first = h.engine.run(&full, &NoProgress::default()).await.unwrap();
    assert_eq!(first.cards_created, 2);
    assert_eq!(first.dispatched, 2);

    let second = h.engine.run(&full, &NoProgress::default()).await.unwrap();
    assert_eq!(second.highlights_seen, 2);
    assert_eq!(second.cards_created, 0);
    assert_eq!(second.cards_existing, 2);
    assert_eq!(second.dispatched, 0);
    assert_eq!(h.client.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.store.all_cards().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_watermark_makes_sync_incremental() {
    let h = harness();
    h.source.add(doc(1, "Old", &[(1, "old highlight")]));

    let first = h
        .engine
        .run(&RunOptions::default(), &NoProgress::default())
        .await
        .unwrap();
    let watermark = first.new_watermark.unwrap();
    assert_eq!(h.store.load_watermark().await.unwrap(), Some(watermark));

    h.source.add(doc(2, "New", &[(2, "new highlight")]));
    let second = h
        .engine
        .run(&RunOptions::default(), &NoProgress::default())
        .await
        .unwrap();

    assert_eq!(h.source.last_watermark(), Some(watermark));
    assert_eq!(second.documents_fetched, 1);
    assert_eq!(second.cards_created, 1);
    assert!(second.new_watermark.unwrap() > watermark);
    assert_eq!(count(&h.store, CardState::Completed).await, 2);
}

#[tokio::test]
async fn test_excluded_documents_are_skipped() {
    let h = harness();
    h.source.add(doc(1, "Keep", &[(1, "kept")]));
    let mut podcast = doc(2, "Episode", &[(2, "transcript")]);
    podcast.category = serde_json::from_value(json!("podcasts")).unwrap();
    h.source.add(podcast);
    let mut airr = doc(3, "Airr clip", &[(3, "clip")]);
    airr.source = Some("airr".to_string());
    h.source.add(airr);
    h.source.add(doc(4, "Empty", &[]));

    let report = h
        .engine
        .run(&RunOptions::default(), &NoProgress::default())
        .await
        .unwrap();

    assert_eq!(report.documents_fetched, 4);
    assert_eq!(report.documents_kept, 1);
    assert_eq!(report.cards_created, 1);
    assert!(h.store.find_card("2").await.unwrap().is_none());
    assert!(h.store.find_card("3").await.unwrap().is_none());
}

#[tokio::test]
async fn test_empty_fact_list_suspends_card() {
    let h = harness();
    h.source.add(doc(1, "D", &[(1, "Chapter 3")]));
    h.client.reply("Chapter 3", "[]");

    let report = h
        .engine
        .run(&RunOptions::default(), &NoProgress::default())
        .await
        .unwrap();

    assert_eq!(report.suspended, 1);
    let card = h.store.find_card("1").await.unwrap().unwrap();
    assert_eq!(card.state, CardState::Suspended);
    assert!(card.question.is_empty());
}

#[tokio::test]
async fn test_cancel_after_three_leaves_rest_pending() {
    let h = harness_with(ScriptedClient::with_delay(Duration::from_millis(10)), 4);
    h.source.add(ten_highlights());
    let progress = CancelAfter {
        after: 3,
        seen: AtomicUsize::new(0),
        flag: CancelFlag::new(),
    };

    let report = h
        .engine
        .run(&RunOptions::default(), &progress)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.cards_created, 10);
    assert_eq!(report.completed, 3);
    assert_eq!(report.left_pending, 7);
    assert_eq!(count(&h.store, CardState::Completed).await, 3);
    assert_eq!(count(&h.store, CardState::Pending).await, 7);

    // Pending cards are picked up again without any new highlights.
    let next = h
        .engine
        .run(&RunOptions::default(), &NoProgress::default())
        .await
        .unwrap();
    assert_eq!(next.cards_created, 0);
    assert_eq!(next.dispatched, 7);
    assert_eq!(next.completed, 7);
    assert_eq!(count(&h.store, CardState::Completed).await, 10);
}

#[tokio::test]
async fn test_cancel_before_materializing_writes_nothing() {
    let h = harness();
    h.source.add(ten_highlights());
    let cancel = CancelFlag::new();
    cancel.cancel();

    let report = h
        .engine
        .run(&RunOptions::default(), &NoProgress::new(cancel))
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.cards_created, 0);
    assert!(report.new_watermark.is_none());
    assert!(h.store.load_watermark().await.unwrap().is_none());
    assert_eq!(h.client.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_at_most_four_requests_in_flight() {
    let h = harness_with(ScriptedClient::with_delay(Duration::from_millis(20)), 4);
    h.source.add(ten_highlights());
    h.source.add(doc(2, "More", &[(11, "eleven"), (12, "twelve")]));

    let report = h
        .engine
        .run(&RunOptions::default(), &NoProgress::default())
        .await
        .unwrap();

    assert_eq!(report.completed, 12);
    let peak = h.client.peak.load(Ordering::SeqCst);
    assert!(peak <= 4, "peak concurrency was {}", peak);
    assert!(peak >= 2, "requests never overlapped");
}

#[tokio::test]
async fn test_second_run_while_active_is_rejected() {
    let h = harness_with(ScriptedClient::with_delay(Duration::from_millis(200)), 4);
    h.source.add(doc(1, "D", &[(1, "slow")]));

    let first_opts = RunOptions::default();
    let first_progress = NoProgress::default();
    let (first, second) = tokio::join!(
        h.engine.run(&first_opts, &first_progress),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.engine
                .run(&RunOptions::default(), &NoProgress::default())
                .await
        }
    );

    assert!(first.is_ok());
    assert!(matches!(second, Err(SyncError::AlreadyRunning)));

    // The guard is released once the first run ends.
    assert!(h
        .engine
        .run(&RunOptions::default(), &NoProgress::default())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_fetch_error_keeps_watermark() {
    let h = harness();
    h.source.add(doc(1, "D", &[(1, "alpha")]));
    let first = h
        .engine
        .run(&RunOptions::default(), &NoProgress::default())
        .await
        .unwrap();

    h.source.failing.store(true, Ordering::SeqCst);
    let err = h
        .engine
        .run(&RunOptions::default(), &NoProgress::default())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Fetch(FetchError::Status { status: 503, .. })));
    assert_eq!(h.store.load_watermark().await.unwrap(), first.new_watermark);
}

#[tokio::test]
async fn test_service_error_fails_card_until_retried() {
    let h = harness();
    h.source.add(doc(1, "D", &[(1, "too long")]));
    h.client.fail_on("too long");

    let err = h
        .engine
        .run(&RunOptions::default(), &NoProgress::default())
        .await
        .unwrap_err();
    assert_eq!(err.highlight_id(), Some("1"));
    assert!(h.store.load_watermark().await.unwrap().is_none());

    let card = h.store.find_card("1").await.unwrap().unwrap();
    assert_eq!(card.state, CardState::Failed);
    assert!(card.last_error.unwrap().contains("400"));

    // A plain sync leaves failed cards alone.
    h.client.heal();
    let plain = h
        .engine
        .run(&RunOptions::default(), &NoProgress::default())
        .await
        .unwrap();
    assert_eq!(plain.dispatched, 0);
    assert_eq!(count(&h.store, CardState::Failed).await, 1);

    let retry = h
        .engine
        .run(
            &RunOptions {
                retry_failed: true,
                ..RunOptions::default()
            },
            &NoProgress::default(),
        )
        .await
        .unwrap();
    assert_eq!(retry.retried_failed, 1);
    assert_eq!(retry.completed, 1);
    let card = h.store.find_card("1").await.unwrap().unwrap();
    assert_eq!(card.state, CardState::Completed);
    assert!(card.last_error.is_none());
}

#[tokio::test]
async fn test_malformed_completion_is_reported_with_raw_text() {
    let h = harness();
    h.source.add(doc(1, "D", &[(1, "odd")]));
    h.client.reply("odd", "Q: What? A: That.");

    let err = h
        .engine
        .run(&RunOptions::default(), &NoProgress::default())
        .await
        .unwrap_err();

    match err {
        SyncError::GenerationParse { highlight_id, raw, .. } => {
            assert_eq!(highlight_id, "1");
            assert_eq!(raw, "Q: What? A: That.");
        }
        other => panic!("unexpected error: {other}"),
    }
    let card = h.store.find_card("1").await.unwrap().unwrap();
    assert_eq!(card.state, CardState::Failed);
}

#[tokio::test]
async fn test_regenerate_replaces_question() {
    let h = harness();
    h.source.add(doc(1, "D", &[(9, "water boils at 100C")]));
    h.engine
        .run(&RunOptions::default(), &NoProgress::default())
        .await
        .unwrap();

    h.client.reply(
        "water boils at 100C",
        r#"[{"question": "At what temperature does water boil?", "answer": "100C"}]"#,
    );
    let card = h
        .engine
        .regenerate("9", &NoProgress::default())
        .await
        .unwrap();
    assert_eq!(card.state, CardState::Completed);
    assert_eq!(card.question, "At what temperature does water boil?");

    let missing = h.engine.regenerate("404", &NoProgress::default()).await;
    assert!(matches!(missing, Err(SyncError::UnknownCard(id)) if id == "404"));

    // Regenerate is its own undo entry.
    let undone = h.store.undo_last().await.unwrap().unwrap();
    assert_eq!(undone.label, "Regenerate card");
    let card = h.store.find_card("9").await.unwrap().unwrap();
    assert_eq!(card.question, "What does this say: water boils at 100C?");
}

#[tokio::test]
async fn test_whole_run_undoes_as_one_entry() {
    let h = harness();
    let texts: Vec<String> = (1..=60).map(|i| format!("highlight {}", i)).collect();
    let pairs: Vec<(i64, &str)> = texts
        .iter()
        .enumerate()
        .map(|(i, t)| (i as i64 + 1, t.as_str()))
        .collect();
    h.source.add(doc(1, "Long Book", &pairs));

    let report = h
        .engine
        .run(&RunOptions::default(), &NoProgress::default())
        .await
        .unwrap();
    assert_eq!(report.completed, 60);
    assert_eq!(h.store.undo_log().len(), 1);

    let undone = h.store.undo_last().await.unwrap().unwrap();
    assert_eq!(undone.label, "Sync highlights");
    assert!(h.store.all_cards().await.unwrap().is_empty());
    assert!(h.store.undo_last().await.unwrap().is_none());
}

#[tokio::test]
async fn test_worker_panic_aborts_and_keeps_card_pending() {
    let h = harness_with(ScriptedClient::default(), 1);
    h.source.add(doc(1, "D", &[(1, "explodes")]));
    h.client.panic_on("explodes");

    let result = h
        .engine
        .run(&RunOptions::default(), &NoProgress::default())
        .await;

    assert!(matches!(result, Err(SyncError::Worker(_))));
    let card = h.store.find_card("1").await.unwrap().unwrap();
    assert_eq!(card.state, CardState::Pending);
    assert!(card.last_error.is_none());

    // The checkpoint still closed around the card creation.
    assert_eq!(h.store.undo_log().len(), 1);
    assert!(h.store.load_watermark().await.unwrap().is_none());
}

#[tokio::test]
async fn test_limit_truncates_and_holds_watermark() {
    let h = harness();
    for i in 1..=5 {
        h.source.add(doc(i, "D", &[(i, "text")]));
    }

    let report = h
        .engine
        .run(
            &RunOptions {
                limit: Some(2),
                ..RunOptions::default()
            },
            &NoProgress::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.documents_fetched, 5);
    assert_eq!(report.documents_kept, 2);
    assert_eq!(report.cards_created, 2);
    assert!(report.new_watermark.is_none());
    assert!(h.store.load_watermark().await.unwrap().is_none());
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let h = harness();
    h.source.add(doc(1, "D", &[(1, "a"), (2, "b")]));

    let report = h
        .engine
        .run(
            &RunOptions {
                dry_run: true,
                ..RunOptions::default()
            },
            &NoProgress::default(),
        )
        .await
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.cards_created, 2);
    assert_eq!(report.dispatched, 2);
    assert!(h.store.all_cards().await.unwrap().is_empty());
    assert!(h.store.undo_log().is_empty());
    assert!(h.store.load_watermark().await.unwrap().is_none());
    assert_eq!(h.client.calls.load(Ordering::SeqCst), 0);
}
