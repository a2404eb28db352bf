//! Bounded-concurrency fan-out of generation requests.
//!
//! [`Dispatcher::dispatch`] spawns one task per card onto a `JoinSet`
//! and returns immediately. Each task waits for a permit from a shared
//! semaphore before calling the completion client, so at most
//! `concurrency` requests are outstanding no matter how many cards were
//! submitted. Tasks never touch the store; they hand back the request id
//! and the raw result, and [`InFlight`] maps the id back to its card.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::debug;

use smoothbrain_core::card::Card;

use crate::completion::{build_prompt, CompletionClient, GenerationContext};
use crate::error::GenerationError;

/// Identifies one submitted request within an [`InFlight`] batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

type TaskOutput = (RequestId, Result<String, GenerationError>);

pub struct Dispatcher {
    client: Arc<dyn CompletionClient>,
    concurrency: usize,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn CompletionClient>, concurrency: usize) -> Self {
        Self {
            client,
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Submit one request per card, in the order given.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, cards: Vec<Card>) -> InFlight {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut table = HashMap::with_capacity(cards.len());

        for (i, card) in cards.into_iter().enumerate() {
            let id = RequestId(i as u64);
            let prompt = build_prompt(&card);
            let context = GenerationContext::from_card(&card);
            let client = Arc::clone(&self.client);
            let semaphore = Arc::clone(&semaphore);

            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(permit) => {
                        let text = client.generate(&prompt, &context).await;
                        drop(permit);
                        text
                    }
                    Err(_) => Err(GenerationError::Cancelled),
                };
                (id, result)
            });
            table.insert(id, card);
        }

        let total = table.len();
        debug!(total, concurrency = self.concurrency, "generation requests dispatched");

        InFlight {
            tasks,
            table,
            semaphore,
            total,
        }
    }
}

/// A dispatched batch: the running tasks and the request → card table.
pub struct InFlight {
    tasks: JoinSet<TaskOutput>,
    table: HashMap<RequestId, Card>,
    semaphore: Arc<Semaphore>,
    total: usize,
}

impl InFlight {
    /// Number of requests submitted.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Requests whose result has not been collected yet.
    pub fn outstanding(&self) -> usize {
        self.table.len()
    }

    /// Wait for the next request to finish, in completion order.
    ///
    /// Returns `None` once every result has been collected. A task that
    /// panicked surfaces as `Err(JoinError)`; its card stays in the table.
    pub async fn next(&mut self) -> Option<Result<(Card, Result<String, GenerationError>), JoinError>> {
        loop {
            let joined = self.tasks.join_next().await?;
            match joined {
                Ok((id, result)) => match self.table.remove(&id) {
                    Some(card) => return Some(Ok((card, result))),
                    None => continue,
                },
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Stop requests that have not started. Requests already holding a
    /// permit are unaffected.
    pub fn cancel_unscheduled(&self) {
        self.semaphore.close();
    }

    /// Let every remaining task run to completion in the background and
    /// return the cards whose results will never be collected.
    pub fn detach(mut self) -> Vec<Card> {
        self.tasks.detach_all();
        self.table.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use smoothbrain_core::card::DeckId;
    use smoothbrain_core::models::{Document, Highlight};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn card(id: i64) -> Card {
        let doc: Document = serde_json::from_str(r#"{"user_book_id": 1}"#).unwrap();
        let hl: Highlight =
            serde_json::from_str(&format!(r#"{{"id": {}, "text": "fact {}"}}"#, id, id)).unwrap();
        Card::new_pending(&doc, &hl, DeckId(1))
    }

    #[derive(Default)]
    struct CountingClient {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl CompletionClient for CountingClient {
        async fn generate(
            &self,
            prompt: &str,
            _context: &GenerationContext,
        ) -> Result<String, GenerationError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(format!(r#"[{{"question":"{}?","answer":"a"}}]"#, prompt))
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let client = Arc::new(CountingClient::default());
        let dispatcher = Dispatcher::new(client.clone(), 4);
        let mut in_flight = dispatcher.dispatch((1..=10).map(card).collect());
        assert_eq!(in_flight.total(), 10);

        let mut seen = Vec::new();
        while let Some(joined) = in_flight.next().await {
            let (card, result) = joined.unwrap();
            assert!(result.unwrap().contains(&card.fields.text));
            seen.push(card.highlight_id);
        }

        assert_eq!(seen.len(), 10);
        assert_eq!(in_flight.outstanding(), 0);
        assert!(client.peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_cancel_unscheduled_skips_queued_requests() {
        let client = Arc::new(CountingClient::default());
        let dispatcher = Dispatcher::new(client, 1);
        let mut in_flight = dispatcher.dispatch((1..=5).map(card).collect());

        let (_, first) = in_flight.next().await.unwrap().unwrap();
        assert!(first.is_ok());
        in_flight.cancel_unscheduled();

        let mut cancelled = 0;
        while let Some(joined) = in_flight.next().await {
            if let (_, Err(GenerationError::Cancelled)) = joined.unwrap() {
                cancelled += 1;
            }
        }
        assert!(cancelled >= 3);
    }

    #[tokio::test]
    async fn test_detach_returns_uncollected_cards() {
        let dispatcher = Dispatcher::new(Arc::new(CountingClient::default()), 2);
        let in_flight = dispatcher.dispatch((1..=3).map(card).collect());
        let left = in_flight.detach();
        assert_eq!(left.len(), 3);
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let dispatcher = Dispatcher::new(Arc::new(CountingClient::default()), 0);
        assert_eq!(dispatcher.concurrency(), 1);
    }
}
