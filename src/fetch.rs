//! Incremental fetch and document filtering.
//!
//! [`fetch_documents`] walks every page of an [`ExportSource`] and
//! returns the accumulated documents together with the instant the fetch
//! started. The caller persists that instant as the next watermark, and
//! only once the whole run has succeeded.
//!
//! [`filter_documents`] is separate from the fetch so the fetch contract
//! stays reusable: it drops documents nobody highlighted on purpose
//! (supplementals), media without text (podcasts, transcripts), noisy
//! social threads, and anything without highlights.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use smoothbrain_core::models::{Category, Document};

use crate::error::FetchError;
use crate::readwise::ExportSource;

/// Categories never turned into cards.
pub const EXCLUDED_CATEGORIES: [Category; 3] =
    [Category::Supplementals, Category::Podcasts, Category::Tweets];

/// Source names never turned into cards.
pub const EXCLUDED_SOURCES: [&str; 4] = ["supplemental", "podcast", "airr", "twitter"];

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub documents: Vec<Document>,
    /// When the first page was requested.
    pub started_at: DateTime<Utc>,
    pub pages: usize,
}

/// Fetch every page updated after `watermark`, or everything when `None`.
pub async fn fetch_documents(
    source: &dyn ExportSource,
    watermark: Option<DateTime<Utc>>,
) -> Result<FetchOutcome, FetchError> {
    let started_at = Utc::now();
    let mut documents = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = source.export_page(watermark, cursor.as_deref()).await?;
        pages += 1;
        debug!(
            page = pages,
            documents = page.results.len(),
            "fetched export page"
        );
        documents.extend(page.results);

        match page.next_page_cursor {
            Some(next) if cursor.as_deref() == Some(next.as_str()) => {
                return Err(FetchError::Decode {
                    reason: format!("export repeated page cursor {}", next),
                    body: String::new(),
                });
            }
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    info!(
        documents = documents.len(),
        pages,
        incremental = watermark.is_some(),
        "export fetched"
    );

    Ok(FetchOutcome {
        documents,
        started_at,
        pages,
    })
}

/// Why a document was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    Category(Category),
    Source(&'static str),
    NoHighlights,
}

/// Reason `document` should not become cards, or `None` to keep it.
pub fn exclusion_reason(document: &Document) -> Option<Exclusion> {
    if EXCLUDED_CATEGORIES.contains(&document.category) {
        return Some(Exclusion::Category(document.category));
    }
    if let Some(source) = document.source.as_deref() {
        let source = source.trim().to_ascii_lowercase();
        if let Some(hit) = EXCLUDED_SOURCES.iter().find(|s| **s == source) {
            return Some(Exclusion::Source(*hit));
        }
    }
    if document.highlights.is_empty() {
        return Some(Exclusion::NoHighlights);
    }
    None
}

/// Keep only documents that should become cards, preserving order.
pub fn filter_documents(documents: Vec<Document>) -> Vec<Document> {
    documents
        .into_iter()
        .filter(|doc| match exclusion_reason(doc) {
            Some(reason) => {
                debug!(user_book_id = doc.user_book_id, ?reason, "document excluded");
                false
            }
            None => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readwise::ExportPage;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn doc(id: i64, category: &str, source: &str, highlights: usize) -> Document {
        let hls: Vec<String> = (0..highlights)
            .map(|i| format!(r#"{{"id": {}, "text": "t{}"}}"#, id * 100 + i as i64, i))
            .collect();
        serde_json::from_str(&format!(
            r#"{{"user_book_id": {}, "category": "{}", "source": "{}", "highlights": [{}]}}"#,
            id,
            category,
            source,
            hls.join(",")
        ))
        .unwrap()
    }

    struct PagedSource {
        pages: Vec<ExportPage>,
        seen: Mutex<Vec<(Option<DateTime<Utc>>, Option<String>)>>,
    }

    #[async_trait]
    impl ExportSource for PagedSource {
        async fn export_page(
            &self,
            updated_after: Option<DateTime<Utc>>,
            cursor: Option<&str>,
        ) -> Result<ExportPage, FetchError> {
            let mut seen = self.seen.lock().unwrap();
            seen.push((updated_after, cursor.map(str::to_string)));
            Ok(self.pages[seen.len() - 1].clone())
        }
    }

    #[tokio::test]
    async fn test_paginates_until_cursor_absent() {
        let source = PagedSource {
            pages: vec![
                ExportPage {
                    results: vec![doc(1, "books", "kindle", 1)],
                    next_page_cursor: Some("a".to_string()),
                },
                ExportPage {
                    results: vec![doc(2, "articles", "reader", 2)],
                    next_page_cursor: None,
                },
            ],
            seen: Mutex::new(Vec::new()),
        };
        let wm = Utc::now();
        let outcome = fetch_documents(&source, Some(wm)).await.unwrap();

        assert_eq!(outcome.pages, 2);
        assert_eq!(outcome.documents.len(), 2);
        let seen = source.seen.lock().unwrap();
        assert_eq!(seen[0], (Some(wm), None));
        assert_eq!(seen[1], (Some(wm), Some("a".to_string())));
    }

    #[tokio::test]
    async fn test_repeated_cursor_is_an_error() {
        let page = ExportPage {
            results: vec![],
            next_page_cursor: Some("same".to_string()),
        };
        let source = PagedSource {
            pages: vec![page.clone(), page],
            seen: Mutex::new(Vec::new()),
        };
        let err = fetch_documents(&source, None).await.unwrap_err();
        assert!(matches!(err, FetchError::Decode { .. }));
    }

    #[test]
    fn test_podcast_excluded_even_with_highlights() {
        let d = doc(1, "podcasts", "snipd", 3);
        assert_eq!(
            exclusion_reason(&d),
            Some(Exclusion::Category(Category::Podcasts))
        );
    }

    #[test]
    fn test_empty_document_excluded_even_if_allowed() {
        let d = doc(1, "books", "kindle", 0);
        assert_eq!(exclusion_reason(&d), Some(Exclusion::NoHighlights));
    }

    #[test]
    fn test_source_exclusion() {
        assert_eq!(
            exclusion_reason(&doc(1, "articles", "airr", 1)),
            Some(Exclusion::Source("airr"))
        );
        assert_eq!(
            exclusion_reason(&doc(1, "articles", "Twitter", 1)),
            Some(Exclusion::Source("twitter"))
        );
    }

    #[test]
    fn test_filter_keeps_order() {
        let docs = vec![
            doc(1, "books", "kindle", 1),
            doc(2, "supplementals", "supplemental", 2),
            doc(3, "articles", "reader", 1),
            doc(4, "books", "kindle", 0),
        ];
        let kept: Vec<i64> = filter_documents(docs)
            .into_iter()
            .map(|d| d.user_book_id)
            .collect();
        assert_eq!(kept, vec![1, 3]);
    }
}
