//! The persisted study-card record derived from one highlight.
//!
//! A [`Card`] is keyed by the highlight's stable identifier and carries a
//! denormalized copy of every highlight and document attribute, so the
//! card can be displayed and searched without the source. The generated
//! question and answer start empty and are filled in by reconciliation.
//!
//! # Lifecycle
//!
//! ```text
//!            complete(fact)
//! Pending ─────────────────▶ Completed
//!    │ ▲
//!    │ │ reset_for_retry()
//!    │ └──────────────── Failed / Suspended / Completed
//!    ├── suspend() ──────▶ Suspended
//!    └── fail(msg) ──────▶ Failed
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::facts::Fact;
use crate::markup;
use crate::models::{Document, Highlight};

/// Identifier of a deck in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeckId(pub i64);

/// Where a card is in its generation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardState {
    /// Created, no generation result yet.
    Pending,
    /// Question and answer populated.
    Completed,
    /// Generation produced no usable fact; study items disabled.
    Suspended,
    /// Generation or parsing failed; `last_error` says why.
    Failed,
}

impl CardState {
    pub const ALL: [CardState; 4] = [
        CardState::Pending,
        CardState::Completed,
        CardState::Suspended,
        CardState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CardState::Pending => "pending",
            CardState::Completed => "completed",
            CardState::Suspended => "suspended",
            CardState::Failed => "failed",
        }
    }
}

impl fmt::Display for CardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CardState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CardState::Pending),
            "completed" => Ok(CardState::Completed),
            "suspended" => Ok(CardState::Suspended),
            "failed" => Ok(CardState::Failed),
            other => anyhow::bail!("unknown card state: '{}'", other),
        }
    }
}

/// Denormalized highlight and document attributes, rendered for display.
///
/// URL fields hold ready-to-display anchors, `cover_image` an `<img>` tag,
/// and `text_html` the rendered highlight. `text` keeps the raw highlight
/// so generation can be re-run without the source document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CardFields {
    pub text: String,
    pub text_html: String,
    pub note: String,
    pub url: String,
    pub readwise_url: String,
    pub highlighted_at: String,
    pub created_at: String,
    pub updated_at: String,
    pub location: String,
    pub end_location: String,
    pub color: String,
    pub is_favorite: bool,
    pub is_discard: bool,
    pub user_book_id: String,
    pub title: String,
    pub readable_title: String,
    pub document_note: String,
    pub document_readwise_url: String,
    pub author: String,
    pub source: String,
    pub source_url: String,
    pub unique_url: String,
    pub cover_image: String,
    pub category: String,
    pub asin: String,
}

/// A study card materialized from one highlight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub highlight_id: String,
    pub deck_id: DeckId,
    pub question: String,
    pub answer: String,
    pub state: CardState,
    pub fields: CardFields,
    pub tags: Vec<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn text_of(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or_default().to_string()
}

fn ts_of(value: Option<DateTime<Utc>>) -> String {
    value.map(|t| t.to_rfc3339()).unwrap_or_default()
}

fn num_of(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Union of document tags and highlight tags, by name, first occurrence wins.
pub fn merge_tags(document: &Document, highlight: &Highlight) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in document.book_tags.iter().chain(highlight.tags.iter()) {
        let name = tag.name.trim();
        if !name.is_empty() && !tags.iter().any(|t| t == name) {
            tags.push(name.to_string());
        }
    }
    tags
}

impl Card {
    /// Build a fresh `Pending` card for `highlight` within `document`.
    pub fn new_pending(document: &Document, highlight: &Highlight, deck_id: DeckId) -> Self {
        let now = Utc::now();
        let fields = CardFields {
            text: highlight.text.clone(),
            text_html: markup::render_markup(&highlight.text),
            note: text_of(highlight.note.as_deref()),
            url: markup::link(highlight.url.as_deref()),
            readwise_url: markup::link(highlight.readwise_url.as_deref()),
            highlighted_at: ts_of(highlight.highlighted_at),
            created_at: ts_of(highlight.created_at),
            updated_at: ts_of(highlight.updated_at),
            location: num_of(highlight.location),
            end_location: num_of(highlight.end_location),
            color: text_of(highlight.color.as_deref()),
            is_favorite: highlight.is_favorite,
            is_discard: highlight.is_discard,
            user_book_id: document.user_book_id.to_string(),
            title: document.title.clone(),
            readable_title: document.display_title().to_string(),
            document_note: text_of(document.document_note.as_deref()),
            document_readwise_url: markup::link(document.readwise_url.as_deref()),
            author: text_of(document.author.as_deref()),
            source: text_of(document.source.as_deref()),
            source_url: markup::link(document.source_url.as_deref()),
            unique_url: markup::link(document.unique_url.as_deref()),
            cover_image: markup::image(document.cover_image_url.as_deref()),
            category: document.category.as_str().to_string(),
            asin: text_of(document.asin.as_deref()),
        };

        Self {
            highlight_id: highlight.key(),
            deck_id,
            question: String::new(),
            answer: String::new(),
            state: CardState::Pending,
            fields,
            tags: merge_tags(document, highlight),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a generated fact and mark the card completed.
    pub fn complete(&mut self, fact: &Fact) {
        self.question = fact.question.trim().to_string();
        self.answer = fact.answer.trim().to_string();
        self.state = CardState::Completed;
        self.last_error = None;
        self.touch();
    }

    /// Disable the card's study items. Question and answer are left as-is.
    pub fn suspend(&mut self) {
        self.state = CardState::Suspended;
        self.last_error = None;
        self.touch();
    }

    /// Record a generation or parse failure.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.state = CardState::Failed;
        self.last_error = Some(message.into());
        self.touch();
    }

    /// Put the card back in the queue for another generation attempt.
    pub fn reset_for_retry(&mut self) {
        self.state = CardState::Pending;
        self.last_error = None;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
