//! Source item model: documents and highlights as delivered by the
//! read-it-later export API.
//!
//! These are immutable values. Every optional field tolerates `null` or
//! absence on the wire, since the export omits whatever the source never
//! populated (an ASIN for a web article, a location for a tweet).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Read an explicit `null` as the type's default, like an absent field.
fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A tag attached to a document or a highlight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default, deserialize_with = "null_default")]
    pub name: String,
}

/// Document category as reported by the source.
///
/// Unknown values map to [`Category::Other`] so a new category on the
/// server side never breaks a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[serde(alias = "book")]
    Books,
    #[serde(alias = "article")]
    Articles,
    #[serde(alias = "tweet")]
    Tweets,
    #[serde(alias = "supplemental")]
    Supplementals,
    #[serde(alias = "podcast")]
    Podcasts,
    #[serde(other)]
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Books => "books",
            Category::Articles => "articles",
            Category::Tweets => "tweets",
            Category::Supplementals => "supplementals",
            Category::Podcasts => "podcasts",
            Category::Other => "other",
        }
    }
}

impl Default for Category {
    fn default() -> Self {
        Category::Other
    }
}

/// A single highlighted passage.
///
/// `id` is assigned by the source and never changes; it is the only
/// attribute used for deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highlight {
    pub id: i64,
    #[serde(default, deserialize_with = "null_default")]
    pub text: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub location: Option<i64>,
    #[serde(default)]
    pub end_location: Option<i64>,
    #[serde(default)]
    pub location_type: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub highlighted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub book_id: Option<i64>,
    #[serde(default, deserialize_with = "null_default")]
    pub tags: Vec<Tag>,
    #[serde(default, deserialize_with = "null_default")]
    pub is_favorite: bool,
    #[serde(default, deserialize_with = "null_default")]
    pub is_discard: bool,
    #[serde(default)]
    pub readwise_url: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
}

impl Highlight {
    /// The stable key a card is stored under.
    pub fn key(&self) -> String {
        self.id.to_string()
    }
}

/// A source item (book, article, ...) and the highlights it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub user_book_id: i64,
    #[serde(default, deserialize_with = "null_default")]
    pub title: String,
    #[serde(default)]
    pub readable_title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub category: Category,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub unique_url: Option<String>,
    #[serde(default)]
    pub readwise_url: Option<String>,
    #[serde(default)]
    pub cover_image_url: Option<String>,
    /// Amazon Standard Identification Number. Only set for some books.
    #[serde(default)]
    pub asin: Option<String>,
    #[serde(default)]
    pub document_note: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub book_tags: Vec<Tag>,
    #[serde(default, deserialize_with = "null_default")]
    pub highlights: Vec<Highlight>,
}

impl Document {
    /// Title for display: the readable title when present, else the raw one.
    pub fn display_title(&self) -> &str {
        match self.readable_title.as_deref() {
            Some(t) if !t.trim().is_empty() => t,
            _ => &self.title,
        }
    }
}
