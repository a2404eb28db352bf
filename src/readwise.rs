//! Readwise export API client.
//!
//! `GET {base_url}/export/` returns one page of documents with their
//! highlights and, when more remain, a `nextPageCursor`. Requests are
//! authenticated with `Authorization: Token <token>`. An `updatedAfter`
//! ISO-8601 parameter restricts the export to items changed since then.
//!
//! The client fetches exactly one page per call and never retries;
//! [`crate::fetch::fetch_documents`] drives pagination.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer};
use tracing::debug;

use smoothbrain_core::models::Document;

use crate::config::Config;
use crate::error::FetchError;

/// One page of the export.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExportPage {
    #[serde(default)]
    pub results: Vec<Document>,
    #[serde(
        default,
        rename = "nextPageCursor",
        deserialize_with = "cursor_string"
    )]
    pub next_page_cursor: Option<String>,
}

/// The API has sent the cursor both as a number and as a string.
fn cursor_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// A paginated source of documents.
#[async_trait]
pub trait ExportSource: Send + Sync {
    async fn export_page(
        &self,
        updated_after: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<ExportPage, FetchError>;
}

pub struct ReadwiseClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ReadwiseClient {
    pub fn new(base_url: &str, token: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            http: builder.build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let token = config
            .readwise_token()
            .context("no Readwise token configured (set readwise.api_key or READWISE_TOKEN)")?;
        Self::new(
            &config.readwise.base_url,
            &token,
            config.readwise.timeout_secs.map(Duration::from_secs),
        )
    }
}

#[async_trait]
impl ExportSource for ReadwiseClient {
    async fn export_page(
        &self,
        updated_after: Option<DateTime<Utc>>,
        cursor: Option<&str>,
    ) -> Result<ExportPage, FetchError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(cursor) = cursor {
            params.push(("pageCursor", cursor.to_string()));
        }
        if let Some(after) = updated_after {
            params.push((
                "updatedAfter",
                after.to_rfc3339_opts(SecondsFormat::Millis, true),
            ));
        }

        debug!(cursor = ?cursor, updated_after = ?updated_after, "requesting export page");

        let response = self
            .http
            .get(format!("{}/export/", self.base_url))
            .header("Authorization", format!("Token {}", self.token))
            .query(&params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| FetchError::Decode {
            reason: e.to_string(),
            body,
        })
    }
}
