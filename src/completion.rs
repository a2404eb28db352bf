//! Completion service client and prompt construction.
//!
//! The highlight text is the only thing the model should turn into a
//! question. Title, author, and the reader's note travel separately in a
//! [`GenerationContext`] and are presented to the model as tone and
//! language hints, never as material to quiz on.
//!
//! # Retry strategy
//!
//! [`OpenAiClient`] retries like the rest of our HTTP clients:
//! - HTTP 429 and 5xx → retry with exponential backoff (1s, 2s, 4s, ... capped at 32s)
//! - other HTTP 4xx → fail immediately
//! - network errors → retry
//!
//! There is no request timeout unless `generation.timeout_secs` is set.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use smoothbrain_core::card::Card;

use crate::config::Config;
use crate::error::GenerationError;

const SYSTEM_PROMPT: &str = "You write spaced-repetition flashcards from a reader's highlights.\n\
Make a succinct flash card for the highlighted passage the user sends.\n\
Remember to:\n\
1. Be straight to the point.\n\
2. Only test ONE fact.\n\
3. Prefer question and answer format.\n\
Reply with a JSON array of objects with string members \"question\" and \"answer\" \
and nothing else. Reply with [] if the passage holds nothing worth memorizing.";

/// Document context used to steer tone and language only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GenerationContext {
    pub title: String,
    pub author: String,
    pub category: String,
    pub note: String,
}

impl GenerationContext {
    pub fn from_card(card: &Card) -> Self {
        Self {
            title: card.fields.readable_title.clone(),
            author: card.fields.author.clone(),
            category: card.fields.category.clone(),
            note: card.fields.note.clone(),
        }
    }

    /// Steering text appended to the system prompt. Empty fields are skipped.
    pub fn steering(&self) -> String {
        let mut lines = Vec::new();
        if !self.title.is_empty() {
            lines.push(format!("The passage comes from \"{}\".", self.title));
        }
        if !self.author.is_empty() {
            lines.push(format!("Its author is {}.", self.author));
        }
        if !self.category.is_empty() && self.category != "other" {
            lines.push(format!("It is one of the reader's {}.", self.category));
        }
        if !self.note.is_empty() {
            lines.push(format!("The reader noted: \"{}\".", self.note));
        }
        if lines.is_empty() {
            return String::new();
        }
        format!(
            "Use this only to match tone and language; do not ask about it.\n{}",
            lines.join("\n")
        )
    }
}

/// The user message for `card`: its raw highlight text.
pub fn build_prompt(card: &Card) -> String {
    card.fields.text.trim().to_string()
}

/// A completion backend.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Return the raw completion text for `prompt`.
    async fn generate(
        &self,
        prompt: &str,
        context: &GenerationContext,
    ) -> Result<String, GenerationError>;
}

/// Client for an OpenAI-compatible `POST {base}/chat/completions`.
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_output_tokens: u32,
    temperature: f32,
    max_retries: u32,
    backoff_base: Duration,
}

impl OpenAiClient {
    pub fn from_config(config: &Config) -> Result<Self, GenerationError> {
        let api_key = config
            .generation_api_key()
            .ok_or(GenerationError::MissingCredentials)?;

        let mut builder = reqwest::Client::builder();
        if let Some(secs) = config.generation.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        Ok(Self {
            http: builder.build()?,
            base_url: config.generation.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.generation.model.clone(),
            max_output_tokens: config.generation.max_output_tokens,
            temperature: config.generation.temperature,
            max_retries: config.generation.max_retries,
            backoff_base: Duration::from_secs(1),
        })
    }

    /// Override the first backoff delay.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    fn request_body(&self, prompt: &str, context: &GenerationContext) -> serde_json::Value {
        let steering = context.steering();
        let system = if steering.is_empty() {
            SYSTEM_PROMPT.to_string()
        } else {
            format!("{}\n\n{}", SYSTEM_PROMPT, steering)
        };

        serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
            "max_tokens": self.max_output_tokens,
            "temperature": self.temperature,
            "top_p": 1,
            "frequency_penalty": 0,
            "presence_penalty": 0,
        })
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn generate(
        &self,
        prompt: &str,
        context: &GenerationContext,
    ) -> Result<String, GenerationError> {
        let body = self.request_body(prompt, context);
        let url = format!("{}/chat/completions", self.base_url);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff_base * (1u32 << (attempt - 1).min(5));
                debug!(attempt, ?delay, "retrying completion request");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .http
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_chat_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = GenerationError::Status {
                        status: status.as_u16(),
                        body: body_text,
                    };

                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(status = status.as_u16(), attempt, "completion service busy");
                        last_err = Some(err);
                        continue;
                    }

                    return Err(err);
                }
                Err(e) => {
                    warn!(error = %e, attempt, "completion request failed");
                    last_err = Some(GenerationError::Transport(e));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or(GenerationError::EmptyResponse))
    }
}

/// Extract `choices[0].message.content`.
fn parse_chat_response(json: &serde_json::Value) -> Result<String, GenerationError> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .ok_or(GenerationError::EmptyResponse)
}
