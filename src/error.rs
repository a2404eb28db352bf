//! Error taxonomy for the sync engine.
//!
//! Remote-service failures get typed errors so the orchestrator can tell
//! a fetch failure (watermark not advanced) from a generation failure
//! (card marked failed) from a malformed completion (card marked failed,
//! raw text logged). Store and config plumbing stays on `anyhow`.

use smoothbrain_core::facts::FactParseError;
use thiserror::Error;

/// Source fetch failed. Never retried internally.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("export request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("export returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode export page: {reason}")]
    Decode { reason: String, body: String },
}

/// A completion request did not produce text.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("completion request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("completion service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("completion service returned no text")]
    EmptyResponse,

    #[error("no completion API key configured (set generation.api_key or OPENAI_API_KEY)")]
    MissingCredentials,

    #[error("request cancelled before it was sent")]
    Cancelled,
}

/// Why a sync run stopped early.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("generation failed for highlight {highlight_id}: {source}")]
    GenerationService {
        highlight_id: String,
        #[source]
        source: GenerationError,
    },

    #[error("malformed completion for highlight {highlight_id}: {source}")]
    GenerationParse {
        highlight_id: String,
        raw: String,
        #[source]
        source: FactParseError,
    },

    #[error("generation worker crashed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("a sync run is already in progress")]
    AlreadyRunning,

    #[error("no card for highlight {0}")]
    UnknownCard(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl SyncError {
    /// Highlight the error is attributed to, if any.
    pub fn highlight_id(&self) -> Option<&str> {
        match self {
            SyncError::GenerationService { highlight_id, .. }
            | SyncError::GenerationParse { highlight_id, .. } => Some(highlight_id),
            SyncError::UnknownCard(id) => Some(id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_status_carries_body() {
        let err = SyncError::from(FetchError::Status {
            status: 401,
            body: r#"{"detail":"Invalid token."}"#.to_string(),
        });
        let msg = err.to_string();
        assert!(msg.contains("401"));
        assert!(msg.contains("Invalid token"));
        assert!(err.highlight_id().is_none());
    }

    #[test]
    fn test_parse_error_names_highlight() {
        let err = SyncError::GenerationParse {
            highlight_id: "42".to_string(),
            raw: "not json".to_string(),
            source: FactParseError {
                reason: "expected value".to_string(),
            },
        };
        assert_eq!(err.highlight_id(), Some("42"));
        assert!(err.to_string().contains("highlight 42"));
    }

    #[test]
    fn test_store_error_is_transparent() {
        let err = SyncError::from(anyhow::anyhow!("disk full"));
        assert_eq!(err.to_string(), "disk full");
    }
}
