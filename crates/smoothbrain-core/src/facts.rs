//! Structured question/answer extraction from raw completion text.
//!
//! The completion service is asked for a JSON array of
//! `{"question": ..., "answer": ...}` objects. Models sometimes wrap the
//! array in a fenced code block or answer with a bare object instead of
//! a one-element array; both are accepted. Anything else is a
//! [`FactParseError`]. An empty array is a valid answer meaning the
//! highlight contained nothing worth memorizing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One question/answer pair extracted from a highlight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub question: String,
    pub answer: String,
}

/// The completion text was not a well-formed fact list.
#[derive(Debug, Error)]
#[error("malformed completion: {reason}")]
pub struct FactParseError {
    pub reason: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FactPayload {
    Many(Vec<Fact>),
    One(Fact),
}

/// Strip a surrounding ```` ``` ```` or ```` ```json ```` fence, if any.
fn strip_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Parse raw completion text into facts.
///
/// Facts whose question or answer is blank are dropped, so a response
/// made only of blank facts counts as "no fact".
pub fn parse_facts(raw: &str) -> Result<Vec<Fact>, FactParseError> {
    let body = strip_fence(raw);
    if body.is_empty() {
        return Err(FactParseError {
            reason: "empty completion".to_string(),
        });
    }

    let payload: FactPayload = serde_json::from_str(body).map_err(|e| FactParseError {
        reason: e.to_string(),
    })?;

    let facts = match payload {
        FactPayload::Many(facts) => facts,
        FactPayload::One(fact) => vec![fact],
    };

    Ok(facts
        .into_iter()
        .filter(|f| !f.question.trim().is_empty() && !f.answer.trim().is_empty())
        .collect())
}
