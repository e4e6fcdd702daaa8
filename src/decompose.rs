//! Splits free-form model output into typed display segments.
//!
//! The extraction order is fixed: one ```json block first, then one fenced
//! code block of any language, then a raw-code heuristic, then leftover prose.
//! Prompts downstream rely on this order, so additional fenced blocks are left
//! inside the trailing text rather than segmented.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::EMPTY_RESPONSE_PLACEHOLDER;

lazy_static::lazy_static! {
    static ref JSON_BLOCK: Regex = Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").unwrap();
    static ref CODE_BLOCK: Regex = Regex::new(r"(?s)```(\w*)\s*\n(.*?)\n```").unwrap();
}

const CODE_HINTS: [&str; 3] = ["def ", "class ", "import "];

/// A typed, ordered piece of a rendered response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Segment {
    Text(String),
    Json(serde_json::Value),
    Code { language: String, body: String },
}

impl Segment {
    pub fn code(language: impl Into<String>, body: impl Into<String>) -> Self {
        Segment::Code {
            language: language.into(),
            body: body.into(),
        }
    }

    /// Markdown rendering, used by the terminal front-end.
    pub fn to_markdown(&self) -> String {
        match self {
            Segment::Text(text) => text.clone(),
            Segment::Json(value) => format!(
                "```json\n{}\n```",
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            ),
            Segment::Code { language, body } => format!("```{}\n{}\n```", language, body),
        }
    }
}

/// Remove the first occurrence of `span` and trim what is left.
fn remove_span(text: &str, span: &str) -> String {
    text.replacen(span, "", 1).trim().to_string()
}

fn looks_like_code(text: &str) -> bool {
    text.starts_with('#') || text.starts_with("//") || CODE_HINTS.iter().any(|h| text.contains(h))
}

pub fn decompose(text: &str) -> Vec<Segment> {
    if text.trim().is_empty() {
        return vec![Segment::Text(EMPTY_RESPONSE_PLACEHOLDER.to_string())];
    }

    let mut segments = Vec::new();
    let mut remaining = text.to_string();
    // Set when a json fence is present, even if its body fails to parse.
    let mut json_fence = false;

    if let Some(caps) = JSON_BLOCK.captures(text) {
        json_fence = true;
        match serde_json::from_str::<serde_json::Value>(&caps[1]) {
            Ok(value) => {
                segments.push(Segment::Json(value));
                remaining = remove_span(text, &caps[0]);
            }
            Err(e) => warn!("Could not parse JSON report: {}", e),
        }
    }

    let code = CODE_BLOCK
        .captures(&remaining)
        .map(|caps| (caps[0].to_string(), caps[1].to_lowercase(), caps[2].to_string()));

    if let Some((span, language, body)) = code {
        let language = if language.is_empty() {
            "plaintext".to_string()
        } else {
            language
        };
        segments.push(Segment::code(language, body));
        remaining = remove_span(&remaining, &span);
    } else if !json_fence {
        let trimmed = remaining.trim();
        if looks_like_code(trimmed) {
            // Unfenced code carries no language tag; Python is a guess.
            segments.push(Segment::code("python", trimmed));
            return segments;
        }
    }

    let leftover = remaining.trim();
    if !leftover.is_empty() {
        segments.push(Segment::Text(leftover.to_string()));
    }
    segments
}

/// Body of the first fenced block tagged `language`.
pub fn extract_code_block(text: &str, language: &str) -> Option<String> {
    let pattern = format!(r"(?s)```{}\s*\n(.*?)\n```", regex::escape(language));
    let re = Regex::new(&pattern).ok()?;
    re.captures(text).map(|caps| caps[1].to_string())
}

/// Source of the first ```json fenced object, unparsed.
pub fn extract_json_object(text: &str) -> Option<&str> {
    JSON_BLOCK
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}
