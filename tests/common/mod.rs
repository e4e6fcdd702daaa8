#![allow(dead_code)]

use std::sync::Arc;

use make_best::gemini::GeminiClient;
use make_best::stages::default_stages;
use make_best::Pipeline;
use serde_json::json;
use wiremock::ResponseTemplate;

pub const MODEL: &str = "test-model";
pub const API_KEY: &str = "test-key";

pub const GENERATE_PATH: &str = "/v1beta/models/test-model:generateContent";
pub const STREAM_PATH: &str = "/v1beta/models/test-model:streamGenerateContent";

// Phrases that only appear in one stage's system instruction.
pub const ROUTER_MARKER: &str = "intelligent gatekeeper";
pub const GENERATOR_MARKER: &str = "elite AI specializing";
pub const SYNTHESIZER_MARKER: &str = "Apex Code Synthesizer";
pub const PHYSICIAN_MARKER: &str = "Code Physician";
pub const REFINER_MARKER: &str = "Iterative Refiner";

fn candidate(text: &str) -> serde_json::Value {
    json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": text}]},
            "finishReason": "STOP"
        }]
    })
}

/// A complete `generateContent` answer.
pub fn reply(text: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(candidate(text))
}

/// A `streamGenerateContent?alt=sse` answer, one event per chunk.
pub fn streamed(chunks: &[&str]) -> ResponseTemplate {
    let body: String = chunks
        .iter()
        .map(|c| format!("data: {}\r\n\r\n", candidate(c)))
        .collect();
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

pub fn router_reply(decision: serde_json::Value) -> ResponseTemplate {
    reply(&format!("```json\n{}\n```", decision))
}

pub fn pipeline_for(uri: &str) -> Pipeline {
    let client = Arc::new(GeminiClient::with_base_url(API_KEY.into(), uri.into()));
    Pipeline::new(Some(client), MODEL, default_stages())
}
