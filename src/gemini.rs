//! Minimal client for the Gemini `generateContent` REST API.
//!
//! Knows nothing about stages or routing. It turns a request into text, either
//! in one piece or as a stream of chunks parsed from server-sent events.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::stream::{self, Stream, StreamExt};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use crate::constants;

/// Errors from the remote model API, surfaced unchanged to the caller.
#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("response blocked: {0}")]
    Blocked(String),
}

/// A lazy, finite, non-restartable sequence of text chunks.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, GeminiError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(default)]
    pub text: String,
}

/// One message in a Gemini conversation. `role` is `user` or `model`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(text: impl Into<String>) -> Self {
        Self::with_role("user", text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::with_role("model", text)
    }

    /// Role-less content, as used for the system instruction.
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: None,
            parts: vec![Part { text: text.into() }],
        }
    }

    fn with_role(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: Some(role.to_string()),
            parts: vec![Part { text: text.into() }],
        }
    }

    pub fn text(&self) -> String {
        self.parts.iter().map(|p| p.text.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
    pub response_mime_type: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HarmCategory {
    #[serde(rename = "HARM_CATEGORY_HARASSMENT")]
    Harassment,
    #[serde(rename = "HARM_CATEGORY_SEXUALLY_EXPLICIT")]
    SexuallyExplicit,
    #[serde(rename = "HARM_CATEGORY_DANGEROUS_CONTENT")]
    DangerousContent,
    #[serde(rename = "HARM_CATEGORY_HATE_SPEECH")]
    HateSpeech,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HarmBlockThreshold {
    BlockNone,
    BlockLowAndAbove,
    BlockMediumAndAbove,
    BlockOnlyHigh,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SafetySetting {
    pub category: HarmCategory,
    pub threshold: HarmBlockThreshold,
}

/// All four harm categories blocked at medium probability and above.
pub fn default_safety_settings() -> Vec<SafetySetting> {
    [
        HarmCategory::Harassment,
        HarmCategory::SexuallyExplicit,
        HarmCategory::DangerousContent,
        HarmCategory::HateSpeech,
    ]
    .into_iter()
    .map(|category| SafetySetting {
        category,
        threshold: HarmBlockThreshold::BlockMediumAndAbove,
    })
    .collect()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub generation_config: GenerationConfig,
    pub safety_settings: Vec<SafetySetting>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    pub prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Option<Content>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    pub block_reason: Option<String>,
}

impl GenerateContentResponse {
    fn block_reason(&self) -> Option<&str> {
        self.prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
    }

    /// Text of the first candidate.
    pub fn into_text(self) -> Result<String, GeminiError> {
        if let Some(reason) = self.block_reason() {
            return Err(GeminiError::Blocked(reason.to_string()));
        }
        let candidate = self
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| GeminiError::InvalidResponse("response has no candidates".into()))?;
        match candidate.content {
            Some(content) => Ok(content.text()),
            None => Err(match candidate.finish_reason {
                Some(reason) => GeminiError::Blocked(reason),
                None => GeminiError::InvalidResponse("candidate has no content".into()),
            }),
        }
    }
}

/// Raw HTTP client, shared by every session that has a credential.
#[derive(Debug)]
pub struct GeminiClient {
    http: Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, constants::GEMINI_BASE_URL.clone())
    }

    /// Create a client with a custom base URL (for testing with mock servers).
    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            http: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!("{}/v1beta/models/{}:{}", self.base_url, model, method)
    }

    async fn post(
        &self,
        url: &str,
        request: &GenerateContentRequest,
    ) -> Result<Response, GeminiError> {
        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            return Err(GeminiError::RateLimited { retry_after });
        }
        if status >= 400 {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            error!(%status, %message, "Gemini API request failed");
            return Err(GeminiError::Api { status, message });
        }
        Ok(response)
    }

    #[instrument(skip(self, request), fields(turns = request.contents.len()))]
    pub async fn generate(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<String, GeminiError> {
        let url = self.endpoint(model, "generateContent");
        let response: GenerateContentResponse = self
            .post(&url, request)
            .await?
            .json()
            .await
            .map_err(|e| GeminiError::InvalidResponse(format!("failed to parse response: {e}")))?;
        let text = response.into_text()?;
        debug!(chars = text.len(), "Received Gemini response");
        Ok(text)
    }

    /// Start a streamed generation. Chunks are yielded as the server sends them.
    #[instrument(skip(self, request), fields(turns = request.contents.len()))]
    pub async fn stream_generate(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> Result<TextStream, GeminiError> {
        let url = format!("{}?alt=sse", self.endpoint(model, "streamGenerateContent"));
        let response = self.post(&url, request).await?;
        Ok(Box::pin(sse_text_chunks(response.bytes_stream())))
    }
}

/// Decode one server-sent-event line into a text chunk, if it carries one.
pub(crate) fn parse_sse_line(line: &str) -> Option<Result<String, GeminiError>> {
    let data = line.trim_end_matches('\r').strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let response: GenerateContentResponse = match serde_json::from_str(data) {
        Ok(r) => r,
        Err(e) => {
            warn!("Failed to parse SSE line: {} - Error: {}", data, e);
            return Some(Err(GeminiError::InvalidResponse(format!(
                "bad stream event: {e}"
            ))));
        }
    };
    if let Some(reason) = response.block_reason() {
        return Some(Err(GeminiError::Blocked(reason.to_string())));
    }
    let candidate = response.candidates.first()?;
    let text = candidate
        .content
        .as_ref()
        .map(Content::text)
        .unwrap_or_default();
    if !text.is_empty() {
        return Some(Ok(text));
    }
    match candidate.finish_reason.as_deref() {
        None | Some("STOP") | Some("MAX_TOKENS") => None,
        Some(reason) => Some(Err(GeminiError::Blocked(reason.to_string()))),
    }
}

struct SseState<S> {
    bytes: Pin<Box<S>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String, GeminiError>>,
    finished: bool,
}

impl<S> SseState<S> {
    // Only whole lines are decoded so multi-byte characters split across
    // network chunks stay intact.
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.push_line(&line);
        }
    }

    fn push_line(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        if let Some(item) = parse_sse_line(line.trim_end_matches('\n')) {
            self.pending.push_back(item);
        }
    }
}

pub(crate) fn sse_text_chunks<S, B>(bytes: S) -> impl Stream<Item = Result<String, GeminiError>>
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]>,
{
    let state = SseState {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(chunk.as_ref());
                    state.drain_lines();
                }
                Some(Err(e)) => {
                    error!("Stream error: {}", e);
                    state.pending.push_back(Err(GeminiError::Http(e)));
                    state.finished = true;
                }
                None => {
                    let rest = std::mem::take(&mut state.buffer);
                    if !rest.is_empty() {
                        state.push_line(&rest);
                    }
                    state.finished = true;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GenerationConfig {
        GenerationConfig {
            temperature: 0.3,
            top_p: 0.9,
            top_k: 40,
            max_output_tokens: 7500,
            response_mime_type: "text/plain",
        }
    }

    #[test]
    fn client_custom_base_url_is_normalized() {
        let client = GeminiClient::with_base_url("k".into(), "http://localhost:8080/".into());
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(
            client.endpoint("gemini-1.5-flash-latest", "generateContent"),
            "http://localhost:8080/v1beta/models/gemini-1.5-flash-latest:generateContent"
        );
    }

    #[test]
    fn request_serializes_in_camel_case() {
        let req = GenerateContentRequest {
            contents: vec![Content::user("Hello")],
            system_instruction: Some(Content::system("Be brief.")),
            generation_config: config(),
            safety_settings: default_safety_settings(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][0]["parts"][0]["text"], "Hello");
        assert!(json["systemInstruction"].get("role").is_none());
        assert_eq!(json["generationConfig"]["topK"], 40);
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 7500);
        assert_eq!(json["generationConfig"]["responseMimeType"], "text/plain");
        assert_eq!(json["safetySettings"].as_array().unwrap().len(), 4);
        assert_eq!(
            json["safetySettings"][1]["category"],
            "HARM_CATEGORY_SEXUALLY_EXPLICIT"
        );
        assert_eq!(
            json["safetySettings"][1]["threshold"],
            "BLOCK_MEDIUM_AND_ABOVE"
        );
    }

    #[test]
    fn response_text_joins_parts() {
        let json = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hel"},{"text":"lo"}]},"finishReason":"STOP"}]}"#;
        let resp: GenerateContentResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.into_text().unwrap(), "Hello");
    }

    #[test]
    fn blocked_prompt_is_an_error() {
        let json = r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#;
        let resp: GenerateContentResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(resp.into_text(), Err(GeminiError::Blocked(r)) if r == "SAFETY"));
    }

    #[test]
    fn candidate_without_content_reports_finish_reason() {
        let json = r#"{"candidates":[{"finishReason":"RECITATION"}]}"#;
        let resp: GenerateContentResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(resp.into_text(), Err(GeminiError::Blocked(r)) if r == "RECITATION"));
    }

    #[test]
    fn sse_lines() {
        let line = r#"data: {"candidates":[{"content":{"parts":[{"text":"abc"}]}}]}"#;
        assert_eq!(parse_sse_line(line).unwrap().unwrap(), "abc");
        assert!(parse_sse_line("").is_none());
        assert!(parse_sse_line(": keep-alive").is_none());
        assert!(parse_sse_line("data: [DONE]").is_none());
        assert!(matches!(
            parse_sse_line("data: {not json"),
            Some(Err(GeminiError::InvalidResponse(_)))
        ));
        assert!(parse_sse_line(r#"data: {"candidates":[{"finishReason":"STOP"}]}"#).is_none());
    }

    #[test]
    fn sse_safety_stop_is_blocked() {
        let line = r#"data: {"candidates":[{"finishReason":"SAFETY"}]}"#;
        assert!(matches!(
            parse_sse_line(line),
            Some(Err(GeminiError::Blocked(r))) if r == "SAFETY"
        ));
    }

    #[tokio::test]
    async fn sse_stream_surfaces_block_after_partial_text() {
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"def f\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"finishReason\":\"SAFETY\"}]}\n\n",
        );
        let chunks: Vec<Result<Vec<u8>, reqwest::Error>> = vec![Ok(body.as_bytes().to_vec())];
        let items: Vec<Result<String, GeminiError>> =
            sse_text_chunks(stream::iter(chunks)).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "def f");
        assert!(matches!(&items[1], Err(GeminiError::Blocked(r)) if r == "SAFETY"));
    }

    #[tokio::test]
    async fn sse_stream_reassembles_split_lines() {
        let event = r#"data: {"candidates":[{"content":{"parts":[{"text":"héllo"}]}}]}"#;
        let full = format!("{event}\r\n\r\n{event}\n\n");
        let bytes = full.into_bytes();
        // Split inside the multi-byte character of the first event.
        let split = full_index_of_e_acute(&bytes);
        let chunks: Vec<Result<Vec<u8>, reqwest::Error>> =
            vec![Ok(bytes[..split].to_vec()), Ok(bytes[split..].to_vec())];
        let texts: Vec<String> = sse_text_chunks(stream::iter(chunks))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(texts, vec!["héllo".to_string(), "héllo".to_string()]);
    }

    fn full_index_of_e_acute(bytes: &[u8]) -> usize {
        bytes.iter().position(|b| *b == 0xC3).unwrap() + 1
    }
}
