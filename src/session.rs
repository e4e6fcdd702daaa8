//! Owned chat sessions, one per pipeline stage.
//!
//! A session keeps its own conversation history and replays it on every call,
//! so each stage remembers what it was asked before. Sessions created without
//! a client are unusable: every call fails with `StageUnavailable`.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, info, instrument};

use crate::error::PipelineError;
use crate::gemini::{
    default_safety_settings, Content, GeminiClient, GenerateContentRequest, GenerationConfig,
    SafetySetting,
};

#[derive(Debug)]
pub struct ChatSession {
    stage: String,
    model: String,
    system_instruction: Content,
    generation_config: GenerationConfig,
    safety_settings: Vec<SafetySetting>,
    client: Option<Arc<GeminiClient>>,
    history: Vec<Content>,
}

impl ChatSession {
    pub fn new(
        stage: impl Into<String>,
        client: Option<Arc<GeminiClient>>,
        model: impl Into<String>,
        system_instruction: &str,
        generation_config: GenerationConfig,
    ) -> Self {
        Self {
            stage: stage.into(),
            model: model.into(),
            system_instruction: Content::system(system_instruction),
            generation_config,
            safety_settings: default_safety_settings(),
            client,
            history: Vec::new(),
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn is_available(&self) -> bool {
        self.client.is_some()
    }

    /// Every exchanged message so far, oldest first.
    pub fn history(&self) -> &[Content] {
        &self.history
    }

    fn client(&self) -> Result<Arc<GeminiClient>, PipelineError> {
        self.client
            .clone()
            .ok_or_else(|| PipelineError::StageUnavailable {
                stage: self.stage.clone(),
            })
    }

    fn request(&self) -> GenerateContentRequest {
        GenerateContentRequest {
            contents: self.history.clone(),
            system_instruction: Some(self.system_instruction.clone()),
            generation_config: self.generation_config,
            safety_settings: self.safety_settings.clone(),
        }
    }

    /// Send one message and wait for the whole reply.
    #[instrument(skip(self, prompt), fields(stage = %self.stage))]
    pub async fn send(&mut self, prompt: &str) -> Result<String, PipelineError> {
        let client = self.client()?;
        debug!(%prompt, "Sending message");
        self.history.push(Content::user(prompt));
        let result = client.generate(&self.model, &self.request()).await;
        self.finish(result.map_err(PipelineError::from))
    }

    /// Send one message, handing each streamed chunk to `on_chunk` as it
    /// arrives. Returns the accumulated reply.
    #[instrument(skip(self, prompt, on_chunk), fields(stage = %self.stage))]
    pub async fn send_streaming<F>(
        &mut self,
        prompt: &str,
        mut on_chunk: F,
    ) -> Result<String, PipelineError>
    where
        F: FnMut(&str),
    {
        let client = self.client()?;
        debug!(%prompt, "Sending streamed message");
        self.history.push(Content::user(prompt));

        let result = async {
            let mut stream = client.stream_generate(&self.model, &self.request()).await?;
            let mut accumulated = String::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                on_chunk(&chunk);
                accumulated.push_str(&chunk);
            }
            Ok::<_, PipelineError>(accumulated)
        }
        .await;
        self.finish(result)
    }

    fn finish(&mut self, result: Result<String, PipelineError>) -> Result<String, PipelineError> {
        match result {
            Ok(text) => {
                info!(stage = %self.stage, chars = text.len(), "Stage replied");
                self.history.push(Content::model(text.clone()));
                Ok(text)
            }
            Err(e) => {
                // A failed exchange is not part of the conversation.
                self.history.pop();
                Err(e)
            }
        }
    }
}
