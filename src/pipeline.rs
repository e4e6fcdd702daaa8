//! Runs one user message through the router and, for code requests, the
//! refinement chain. Stages run strictly one after another; a stage starts
//! only once the previous one has produced its whole output.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, instrument, warn};

use crate::constants;
use crate::decompose::{decompose, extract_code_block, Segment};
use crate::error::PipelineError;
use crate::gemini::GeminiClient;
use crate::router;
use crate::session::ChatSession;
use crate::stages::{default_stages, StageDescriptor, ROUTER_GENERATION, ROUTER_INSTRUCTION};

/// Progress notifications for front-ends.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Acknowledged(String),
    StageStarted {
        index: usize,
        total: usize,
        label: String,
    },
    Chunk {
        stage: String,
        text: String,
    },
    Completed(crate::conversation::Turn),
    Failed(String),
}

pub type EventSender = UnboundedSender<PipelineEvent>;

pub(crate) fn emit(events: Option<&EventSender>, event: PipelineEvent) {
    if let Some(tx) = events {
        // Front-ends may stop listening mid-turn; the turn still completes.
        let _ = tx.send(event);
    }
}

pub struct Pipeline {
    router: ChatSession,
    stages: Vec<(StageDescriptor, ChatSession)>,
}

impl Pipeline {
    /// Create fresh sessions for the router and every stage. Without a client
    /// all sessions are unusable.
    pub fn new(client: Option<Arc<GeminiClient>>, model: &str, stages: Vec<StageDescriptor>) -> Self {
        let router = ChatSession::new(
            "router",
            client.clone(),
            model,
            ROUTER_INSTRUCTION,
            ROUTER_GENERATION,
        );
        let stages = stages
            .into_iter()
            .map(|stage| {
                let session = ChatSession::new(
                    stage.name,
                    client.clone(),
                    model,
                    stage.system_instruction,
                    stage.generation,
                );
                (stage, session)
            })
            .collect();
        Self { router, stages }
    }

    /// Default chain against the configured model. A credential error is
    /// logged and leaves the pipeline unusable rather than aborting.
    pub fn from_api_key(api_key: Result<String, PipelineError>) -> Self {
        let client = match api_key {
            Ok(key) => Some(Arc::new(GeminiClient::new(key))),
            Err(e) => {
                error!("{}", e);
                warn!("Continuing without a usable model session; every request will fail");
                None
            }
        };
        Self::new(client, &constants::MAKE_BEST_MODEL, default_stages())
    }

    pub fn is_available(&self) -> bool {
        self.router.is_available()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|(s, _)| s.name).collect()
    }

    #[instrument(skip(self, events))]
    pub async fn run(
        &mut self,
        utterance: &str,
        events: Option<&EventSender>,
    ) -> Result<Vec<Segment>, PipelineError> {
        let decision = router::route(&mut self.router, utterance).await?;
        emit(events, PipelineEvent::Acknowledged(decision.acknowledgement.clone()));

        if !decision.is_code_related {
            return Ok(vec![Segment::Text(decision.acknowledgement)]);
        }

        let total = self.stages.len() + 1;
        let mut output = decision.next_prompt;
        for (i, (stage, session)) in self.stages.iter_mut().enumerate() {
            info!(stage = stage.name, "{}", stage.label);
            emit(
                events,
                PipelineEvent::StageStarted {
                    index: i + 2,
                    total,
                    label: stage.label.to_string(),
                },
            );

            let payload = match stage.extract {
                Some(language) => extract_code_block(&output, language).ok_or_else(|| {
                    PipelineError::ExtractionFailed {
                        stage: stage.name.to_string(),
                        language: language.to_string(),
                        output: output.clone(),
                    }
                })?,
                None => std::mem::take(&mut output),
            };
            let prompt = stage.render_prompt(&payload)?;

            output = if stage.stream {
                let name = stage.name;
                session
                    .send_streaming(&prompt, |chunk| {
                        emit(
                            events,
                            PipelineEvent::Chunk {
                                stage: name.to_string(),
                                text: chunk.to_string(),
                            },
                        )
                    })
                    .await?
            } else {
                session.send(&prompt).await?
            };
            if !stage.output.matches(&output) {
                warn!(stage = stage.name, shape = ?stage.output, "Stage output does not have the expected shape");
            }
        }

        Ok(decompose(&output))
    }
}
