//! First stage: asks the model whether a message is code-related and, if so,
//! for a directive prompt to hand to the refinement chain.
//!
//! The router makes no decision of its own. It only parses the JSON envelope
//! the model answers with and refuses to guess when that envelope is missing.

use serde::Deserialize;
use tracing::{debug, info};

use crate::constants::{DEFAULT_CHAT_REPLY, DEFAULT_CODE_ACK};
use crate::decompose::extract_json_object;
use crate::error::PipelineError;
use crate::session::ChatSession;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterDecision {
    pub is_code_related: bool,
    pub acknowledgement: String,
    pub next_prompt: String,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    is_code_related: bool,
    response_for_user: Option<String>,
    #[serde(default)]
    prompt_for_model2: String,
}

/// Parse the router model's raw answer. A ```json block wins over the bare
/// text; if neither parses, the raw text is returned inside the error.
pub fn parse_decision(raw: &str) -> Result<RouterDecision, PipelineError> {
    let source = extract_json_object(raw).unwrap_or_else(|| raw.trim());
    let envelope: Envelope =
        serde_json::from_str(source).map_err(|e| PipelineError::MalformedRouterOutput {
            raw: raw.to_string(),
            reason: e.to_string(),
        })?;

    let acknowledgement = match envelope.response_for_user {
        Some(text) if !text.trim().is_empty() => text,
        _ if envelope.is_code_related => DEFAULT_CODE_ACK.to_string(),
        _ => DEFAULT_CHAT_REPLY.to_string(),
    };

    Ok(RouterDecision {
        is_code_related: envelope.is_code_related,
        acknowledgement,
        next_prompt: envelope.prompt_for_model2,
    })
}

/// Route one user message through the router session.
pub async fn route(session: &mut ChatSession, utterance: &str) -> Result<RouterDecision, PipelineError> {
    if utterance.trim().is_empty() {
        return Err(PipelineError::EmptyUtterance);
    }
    let raw = session.send(utterance).await?;
    debug!(%raw, "Router raw output");

    let decision = parse_decision(&raw)?;
    if decision.is_code_related && decision.next_prompt.trim().is_empty() {
        return Err(PipelineError::MissingDirective);
    }
    info!(code_related = decision.is_code_related, "Routing decision made");
    Ok(decision)
}
