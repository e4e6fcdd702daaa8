use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::constants::GREETING;
use crate::decompose::Segment;
use crate::pipeline::{emit, EventSender, Pipeline, PipelineEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub segments: Vec<Segment>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            segments: vec![Segment::Text(text.into())],
        }
    }

    pub fn assistant(segments: Vec<Segment>) -> Self {
        Self {
            role: Role::Assistant,
            segments,
        }
    }
}

/// Append-only chat log for the life of the process.
#[derive(Debug, Clone)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            turns: vec![Turn::assistant(vec![Segment::Text(GREETING.to_string())])],
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Append a finished turn.
    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// Record the user's message, run it through `pipeline` and record the
    /// answer. A failed run is recorded as an error message, so every user
    /// turn is followed by exactly one assistant turn.
    pub async fn submit(
        &mut self,
        pipeline: &mut Pipeline,
        utterance: &str,
        events: Option<&EventSender>,
    ) -> &Turn {
        self.push(Turn::user(utterance));
        let turn = respond(pipeline, utterance, events).await;
        self.push(turn);
        &self.turns[self.turns.len() - 1]
    }
}

/// Run `utterance` through `pipeline` and build the assistant turn for it.
/// Errors become an apology turn; `Failed` and `Completed` are published.
pub async fn respond(
    pipeline: &mut Pipeline,
    utterance: &str,
    events: Option<&EventSender>,
) -> Turn {
    let turn = match pipeline.run(utterance, events).await {
        Ok(segments) => {
            info!(segments = segments.len(), "Turn completed");
            Turn::assistant(segments)
        }
        Err(e) => {
            error!("An error occurred in the AI pipeline: {}", e);
            emit(events, PipelineEvent::Failed(e.to_string()));
            Turn::assistant(vec![Segment::Text(e.user_message())])
        }
    };
    emit(events, PipelineEvent::Completed(turn.clone()));
    turn
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::default_stages;

    #[test]
    fn starts_with_greeting() {
        let conversation = Conversation::new();
        assert_eq!(conversation.turns().len(), 1);
        assert_eq!(conversation.turns()[0].role, Role::Assistant);
        assert_eq!(
            conversation.turns()[0].segments,
            vec![Segment::Text(GREETING.to_string())]
        );
    }

    #[tokio::test]
    async fn failed_turn_is_still_recorded() {
        let mut pipeline = Pipeline::new(None, "m", default_stages());
        let mut conversation = Conversation::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let turn = conversation.submit(&mut pipeline, "write fizzbuzz", Some(&tx)).await.clone();

        assert_eq!(turn.role, Role::Assistant);
        match &turn.segments[..] {
            [Segment::Text(text)] => {
                assert!(text.starts_with("Sorry, I encountered an error:"));
                assert!(text.contains("router"));
            }
            other => panic!("unexpected segments {:?}", other),
        }
        assert_eq!(conversation.turns().len(), 3);
        assert_eq!(conversation.turns()[1], Turn::user("write fizzbuzz"));

        assert!(matches!(rx.recv().await, Some(PipelineEvent::Failed(_))));
        assert_eq!(rx.recv().await, Some(PipelineEvent::Completed(turn)));
    }

    #[test]
    fn turn_serializes_for_the_browser() {
        let json = serde_json::to_value(Turn::user("hi")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"role": "user", "segments": [{"kind": "text", "data": "hi"}]})
        );
    }
}
