// Interactive terminal chat: one line in, one pipeline run out.

use anyhow::{Context, Result};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

use crate::conversation::Conversation;
use crate::decompose::Segment;
use crate::pipeline::{Pipeline, PipelineEvent};

/// Render an assistant turn for a terminal.
pub fn render_segments(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(Segment::to_markdown)
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn print_event(event: &PipelineEvent) {
    match event {
        PipelineEvent::Acknowledged(text) => println!("assistant: {}", text),
        PipelineEvent::StageStarted { label, .. } => println!("  ... {}", label),
        // Streamed text is only progress; the rendered turn follows.
        PipelineEvent::Chunk { .. } => {
            print!(".");
            // Progress dots only; a failed flush shows up on the next prompt.
            std::io::stdout().flush().ok();
        }
        PipelineEvent::Failed(message) => eprintln!("error: {}", message),
        PipelineEvent::Completed(_) => println!(),
    }
}

pub async fn run_chat(mut pipeline: Pipeline) -> Result<()> {
    info!("Starting terminal chat...");
    let mut conversation = Conversation::new();
    if let Some(greeting) = conversation.turns().first() {
        println!("assistant: {}", render_segments(&greeting.segments));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you: ");
        std::io::stdout().flush().context("Failed to flush stdout")?;

        let Some(line) = lines.next_line().await.context("Failed to read from stdin")? else {
            break;
        };
        let utterance = line.trim();
        if utterance.eq_ignore_ascii_case("quit") {
            break;
        }
        if utterance.is_empty() {
            continue;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                print_event(&event);
            }
        });

        let turn = conversation
            .submit(&mut pipeline, utterance, Some(&tx))
            .await
            .clone();
        drop(tx);
        printer.await.context("Progress printer task failed")?;

        println!("assistant:\n{}", render_segments(&turn.segments));
    }

    info!(turns = conversation.turns().len(), "Chat session finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn segments_render_in_order() {
        let rendered = render_segments(&[
            Segment::Json(json!({"status": "ok"})),
            Segment::code("python", "print(1)"),
            Segment::Text("done".into()),
        ]);
        assert_eq!(
            rendered,
            "```json\n{\n  \"status\": \"ok\"\n}\n```\n\n```python\nprint(1)\n```\n\ndone"
        );
    }

    #[test]
    fn progress_events_print_without_a_terminal() {
        print_event(&PipelineEvent::Acknowledged("On it.".into()));
        print_event(&PipelineEvent::Chunk {
            stage: "code-generator".into(),
            text: "def".into(),
        });
        print_event(&PipelineEvent::Failed("boom".into()));
    }
}
