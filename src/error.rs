use crate::gemini::GeminiError;

/// Everything that can go wrong while handling one user turn.
///
/// None of these are retried. The conversation records them as a visible
/// text segment in place of the assistant's answer.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no API key found in environment variable {key_name}")]
    CredentialMissing { key_name: String },

    #[error("router output is not a valid decision ({reason}): {raw}")]
    MalformedRouterOutput { raw: String, reason: String },

    #[error("router marked the request as code-related but gave no instructions for the next stage")]
    MissingDirective,

    #[error("cannot route an empty message")]
    EmptyUtterance,

    #[error("stage '{stage}' has no usable session (missing API key?)")]
    StageUnavailable { stage: String },

    #[error("could not extract a {language} code block for stage '{stage}' from:\n{output}")]
    ExtractionFailed {
        stage: String,
        language: String,
        output: String,
    },

    #[error("remote call failed: {0}")]
    RemoteCallFailed(#[from] GeminiError),

    #[error("prompt template error: {0}")]
    Template(#[from] minijinja::Error),
}

impl PipelineError {
    /// Text stored in history when a turn fails.
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::MalformedRouterOutput { .. } | PipelineError::MissingDirective => format!(
                "Sorry, I had trouble understanding the initial request structure. Error: {}",
                self
            ),
            _ => format!("Sorry, I encountered an error: {}", self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_errors_get_the_structure_message() {
        let err = PipelineError::MalformedRouterOutput {
            raw: "Nice to meet you!".into(),
            reason: "expected value".into(),
        };
        let msg = err.user_message();
        assert!(msg.starts_with("Sorry, I had trouble understanding"));
        assert!(msg.contains("Nice to meet you!"));
    }

    #[test]
    fn other_errors_get_the_generic_message() {
        let err = PipelineError::StageUnavailable {
            stage: "code-generator".into(),
        };
        assert_eq!(
            err.user_message(),
            "Sorry, I encountered an error: stage 'code-generator' has no usable session (missing API key?)"
        );
    }

    #[test]
    fn remote_errors_convert() {
        let err: PipelineError = GeminiError::Blocked("SAFETY".into()).into();
        assert!(matches!(err, PipelineError::RemoteCallFailed(_)));
        assert!(err.to_string().contains("SAFETY"));
    }
}
