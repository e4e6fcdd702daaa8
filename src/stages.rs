//! Stage descriptors: the fixed prompts and generation settings of every call
//! in the pipeline, listed in execution order.

use minijinja::{context, Environment};

use crate::decompose::{decompose, Segment};
use crate::error::PipelineError;
use crate::gemini::GenerationConfig;

/// What a stage is expected to answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    /// Setup notes and code, usually unfenced.
    RawCode,
    /// A ```json report followed by a fenced code block.
    ReportWithCode,
}

impl OutputShape {
    /// Whether `text` has the structure this shape promises.
    pub fn matches(self, text: &str) -> bool {
        match self {
            OutputShape::RawCode => !text.trim().is_empty(),
            OutputShape::ReportWithCode => {
                let segments = decompose(text);
                segments.iter().any(|s| matches!(s, Segment::Json(_)))
                    && segments.iter().any(|s| matches!(s, Segment::Code { .. }))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageDescriptor {
    pub name: &'static str,
    /// Progress line shown while the stage runs.
    pub label: &'static str,
    pub system_instruction: &'static str,
    pub generation: GenerationConfig,
    /// minijinja template; `payload` is the previous stage's output.
    pub prompt_template: &'static str,
    pub output: OutputShape,
    /// When set, `payload` is only the fenced block of this language taken
    /// from the previous output, and its absence aborts the turn.
    pub extract: Option<&'static str>,
    pub stream: bool,
}

impl StageDescriptor {
    pub fn render_prompt(&self, payload: &str) -> Result<String, PipelineError> {
        let env = Environment::new();
        Ok(env.render_str(self.prompt_template, context! { payload => payload })?)
    }
}

pub const ROUTER_GENERATION: GenerationConfig = GenerationConfig {
    temperature: 0.3,
    top_p: 0.9,
    top_k: 40,
    max_output_tokens: 7500,
    response_mime_type: "text/plain",
};

pub const ROUTER_INSTRUCTION: &str = r#"You are an intelligent gatekeeper and expert prompt engineer for a specialized AI coding assistant (Model 2).
Your primary function is to analyze the user's input and the recent conversation history to determine if a request is code-related. Conversation history is crucial for context.

Answer with a single JSON object inside a ```json fenced block and nothing else:
{"is_code_related": <true|false>, "response_for_user": "<short acknowledgement or reply>", "prompt_for_model2": "<directive prompt or empty string>"}

1. IF the latest input, considered with the preceding turns, clearly requests code generation, code modification, code optimization, or discusses a programming problem requiring a code solution:
   - set "is_code_related" to true;
   - set "response_for_user" to a one-sentence acknowledgement of what will be built;
   - set "prompt_for_model2" to a meticulously crafted, self-contained directive prompt for Model 2. It must demand only code as output, maximal time and space efficiency (state Big O when non-trivial), thorough coverage of explicit and implicit requirements, robust handling of edge cases and invalid input, idiomatic style with comments where non-obvious, and a complete, well-developed solution. Synthesize the problem description, constraints, language, libraries and relevant history into it. Be exhaustive; use up to 7000 tokens.
2. ELSE (not code-related, or still ambiguous after considering history):
   - set "is_code_related" to false;
   - set "response_for_user" to a brief friendly reply, for example "Nice to meet you!";
   - set "prompt_for_model2" to "".

Remember to use the conversation history to carry over language choices and constraints the user established earlier."#;

const CODE_GENERATOR_INSTRUCTION: &str = "You are an elite AI specializing in writing extremely efficient and comprehensive code. \
Your ONLY output should be the requested code. Do NOT include explanations, apologies, or any text other than the code itself. \
Strictly follow all directives in the user's prompt.";

const APEX_SYNTHESIZER_INSTRUCTION: &str = "You are the Apex Code Synthesizer. You receive code inside <CodeToRefine> and a goal inside <TaskGoal>. \
Produce the definitive version of that code: complete, runnable, efficient and idiomatic. \
Output raw text only, no Markdown fences: first the setup instructions (dependencies, install commands) as comment lines, then the pure code.";

const CODE_PHYSICIAN_INSTRUCTION: &str = "You are the Code Physician. You receive code inside <CodeToFix> and instructions inside <RequestDetails>. \
Diagnose every syntax, logic, runtime and dependency problem, fix them, and verify the fix by reasoning through execution. \
Output exactly two things in this order: a ```json fenced report object with the keys \"diagnosis\", \"fixes_applied\" and \"verification\", \
then the complete corrected program in a single ```python fenced block.";

const ITERATIVE_REFINER_INSTRUCTION: &str = "You are the Iterative Refiner. You receive code inside <CodeToPerfect>, a goal inside <TaskGoal> and an iteration budget inside <MaxIterations>. \
Review, test mentally and improve the code repeatedly until it is fully runnable and functionally complete, or the budget is spent. \
Output exactly two things in this order: a ```json fenced log object with the keys \"iterations\" (a list of what changed in each pass) and \"status\", \
then the final program in a single ```python fenced block.";

/// Stages 2 to 5 of the pipeline, run in order after a code-related routing
/// decision.
pub fn default_stages() -> Vec<StageDescriptor> {
    vec![
        StageDescriptor {
            name: "code-generator",
            label: "Stage 2/5: Generating initial code...",
            system_instruction: CODE_GENERATOR_INSTRUCTION,
            generation: GenerationConfig {
                temperature: 0.9,
                top_p: 0.9,
                top_k: 100,
                max_output_tokens: 8120,
                response_mime_type: "text/plain",
            },
            prompt_template: "{{ payload }}",
            output: OutputShape::RawCode,
            extract: None,
            stream: true,
        },
        StageDescriptor {
            name: "apex-synthesizer",
            label: "Stage 3/5: Refining code structure...",
            system_instruction: APEX_SYNTHESIZER_INSTRUCTION,
            generation: GenerationConfig {
                temperature: 0.4,
                top_p: 0.9,
                top_k: 64,
                max_output_tokens: 8192,
                response_mime_type: "text/plain",
            },
            prompt_template: "<CodeToRefine>\n{{ payload }}\n</CodeToRefine>\n<TaskGoal>Refine this code to meet Apex standards: raw output, setup instructions, peak quality.</TaskGoal>",
            output: OutputShape::RawCode,
            extract: None,
            stream: true,
        },
        StageDescriptor {
            name: "code-physician",
            label: "Stage 4/5: Diagnosing and correcting...",
            system_instruction: CODE_PHYSICIAN_INSTRUCTION,
            generation: GenerationConfig {
                temperature: 0.2,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 8192,
                response_mime_type: "text/plain",
            },
            prompt_template: "<CodeToFix language='python'>\n{{ payload }}\n</CodeToFix>\n<RequestDetails>Diagnose, fix, and verify this code. Adhere to any implicit library constraints. Output JSON report then corrected code block.</RequestDetails>",
            output: OutputShape::ReportWithCode,
            extract: None,
            stream: true,
        },
        StageDescriptor {
            name: "iterative-refiner",
            label: "Stage 5/5: Final iterative perfection...",
            system_instruction: ITERATIVE_REFINER_INSTRUCTION,
            generation: GenerationConfig {
                temperature: 0.2,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: 8192,
                response_mime_type: "text/plain",
            },
            prompt_template: "<CodeToPerfect language='python'>\n```python\n{{ payload }}\n```\n</CodeToPerfect>\n<TaskGoal>Iteratively perfect this code until it's 100% runnable and functionally complete. Output JSON log then final code block.</TaskGoal>\n<MaxIterations>5</MaxIterations>",
            output: OutputShape::ReportWithCode,
            extract: Some("python"),
            stream: true,
        },
    ]
}
