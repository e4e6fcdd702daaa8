pub mod chat;
pub mod constants;
pub mod conversation;
pub mod credentials;
pub mod decompose;
pub mod error;
pub mod gemini;
pub mod pipeline;
pub mod router;
pub mod session;
pub mod stages;
pub mod web_server;

pub use conversation::{Conversation, Role, Turn};
pub use decompose::{decompose, Segment};
pub use error::PipelineError;
pub use pipeline::{Pipeline, PipelineEvent};
pub use router::RouterDecision;
