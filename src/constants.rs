// Runtime constants, loaded once from the environment with fallbacks.

use std::env;

lazy_static::lazy_static! {
    pub static ref GEMINI_BASE_URL: String = env::var("GEMINI_BASE_URL")
        .unwrap_or_else(|_| "https://generativelanguage.googleapis.com".to_string());
    // Every stage talks to the same model; only the generation settings differ.
    pub static ref MAKE_BEST_MODEL: String = env::var("MAKE_BEST_MODEL")
        .unwrap_or_else(|_| "gemini-1.5-flash-latest".to_string());
}

/// Environment variable holding the API key unless `--key-name` overrides it.
pub const DEFAULT_KEY_NAME: &str = "GOOGLE_API_KEY";

pub const GREETING: &str =
    "Hello! How can I assist you today with your coding or machine learning tasks?";

/// Shown in place of a response that carried no text at all.
pub const EMPTY_RESPONSE_PLACEHOLDER: &str = "Received an empty response from the AI.";

pub const DEFAULT_CODE_ACK: &str = "Processing your code-related request...";
pub const DEFAULT_CHAT_REPLY: &str = "I'm not sure how to help with that. Could you try rephrasing?";
