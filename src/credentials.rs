// API key lookup: an explicit env file first, then the process environment.

use std::env;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::PipelineError;

pub fn load_api_key(env_file: Option<&Path>, key_name: &str) -> Result<String, PipelineError> {
    if let Some(path) = env_file {
        match dotenvy::from_path_iter(path) {
            Ok(iter) => {
                for item in iter {
                    match item {
                        Ok((key, value)) if key == key_name && !value.trim().is_empty() => {
                            debug!(path = %path.display(), "API key read from env file");
                            return Ok(value);
                        }
                        Ok(_) => {}
                        Err(e) => warn!(path = %path.display(), "Skipping bad env file line: {}", e),
                    }
                }
            }
            Err(e) => warn!(path = %path.display(), "Could not read env file: {}", e),
        }
    }

    match env::var(key_name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(PipelineError::CredentialMissing {
            key_name: key_name.to_string(),
        }),
    }
}
