//! Text generation contract used by consolidation.
//!
//! The generator is called once per consolidation group with a prompt built by
//! [`build_merge_prompt`]; its raw output must pass [`parse_merge_response`]
//! before anything is written.

use async_trait::async_trait;
use thiserror::Error;

/// Upper bound on an accepted merge result, in characters.
pub const MAX_MERGE_CHARS: usize = 8000;

#[derive(Debug, Error)]
pub enum GenerationError {
    /// The backend call itself failed (network, quota, timeout).
    #[error("generator backend failed: {0}")]
    Backend(String),

    /// The backend answered, but the text is unusable.
    #[error("malformed generator output: {0}")]
    Malformed(String),
}

/// Prompt → text. Implementations own their own timeouts and retries.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

/// Build the merge prompt for a group of memory contents.
pub fn build_merge_prompt<S: AsRef<str>>(contents: &[S]) -> String {
    let mut prompt = String::from(
        "Merge the following related memories into one concise memory. \
         Keep every distinct fact, drop repetition, and do not add information \
         that is not present. Reply with the merged memory text only.\n\nMemories:\n",
    );
    for (i, content) in contents.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, content.as_ref().trim()));
    }
    prompt
}

/// Strictly parse generator output into merged content.
///
/// Strips one surrounding code fence and whitespace. Empty or oversized output
/// is rejected.
pub fn parse_merge_response(raw: &str) -> Result<String, GenerationError> {
    let mut text = raw.trim();

    if let Some(rest) = text.strip_prefix("```") {
        let Some(inner) = rest.strip_suffix("```") else {
            return Err(GenerationError::Malformed("unterminated code fence".into()));
        };
        // Drop an optional language tag on the opening fence line.
        text = match inner.split_once('\n') {
            Some((tag, body)) if !tag.trim().contains(' ') => body,
            _ => inner,
        };
        text = text.trim();
    }

    if text.is_empty() {
        return Err(GenerationError::Malformed("empty output".into()));
    }
    let chars = text.chars().count();
    if chars > MAX_MERGE_CHARS {
        return Err(GenerationError::Malformed(format!(
            "output too long ({chars} chars, max {MAX_MERGE_CHARS})"
        )));
    }
    Ok(text.to_string())
}
