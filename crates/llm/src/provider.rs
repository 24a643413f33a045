use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use deskrail_core::StageError;

/// A chat message for the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Lowercase label used by chat-completion wire formats.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Trait for LLM providers — each backend implements this.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat completion request and return the assistant's response text.
    async fn complete(
        &self,
        messages: Vec<Message>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError>;
}

#[async_trait]
impl<T: LlmProvider + ?Sized> LlmProvider for std::sync::Arc<T> {
    async fn complete(
        &self,
        messages: Vec<Message>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        (**self).complete(messages, temperature, max_tokens).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("API error: {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    ParseError(String),
    #[error("response failed schema validation: {0}")]
    InvalidResponse(String),
    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

impl From<LlmError> for StageError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::HttpError(e) => StageError::transient(format!("llm: {e}")),
            LlmError::ApiError { status, body } => StageError::from_http_status(status, body),
            // Malformed or schema-invalid payloads are retried within the
            // budget; the runner promotes leftovers to failed outcomes.
            LlmError::ParseError(msg) | LlmError::InvalidResponse(msg) => {
                StageError::transient(format!("llm: {msg}"))
            }
            LlmError::NotConfigured(msg) => StageError::permanent(format!("llm: {msg}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification_for_retry() {
        let err: StageError = LlmError::ApiError {
            status: 503,
            body: "overloaded".into(),
        }
        .into();
        assert!(err.is_transient());

        let err: StageError = LlmError::ApiError {
            status: 401,
            body: "bad key".into(),
        }
        .into();
        assert!(!err.is_transient());

        let err: StageError = LlmError::InvalidResponse("bad sentiment".into()).into();
        assert!(err.is_transient());

        let err: StageError = LlmError::NotConfigured("no key".into()).into();
        assert!(!err.is_transient());
    }
}
