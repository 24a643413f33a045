use thiserror::Error;

/// Domain-level failure kinds for one stage attempt.
///
/// The stage runner retries `Transient` within the retry budget and promotes
/// leftovers to failed outcomes. `Permanent` fails immediately. `Cancelled`
/// means cooperative batch cancellation. `Fatal` terminates the whole batch
/// (database unreachable and the like).
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),

    #[error("cancelled")]
    Cancelled,

    #[error("fatal: {0}")]
    Fatal(String),
}

impl StageError {
    pub fn transient(msg: impl Into<String>) -> Self {
        StageError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        StageError::Permanent(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        StageError::Fatal(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }

    /// Classify an HTTP status the way every external port does:
    /// 5xx and 429 are retriable, other 4xx are not.
    pub fn from_http_status(status: u16, body: impl Into<String>) -> Self {
        let msg = format!("HTTP {}: {}", status, body.into());
        if status >= 500 || status == 429 {
            StageError::Transient(msg)
        } else {
            StageError::Permanent(msg)
        }
    }
}

/// Start-up configuration failure. Missing required secrets are a hard error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required env var {0} is not set")]
    MissingKey(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("policy file error: {0}")]
    Policy(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_classification() {
        assert!(StageError::from_http_status(500, "").is_transient());
        assert!(StageError::from_http_status(503, "").is_transient());
        assert!(StageError::from_http_status(429, "").is_transient());
        assert!(!StageError::from_http_status(400, "").is_transient());
        assert!(!StageError::from_http_status(404, "").is_transient());
        assert!(!StageError::from_http_status(422, "").is_transient());
    }

    #[test]
    fn display_includes_detail() {
        let err = StageError::transient("connection reset");
        assert_eq!(err.to_string(), "transient: connection reset");
        assert_eq!(StageError::Cancelled.to_string(), "cancelled");
    }
}
