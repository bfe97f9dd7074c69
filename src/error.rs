use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),
}

/// Problems with the shape of a batch request. Raised before any call is placed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("No tests provided")]
    NoTests,

    #[error("Agent type is required")]
    MissingAgentType,

    #[error("Unsupported agent type: {0} (expected \"inbound\" or \"outbound\")")]
    UnknownAgentType(String),

    #[error("Phone number is required for {0} agent")]
    MissingPhoneNumber(&'static str),

    #[error("Invalid test {index}: {reason}")]
    InvalidTest { index: usize, reason: String },
}

/// Failure of a single test. Captured into `TestResult::error`, never raised past the batch.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("timed out after {waited:?} waiting for the end-of-call report for {phone_number}")]
    Timeout {
        phone_number: String,
        waited: Duration,
    },

    #[error("evaluation failed: {0}")]
    Evaluation(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl TestError {
    pub fn kind(&self) -> &'static str {
        match self {
            TestError::Configuration(_) => "configuration",
            TestError::Timeout { .. } => "timeout",
            TestError::Evaluation(_) => "evaluation",
            TestError::Unexpected(_) => "unexpected",
        }
    }
}

impl From<LLMError> for TestError {
    fn from(error: LLMError) -> Self {
        TestError::Evaluation(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_keeps_sub_second_precision() {
        let error = TestError::Timeout {
            phone_number: "+15550001111".into(),
            waited: Duration::from_millis(250),
        };
        assert_eq!(
            error.to_string(),
            "timed out after 250ms waiting for the end-of-call report for +15550001111"
        );
        assert_eq!(error.kind(), "timeout");
    }
}
