//! Decoding of the voice platform's server-message webhooks.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::model::{EvaluationResult, TranscriptTurn};

pub const WEBHOOK_PATH: &str = "/vapi-webhook";
pub const END_OF_CALL_REPORT: &str = "end-of-call-report";

static NUMBER_FORMATTING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\s\-\.\(\)]").expect("static regex is valid"));

/// Strips the formatting characters people and providers sprinkle into E.164 numbers.
pub fn canonical_number(number: &str) -> String {
    NUMBER_FORMATTING.replace_all(number.trim(), "").into_owned()
}

/// Everything we keep from an end-of-call report.
#[derive(Debug, Clone, PartialEq)]
pub struct CallReport {
    pub customer_number: String,
    pub transcript: Vec<TranscriptTurn>,
    pub stereo_recording_url: Option<String>,
    pub ended_reason: Option<String>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Verdicts the platform's own analysis attached, if any.
    pub evaluation_results: Option<Vec<EvaluationResult>>,
}

impl CallReport {
    pub fn new(customer_number: impl Into<String>, transcript: Vec<TranscriptTurn>) -> Self {
        Self {
            customer_number: customer_number.into(),
            transcript,
            stereo_recording_url: None,
            ended_reason: None,
            ended_at: None,
            evaluation_results: None,
        }
    }

    pub fn with_recording_url(mut self, url: impl Into<String>) -> Self {
        self.stereo_recording_url = Some(url.into());
        self
    }

    pub fn with_evaluation_results(mut self, results: Vec<EvaluationResult>) -> Self {
        self.evaluation_results = Some(results);
        self
    }
}

#[derive(Debug)]
pub enum WebhookEvent {
    CallEnded(CallReport),
    /// An end-of-call report that carries no customer number to correlate on.
    Uncorrelated,
    Ignored { kind: Option<String> },
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    message: Option<ServerMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    customer: Option<Customer>,
    artifact: Option<Artifact>,
    ended_reason: Option<String>,
    ended_at: Option<String>,
    /// Platform analysis output. Its shape is user-defined, so it is decoded leniently.
    analysis: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Customer {
    number: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Artifact {
    #[serde(default, rename = "messagesOpenAIFormatted")]
    messages: Vec<TranscriptTurn>,
    stereo_recording_url: Option<String>,
}

impl WebhookEvent {
    pub fn parse(body: &[u8]) -> Self {
        let value: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => return WebhookEvent::Malformed(format!("body is not JSON: {e}")),
        };
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Self {
        let envelope: Envelope = match serde_json::from_value(value) {
            Ok(envelope) => envelope,
            Err(e) => return WebhookEvent::Malformed(e.to_string()),
        };

        let Some(message) = envelope.message else {
            return WebhookEvent::Ignored { kind: None };
        };

        if message.kind.as_deref() != Some(END_OF_CALL_REPORT) {
            return WebhookEvent::Ignored { kind: message.kind };
        }

        let Some(customer_number) = message
            .customer
            .and_then(|customer| customer.number)
            .filter(|number| !number.trim().is_empty())
        else {
            return WebhookEvent::Uncorrelated;
        };

        let artifact = message.artifact.unwrap_or_default();
        let ended_at = message
            .ended_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc));
        let evaluation_results = message.analysis.and_then(platform_evaluations);

        WebhookEvent::CallEnded(CallReport {
            customer_number,
            transcript: artifact.messages,
            stereo_recording_url: artifact.stereo_recording_url.filter(|url| !url.is_empty()),
            ended_reason: message.ended_reason,
            ended_at,
            evaluation_results,
        })
    }
}

/// Reads `structuredData.evaluation_results` when it has our shape, `None` otherwise.
fn platform_evaluations(analysis: Value) -> Option<Vec<EvaluationResult>> {
    let structured = analysis.get("structuredData")?;
    let raw = structured
        .get("evaluation_results")
        .or_else(|| structured.get("evaluationResults"))
        .filter(|raw| !raw.is_null())?;

    match serde_json::from_value(raw.clone()) {
        Ok(results) => Some(results),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring platform evaluations with an unexpected shape");
            None
        }
    }
}
