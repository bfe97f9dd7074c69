//! Data model shared by inbound and outbound test runs.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::ValidationError;

/// The persona the configured voice assistant plays during a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub voice_id: String,
}

impl Agent {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            voice_id: String::new(),
        }
    }

    pub fn with_voice_id(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = voice_id.into();
        self
    }
}

/// One named pass/fail question asked of a finished call. `prompt` holds the success criteria.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub name: String,
    pub prompt: String,
}

impl Evaluation {
    pub fn new(name: impl Into<String>, success_criteria: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: success_criteria.into(),
        }
    }

    pub fn success_criteria(&self) -> &str {
        &self.prompt
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub prompt: String,
    #[serde(default)]
    pub evaluations: Vec<Evaluation>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            evaluations: Vec::new(),
        }
    }

    pub fn with_evaluation(mut self, evaluation: Evaluation) -> Self {
        self.evaluations.push(evaluation);
        self
    }

    pub fn with_evaluations<I>(mut self, evaluations: I) -> Self
    where
        I: IntoIterator<Item = Evaluation>,
    {
        self.evaluations.extend(evaluations);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Test {
    pub agent: Agent,
    pub scenario: Scenario,
}

impl Test {
    pub fn new(agent: Agent, scenario: Scenario) -> Self {
        Self { agent, scenario }
    }

    pub(crate) fn validate(&self, index: usize) -> Result<(), ValidationError> {
        let invalid = |reason: String| ValidationError::InvalidTest { index, reason };

        let mut seen = std::collections::HashSet::new();
        for evaluation in &self.scenario.evaluations {
            let name = evaluation.name.trim();
            if name.is_empty() {
                return Err(invalid("evaluation name must not be empty".into()));
            }
            if !seen.insert(name) {
                return Err(invalid(format!("duplicate evaluation name '{name}'")));
            }
        }
        Ok(())
    }
}

/// Which side of the call the agent under test is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// The agent under test answers; the configured assistant dials it.
    Inbound,
    /// The agent under test dials the configured assistant.
    Outbound,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Inbound => "inbound",
            CallDirection::Outbound => "outbound",
        }
    }
}

impl fmt::Display for CallDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallDirection {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" => Err(ValidationError::MissingAgentType),
            "inbound" => Ok(CallDirection::Inbound),
            "outbound" => Ok(CallDirection::Outbound),
            _ => Err(ValidationError::UnknownAgentType(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnRole {
    System,
    User,
    Assistant,
    Tool,
    Other(String),
}

impl TurnRole {
    pub fn as_str(&self) -> &str {
        match self {
            TurnRole::System => "system",
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::Tool => "tool",
            TurnRole::Other(role) => role,
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, TurnRole::System)
    }
}

impl From<&str> for TurnRole {
    fn from(value: &str) -> Self {
        match value {
            "system" => TurnRole::System,
            "user" => TurnRole::User,
            "assistant" => TurnRole::Assistant,
            "tool" => TurnRole::Tool,
            other => TurnRole::Other(other.to_string()),
        }
    }
}

impl Serialize for TurnRole {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TurnRole {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(TurnRole::from(raw.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub role: TurnRole,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub content: String,
}

impl TranscriptTurn {
    pub fn new(role: impl Into<TurnRole>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(TurnRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content)
    }
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub name: String,
    pub passed: bool,
    pub reason: String,
}

/// Verdicts for one call, in the nested shape callers of `/runTests` expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResults {
    pub evaluation_results: Vec<EvaluationResult>,
    #[serde(default)]
    pub extra_data: Map<String, Value>,
}

impl EvaluationResults {
    pub fn new(evaluation_results: Vec<EvaluationResult>) -> Self {
        Self {
            evaluation_results,
            extra_data: Map::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.evaluation_results.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test: Test,
    pub evaluation_results: Option<EvaluationResults>,
    pub transcript: Vec<TranscriptTurn>,
    pub stereo_recording_url: Option<String>,
    pub error: Option<String>,
}

impl TestResult {
    pub fn failed(test: Test, error: impl fmt::Display) -> Self {
        Self {
            test,
            evaluation_results: None,
            transcript: Vec::new(),
            stereo_recording_url: None,
            error: Some(error.to_string()),
        }
    }

    pub fn passed(&self) -> bool {
        self.error.is_none()
            && self
                .evaluation_results
                .as_ref()
                .map_or(false, |results| results.evaluation_results.iter().all(|r| r.passed))
    }
}
