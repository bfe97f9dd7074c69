//! LLM-judged scoring of a finished call.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use schemars::{gen::SchemaSettings, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::TestError,
    model::{Evaluation, EvaluationResult},
    prompts,
    providers::LLMProvider,
    transcript::EvaluatorView,
    types::{ChatMessage, CompletionRequest},
};

pub const DEFAULT_EVALUATOR_MODEL: &str = "gpt-4o";

const SCHEMA_NAME: &str = "evaluation_results";
const MISSING_REASON: &str = "Unknown reason";

const EVALUATION_PROMPT: &str = r#"You are an expert at evaluating phone calls conducted by AI. You will be given a transcript of a call between an AI and a user, along with evaluation criteria. Decide for each criterion whether the AI passed it.

Here is the transcript of the call:
{{transcript}}
Evaluate the AI against each of these criteria:
{{#each evaluations}}
- name: {{this.name}}
  success criteria: {{this.criteria}}
{{/each}}

Return exactly one result per criterion, using the criterion name verbatim, whether it passed, and a short reason."#;

#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Scores `view` against every evaluation. Either all evaluations get a verdict or the call fails.
    async fn evaluate(
        &self,
        view: &EvaluatorView,
        evaluations: &[Evaluation],
    ) -> Result<Vec<EvaluationResult>, TestError>;
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct VerdictSheet {
    evaluation_results: Vec<Verdict>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct Verdict {
    name: String,
    passed: bool,
    reason: String,
}

#[derive(Serialize)]
struct PromptData<'a> {
    transcript: String,
    evaluations: Vec<PromptEvaluation<'a>>,
}

#[derive(Serialize)]
struct PromptEvaluation<'a> {
    name: &'a str,
    criteria: &'a str,
}

pub struct LlmEvaluator {
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: Option<f32>,
}

impl LlmEvaluator {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: Some(0.0),
        }
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    fn build_request(
        &self,
        view: &EvaluatorView,
        evaluations: &[Evaluation],
    ) -> Result<CompletionRequest, TestError> {
        let prompt = render_prompt(view, evaluations)?;
        let mut request = CompletionRequest::new(self.model.clone(), vec![ChatMessage::user(prompt)])
            .with_json_schema(SCHEMA_NAME, verdict_schema());
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        Ok(request)
    }
}

#[async_trait]
impl Evaluator for LlmEvaluator {
    async fn evaluate(
        &self,
        view: &EvaluatorView,
        evaluations: &[Evaluation],
    ) -> Result<Vec<EvaluationResult>, TestError> {
        if evaluations.is_empty() {
            return Ok(Vec::new());
        }

        let request = self.build_request(view, evaluations)?;

        tracing::info!(
            provider = self.provider.name(),
            model = %self.model,
            turns = view.len(),
            evaluations = evaluations.len(),
            "requesting evaluation"
        );

        let response = self.provider.complete(request).await?;
        let content = response
            .message
            .text()
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| TestError::Evaluation("judge returned an empty reply".into()))?;

        let sheet = parse_sheet(content)?;
        let results = reconcile(evaluations, sheet.evaluation_results)?;

        tracing::debug!(
            passed = results.iter().filter(|r| r.passed).count(),
            total = results.len(),
            "evaluation finished"
        );

        Ok(results)
    }
}

pub fn render_prompt(view: &EvaluatorView, evaluations: &[Evaluation]) -> Result<String, TestError> {
    let data = PromptData {
        transcript: view.to_string(),
        evaluations: evaluations
            .iter()
            .map(|evaluation| PromptEvaluation {
                name: evaluation.name.trim(),
                criteria: evaluation.success_criteria(),
            })
            .collect(),
    };

    prompts::render(EVALUATION_PROMPT, &data)
        .map_err(|e| TestError::Evaluation(format!("failed to render prompt: {e}")))
}

fn verdict_schema() -> Value {
    let generator = SchemaSettings::draft07()
        .with(|settings| {
            settings.inline_subschemas = true;
            settings.meta_schema = None;
        })
        .into_generator();
    let root = generator.into_root_schema_for::<VerdictSheet>();
    serde_json::to_value(root.schema).expect("schema serialization should not fail")
}

fn parse_sheet(content: &str) -> Result<VerdictSheet, TestError> {
    let body = strip_code_fence(content);
    let value: Value = serde_json::from_str(body)
        .map_err(|e| TestError::Evaluation(format!("judge reply is not valid JSON: {e}")))?;

    let schema = verdict_schema();
    let validator = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema)
        .map_err(|e| TestError::Evaluation(format!("failed to compile verdict schema: {e}")))?;

    if let Err(errors) = validator.validate(&value) {
        let details = errors
            .take(3)
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(TestError::Evaluation(format!(
            "judge reply does not match the verdict schema: {details}"
        )));
    }

    serde_json::from_value(value)
        .map_err(|e| TestError::Evaluation(format!("judge reply could not be decoded: {e}")))
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Orders verdicts like `evaluations`, matching by name. Cardinality and names must line up exactly.
fn reconcile(
    evaluations: &[Evaluation],
    verdicts: Vec<Verdict>,
) -> Result<Vec<EvaluationResult>, TestError> {
    if verdicts.len() != evaluations.len() {
        return Err(TestError::Evaluation(format!(
            "expected {} verdicts, judge returned {}",
            evaluations.len(),
            verdicts.len()
        )));
    }

    let mut by_name: HashMap<String, Verdict> = HashMap::with_capacity(verdicts.len());
    for verdict in verdicts {
        let key = verdict.name.trim().to_string();
        if by_name.insert(key.clone(), verdict).is_some() {
            return Err(TestError::Evaluation(format!(
                "judge returned '{key}' more than once"
            )));
        }
    }

    evaluations
        .iter()
        .map(|evaluation| {
            let name = evaluation.name.trim();
            let verdict = by_name.remove(name).ok_or_else(|| {
                TestError::Evaluation(format!("judge returned no verdict for '{name}'"))
            })?;
            let reason = if verdict.reason.trim().is_empty() {
                MISSING_REASON.to_string()
            } else {
                verdict.reason
            };
            Ok(EvaluationResult {
                name: evaluation.name.clone(),
                passed: verdict.passed,
                reason,
            })
        })
        .collect()
}
