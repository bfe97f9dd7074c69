//! The batch API: `POST /runTests` and `GET /health`.

use std::sync::Arc;

use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    error::ValidationError,
    model::{Agent, CallDirection, Evaluation, Scenario, Test, TestResult},
    orchestrator::TestOrchestrator,
};

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationRequest {
    pub eval_name: String,
    pub eval_success_criteria: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestCaseRequest {
    pub agent_name: String,
    pub agent_description: String,
    pub scenario_name: String,
    pub scenario_description: String,
    #[serde(default)]
    pub evaluations: Vec<EvaluationRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunTestsRequest {
    #[serde(default)]
    pub tests: Vec<TestCaseRequest>,
    #[serde(default)]
    pub agent_type: String,
    #[serde(default)]
    pub phone_number: Option<String>,
}

impl RunTestsRequest {
    pub fn into_tests(self, default_voice_id: &str) -> Vec<Test> {
        self.tests
            .into_iter()
            .map(|case| {
                let agent = Agent::new(case.agent_name, case.agent_description)
                    .with_voice_id(default_voice_id);
                let scenario = Scenario::new(case.scenario_name, case.scenario_description)
                    .with_evaluations(case.evaluations.into_iter().map(|evaluation| {
                        Evaluation::new(evaluation.eval_name, evaluation.eval_success_criteria)
                    }));
                Test::new(agent, scenario)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTestsResponse {
    pub result: Vec<TestResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Result<Vec<TestResult>, ValidationError>> for RunTestsResponse {
    fn from(outcome: Result<Vec<TestResult>, ValidationError>) -> Self {
        match outcome {
            Ok(result) => Self { result, error: None },
            Err(error) => Self {
                result: Vec::new(),
                error: Some(error.to_string()),
            },
        }
    }
}

pub struct AppState {
    /// One batch at a time: the webhook listener owns a single port.
    orchestrator: Mutex<TestOrchestrator>,
    default_voice_id: String,
}

impl AppState {
    pub fn new(orchestrator: TestOrchestrator, default_voice_id: impl Into<String>) -> Self {
        Self {
            orchestrator: Mutex::new(orchestrator),
            default_voice_id: default_voice_id.into(),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/runTests", post(run_tests))
        .route("/health", get(health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn run_tests(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunTestsRequest>,
) -> Json<RunTestsResponse> {
    if request.tests.is_empty() {
        tracing::warn!("rejecting empty batch");
        return Json(RunTestsResponse::from(Err(ValidationError::NoTests)));
    }

    let direction = match request.agent_type.parse::<CallDirection>() {
        Ok(direction) => direction,
        Err(error) => {
            tracing::warn!(agent_type = %request.agent_type, %error, "rejecting batch");
            return Json(RunTestsResponse::from(Err(error)));
        }
    };

    let phone_number = request.phone_number.clone();
    let tests = request.into_tests(&state.default_voice_id);

    let orchestrator = state.orchestrator.lock().await;
    let outcome = orchestrator
        .run(&tests, direction, phone_number.as_deref())
        .await;

    if let Err(error) = &outcome {
        tracing::warn!(%error, "rejecting batch");
    }

    Json(RunTestsResponse::from(outcome))
}
