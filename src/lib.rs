pub mod config;
pub mod error;
pub mod evaluator;
pub mod model;
pub mod orchestrator;
pub mod prompts;
pub mod providers;
pub mod server;
pub mod transcript;
pub mod tunnel;
pub mod types;
pub mod voice_agent;
pub mod waiter;
pub mod webhook;

pub use config::{ConfigError, Settings};
pub use error::{LLMError, TestError, ValidationError};
pub use evaluator::{Evaluator, LlmEvaluator};
pub use model::{
    Agent,
    CallDirection,
    Evaluation,
    EvaluationResult,
    EvaluationResults,
    Scenario,
    Test,
    TestResult,
    TranscriptTurn,
    TurnRole,
};
pub use orchestrator::{OrchestratorEvent, TestOrchestrator, TestPhase};
pub use providers::LLMProvider;
pub use transcript::{normalize, EvaluatorView, Speaker};
pub use tunnel::{NgrokAgentTunnel, StaticTunnel, Tunnel, TunnelError};
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
pub use voice_agent::{AssistantUpdate, VapiClient, VapiConfig, VoiceAgentError, VoiceAgentService};
pub use waiter::{ActiveWait, CallWaiter, WebhookRegistry};
pub use webhook::{CallReport, WebhookEvent};
