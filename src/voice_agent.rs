//! The voice platform that plays the simulated caller or callee.

use std::{env, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::{
    model::{CallDirection, Test},
    prompts,
    webhook::{END_OF_CALL_REPORT, WEBHOOK_PATH},
};

const DEFAULT_BASE_URL: &str = "https://api.vapi.ai";
const FIRST_MESSAGE: &str = "Hello";

const PERSONA_PROMPT: &str = r#"Your Name is {{agent_name}}. {{agent_prompt}}.

Your task is to simulate this scenario immediately as soon as the conversation starts.
Scenario Name: {{scenario_name}}
Scenario Description: {{scenario_prompt}}{{#if voicemail}}
If you reach voicemail, end the call immediately.{{/if}}"#;

#[derive(Debug, Error)]
pub enum VoiceAgentError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("voice platform rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("missing configuration: set the {0} environment variable")]
    MissingConfig(&'static str),

    #[error("failed to render persona prompt: {0}")]
    Prompt(#[from] handlebars::RenderError),
}

/// What the assistant should be for the next call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssistantUpdate {
    pub system_prompt: String,
    pub first_message: String,
    pub voice_id: Option<String>,
    pub webhook_url: String,
}

#[derive(Serialize)]
struct PersonaData<'a> {
    agent_name: &'a str,
    agent_prompt: &'a str,
    scenario_name: &'a str,
    scenario_prompt: &'a str,
    voicemail: bool,
}

impl AssistantUpdate {
    /// `public_base_url` is where the webhook listener is reachable from the internet.
    pub fn for_test(
        test: &Test,
        direction: CallDirection,
        public_base_url: &str,
    ) -> Result<Self, VoiceAgentError> {
        let data = PersonaData {
            agent_name: test.agent.name.trim(),
            agent_prompt: test.agent.prompt.trim().trim_end_matches('.'),
            scenario_name: test.scenario.name.trim(),
            scenario_prompt: test.scenario.prompt.trim(),
            // When we dial out we may land on an answering machine.
            voicemail: direction == CallDirection::Inbound,
        };

        let voice_id = Some(test.agent.voice_id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        Ok(Self {
            system_prompt: prompts::render(PERSONA_PROMPT, &data)?,
            first_message: FIRST_MESSAGE.to_string(),
            voice_id,
            webhook_url: format!("{}{}", public_base_url.trim_end_matches('/'), WEBHOOK_PATH),
        })
    }
}

#[async_trait]
pub trait VoiceAgentService: Send + Sync {
    async fn configure(&self, update: &AssistantUpdate) -> Result<(), VoiceAgentError>;

    /// Dials `phone_number` from the configured assistant. Returns the platform's call id.
    async fn place_call(&self, phone_number: &str) -> Result<Option<String>, VoiceAgentError>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct VapiConfig {
    pub api_key: String,
    pub assistant_id: String,
    pub phone_number_id: Option<String>,
    pub base_url: String,
    pub model_provider: String,
    pub model: String,
    pub voice_provider: String,
    pub request_timeout: Duration,
}

impl VapiConfig {
    pub fn new(api_key: impl Into<String>, assistant_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            assistant_id: assistant_id.into(),
            phone_number_id: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model_provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            voice_provider: "11labs".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_phone_number_id(mut self, phone_number_id: impl Into<String>) -> Self {
        self.phone_number_id = Some(phone_number_id.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.model_provider = provider.into();
        self.model = model.into();
        self
    }

    pub fn with_voice_provider(mut self, provider: impl Into<String>) -> Self {
        self.voice_provider = provider.into();
        self
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct VapiClient {
    client: Client,
    config: VapiConfig,
}

impl VapiClient {
    pub fn new(api_key: impl Into<String>, assistant_id: impl Into<String>) -> Result<Self, VoiceAgentError> {
        Self::from_config(VapiConfig::new(api_key, assistant_id))
    }

    pub fn from_env() -> Result<Self, VoiceAgentError> {
        let api_key = env::var("VAPI_API_KEY").map_err(|_| VoiceAgentError::MissingConfig("VAPI_API_KEY"))?;
        let assistant_id = env::var("VAPI_ASSISTANT_ID")
            .map_err(|_| VoiceAgentError::MissingConfig("VAPI_ASSISTANT_ID"))?;
        let mut config = VapiConfig::new(api_key, assistant_id);

        if let Ok(phone_number_id) = env::var("VAPI_PHONE_NUMBER_ID") {
            config.phone_number_id = Some(phone_number_id);
        }
        if let Ok(base_url) = env::var("VAPI_BASE_URL") {
            config.base_url = base_url;
        }

        Self::from_config(config)
    }

    pub fn from_config(config: VapiConfig) -> Result<Self, VoiceAgentError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.config.api_key)
    }

    fn assistant_body(&self, update: &AssistantUpdate) -> Value {
        let mut body = json!({
            "model": {
                "provider": self.config.model_provider,
                "model": self.config.model,
                "messages": [
                    {"role": "system", "content": update.system_prompt}
                ]
            },
            "firstMessage": update.first_message,
            "firstMessageMode": "assistant-speaks-first",
            "analysisPlan": {
                "successEvaluationPlan": {"enabled": false}
            },
            "serverMessages": ["status-update", END_OF_CALL_REPORT],
            "server": {"url": update.webhook_url}
        });

        if let Some(voice_id) = &update.voice_id {
            body["voice"] = json!({
                "provider": self.config.voice_provider,
                "voiceId": voice_id,
            });
        }

        body
    }
}

#[derive(Debug, Deserialize)]
struct VapiErrorEnvelope {
    #[serde(default)]
    message: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedCall {
    id: Option<String>,
}

async fn rejection(response: reqwest::Response) -> VoiceAgentError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();

    let message = match serde_json::from_str::<VapiErrorEnvelope>(&text) {
        Ok(VapiErrorEnvelope { message: Some(Value::String(message)), .. }) => message,
        Ok(VapiErrorEnvelope { message: Some(Value::Array(items)), .. }) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).unwrap_or_else(|| item.to_string()))
            .collect::<Vec<_>>()
            .join("; "),
        Ok(VapiErrorEnvelope { error: Some(error), .. }) => error,
        _ => text,
    };

    VoiceAgentError::Rejected { status, message }
}

#[async_trait]
impl VoiceAgentService for VapiClient {
    async fn configure(&self, update: &AssistantUpdate) -> Result<(), VoiceAgentError> {
        let path = format!("assistant/{}", self.config.assistant_id);
        let response = self
            .authorized(self.client.patch(self.endpoint(&path)))
            .json(&self.assistant_body(update))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(rejection(response).await);
        }

        tracing::debug!(assistant = %self.config.assistant_id, webhook = %update.webhook_url, "assistant updated");
        Ok(())
    }

    async fn place_call(&self, phone_number: &str) -> Result<Option<String>, VoiceAgentError> {
        let phone_number_id = self
            .config
            .phone_number_id
            .as_deref()
            .ok_or(VoiceAgentError::MissingConfig("VAPI_PHONE_NUMBER_ID"))?;

        let body = json!({
            "assistantId": self.config.assistant_id,
            "phoneNumberId": phone_number_id,
            "customer": {"number": phone_number},
        });

        let response = self
            .authorized(self.client.post(self.endpoint("call")))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(rejection(response).await);
        }

        let created: CreatedCall = response.json().await?;
        tracing::info!(call_id = created.id.as_deref().unwrap_or("<unknown>"), phone_number, "call placed");
        Ok(created.id)
    }

    fn name(&self) -> &'static str {
        "vapi"
    }
}
