use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use callcheck::{
    providers::scripted::ScriptedProvider,
    server::{router, AppState, RunTestsResponse},
    AssistantUpdate, CallWaiter, LlmEvaluator, StaticTunnel, TestOrchestrator, VoiceAgentError,
    VoiceAgentService,
};
use serde_json::{json, Value};

/// Plays the voice platform: when asked to dial, it sends an end-of-call report to the
/// webhook URL it was configured with.
struct LoopbackPlatform {
    webhook_url: Mutex<Option<String>>,
    report: Value,
}

#[async_trait]
impl VoiceAgentService for LoopbackPlatform {
    async fn configure(&self, update: &AssistantUpdate) -> Result<(), VoiceAgentError> {
        *self.webhook_url.lock().unwrap() = Some(update.webhook_url.clone());
        Ok(())
    }

    async fn place_call(&self, _phone_number: &str) -> Result<Option<String>, VoiceAgentError> {
        let url = self.webhook_url.lock().unwrap().clone().expect("configured first");
        let report = self.report.clone();
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            for _ in 0..50 {
                if client.post(&url).json(&report).send().await.is_ok() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });
        Ok(Some("call-123".into()))
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("free port")
}

fn end_of_call_report() -> Value {
    json!({
        "message": {
            "type": "end-of-call-report",
            "endedReason": "assistant-ended-call",
            "customer": {"number": "+44 7436 962389"},
            "artifact": {
                "messagesOpenAIFormatted": [
                    {"role": "system", "content": "Your Name is Sarah."},
                    {"role": "assistant", "content": "Hi, I'd like a glazed donut."},
                    {"role": "user", "content": "Sure, anything else?"},
                    {"role": "assistant", "content": null}
                ],
                "stereoRecordingUrl": "https://storage.example/call-123.wav"
            }
        }
    })
}

async fn spawn_app(provider: Arc<ScriptedProvider>) -> SocketAddr {
    let webhook_port = free_port();
    let platform = Arc::new(LoopbackPlatform {
        webhook_url: Mutex::new(None),
        report: end_of_call_report(),
    });

    let orchestrator = TestOrchestrator::new(
        platform,
        Arc::new(LlmEvaluator::new(provider, "judge")),
        Arc::new(StaticTunnel::new(format!("http://127.0.0.1:{webhook_port}")).expect("tunnel")),
        CallWaiter::new(SocketAddr::from(([127, 0, 0, 1], webhook_port))),
    )
    .with_call_timeout(Duration::from_secs(10));

    let app = router(Arc::new(AppState::new(orchestrator, "voice-1")));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

#[tokio::test]
async fn inbound_batch_runs_end_to_end() {
    let provider = Arc::new(ScriptedProvider::with_responses([json!({
        "evaluation_results": [
            {"name": "greets", "passed": true, "reason": "opened politely"},
            {"name": "orders", "passed": true, "reason": "asked for a glazed donut"}
        ]
    })
    .to_string()]));
    let addr = spawn_app(provider.clone()).await;

    let response: RunTestsResponse = reqwest::Client::new()
        .post(format!("http://{addr}/runTests"))
        .json(&json!({
            "agent_type": "inbound",
            "phone_number": "+447436962389",
            "tests": [{
                "agent_name": "Sarah",
                "agent_description": "A hungry customer.",
                "scenario_name": "Donut order",
                "scenario_description": "Order one glazed donut.",
                "evaluations": [
                    {"eval_name": "orders", "eval_success_criteria": "The caller orders a donut."},
                    {"eval_name": "greets", "eval_success_criteria": "The caller greets the shop."}
                ]
            }]
        }))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");

    assert!(response.error.is_none());
    assert_eq!(response.result.len(), 1);

    let result = &response.result[0];
    assert!(result.error.is_none(), "{:?}", result.error);
    assert!(result.passed());
    assert_eq!(result.transcript.len(), 4);
    assert_eq!(result.transcript[3].content, "");
    assert_eq!(
        result.stereo_recording_url.as_deref(),
        Some("https://storage.example/call-123.wav")
    );

    let names: Vec<&str> = result
        .evaluation_results
        .as_ref()
        .expect("evaluations")
        .evaluation_results
        .iter()
        .map(|r| r.name.as_str())
        .collect();
    assert_eq!(names, ["orders", "greets"]);

    assert_eq!(provider.call_count(), 1);
    let prompt = provider.requests()[0].messages[0].text().unwrap_or_default().to_string();
    // Our assistant plays the customer; the agent under test is the AI side.
    assert!(prompt.contains("user: Hi, I'd like a glazed donut."));
    assert!(prompt.contains("AI: Sure, anything else?"));
    assert!(!prompt.contains("Your Name is Sarah."));
}
