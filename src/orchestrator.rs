//! Runs a batch of call tests one after another.
//!
//! Each test moves through `Configuring → AwaitingCall → Normalizing →
//! Evaluating → Done`, or ends in `Failed`. A failing test is reported in its
//! own `TestResult` and never stops the rest of the batch; only a malformed
//! batch is rejected as a whole, before anything external is touched.

use std::{sync::Arc, time::Duration};

use crate::{
    config::DEFAULT_CALL_TIMEOUT,
    error::{TestError, ValidationError},
    evaluator::Evaluator,
    model::{CallDirection, EvaluationResults, Test, TestResult},
    transcript::{self, EvaluatorView},
    tunnel::Tunnel,
    voice_agent::{AssistantUpdate, VoiceAgentService},
    waiter::CallWaiter,
    webhook::CallReport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPhase {
    Configuring,
    AwaitingCall,
    Normalizing,
    Evaluating,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    PhaseChanged {
        index: usize,
        scenario: String,
        phase: TestPhase,
    },
}

pub struct TestOrchestrator {
    voice_agent: Arc<dyn VoiceAgentService>,
    evaluator: Arc<dyn Evaluator>,
    tunnel: Arc<dyn Tunnel>,
    waiter: CallWaiter,
    call_timeout: Duration,
    event_callback: Option<Arc<dyn Fn(&OrchestratorEvent) + Send + Sync>>,
}

impl TestOrchestrator {
    pub fn new(
        voice_agent: Arc<dyn VoiceAgentService>,
        evaluator: Arc<dyn Evaluator>,
        tunnel: Arc<dyn Tunnel>,
        waiter: CallWaiter,
    ) -> Self {
        Self {
            voice_agent,
            evaluator,
            tunnel,
            waiter,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            event_callback: None,
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_event_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&OrchestratorEvent) + Send + Sync + 'static,
    {
        self.event_callback = Some(Arc::new(callback));
        self
    }

    pub fn waiter(&self) -> &CallWaiter {
        &self.waiter
    }

    /// Checks the batch and returns the correlation phone number.
    pub fn validate(
        tests: &[Test],
        direction: CallDirection,
        phone_number: Option<&str>,
    ) -> Result<String, ValidationError> {
        if tests.is_empty() {
            return Err(ValidationError::NoTests);
        }

        let phone_number = phone_number
            .map(str::trim)
            .filter(|number| !number.is_empty())
            .ok_or(ValidationError::MissingPhoneNumber(direction.as_str()))?;

        for (index, test) in tests.iter().enumerate() {
            test.validate(index)?;
        }

        Ok(phone_number.to_string())
    }

    pub async fn run(
        &self,
        tests: &[Test],
        direction: CallDirection,
        phone_number: Option<&str>,
    ) -> Result<Vec<TestResult>, ValidationError> {
        let phone_number = Self::validate(tests, direction, phone_number)?;

        tracing::info!(
            tests = tests.len(),
            %direction,
            phone_number = %phone_number,
            "starting test batch"
        );

        let public_url = self
            .tunnel
            .public_url(self.waiter.bind_addr().port())
            .await
            .map_err(|e| {
                format!("failed to resolve public webhook url via {}: {e}", self.tunnel.name())
            });

        let mut results = Vec::with_capacity(tests.len());
        for (index, test) in tests.iter().enumerate() {
            let result = match &public_url {
                Ok(url) => self.run_test(index, test, direction, &phone_number, url).await,
                Err(reason) => self.fail(index, test, TestError::Configuration(reason.clone()), None),
            };
            results.push(result);
        }

        tracing::info!(
            passed = results.iter().filter(|result| result.passed()).count(),
            failed = results.iter().filter(|result| result.error.is_some()).count(),
            total = results.len(),
            "test batch finished"
        );

        Ok(results)
    }

    async fn run_test(
        &self,
        index: usize,
        test: &Test,
        direction: CallDirection,
        phone_number: &str,
        public_url: &str,
    ) -> TestResult {
        let report = match self.collect_call(index, test, direction, phone_number, public_url).await {
            Ok(report) => report,
            Err(error) => return self.fail(index, test, error, None),
        };

        tracing::debug!(
            index,
            ended_reason = report.ended_reason.as_deref().unwrap_or("<unknown>"),
            ended_at = ?report.ended_at,
            turns = report.transcript.len(),
            "end-of-call report received"
        );

        self.emit_phase(index, test, TestPhase::Normalizing);
        let view = transcript::normalize(&report.transcript);

        match self.score(index, test, &report, &view).await {
            Ok(evaluation_results) => {
                self.emit_phase(index, test, TestPhase::Done);
                TestResult {
                    test: test.clone(),
                    evaluation_results,
                    transcript: report.transcript,
                    stereo_recording_url: report.stereo_recording_url,
                    error: None,
                }
            }
            Err(error) => self.fail(index, test, error, Some(report)),
        }
    }

    async fn collect_call(
        &self,
        index: usize,
        test: &Test,
        direction: CallDirection,
        phone_number: &str,
        public_url: &str,
    ) -> Result<CallReport, TestError> {
        self.emit_phase(index, test, TestPhase::Configuring);
        let update = AssistantUpdate::for_test(test, direction, public_url)
            .map_err(|e| TestError::Configuration(e.to_string()))?;
        self.voice_agent
            .configure(&update)
            .await
            .map_err(|e| TestError::Configuration(format!("failed to update assistant: {e}")))?;

        self.emit_phase(index, test, TestPhase::AwaitingCall);
        // Register before dialing so a fast hang-up cannot beat us to the webhook.
        let wait = self.waiter.begin(phone_number).await?;

        if direction == CallDirection::Inbound {
            self.voice_agent
                .place_call(phone_number)
                .await
                .map_err(|e| TestError::Configuration(format!("failed to place call: {e}")))?;
        }

        wait.wait(self.call_timeout).await
    }

    async fn score(
        &self,
        index: usize,
        test: &Test,
        report: &CallReport,
        view: &EvaluatorView,
    ) -> Result<Option<EvaluationResults>, TestError> {
        if let Some(results) = report.evaluation_results.as_ref().filter(|r| !r.is_empty()) {
            tracing::info!(index, "using evaluations attached by the voice platform");
            return Ok(Some(EvaluationResults::new(results.clone())));
        }

        if view.is_empty() {
            tracing::info!(index, "call produced no conversation; skipping evaluation");
            return Ok(None);
        }

        self.emit_phase(index, test, TestPhase::Evaluating);
        let results = self
            .evaluator
            .evaluate(view, &test.scenario.evaluations)
            .await?;

        Ok(Some(EvaluationResults::new(results)))
    }

    fn fail(&self, index: usize, test: &Test, error: TestError, report: Option<CallReport>) -> TestResult {
        match &error {
            TestError::Unexpected(_) => tracing::error!(
                index,
                scenario = %test.scenario.name,
                agent = %test.agent.name,
                error = %error,
                "test failed unexpectedly"
            ),
            _ => tracing::warn!(
                index,
                scenario = %test.scenario.name,
                kind = error.kind(),
                error = %error,
                "test failed"
            ),
        }
        self.emit_phase(index, test, TestPhase::Failed);

        let mut result = TestResult::failed(test.clone(), &error);
        if let Some(report) = report {
            result.transcript = report.transcript;
            result.stereo_recording_url = report.stereo_recording_url;
        }
        result
    }

    fn emit_phase(&self, index: usize, test: &Test, phase: TestPhase) {
        tracing::debug!(index, scenario = %test.scenario.name, ?phase, "test phase");
        if let Some(callback) = &self.event_callback {
            callback(&OrchestratorEvent::PhaseChanged {
                index,
                scenario: test.scenario.name.clone(),
                phase,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        evaluator::LlmEvaluator,
        model::{Agent, Evaluation, EvaluationResult, Scenario, TranscriptTurn},
        providers::scripted::ScriptedProvider,
        tunnel::StaticTunnel,
        voice_agent::VoiceAgentError,
        waiter::{Delivery, WebhookRegistry},
    };

    /// Pretends to be the voice platform: every call it "connects" ends with the next scripted report.
    struct FakePlatform {
        registry: WebhookRegistry,
        reports: Mutex<Vec<Option<CallReport>>>,
        fail_configure: Mutex<Vec<bool>>,
        configured: Mutex<Vec<AssistantUpdate>>,
        dialed: Mutex<Vec<String>>,
    }

    impl FakePlatform {
        fn new(registry: WebhookRegistry, reports: Vec<Option<CallReport>>) -> Self {
            Self {
                registry,
                reports: Mutex::new(reports),
                fail_configure: Mutex::new(Vec::new()),
                configured: Mutex::new(Vec::new()),
                dialed: Mutex::new(Vec::new()),
            }
        }

        fn failing_configure(self, pattern: Vec<bool>) -> Self {
            *self.fail_configure.lock().unwrap() = pattern;
            self
        }

        fn finish_next_call(&self) {
            let report = {
                let mut reports = self.reports.lock().unwrap();
                if reports.is_empty() { None } else { reports.remove(0) }
            };
            let Some(report) = report else { return };

            let registry = self.registry.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    if registry.deliver(report.clone()) == Delivery::Delivered {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            });
        }
    }

    #[async_trait]
    impl VoiceAgentService for FakePlatform {
        async fn configure(&self, update: &AssistantUpdate) -> Result<(), VoiceAgentError> {
            self.configured.lock().unwrap().push(update.clone());
            let fail = {
                let mut pattern = self.fail_configure.lock().unwrap();
                if pattern.is_empty() { false } else { pattern.remove(0) }
            };
            if fail {
                return Err(VoiceAgentError::Rejected {
                    status: 400,
                    message: "assistant not found".into(),
                });
            }
            Ok(())
        }

        async fn place_call(&self, phone_number: &str) -> Result<Option<String>, VoiceAgentError> {
            self.dialed.lock().unwrap().push(phone_number.to_string());
            self.finish_next_call();
            Ok(Some("call-1".into()))
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    /// Outbound: the agent under test dials in as soon as the assistant is configured.
    struct DialsInOnConfigure(FakePlatform);

    #[async_trait]
    impl VoiceAgentService for DialsInOnConfigure {
        async fn configure(&self, update: &AssistantUpdate) -> Result<(), VoiceAgentError> {
            self.0.configure(update).await?;
            self.0.finish_next_call();
            Ok(())
        }

        async fn place_call(&self, _phone_number: &str) -> Result<Option<String>, VoiceAgentError> {
            panic!("outbound tests must not place calls");
        }

        fn name(&self) -> &'static str {
            "fake-outbound"
        }
    }

    const NUMBER: &str = "+447436962389";

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    fn donut_test() -> Test {
        Test::new(
            Agent::new("Sarah", "Order a donut."),
            Scenario::new("Donut order", "Ask for a glazed donut.").with_evaluations([
                Evaluation::new("A", "criteria1"),
                Evaluation::new("B", "criteria2"),
            ]),
        )
    }

    fn conversation_report() -> CallReport {
        CallReport::new(
            NUMBER,
            vec![
                TranscriptTurn::system("You are Sarah."),
                TranscriptTurn::assistant("Hi, one glazed donut please."),
                TranscriptTurn::user("Coming right up."),
            ],
        )
        .with_recording_url("https://storage.example/rec.wav")
    }

    fn verdicts() -> String {
        serde_json::json!({
            "evaluation_results": [
                {"name": "A", "passed": true, "reason": "took the order"},
                {"name": "B", "passed": false, "reason": "no upsell"}
            ]
        })
        .to_string()
    }

    fn orchestrator(
        platform: Arc<dyn VoiceAgentService>,
        provider: Arc<ScriptedProvider>,
        waiter: CallWaiter,
    ) -> TestOrchestrator {
        TestOrchestrator::new(
            platform,
            Arc::new(LlmEvaluator::new(provider, "judge")),
            Arc::new(StaticTunnel::new("https://calls.example.com").unwrap()),
            waiter,
        )
        .with_call_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn inbound_test_is_called_scored_and_reported() {
        let waiter = CallWaiter::new(loopback());
        let platform = Arc::new(FakePlatform::new(
            waiter.registry().clone(),
            vec![Some(conversation_report())],
        ));
        let provider = Arc::new(ScriptedProvider::with_responses([verdicts()]));
        let phases = Arc::new(Mutex::new(Vec::new()));
        let seen = phases.clone();

        let orchestrator = orchestrator(platform.clone(), provider.clone(), waiter)
            .with_event_callback(move |event| {
                let OrchestratorEvent::PhaseChanged { phase, .. } = event;
                seen.lock().unwrap().push(*phase);
            });

        let results = orchestrator
            .run(&[donut_test()], CallDirection::Inbound, Some(NUMBER))
            .await
            .expect("batch");

        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert!(result.error.is_none());
        assert_eq!(result.transcript.len(), 3);
        assert_eq!(result.stereo_recording_url.as_deref(), Some("https://storage.example/rec.wav"));
        let evaluations = result.evaluation_results.as_ref().expect("evaluations");
        assert_eq!(evaluations.evaluation_results.len(), 2);
        assert_eq!(provider.call_count(), 1);

        assert_eq!(platform.dialed.lock().unwrap().as_slice(), [NUMBER.to_string()]);
        let configured = platform.configured.lock().unwrap();
        assert_eq!(configured[0].webhook_url, "https://calls.example.com/vapi-webhook");
        assert!(configured[0].system_prompt.contains("voicemail"));

        assert_eq!(
            phases.lock().unwrap().as_slice(),
            [
                TestPhase::Configuring,
                TestPhase::AwaitingCall,
                TestPhase::Normalizing,
                TestPhase::Evaluating,
                TestPhase::Done
            ]
        );
    }

    #[tokio::test]
    async fn outbound_test_waits_without_dialing() {
        let waiter = CallWaiter::new(loopback());
        let platform = Arc::new(DialsInOnConfigure(FakePlatform::new(
            waiter.registry().clone(),
            vec![Some(conversation_report())],
        )));
        let provider = Arc::new(ScriptedProvider::with_responses([verdicts()]));

        let results = orchestrator(platform.clone(), provider.clone(), waiter)
            .run(&[donut_test()], CallDirection::Outbound, Some("+44 7436 962389"))
            .await
            .expect("batch");

        assert!(results[0].error.is_none());
        assert!(platform.0.dialed.lock().unwrap().is_empty());
        assert!(!platform.0.configured.lock().unwrap()[0].system_prompt.contains("voicemail"));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn timeout_is_reported_per_test() {
        let waiter = CallWaiter::new(loopback());
        let platform = Arc::new(FakePlatform::new(waiter.registry().clone(), vec![None]));
        let provider = Arc::new(ScriptedProvider::new());

        let results = orchestrator(platform, provider.clone(), waiter)
            .with_call_timeout(Duration::from_millis(100))
            .run(&[donut_test()], CallDirection::Inbound, Some(NUMBER))
            .await
            .expect("batch");

        let result = &results[0];
        assert!(result.evaluation_results.is_none());
        assert!(result.error.as_deref().unwrap_or_default().starts_with("timed out"));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn system_only_transcript_skips_the_judge() {
        let waiter = CallWaiter::new(loopback());
        let report = CallReport::new(NUMBER, vec![TranscriptTurn::system("You are Sarah.")]);
        let platform = Arc::new(FakePlatform::new(waiter.registry().clone(), vec![Some(report)]));
        let provider = Arc::new(ScriptedProvider::new());

        let results = orchestrator(platform, provider.clone(), waiter)
            .run(&[donut_test()], CallDirection::Inbound, Some(NUMBER))
            .await
            .expect("batch");

        assert!(results[0].evaluation_results.is_none());
        assert!(results[0].error.is_none());
        assert_eq!(results[0].transcript.len(), 1);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn platform_evaluations_are_trusted() {
        let waiter = CallWaiter::new(loopback());
        let report = conversation_report().with_evaluation_results(vec![EvaluationResult {
            name: "A".into(),
            passed: true,
            reason: "platform says so".into(),
        }]);
        let platform = Arc::new(FakePlatform::new(waiter.registry().clone(), vec![Some(report)]));
        let provider = Arc::new(ScriptedProvider::new());

        let results = orchestrator(platform, provider.clone(), waiter)
            .run(&[donut_test()], CallDirection::Inbound, Some(NUMBER))
            .await
            .expect("batch");

        let evaluations = results[0].evaluation_results.as_ref().expect("evaluations");
        assert_eq!(evaluations.evaluation_results[0].reason, "platform says so");
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn configuration_failure_does_not_stop_the_batch() {
        let waiter = CallWaiter::new(loopback());
        let platform = Arc::new(
            FakePlatform::new(waiter.registry().clone(), vec![Some(conversation_report())])
                .failing_configure(vec![true, false]),
        );
        let provider = Arc::new(ScriptedProvider::with_responses([verdicts()]));

        let results = orchestrator(platform.clone(), provider, waiter)
            .run(&[donut_test(), donut_test()], CallDirection::Inbound, Some(NUMBER))
            .await
            .expect("batch");

        assert_eq!(results.len(), 2);
        let first_error = results[0].error.as_deref().unwrap_or_default();
        assert!(first_error.starts_with("configuration error"), "{first_error}");
        assert!(results[0].evaluation_results.is_none());
        assert!(results[1].error.is_none());
        assert!(results[1].evaluation_results.is_some());
        assert_eq!(platform.dialed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn judge_failure_keeps_the_transcript() {
        let waiter = CallWaiter::new(loopback());
        let platform = Arc::new(FakePlatform::new(
            waiter.registry().clone(),
            vec![Some(conversation_report())],
        ));
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_failure("upstream 500");

        let results = orchestrator(platform, provider, waiter)
            .run(&[donut_test()], CallDirection::Inbound, Some(NUMBER))
            .await
            .expect("batch");

        let result = &results[0];
        assert!(result.evaluation_results.is_none());
        assert!(result.error.as_deref().unwrap_or_default().starts_with("evaluation failed"));
        assert_eq!(result.transcript.len(), 3);
    }

    #[tokio::test]
    async fn invalid_batches_touch_nothing_external() {
        let waiter = CallWaiter::new(loopback());
        let platform = Arc::new(FakePlatform::new(waiter.registry().clone(), Vec::new()));
        let provider = Arc::new(ScriptedProvider::new());
        let orchestrator = orchestrator(platform.clone(), provider.clone(), waiter);

        assert_eq!(
            orchestrator.run(&[], CallDirection::Inbound, Some(NUMBER)).await,
            Err(ValidationError::NoTests)
        );
        assert_eq!(
            orchestrator.run(&[donut_test()], CallDirection::Outbound, None).await,
            Err(ValidationError::MissingPhoneNumber("outbound"))
        );
        assert_eq!(
            orchestrator.run(&[donut_test()], CallDirection::Inbound, Some("  ")).await,
            Err(ValidationError::MissingPhoneNumber("inbound"))
        );

        assert!(platform.configured.lock().unwrap().is_empty());
        assert!(platform.dialed.lock().unwrap().is_empty());
        assert_eq!(provider.call_count(), 0);
    }
}
