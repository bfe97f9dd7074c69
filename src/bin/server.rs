use std::{error::Error, sync::Arc};

use callcheck::{
    providers::openai::OpenAI,
    server::{router, AppState},
    CallWaiter, LlmEvaluator, OrchestratorEvent, Settings, TestOrchestrator, VapiClient,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,callcheck=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::from_env()?;
    let provider = Arc::new(OpenAI::from_env()?);
    let voice_agent = Arc::new(VapiClient::from_env()?);
    let tunnel = settings.tunnel()?;

    let orchestrator = TestOrchestrator::new(
        voice_agent,
        Arc::new(LlmEvaluator::new(provider, settings.evaluator_model.clone())),
        tunnel,
        CallWaiter::new(settings.webhook_addr()),
    )
    .with_call_timeout(settings.call_timeout)
    .with_event_callback(|event| match event {
        OrchestratorEvent::PhaseChanged { index, scenario, phase } => {
            tracing::info!(index, %scenario, ?phase, "test progress");
        }
    });

    let app = router(Arc::new(AppState::new(orchestrator, settings.default_voice_id.clone())));

    let addr = settings.listen_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        %addr,
        webhook_port = settings.webhook_port,
        call_timeout_secs = settings.call_timeout.as_secs(),
        "listening"
    );
    axum::serve(listener, app).await?;

    Ok(())
}
