//! Waits for the end-of-call webhook of one specific call.
//!
//! A [`CallWaiter`] owns a correlation table from phone number to a oneshot
//! rendezvous. [`CallWaiter::begin`] registers the number and starts a
//! listener; the returned [`ActiveWait`] unregisters and stops the listener
//! when it is consumed or dropped.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::post,
    Router,
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};

use crate::{
    error::TestError,
    webhook::{canonical_number, CallReport, WebhookEvent, WEBHOOK_PATH},
};

const BIND_ATTEMPTS: u32 = 3;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(200);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Unmatched,
}

/// Pending waits keyed by canonical phone number.
#[derive(Clone, Default)]
pub struct WebhookRegistry {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<CallReport>>>>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, phone_number: &str) -> Result<oneshot::Receiver<CallReport>, TestError> {
        let key = canonical_number(phone_number);
        let mut pending = self.lock();

        if let Some(existing) = pending.get(&key) {
            if !existing.is_closed() {
                return Err(TestError::Unexpected(format!(
                    "a call to {phone_number} is already being awaited"
                )));
            }
        }

        let (sender, receiver) = oneshot::channel();
        pending.insert(key, sender);
        Ok(receiver)
    }

    pub fn unregister(&self, phone_number: &str) {
        self.lock().remove(&canonical_number(phone_number));
    }

    pub fn deliver(&self, report: CallReport) -> Delivery {
        let key = canonical_number(&report.customer_number);
        let Some(sender) = self.lock().remove(&key) else {
            return Delivery::Unmatched;
        };

        match sender.send(report) {
            Ok(()) => Delivery::Delivered,
            Err(_) => Delivery::Unmatched,
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<CallReport>>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn webhook_router(registry: WebhookRegistry) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(receive_webhook))
        .with_state(registry)
}

async fn receive_webhook(State(registry): State<WebhookRegistry>, body: Bytes) -> StatusCode {
    match WebhookEvent::parse(&body) {
        WebhookEvent::CallEnded(report) => {
            let number = report.customer_number.clone();
            match registry.deliver(report) {
                Delivery::Delivered => {
                    tracing::info!(customer = %number, "end-of-call report matched a pending wait");
                }
                Delivery::Unmatched => {
                    tracing::info!(customer = %number, "ignoring end-of-call report for a number nobody is waiting on");
                }
            }
        }
        WebhookEvent::Uncorrelated => {
            tracing::warn!("ignoring end-of-call report without a customer number");
        }
        WebhookEvent::Ignored { kind } => {
            tracing::debug!(kind = kind.as_deref().unwrap_or("<none>"), "ignoring webhook event");
        }
        WebhookEvent::Malformed(reason) => {
            tracing::warn!(%reason, "ignoring malformed webhook payload");
        }
    }

    StatusCode::OK
}

pub struct CallWaiter {
    bind_addr: SocketAddr,
    registry: WebhookRegistry,
    busy: Arc<AtomicBool>,
}

impl CallWaiter {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            registry: WebhookRegistry::new(),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn registry(&self) -> &WebhookRegistry {
        &self.registry
    }

    /// Registers interest in `phone_number` and starts the webhook listener.
    pub async fn begin(&self, phone_number: &str) -> Result<ActiveWait, TestError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(TestError::Unexpected(
                "this waiter is already awaiting a call".to_string(),
            ));
        }
        let busy = BusyFlag(self.busy.clone());

        let receiver = self.registry.register(phone_number)?;
        let registration = Registration {
            registry: self.registry.clone(),
            phone_number: phone_number.to_string(),
        };

        let listener = bind_with_retry(self.bind_addr).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TestError::Unexpected(format!("webhook listener has no address: {e}")))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = webhook_router(self.registry.clone());
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "webhook listener failed");
            }
        });

        tracing::info!(%local_addr, phone_number, "webhook listener started");

        Ok(ActiveWait {
            local_addr,
            receiver: Some(receiver),
            shutdown: Some(shutdown_tx),
            task: Some(task),
            registration,
            _busy: busy,
        })
    }

    pub async fn await_call_completion(
        &self,
        expected_phone_number: &str,
        timeout: Duration,
    ) -> Result<CallReport, TestError> {
        self.begin(expected_phone_number).await?.wait(timeout).await
    }
}

async fn bind_with_retry(addr: SocketAddr) -> Result<TcpListener, TestError> {
    let mut attempt = 1;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if attempt < BIND_ATTEMPTS => {
                tracing::debug!(%addr, attempt, error = %e, "webhook port busy, retrying");
                attempt += 1;
                tokio::time::sleep(BIND_RETRY_DELAY).await;
            }
            Err(e) => {
                return Err(TestError::Configuration(format!(
                    "failed to bind webhook listener on {addr}: {e}"
                )))
            }
        }
    }
}

struct BusyFlag(Arc<AtomicBool>);

impl Drop for BusyFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Registration {
    registry: WebhookRegistry,
    phone_number: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.phone_number);
    }
}

/// A registered wait plus the listener serving it.
pub struct ActiveWait {
    local_addr: SocketAddr,
    receiver: Option<oneshot::Receiver<CallReport>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    registration: Registration,
    _busy: BusyFlag,
}

impl ActiveWait {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn phone_number(&self) -> &str {
        &self.registration.phone_number
    }

    pub async fn wait(mut self, timeout: Duration) -> Result<CallReport, TestError> {
        let outcome = match self.receiver.take() {
            Some(receiver) => match tokio::time::timeout(timeout, receiver).await {
                Ok(Ok(report)) => Ok(report),
                Ok(Err(_)) => Err(TestError::Unexpected(
                    "webhook registration was dropped before the call ended".to_string(),
                )),
                Err(_) => Err(TestError::Timeout {
                    phone_number: self.registration.phone_number.clone(),
                    waited: timeout,
                }),
            },
            None => Err(TestError::Unexpected("wait was already consumed".to_string())),
        };

        self.stop().await;
        outcome
    }

    async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                tracing::warn!("webhook listener did not drain in time, aborting");
                task.abort();
            }
        }
        tracing::debug!(local_addr = %self.local_addr, "webhook listener stopped");
    }
}

impl Drop for ActiveWait {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
