#![forbid(unsafe_code)]

//! Webhook dispatcher: a bounded job queue drained by at most `concurrency`
//! concurrent deliveries. Every send re-validates the target URL, resolves
//! it, vets each resolved address and connects only to those addresses.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use efferve_engines::outbound::{
    resolve_vetted_target, validate_webhook_url, HostResolver, OutboundViolation,
};
use efferve_kernel_contracts::alert::{DispatchJob, RuleId};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total sends per job, first attempt included.
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_millis(500),
        }
    }

    pub fn allows_retry(&self, attempt: u32, failure: &DispatchFailure) -> bool {
        attempt < self.max_attempts && failure.is_retryable()
    }

    /// Linear backoff: the n-th retry waits n * `backoff`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Record deliveries instead of sending them.
    pub dry_run: bool,
}

impl DispatcherConfig {
    pub fn mvp_v1() -> Self {
        Self {
            concurrency: 4,
            queue_capacity: 256,
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::none(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchFailure {
    #[error("target refused: {0}")]
    Rejected(#[from] OutboundViolation),
    #[error("webhook answered http status {0}")]
    HttpStatus(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("payload encode failed: {0}")]
    Encode(String),
}

impl DispatchFailure {
    pub fn class(&self) -> &'static str {
        match self {
            DispatchFailure::Rejected(_) => "rejected",
            DispatchFailure::HttpStatus(_) => "http_status",
            DispatchFailure::Transport(_) => "transport",
            DispatchFailure::Encode(_) => "encode",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchFailure::Transport(_) => true,
            DispatchFailure::HttpStatus(code) => *code == 429 || (500..=599).contains(code),
            DispatchFailure::Rejected(_) | DispatchFailure::Encode(_) => false,
        }
    }

    /// Whether a request actually left the process.
    fn reached_network(&self) -> bool {
        matches!(self, DispatchFailure::HttpStatus(_) | DispatchFailure::Transport(_))
    }
}

/// Hex SHA-256 of `rule_id|event|address|timestamp`. Stable across retries.
pub fn idempotency_key(job: &DispatchJob) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job.rule_id.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(job.payload.event.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(job.payload.device.address.as_bytes());
    hasher.update(b"|");
    hasher.update(job.payload.timestamp.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn encode_payload(job: &DispatchJob) -> Result<String, DispatchFailure> {
    serde_json::to_string(&job.payload).map_err(|e| DispatchFailure::Encode(e.to_string()))
}

#[derive(Clone)]
pub struct HttpWebhookSender {
    resolver: Arc<dyn HostResolver>,
    timeout: Duration,
    // Replaces the vetted addresses at connect time; only set by tests.
    dial_override: Option<SocketAddr>,
}

impl HttpWebhookSender {
    pub fn new(resolver: Arc<dyn HostResolver>, timeout: Duration) -> Self {
        Self {
            resolver,
            timeout,
            dial_override: None,
        }
    }

    #[cfg(test)]
    fn dialing(mut self, addr: SocketAddr) -> Self {
        self.dial_override = Some(addr);
        self
    }

    fn send_blocking(&self, job: &DispatchJob) -> Result<u16, DispatchFailure> {
        let target = validate_webhook_url(&job.webhook_url)?;
        let pinned = resolve_vetted_target(&target, self.resolver.as_ref())?;
        let body = encode_payload(job)?;
        let pinned = match self.dial_override {
            Some(addr) => vec![addr],
            None => pinned,
        };
        // Redirects are not followed and the connection may only use the
        // addresses vetted above, so a rebinding DNS answer is never dialled.
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(self.timeout)
            .timeout_read(self.timeout)
            .timeout_write(self.timeout)
            .timeout(self.timeout)
            .redirects(0)
            .resolver(move |_netloc: &str| -> io::Result<Vec<SocketAddr>> { Ok(pinned.clone()) })
            .build();
        let req = agent
            .post(target.as_str())
            .set("content-type", "application/json")
            .set(IDEMPOTENCY_HEADER, &idempotency_key(job));
        match req.send_string(&body) {
            Ok(resp) if (200..=299).contains(&resp.status()) => Ok(resp.status()),
            Ok(resp) => Err(DispatchFailure::HttpStatus(resp.status())),
            Err(ureq::Error::Status(code, _resp)) => Err(DispatchFailure::HttpStatus(code)),
            Err(ureq::Error::Transport(err)) => Err(DispatchFailure::Transport(err.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDelivery {
    pub rule_id: RuleId,
    pub url: String,
    pub idempotency_key: String,
    pub body: String,
    pub targets: Vec<SocketAddr>,
    pub status: u16,
}

/// Applies the same target checks as the HTTP sender, then records the
/// request instead of sending it. Answers 200 unless statuses were queued
/// with `respond_with`.
#[derive(Clone)]
pub struct RecordingSender {
    resolver: Arc<dyn HostResolver>,
    latency: Duration,
    deliveries: Arc<Mutex<Vec<RecordedDelivery>>>,
    responses: Arc<Mutex<VecDeque<u16>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl RecordingSender {
    pub fn new(resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            resolver,
            latency: Duration::ZERO,
            deliveries: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn respond_with(&self, statuses: impl IntoIterator<Item = u16>) {
        if let Ok(mut q) = self.responses.lock() {
            q.extend(statuses);
        }
    }

    pub fn deliveries(&self) -> Vec<RecordedDelivery> {
        self.deliveries.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn send(&self, job: &DispatchJob) -> Result<u16, DispatchFailure> {
        let target = validate_webhook_url(&job.webhook_url)?;
        let targets = resolve_vetted_target(&target, self.resolver.as_ref())?;
        let body = encode_payload(job)?;

        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let status = self
            .responses
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or(200);
        if let Ok(mut d) = self.deliveries.lock() {
            d.push(RecordedDelivery {
                rule_id: job.rule_id.clone(),
                url: target.as_str().to_string(),
                idempotency_key: idempotency_key(job),
                body,
                targets,
                status,
            });
        }
        if (200..=299).contains(&status) {
            Ok(status)
        } else {
            Err(DispatchFailure::HttpStatus(status))
        }
    }
}

#[derive(Clone)]
pub enum WebhookSenderRuntime {
    Http(HttpWebhookSender),
    Recording(RecordingSender),
}

impl WebhookSenderRuntime {
    pub fn from_config(config: &DispatcherConfig, resolver: Arc<dyn HostResolver>) -> Self {
        if config.dry_run {
            WebhookSenderRuntime::Recording(RecordingSender::new(resolver))
        } else {
            WebhookSenderRuntime::Http(HttpWebhookSender::new(resolver, config.request_timeout))
        }
    }

    pub async fn send(&self, job: &DispatchJob) -> Result<u16, DispatchFailure> {
        match self {
            WebhookSenderRuntime::Http(http) => {
                let http = http.clone();
                let job = job.clone();
                tokio::task::spawn_blocking(move || http.send_blocking(&job))
                    .await
                    .map_err(|e| DispatchFailure::Transport(format!("send task failed: {e}")))?
            }
            WebhookSenderRuntime::Recording(rec) => rec.send(job).await,
        }
    }
}

#[derive(Debug, Default)]
struct DispatchCounters {
    enqueued: AtomicU64,
    attempts: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub enqueued: u64,
    /// Requests that reached the network, retries included.
    pub attempts: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Jobs refused by target validation before any request was made.
    pub rejected: u64,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("webhook dispatcher is shut down")]
pub struct DispatcherClosed;

pub struct WebhookDispatcher {
    intake: Mutex<Option<mpsc::Sender<DispatchJob>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    permits: Arc<Semaphore>,
    concurrency: usize,
    counters: Arc<DispatchCounters>,
}

impl WebhookDispatcher {
    /// Spawns the intake task. Must be called inside a tokio runtime.
    pub fn start(config: &DispatcherConfig, sender: WebhookSenderRuntime) -> Self {
        let concurrency = config.concurrency.max(1);
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let permits = Arc::new(Semaphore::new(concurrency));
        let counters = Arc::new(DispatchCounters::default());
        let task = tokio::spawn(run_intake(
            rx,
            Arc::new(sender),
            permits.clone(),
            config.retry,
            counters.clone(),
        ));
        Self {
            intake: Mutex::new(Some(tx)),
            task: Mutex::new(Some(task)),
            permits,
            concurrency,
            counters,
        }
    }

    /// Waits for queue space when the queue is full.
    pub async fn submit(&self, job: DispatchJob) -> Result<(), DispatcherClosed> {
        let tx = self
            .intake
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .ok_or(DispatcherClosed)?;
        tx.send(job).await.map_err(|_| DispatcherClosed)?;
        bump(&self.counters.enqueued);
        Ok(())
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.counters;
        DispatchStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            attempts: c.attempts.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            in_flight: self.concurrency.saturating_sub(self.permits.available_permits()),
        }
    }

    /// Stops intake, lets queued and in-flight jobs finish within `grace`,
    /// then abandons whatever is left.
    pub async fn shutdown(&self, grace: Duration) -> DispatchStats {
        if let Ok(mut intake) = self.intake.lock() {
            intake.take();
        }
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(mut task) = task {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                warn!(grace_ms = grace.as_millis() as u64, "dispatcher drain timed out; abandoning deliveries");
                task.abort();
            }
        }
        let stats = self.stats();
        info!(
            delivered = stats.delivered,
            failed = stats.failed,
            rejected = stats.rejected,
            "webhook dispatcher stopped"
        );
        stats
    }
}

async fn run_intake(
    mut rx: mpsc::Receiver<DispatchJob>,
    sender: Arc<WebhookSenderRuntime>,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    counters: Arc<DispatchCounters>,
) {
    // Dropping this set (abort of the intake task) cancels in-flight work.
    let mut workers = JoinSet::new();
    loop {
        tokio::select! {
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                if let Err(err) = joined {
                    error!(error = %err, "webhook worker ended abnormally");
                }
            }
            next = rx.recv() => {
                let Some(job) = next else { break };
                let Ok(permit) = permits.clone().acquire_owned().await else { break };
                let sender = sender.clone();
                let counters = counters.clone();
                workers.spawn(async move {
                    deliver(job, &sender, retry, &counters).await;
                    drop(permit);
                });
            }
        }
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "webhook worker ended abnormally");
        }
    }
}

async fn deliver(
    job: DispatchJob,
    sender: &WebhookSenderRuntime,
    retry: RetryPolicy,
    counters: &DispatchCounters,
) {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let failure = match sender.send(&job).await {
            Ok(status) => {
                bump(&counters.attempts);
                bump(&counters.delivered);
                info!(rule_id = %job.rule_id, status, attempt, "webhook delivered");
                return;
            }
            Err(failure) => failure,
        };
        if failure.reached_network() {
            bump(&counters.attempts);
        }
        if let DispatchFailure::HttpStatus(status) = failure {
            warn!(rule_id = %job.rule_id, status, attempt, "webhook answered non-2xx");
        }
        if retry.allows_retry(attempt, &failure) {
            tokio::time::sleep(retry.delay(attempt)).await;
            continue;
        }
        match &failure {
            DispatchFailure::Rejected(violation) => {
                bump(&counters.rejected);
                error!(
                    rule_id = %job.rule_id,
                    class = failure.class(),
                    violation = violation.class(),
                    error = %failure,
                    "webhook dispatch refused"
                );
            }
            _ => {
                bump(&counters.failed);
                error!(
                    rule_id = %job.rule_id,
                    class = failure.class(),
                    attempts = attempt,
                    error = %failure,
                    "webhook dispatch failed"
                );
            }
        }
        return;
    }
}
