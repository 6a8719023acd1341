use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, info_span, warn, Instrument};

use courier_core::{AttemptId, DeliveryConfig, DeliveryError};
use courier_store::SessionStore;
use courier_telemetry::MetricsRecorder;

use crate::outcome::{classify, AttemptOutcome, AttemptReport};
use crate::payload::PayloadBuilder;
use crate::queue::DeliveryQueue;
use crate::transport::{HttpTransport, ReqwestTransport};

pub const DEFAULT_QUEUE_NAME: &str = "courier-delivery";
const REPORT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to start delivery queue {queue}: {source}")]
    Queue {
        queue: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Ships the pending sessions of a store to the collector.
///
/// Every call to [`deliver_sessions_in_store`](Self::deliver_sessions_in_store)
/// enqueues one attempt on the client's private queue and returns at once.
/// Attempts run one at a time in submission order: each reads all pending
/// records, sends them as one payload and deletes exactly those records if
/// the collector accepts them.
pub struct DeliveryClient {
    inner: Arc<ClientInner>,
    queue: DeliveryQueue,
}

struct ClientInner {
    config: DeliveryConfig,
    transport: Arc<dyn HttpTransport>,
    metrics: Option<Arc<MetricsRecorder>>,
    reports: broadcast::Sender<AttemptReport>,
    queue_name: String,
}

pub struct DeliveryClientBuilder {
    config: DeliveryConfig,
    queue_name: String,
    transport: Option<Arc<dyn HttpTransport>>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl DeliveryClientBuilder {
    pub fn queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<DeliveryClient, ClientError> {
        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::with_default_client()?),
        };
        let queue = DeliveryQueue::spawn(self.queue_name.clone()).map_err(|source| {
            ClientError::Queue {
                queue: self.queue_name.clone(),
                source,
            }
        })?;
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);

        Ok(DeliveryClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                transport,
                metrics: self.metrics,
                reports,
                queue_name: self.queue_name,
            }),
            queue,
        })
    }
}

impl DeliveryClient {
    /// Bind a client to `config` with a reqwest transport. Starts the worker
    /// thread but performs no network activity.
    pub fn new(config: DeliveryConfig, queue_name: impl Into<String>) -> Result<Self, ClientError> {
        Self::builder(config).queue_name(queue_name).build()
    }

    pub fn builder(config: DeliveryConfig) -> DeliveryClientBuilder {
        DeliveryClientBuilder {
            config,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            transport: None,
            metrics: None,
        }
    }

    /// Enqueue one delivery attempt against `store` and return immediately.
    pub fn deliver_sessions_in_store(&self, store: Arc<dyn SessionStore>) {
        // Counted before submit so the worker's decrement can never land first.
        self.inner.adjust_depth(1.0);
        let inner = self.inner.clone();
        let queued = self.queue.submit(async move {
            inner.run_attempt(store.as_ref()).await;
        });
        if !queued {
            self.inner.adjust_depth(-1.0);
            warn!(queue = %self.inner.queue_name, "delivery queue closed, attempt dropped");
        }
    }

    pub fn code_bundle_id(&self) -> Option<String> {
        self.inner.config.code_bundle_id.get().map(|id| id.to_string())
    }

    /// Takes effect for every attempt that builds its payload after this call.
    pub fn set_code_bundle_id(&self, code_bundle_id: Option<String>) {
        self.inner.config.code_bundle_id.set(code_bundle_id);
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AttemptReport> {
        self.inner.reports.subscribe()
    }

    /// Resolves once every attempt enqueued before this call has finished.
    pub fn flush(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let _ = self.queue.submit(async move {
            let _ = tx.send(());
        });
        rx
    }

    /// Blocking form of [`flush`](Self::flush). Do not call from the queue's
    /// own tasks.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let (tx, rx) = std::sync::mpsc::channel();
        if !self.queue.submit(async move {
            let _ = tx.send(());
        }) {
            return false;
        }
        rx.recv_timeout(timeout).is_ok()
    }

    pub fn pending_tasks(&self) -> usize {
        self.queue.pending()
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    /// Finish queued attempts and stop the worker thread.
    pub fn shutdown(self) {
        self.queue.shutdown();
    }
}

impl ClientInner {
    fn adjust_depth(&self, delta: f64) {
        if let Some(metrics) = &self.metrics {
            metrics.gauge_add("delivery.queue.depth", &[("queue", self.queue_name.as_str())], delta);
        }
    }

    async fn run_attempt(&self, store: &dyn SessionStore) {
        let attempt_id = AttemptId::new();
        let span = info_span!(
            "delivery_attempt",
            attempt_id = %attempt_id,
            queue = %self.queue_name
        );
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut stats = AttemptStats::default();

        let outcome = self.attempt(store, &mut stats).instrument(span).await;

        self.adjust_depth(-1.0);
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc("delivery.attempts.total", &[("outcome", outcome.label())], 1);
            if let AttemptOutcome::Accepted { delivered } = &outcome {
                metrics.counter_inc("delivery.sessions.delivered", &[], *delivered as u64);
            }
            if let Some(elapsed) = stats.exchange {
                metrics.histogram_observe(
                    "delivery.exchange.duration_ms",
                    &[],
                    elapsed.as_secs_f64() * 1000.0,
                );
            }
        }

        // No subscribers is the normal case.
        let _ = self.reports.send(AttemptReport {
            attempt_id,
            queue: self.queue_name.clone(),
            outcome,
            batch_size: stats.batch_size,
            code_bundle_id: stats.code_bundle_id,
            started_at,
            duration: clock.elapsed(),
        });
    }

    async fn attempt(&self, store: &dyn SessionStore, stats: &mut AttemptStats) -> AttemptOutcome {
        if let Some(reason) = self.config.skip_reason() {
            debug!(reason = reason.as_str(), "delivery skipped");
            return AttemptOutcome::Skipped(reason);
        }

        let records = match store.list_pending() {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "failed to read pending sessions");
                return AttemptOutcome::StoreFailed(e.into());
            }
        };
        if records.is_empty() {
            debug!("no pending sessions");
            return AttemptOutcome::Empty;
        }

        let count = records.len();
        stats.batch_size = count;
        let builder = PayloadBuilder::new(&self.config);
        let batch = match builder.build(records) {
            Ok(batch) => batch,
            Err(error) => {
                warn!(error = %error, sessions = count, "could not serialize sessions");
                return AttemptOutcome::Rejected { retained: count, error };
            }
        };
        stats.code_bundle_id = batch.code_bundle_id().map(str::to_string);

        let request = builder.request(&batch, Utc::now());
        let exchange = Instant::now();
        let result = self.transport.execute(request).await;
        stats.exchange = Some(exchange.elapsed());

        match classify(result) {
            Ok(status) => match store.delete(batch.ids()) {
                Ok(removed) => {
                    info!(status, sessions = batch.len(), removed, "sessions delivered");
                    AttemptOutcome::Accepted {
                        delivered: batch.len(),
                    }
                }
                Err(e) => {
                    error!(
                        error = %e,
                        sessions = batch.len(),
                        "delivered sessions could not be removed and will be sent again"
                    );
                    AttemptOutcome::StoreFailed(DeliveryError::from(e))
                }
            },
            Err(error) if error.is_permanent() => {
                warn!(
                    error = %error,
                    kind = error.error_kind(),
                    sessions = batch.len(),
                    "collector rejected sessions, keeping them"
                );
                AttemptOutcome::Rejected {
                    retained: batch.len(),
                    error,
                }
            }
            Err(error) => {
                warn!(
                    error = %error,
                    kind = error.error_kind(),
                    sessions = batch.len(),
                    "session delivery failed, will retry on next trigger"
                );
                AttemptOutcome::TransientFailure {
                    retained: batch.len(),
                    error,
                }
            }
        }
    }
}

#[derive(Default)]
struct AttemptStats {
    batch_size: usize,
    code_bundle_id: Option<String>,
    exchange: Option<Duration>,
}
