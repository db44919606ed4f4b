//! Buffers outgoing metrics per backend and drains them into a
//! [`crate::submitter::Submitter`] with bounded concurrency.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use crate::metrics;
use crate::model::OutgoingMetric;
use crate::submitter::Submitter;

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub max_workers: i64,
    pub metrics_per_request_size: usize,
    pub batch_send_deadline: Duration,
    pub max_allowed_eps: u32,
    pub debug: bool,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        ForwarderConfig {
            max_workers: 20,
            metrics_per_request_size: 1000,
            batch_send_deadline: Duration::from_secs(60),
            max_allowed_eps: 0,
            debug: false,
        }
    }
}

#[derive(Debug)]
pub enum ForwarderConfigError {
    EpsBelowChunkSize { eps: u32, chunk_size: usize },
}

impl std::fmt::Display for ForwarderConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ForwarderConfigError::EpsBelowChunkSize { eps, chunk_size } => write!(
                f,
                "max_allowed_eps ({eps}) must be zero or at least metrics_per_request_size ({chunk_size})"
            ),
        }
    }
}

impl std::error::Error for ForwarderConfigError {}

struct Buffer {
    items: Vec<OutgoingMetric>,
    oldest_at: Option<Instant>,
}

/// Owns one backend's buffer, concurrency counter and background
/// tasks. Cheap to clone: everything mutable lives behind `Arc`.
pub struct Forwarder {
    config: ForwarderConfig,
    submitter: Arc<dyn Submitter>,
    buffer: Mutex<Buffer>,
    in_flight: AtomicI64,
    flush_tx: mpsc::Sender<()>,
    flush_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl ForwarderConfig {
    pub fn validate(&self) -> Result<(), ForwarderConfigError> {
        if self.max_allowed_eps > 0 && (self.max_allowed_eps as usize) < self.metrics_per_request_size {
            return Err(ForwarderConfigError::EpsBelowChunkSize {
                eps: self.max_allowed_eps,
                chunk_size: self.metrics_per_request_size,
            });
        }
        Ok(())
    }
}

impl Forwarder {
    pub fn new(config: ForwarderConfig, submitter: Arc<dyn Submitter>) -> Result<Arc<Self>, ForwarderConfigError> {
        config.validate()?;

        let (flush_tx, flush_rx) = mpsc::channel(1);
        Ok(Arc::new(Forwarder {
            config,
            submitter,
            buffer: Mutex::new(Buffer {
                items: Vec::new(),
                oldest_at: None,
            }),
            in_flight: AtomicI64::new(0),
            flush_tx,
            flush_rx: Mutex::new(Some(flush_rx)),
        }))
    }

    fn anodot_url(&self) -> &str {
        self.submitter.label()
    }

    /// Appends a batch of metrics to the buffer, signaling the
    /// dispatcher if the configured chunk size has been reached.
    pub fn do_forward(&self, batch: Vec<OutgoingMetric>) {
        metrics::SAMPLES_RECEIVED.inc_by(batch.len() as f64);

        if self.config.debug {
            for metric in &batch {
                log::info!("received metric: {metric:?}");
            }
            return;
        }

        if batch.is_empty() {
            return;
        }

        let should_signal = {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.oldest_at.is_none() {
                buffer.oldest_at = Some(Instant::now());
            }
            buffer.items.extend(batch);
            metrics::BUFFERED_METRICS
                .with_label_values(&[self.anodot_url()])
                .set(buffer.items.len() as f64);
            buffer.items.len() >= self.config.metrics_per_request_size
        };

        if should_signal {
            let _ = self.flush_tx.try_send(());
        }
    }

    /// Spawns the deadline watcher and dispatcher background tasks.
    /// `done` fires to stop the dispatcher without a final flush.
    pub fn spawn(self: &Arc<Self>, mut done: watch::Receiver<bool>) {
        let deadline_forwarder = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(deadline_forwarder.config.batch_send_deadline);
            loop {
                ticker.tick().await;
                let stale = {
                    let buffer = deadline_forwarder.buffer.lock().unwrap();
                    !buffer.items.is_empty()
                        && buffer
                            .oldest_at
                            .is_some_and(|t| t.elapsed() >= deadline_forwarder.config.batch_send_deadline)
                };
                if stale {
                    let _ = deadline_forwarder.flush_tx.try_send(());
                }
            }
        });

        let dispatch_forwarder = Arc::clone(self);
        let mut flush_rx = self
            .flush_rx
            .lock()
            .unwrap()
            .take()
            .expect("Forwarder::spawn must only be called once");
        tokio::spawn(async move {
            let mut rate_limiter = if dispatch_forwarder.config.max_allowed_eps > 0 {
                let chunks_per_sec =
                    dispatch_forwarder.config.max_allowed_eps as f64 / dispatch_forwarder.config.metrics_per_request_size as f64;
                let micros = (1_000_000.0 / chunks_per_sec).round().max(1.0) as u64;
                Some(tokio::time::interval(Duration::from_micros(micros)))
            } else {
                None
            };

            loop {
                tokio::select! {
                    biased;
                    _ = done.changed() => {
                        if *done.borrow() {
                            return;
                        }
                    }
                    maybe = flush_rx.recv() => {
                        if maybe.is_none() {
                            return;
                        }
                    }
                }

                loop {
                    let chunk = dispatch_forwarder.drain_chunk();
                    let Some(chunk) = chunk else { break };

                    if let Some(limiter) = rate_limiter.as_mut() {
                        let wait_start = Instant::now();
                        limiter.tick().await;
                        metrics::WORKERS_THROTTLE_TIME_MS
                            .with_label_values(&[dispatch_forwarder.anodot_url()])
                            .inc_by(wait_start.elapsed().as_millis() as f64);
                    }

                    if dispatch_forwarder.in_flight.load(Ordering::SeqCst) >= dispatch_forwarder.config.max_workers {
                        metrics::CONCURRENCY_LIMIT_REACHED
                            .with_label_values(&[dispatch_forwarder.anodot_url()])
                            .inc();
                        log::warn!(
                            "reached concurrency limit for {}, submitting synchronously",
                            dispatch_forwarder.anodot_url()
                        );
                        dispatch_forwarder.submit_chunk(chunk).await;
                    } else {
                        let submit_forwarder = Arc::clone(&dispatch_forwarder);
                        tokio::spawn(async move {
                            submit_forwarder.submit_chunk(chunk).await;
                        });
                    }
                }
            }
        });
    }

    fn drain_chunk(&self) -> Option<Vec<OutgoingMetric>> {
        let mut buffer = self.buffer.lock().unwrap();
        if buffer.items.is_empty() {
            return None;
        }
        let take = buffer.items.len().min(self.config.metrics_per_request_size);
        let chunk: Vec<OutgoingMetric> = buffer.items.drain(..take).collect();
        buffer.oldest_at = if buffer.items.is_empty() { None } else { Some(Instant::now()) };
        metrics::BUFFERED_METRICS
            .with_label_values(&[self.anodot_url()])
            .set(buffer.items.len() as f64);
        Some(chunk)
    }

    async fn submit_chunk(&self, chunk: Vec<OutgoingMetric>) {
        struct InFlightGuard<'a>(&'a AtomicI64);
        impl Drop for InFlightGuard<'_> {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);
        metrics::CONCURRENT_WORKERS
            .with_label_values(&[self.anodot_url()])
            .set(self.in_flight.load(Ordering::SeqCst) as f64);

        let start = Instant::now();
        let outcome = self.submitter.submit(&chunk).await;
        metrics::SERVER_RESPONSE_TIME
            .with_label_values(&[self.anodot_url()])
            .observe(start.elapsed().as_secs_f64());

        if let Some(status) = outcome.status {
            metrics::SERVER_HTTP_RESPONSES
                .with_label_values(&[self.anodot_url(), status.as_str()])
                .inc();
        }

        if let Err(err) = outcome.result {
            metrics::METRICS_SUBMISSION_ERRORS.with_label_values(&[self.anodot_url()]).inc();
            log::error!("failed to submit metrics to {}: {err}", self.anodot_url());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use std::sync::atomic::AtomicUsize;
    use crate::submitter::SubmitOutcome;

    struct CountingSubmitter {
        label: String,
        submissions: Mutex<Vec<usize>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Submitter for CountingSubmitter {
        async fn submit(&self, metrics: &[OutgoingMetric]) -> SubmitOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.submissions.lock().unwrap().push(metrics.len());
            SubmitOutcome {
                status: Some(reqwest::StatusCode::OK),
                result: Ok(()),
            }
        }

        fn label(&self) -> &str {
            &self.label
        }
    }

    fn metric() -> OutgoingMetric {
        OutgoingMetric {
            properties: Default::default(),
            tags: Default::default(),
            timestamp: 1,
            value: 1.0,
        }
    }

    #[test]
    fn test_buffer_accumulates_below_threshold() {
        let submitter = Arc::new(CountingSubmitter {
            label: "test".into(),
            submissions: Mutex::new(vec![]),
            calls: AtomicUsize::new(0),
        });
        let forwarder = Forwarder::new(ForwarderConfig::default(), submitter.clone()).unwrap();

        forwarder.do_forward(vec![metric(); 100]);
        forwarder.do_forward(vec![metric(); 800]);

        let buffered = forwarder.buffer.lock().unwrap().items.len();
        pretty_assert_eq!(buffered, 900);
        pretty_assert_eq!(submitter.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rejects_eps_below_chunk_size() {
        let submitter = Arc::new(CountingSubmitter {
            label: "test".into(),
            submissions: Mutex::new(vec![]),
            calls: AtomicUsize::new(0),
        });
        let config = ForwarderConfig {
            max_allowed_eps: 10,
            metrics_per_request_size: 1000,
            ..Default::default()
        };
        assert!(Forwarder::new(config, submitter).is_err());
    }

    #[test]
    fn test_drain_chunk_respects_request_size() {
        let submitter = Arc::new(CountingSubmitter {
            label: "test".into(),
            submissions: Mutex::new(vec![]),
            calls: AtomicUsize::new(0),
        });
        let forwarder = Forwarder::new(ForwarderConfig::default(), submitter).unwrap();
        forwarder.do_forward(vec![metric(); 1500]);

        let chunk = forwarder.drain_chunk().unwrap();
        pretty_assert_eq!(chunk.len(), 1000);
        let remaining = forwarder.buffer.lock().unwrap().items.len();
        pretty_assert_eq!(remaining, 500);
    }

    #[test]
    fn test_debug_mode_never_buffers() {
        let submitter = Arc::new(CountingSubmitter {
            label: "test".into(),
            submissions: Mutex::new(vec![]),
            calls: AtomicUsize::new(0),
        });
        let config = ForwarderConfig {
            debug: true,
            ..Default::default()
        };
        let forwarder = Forwarder::new(config, submitter).unwrap();
        forwarder.do_forward(vec![metric(); 5000]);
        pretty_assert_eq!(forwarder.buffer.lock().unwrap().items.len(), 0);
    }
}
