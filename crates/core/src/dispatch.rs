use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use tokio::{
    sync::{Notify, broadcast, mpsc},
    time::{Instant, sleep_until},
};

use crate::{
    config::TrackerConfig,
    events::EventRecord,
    queues::FifoDropOldestQueue,
    transport::{CollectBatch, Transport},
};

/// Page lifecycle signals the host forwards to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Visible,
    VisibilityHidden,
    PageHide,
    BeforeUnload,
}

impl Lifecycle {
    pub fn triggers_flush(self) -> bool {
        !matches!(self, Lifecycle::Visible)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    /// Another flush owns the queue; nothing was done.
    InFlight,
    Delivered {
        batches: usize,
        events: usize,
    },
    /// A batch failed and went back to the tail of the queue.
    Requeued {
        delivered: usize,
        requeued: usize,
    },
}

#[derive(Debug, Default)]
pub struct DispatchMetrics {
    pub enqueued_total: AtomicU64,
    pub delivered_total: AtomicU64,
    pub dropped_total: AtomicU64,
    pub failed_batches_total: AtomicU64,
}

impl DispatchMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.enqueued_total.load(Ordering::Relaxed),
            delivered: self.delivered_total.load(Ordering::Relaxed),
            dropped: self.dropped_total.load(Ordering::Relaxed),
            failed_batches: self.failed_batches_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub failed_batches: u64,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    queue: FifoDropOldestQueue<EventRecord>,
    transport: Arc<dyn Transport>,
    batch_size: usize,
    in_flight: AtomicBool,
    lifecycle_tx: mpsc::Sender<Lifecycle>,
    metrics: DispatchMetrics,
}

/// Owns the wake-up side of the dispatcher; drive it with [`DispatchWorker::run`].
pub struct DispatchWorker {
    dispatcher: Dispatcher,
    notify: Arc<Notify>,
    lifecycle_rx: mpsc::Receiver<Lifecycle>,
    flush_delay: Duration,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Dispatcher {
    pub fn new(config: &TrackerConfig, transport: Arc<dyn Transport>) -> (Self, DispatchWorker) {
        let notify = Arc::new(Notify::new());
        let (lifecycle_tx, lifecycle_rx) = mpsc::channel(8);
        let dispatcher = Self {
            inner: Arc::new(DispatcherInner {
                queue: FifoDropOldestQueue::new(config.queue_capacity, Arc::clone(&notify)),
                transport,
                batch_size: config.batch_size,
                in_flight: AtomicBool::new(false),
                lifecycle_tx,
                metrics: DispatchMetrics::default(),
            }),
        };
        let worker = DispatchWorker {
            dispatcher: dispatcher.clone(),
            notify,
            lifecycle_rx,
            flush_delay: config.flush_delay(),
        };
        (dispatcher, worker)
    }

    pub fn enqueue(&self, record: EventRecord) {
        self.inner
            .metrics
            .enqueued_total
            .fetch_add(1, Ordering::Relaxed);
        if let Some(evicted) = self.inner.queue.push_overwrite(record) {
            self.inner
                .metrics
                .dropped_total
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                event_uuid = %evicted.event_uuid,
                capacity = self.inner.queue.capacity(),
                "analytics queue full, dropped oldest event"
            );
        }
    }

    /// Forward a lifecycle signal to the worker. Best effort: if the worker is
    /// gone or already has a backlog of signals, the signal is discarded.
    pub fn lifecycle(&self, signal: Lifecycle) {
        if signal.triggers_flush() {
            let _ = self.inner.lifecycle_tx.try_send(signal);
        }
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn batch_size(&self) -> usize {
        self.inner.batch_size
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Deliver everything queued, `batch_size` records per request. Stops at
    /// the first failed batch, which is re-appended to the tail.
    pub async fn flush(&self) -> FlushOutcome {
        if self
            .inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return FlushOutcome::InFlight;
        }
        let _guard = InFlightGuard(&self.inner.in_flight);

        let mut batches = 0;
        let mut delivered = 0;
        loop {
            let events = self.inner.queue.drain_up_to(self.inner.batch_size);
            if events.is_empty() {
                break;
            }
            let n = events.len();
            let batch = CollectBatch { events };
            let body = match batch.to_body() {
                Ok(body) => body,
                Err(err) => {
                    tracing::error!(%err, events = n, "could not serialize batch, dropping it");
                    self.inner
                        .metrics
                        .dropped_total
                        .fetch_add(n as u64, Ordering::Relaxed);
                    continue;
                }
            };

            match self.inner.transport.deliver(&body, n).await {
                Ok(()) => {
                    batches += 1;
                    delivered += n;
                    self.inner
                        .metrics
                        .delivered_total
                        .fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(err) => {
                    tracing::warn!(%err, events = n, "batch delivery failed, requeueing");
                    self.inner
                        .metrics
                        .failed_batches_total
                        .fetch_add(1, Ordering::Relaxed);
                    let evicted = self.inner.queue.requeue(batch.events);
                    if evicted > 0 {
                        self.inner
                            .metrics
                            .dropped_total
                            .fetch_add(evicted as u64, Ordering::Relaxed);
                        tracing::warn!(evicted, "queue overflow while requeueing");
                    }
                    return FlushOutcome::Requeued {
                        delivered,
                        requeued: n,
                    };
                }
            }
        }

        if batches == 0 {
            FlushOutcome::Empty
        } else {
            tracing::debug!(batches, events = delivered, "flushed analytics queue");
            FlushOutcome::Delivered {
                batches,
                events: delivered,
            }
        }
    }
}

impl DispatchWorker {
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Flush on batch size, idle timeout or lifecycle signal until shutdown.
    /// A final flush runs before returning.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut idle_deadline: Option<Instant> = None;

        loop {
            let idle = async move {
                match idle_deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = shutdown.recv() => {
                    self.dispatcher.flush().await;
                    return Ok(());
                }
                _ = self.notify.notified() => {
                    if self.dispatcher.queue_len() >= self.dispatcher.batch_size() {
                        idle_deadline = None;
                        self.dispatcher.flush().await;
                    } else {
                        idle_deadline = Some(Instant::now() + self.flush_delay);
                    }
                }
                _ = idle => {
                    idle_deadline = None;
                    self.dispatcher.flush().await;
                }
                Some(signal) = self.lifecycle_rx.recv() => {
                    tracing::debug!(?signal, "lifecycle flush");
                    idle_deadline = None;
                    self.dispatcher.flush().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        events::{EventContext, EventKind},
        transport::RecordingTransport,
    };
    use serde_json::Map;

    fn view(n: usize) -> EventRecord {
        EventRecord::new(
            EventKind::View,
            EventContext {
                page_id: "home".into(),
                ..Default::default()
            },
            Map::new(),
            format!("uuid-{n}"),
            "2024-05-01T10:00:00.000Z".into(),
        )
    }

    fn setup(
        transport: Arc<RecordingTransport>,
        config: TrackerConfig,
    ) -> (Dispatcher, DispatchWorker) {
        Dispatcher::new(&config, transport)
    }

    #[tokio::test]
    async fn flush_on_empty_queue_is_noop() {
        let transport = Arc::new(RecordingTransport::new());
        let (dispatcher, _worker) = setup(transport.clone(), TrackerConfig::default());
        assert_eq!(dispatcher.flush().await, FlushOutcome::Empty);
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test]
    async fn flush_splits_into_batches() {
        let transport = Arc::new(RecordingTransport::new());
        let (dispatcher, _worker) = setup(transport.clone(), TrackerConfig::default());
        for i in 0..20 {
            dispatcher.enqueue(view(i));
        }
        assert_eq!(
            dispatcher.flush().await,
            FlushOutcome::Delivered {
                batches: 2,
                events: 20
            }
        );
        let sizes: Vec<usize> = transport.batches().iter().map(|b| b.events.len()).collect();
        assert_eq!(sizes, vec![15, 5]);
    }

    #[tokio::test]
    async fn failed_batch_goes_to_tail() {
        let transport = Arc::new(RecordingTransport::failing(1));
        let (dispatcher, _worker) = setup(transport.clone(), TrackerConfig::default());
        dispatcher.enqueue(view(1));
        dispatcher.enqueue(view(2));
        assert_eq!(
            dispatcher.flush().await,
            FlushOutcome::Requeued {
                delivered: 0,
                requeued: 2
            }
        );
        dispatcher.enqueue(view(3));
        dispatcher.flush().await;

        let order: Vec<String> = transport
            .delivered_events()
            .into_iter()
            .map(|e| e.event_uuid)
            .collect();
        assert_eq!(order, vec!["uuid-3", "uuid-1", "uuid-2"]);
        assert_eq!(dispatcher.metrics().failed_batches, 1);
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let transport = Arc::new(RecordingTransport::new());
        let config = TrackerConfig {
            batch_size: 2,
            queue_capacity: 3,
            ..TrackerConfig::default()
        };
        let (dispatcher, _worker) = setup(transport.clone(), config);
        for i in 0..5 {
            dispatcher.enqueue(view(i));
        }
        assert_eq!(dispatcher.queue_len(), 3);
        assert_eq!(dispatcher.metrics().dropped, 2);
        dispatcher.flush().await;
        assert_eq!(transport.delivered_events()[0].event_uuid, "uuid-2");
    }

    #[tokio::test(start_paused = true)]
    async fn worker_flushes_after_idle_delay() {
        let transport = Arc::new(RecordingTransport::new());
        let (dispatcher, worker) = setup(transport.clone(), TrackerConfig::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        dispatcher.enqueue(view(1));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        dispatcher.enqueue(view(2));
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(transport.attempts(), 0, "idle timer must restart on enqueue");

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(transport.batches().len(), 1);
        assert_eq!(transport.batches()[0].events.len(), 2);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn worker_flushes_on_lifecycle_and_shutdown() {
        let transport = Arc::new(RecordingTransport::new());
        let (dispatcher, worker) = setup(transport.clone(), TrackerConfig::default());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(worker.run(shutdown_rx));

        dispatcher.enqueue(view(1));
        dispatcher.lifecycle(Lifecycle::Visible);
        tokio::task::yield_now().await;
        dispatcher.lifecycle(Lifecycle::PageHide);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.batches().len(), 1);

        dispatcher.enqueue(view(2));
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(transport.delivered_events().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_flush_is_single_flight() {
        use crate::error::Result as TrackResult;
        use async_trait::async_trait;
        use tokio::sync::Notify;

        struct Gate {
            entered: Notify,
            release: Notify,
        }

        #[async_trait]
        impl Transport for Gate {
            async fn deliver(&self, _body: &[u8], _events: usize) -> TrackResult<()> {
                self.entered.notify_one();
                self.release.notified().await;
                Ok(())
            }
        }

        let gate = Arc::new(Gate {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let (dispatcher, _worker) = Dispatcher::new(&TrackerConfig::default(), gate.clone());
        dispatcher.enqueue(view(1));

        let first = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.flush().await }
        });
        gate.entered.notified().await;
        dispatcher.enqueue(view(2));
        assert_eq!(dispatcher.flush().await, FlushOutcome::InFlight);
        gate.release.notify_one();
        // the in-flight flush picks up the late event as a second batch
        gate.release.notify_one();
        let outcome = first.await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Delivered { events: 2, .. }));
    }
}
