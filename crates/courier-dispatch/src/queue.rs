//! Bounded-concurrency delivery queue.
//!
//! Submissions wait in a FIFO backlog and are started in submission order,
//! with at most `concurrency` deliveries in flight. Each submission gets a
//! [`DeliveryTicket`] that resolves exactly once with the delivery result.

use async_trait::async_trait;
use courier_core::{DispatchError, SendOutcome, SendRequest};
use courier_telemetry::DispatchMetrics;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Something that can carry a request through to an outcome
#[async_trait]
pub trait Deliver: Send + Sync + 'static {
    /// Deliver one request
    ///
    /// # Errors
    /// Returns the terminal error of the delivery
    async fn deliver(&self, request: SendRequest) -> Result<SendOutcome, DispatchError>;
}

/// Point-in-time queue occupancy; advisory only
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    /// Submissions waiting to start
    pub pending: usize,
    /// Deliveries in flight
    pub active: usize,
}

type Reply = oneshot::Sender<Result<SendOutcome, DispatchError>>;

struct QueuedSend {
    request: SendRequest,
    reply: Reply,
}

#[derive(Default)]
struct QueueState {
    backlog: VecDeque<QueuedSend>,
    active: usize,
}

struct QueueShared {
    deliver: Arc<dyn Deliver>,
    concurrency: usize,
    state: Mutex<QueueState>,
    metrics: Option<Arc<DispatchMetrics>>,
}

impl QueueShared {
    fn status(&self) -> QueueStatus {
        let state = self.state.lock();
        QueueStatus {
            pending: state.backlog.len(),
            active: state.active,
        }
    }

    fn publish(&self, status: QueueStatus) {
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(status.pending, status.active);
        }
    }
}

/// Releases an active slot and keeps draining, even if the delivery panicked
struct ActiveSlot(Arc<QueueShared>);

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        {
            let mut state = self.0.state.lock();
            state.active = state.active.saturating_sub(1);
        }
        DeliveryQueue::drain(&self.0);
    }
}

/// FIFO queue feeding a [`Deliver`] implementation under a concurrency cap
#[derive(Clone)]
pub struct DeliveryQueue {
    shared: Arc<QueueShared>,
}

impl DeliveryQueue {
    /// Create a queue; a zero `concurrency` is treated as one
    #[must_use]
    pub fn new(deliver: Arc<dyn Deliver>, concurrency: usize) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                deliver,
                concurrency: concurrency.max(1),
                state: Mutex::new(QueueState::default()),
                metrics: None,
            }),
        }
    }

    /// Create a queue that publishes occupancy gauges
    #[must_use]
    pub fn with_metrics(
        deliver: Arc<dyn Deliver>,
        concurrency: usize,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                deliver,
                concurrency: concurrency.max(1),
                state: Mutex::new(QueueState::default()),
                metrics: Some(metrics),
            }),
        }
    }

    /// Maximum deliveries in flight
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.shared.concurrency
    }

    /// Enqueue a request and start deliveries up to the cap.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn add(&self, request: SendRequest) -> DeliveryTicket {
        let (reply, receiver) = oneshot::channel();
        self.shared
            .state
            .lock()
            .backlog
            .push_back(QueuedSend { request, reply });
        trace!("Request queued");
        Self::drain(&self.shared);
        DeliveryTicket { receiver }
    }

    /// Current occupancy
    #[must_use]
    pub fn status(&self) -> QueueStatus {
        self.shared.status()
    }

    fn drain(shared: &Arc<QueueShared>) {
        loop {
            let job = {
                let mut state = shared.state.lock();
                if state.active >= shared.concurrency {
                    break;
                }
                let Some(job) = state.backlog.pop_front() else {
                    break;
                };
                state.active += 1;
                job
            };

            let slot = ActiveSlot(Arc::clone(shared));
            tokio::spawn(async move {
                let QueuedSend { request, reply } = job;
                let result = slot.0.deliver.deliver(request).await;
                if reply.send(result).is_err() {
                    debug!("Delivery finished after its ticket was dropped");
                }
                drop(slot);
            });
        }
        shared.publish(shared.status());
    }
}

impl std::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("concurrency", &self.shared.concurrency)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Completion handle for a queued request.
///
/// Resolves with `DispatchError::QueueClosed` if the delivery task went away
/// without producing a result.
#[derive(Debug)]
pub struct DeliveryTicket {
    receiver: oneshot::Receiver<Result<SendOutcome, DispatchError>>,
}

impl Future for DeliveryTicket {
    type Output = Result<SendOutcome, DispatchError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(DispatchError::QueueClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct SlowDeliver {
        delay: Duration,
        current: AtomicUsize,
        peak: AtomicUsize,
        started: Mutex<Vec<String>>,
    }

    impl SlowDeliver {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                started: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Deliver for SlowDeliver {
        async fn deliver(&self, request: SendRequest) -> Result<SendOutcome, DispatchError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.started.lock().push(request.to.clone());
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            if request.subject == "fail" {
                return Err(DispatchError::provider("slow", "rejected", false));
            }
            Ok(SendOutcome::delivered("slow", request.to))
        }
    }

    struct PanickingDeliver;

    #[async_trait]
    impl Deliver for PanickingDeliver {
        async fn deliver(&self, _: SendRequest) -> Result<SendOutcome, DispatchError> {
            panic!("transport bug");
        }
    }

    fn request(to: &str, subject: &str) -> SendRequest {
        SendRequest::builder()
            .to(to)
            .from("noreply@example.com")
            .subject(subject)
            .body("body")
            .build()
            .expect("valid request")
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_and_drain() {
        let deliver = SlowDeliver::new(Duration::from_millis(100));
        let queue = DeliveryQueue::new(deliver.clone(), 3);

        let tickets: Vec<_> = (0..10)
            .map(|i| queue.add(request(&format!("user{i}@example.com"), "hi")))
            .collect();

        tokio::task::yield_now().await;
        let status = queue.status();
        assert_eq!(status.active, 3);
        assert_eq!(status.pending, 7);

        for ticket in tickets {
            assert!(ticket.await.is_ok());
        }
        assert_eq!(deliver.peak.load(Ordering::SeqCst), 3);
        assert_eq!(queue.status(), QueueStatus::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_in_submission_order() {
        let deliver = SlowDeliver::new(Duration::from_millis(10));
        let queue = DeliveryQueue::new(deliver.clone(), 1);

        let tickets: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|to| queue.add(request(to, "hi")))
            .collect();
        for ticket in tickets {
            ticket.await.expect("delivered");
        }

        assert_eq!(*deliver.started.lock(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_reaches_ticket() {
        let queue = DeliveryQueue::new(SlowDeliver::new(Duration::from_millis(10)), 2);

        let ok = queue.add(request("a@example.com", "hi"));
        let failed = queue.add(request("b@example.com", "fail"));

        assert_eq!(ok.await.expect("delivered").message_id.as_deref(), Some("a@example.com"));
        assert!(matches!(failed.await, Err(DispatchError::Provider { .. })));
    }

    #[tokio::test]
    async fn test_panicking_delivery_closes_ticket_and_frees_slot() {
        let queue = DeliveryQueue::new(Arc::new(PanickingDeliver), 1);

        let first = queue.add(request("a@example.com", "hi"));
        let second = queue.add(request("b@example.com", "hi"));

        assert_eq!(first.await, Err(DispatchError::QueueClosed));
        assert_eq!(second.await, Err(DispatchError::QueueClosed));
        assert_eq!(queue.status(), QueueStatus::default());
    }

    #[test]
    fn test_zero_concurrency_clamped() {
        let queue = DeliveryQueue::new(Arc::new(PanickingDeliver), 0);
        assert_eq!(queue.concurrency(), 1);
    }
}
