use super::{ControlEvent, FlowChange, FlowEvent, SessionEvent};
use crate::error::{ControlError, Result};
use crate::flow::Flow;
use crate::metrics::Metrics;
use crate::session::SessionState;
use futures::Stream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TrySendError};

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ControlEvent>,
    overflowed: Arc<AtomicBool>,
}

struct Inner {
    sequence: u64,
    subscribers: Vec<Subscriber>,
}

/// Fan-out of control events to independent bounded queues.
///
/// Publishing never waits. A subscriber whose queue is full is disconnected;
/// it drains what it already has and then sees [`ControlError::Overflow`].
pub struct EventBus {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    buffer: usize,
    metrics: Arc<Metrics>,
}

impl EventBus {
    pub fn new(buffer: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sequence: 0,
                subscribers: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            metrics,
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let overflowed = Arc::new(AtomicBool::new(false));

        self.lock().subscribers.push(Subscriber {
            id,
            tx,
            overflowed: overflowed.clone(),
        });
        self.metrics.subscribers.inc();
        tracing::debug!(subscriber = id, "Subscriber attached");

        Subscription {
            id,
            rx,
            overflowed,
            reported: false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn publish_flow(&self, change: FlowChange, flow: &Flow) {
        self.publish(|sequence| {
            ControlEvent::Flow(FlowEvent {
                sequence,
                change,
                flow: flow.clone(),
            })
        });
    }

    pub fn publish_session(&self, state: SessionState, error: Option<String>) {
        self.publish(|sequence| ControlEvent::Session(SessionEvent {
            sequence,
            state,
            error,
        }));
    }

    fn publish(&self, build: impl FnOnce(u64) -> ControlEvent) {
        let mut inner = self.lock();
        inner.sequence += 1;
        let event = build(inner.sequence);

        let metrics = &self.metrics;
        inner.subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                sub.overflowed.store(true, Ordering::Release);
                metrics.record_overflow();
                metrics.subscribers.dec();
                tracing::warn!(subscriber = sub.id, "Subscriber fell behind and was disconnected");
                false
            }
            Err(TrySendError::Closed(_)) => {
                metrics.subscribers.dec();
                tracing::debug!(subscriber = sub.id, "Subscriber detached");
                false
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<ControlEvent>,
    overflowed: Arc<AtomicBool>,
    reported: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event. After an overflow the buffered events are still delivered,
    /// then one `Err(Overflow)`, then `None`.
    pub async fn recv(&mut self) -> Option<Result<ControlEvent>> {
        match self.rx.recv().await {
            Some(event) => Some(Ok(event)),
            None => self.closed(),
        }
    }

    /// Non-waiting variant of [`recv`](Self::recv); `None` means nothing is queued.
    pub fn try_recv(&mut self) -> Option<Result<ControlEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Some(Ok(event)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => self.closed(),
        }
    }

    fn closed(&mut self) -> Option<Result<ControlEvent>> {
        if self.overflowed.load(Ordering::Acquire) && !self.reported {
            self.reported = true;
            return Some(Err(ControlError::Overflow(self.id)));
        }
        None
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<ControlEvent>> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|item| (item, sub))
        })
    }
}
