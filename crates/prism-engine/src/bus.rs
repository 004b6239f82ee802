//! Per-agent publish/subscribe bus.
//!
//! Delivery is synchronous and totally ordered. A `publish` made while
//! another event is being dispatched (from a handler, or from another
//! thread) is queued and delivered once the current event has reached every
//! subscriber, so all consumers observe one global publish order. The queue
//! is unbounded and nothing is ever dropped; a slow handler slows the
//! publisher instead.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use prism_core::events::{Event, EventType};
use prism_core::ids::AgentId;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, trace};

use crate::error::BusError;

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Host-facing stream of bus events. Ends when the bus closes.
pub type EventReceiver = UnboundedReceiverStream<Event>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Type(EventType),
    Types(Vec<EventType>),
}

impl EventFilter {
    pub fn matches(&self, event_type: EventType) -> bool {
        match self {
            Self::All => true,
            Self::Type(t) => *t == event_type,
            Self::Types(ts) => ts.contains(&event_type),
        }
    }
}

struct Subscriber {
    id: u64,
    consumer_id: u64,
    filter: EventFilter,
    handler: Handler,
    active: AtomicBool,
}

#[derive(Default)]
struct Pending {
    queue: VecDeque<Event>,
    draining: bool,
}

struct BusInner {
    agent_id: AgentId,
    closed: AtomicBool,
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
}

impl BusInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn publish(&self, event: Event) {
        if self.is_closed() {
            trace!(agent_id = %self.agent_id, event_type = %event.event_type, "publish after close ignored");
            return;
        }
        {
            let mut pending = self.pending.lock();
            pending.queue.push_back(event);
            if pending.draining {
                return;
            }
            pending.draining = true;
        }
        loop {
            let next = {
                let mut pending = self.pending.lock();
                match pending.queue.pop_front() {
                    Some(event) => event,
                    None => {
                        pending.draining = false;
                        return;
                    }
                }
            };
            self.dispatch(&next);
        }
    }

    fn dispatch(&self, event: &Event) {
        let targets: Vec<Arc<Subscriber>> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.filter.matches(event.event_type))
            .cloned()
            .collect();

        for sub in targets {
            if self.is_closed() {
                return;
            }
            if !sub.active.load(Ordering::Acquire) {
                continue;
            }
            let handler = &sub.handler;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                error!(
                    agent_id = %self.agent_id,
                    event_type = %event.event_type,
                    subscription = sub.id,
                    panic = %panic_message(panic.as_ref()),
                    "event handler panicked"
                );
            }
        }
    }

    fn subscribe(&self, consumer_id: u64, filter: EventFilter, handler: Handler) -> Result<u64, BusError> {
        let mut subscribers = self.subscribers.write();
        // Checked under the write lock so close() cannot interleave.
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let id = self.next_id();
        subscribers.push(Arc::new(Subscriber {
            id,
            consumer_id,
            filter,
            handler,
            active: AtomicBool::new(true),
        }));
        Ok(id)
    }

    fn remove_where(&self, pred: impl Fn(&Subscriber) -> bool) -> usize {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| {
            if pred(s) {
                s.active.store(false, Ordering::Release);
                false
            } else {
                true
            }
        });
        before - subscribers.len()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Event broker scoped to one agent instance.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            inner: Arc::new(BusInner {
                agent_id,
                closed: AtomicBool::new(false),
                subscribers: RwLock::new(Vec::new()),
                pending: Mutex::new(Pending::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.inner.agent_id
    }

    pub fn create_producer(&self) -> Result<Producer, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        Ok(Producer {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn create_consumer(&self) -> Result<Consumer, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        Ok(Consumer {
            inner: Arc::clone(&self.inner),
            id: self.inner.next_id(),
        })
    }

    /// Stop all delivery and complete every open subscription. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let removed = self.inner.remove_where(|_| true);
        self.inner.pending.lock().queue.clear();
        debug!(agent_id = %self.inner.agent_id, removed, "event bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

#[derive(Clone)]
pub struct Producer {
    inner: Arc<BusInner>,
}

impl Producer {
    pub fn agent_id(&self) -> &AgentId {
        &self.inner.agent_id
    }

    /// No-op once the bus is closed.
    pub fn publish(&self, event: Event) {
        self.inner.publish(event);
    }
}

#[derive(Clone)]
pub struct Consumer {
    inner: Arc<BusInner>,
    id: u64,
}

impl Consumer {
    pub fn consume_all<F>(&self, handler: F) -> Result<Subscription, BusError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(EventFilter::All, handler)
    }

    pub fn consume_by_type<F>(&self, event_type: EventType, handler: F) -> Result<Subscription, BusError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(EventFilter::Type(event_type), handler)
    }

    pub fn consume_by_types<F>(&self, event_types: &[EventType], handler: F) -> Result<Subscription, BusError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(EventFilter::Types(event_types.to_vec()), handler)
    }

    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> Result<Subscription, BusError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.inner.subscribe(self.id, filter, Arc::new(handler))?;
        Ok(Subscription {
            inner: Arc::downgrade(&self.inner),
            id,
        })
    }

    /// Receive matching events as an async stream instead of a callback.
    pub fn subscribe_stream(&self, filter: EventFilter) -> Result<EventReceiver, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(filter, move |event| {
            let _ = tx.send(event.clone());
        })?;
        Ok(UnboundedReceiverStream::new(rx))
    }

    /// Remove every subscription registered through this consumer.
    pub fn unsubscribe_all(&self) -> usize {
        let consumer_id = self.id;
        self.inner.remove_where(|s| s.consumer_id == consumer_id)
    }
}

/// Handle to one subscription. Dropping it does not unsubscribe.
#[derive(Clone, Debug)]
pub struct Subscription {
    inner: Weak<BusInner>,
    id: u64,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Idempotent. Takes effect immediately, even mid-dispatch.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let id = self.id;
            inner.remove_where(|s| s.id == id);
        }
    }
}
