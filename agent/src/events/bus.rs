//! Per-operation publish/subscribe with replay of the latest event

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::mpsc;
use tracing::debug;

use crate::models::operation::OperationEvent;

/// Default number of operations whose latest event is retained
pub const DEFAULT_LATEST_CAPACITY: usize = 1000;

/// Subscriber callback
pub type EventCallback = Arc<dyn Fn(&OperationEvent) + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    id: u64,
    active: Arc<AtomicBool>,
    callback: EventCallback,
}

struct LatestEvent {
    seq: u64,
    event: OperationEvent,
}

/// An event and the subscribers it was published to
struct Delivery {
    targets: Vec<Subscriber>,
    event: OperationEvent,
}

impl Delivery {
    fn deliver(&self) {
        for target in &self.targets {
            // Unsubscribed after the event was queued
            if target.active.load(Ordering::Acquire) {
                (target.callback)(&self.event);
            }
        }
    }
}

#[derive(Default)]
struct BusState {
    subscribers: HashMap<String, Vec<Subscriber>>,
    latest: HashMap<String, LatestEvent>,

    /// Deliveries waiting behind the one in progress, per operation.
    /// A key is present while some caller is delivering for that operation.
    pending: HashMap<String, VecDeque<Delivery>>,

    next_subscriber_id: u64,
    next_seq: u64,
}

impl BusState {
    /// Queue `delivery` behind an ongoing one, or claim the operation and hand
    /// it back to be delivered by the caller
    fn enqueue(&mut self, operation_id: &str, delivery: Delivery) -> Option<Delivery> {
        match self.pending.get_mut(operation_id) {
            Some(queue) => {
                queue.push_back(delivery);
                None
            }
            None => {
                self.pending.insert(operation_id.to_string(), VecDeque::new());
                Some(delivery)
            }
        }
    }
}

/// Operation event bus.
///
/// Callbacks run outside the bus lock and may use the bus, including dropping
/// their own subscription. Events of one operation reach each subscriber in
/// publish order, with the replayed event first.
pub struct EventBus {
    state: Arc<RwLock<BusState>>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus retaining the latest event of up to `capacity` operations
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(BusState::default())),
            capacity: capacity.max(1),
        }
    }

    /// Record `event` as the operation's latest and deliver it to subscribers
    pub fn publish(&self, event: OperationEvent) {
        let operation_id = event.operation_id.clone();

        let delivery = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

            if !state.latest.contains_key(&operation_id) && state.latest.len() >= self.capacity {
                if let Some(oldest) = state
                    .latest
                    .iter()
                    .min_by_key(|(_, l)| l.seq)
                    .map(|(id, _)| id.clone())
                {
                    debug!("Evicting latest event of operation {}", oldest);
                    state.latest.remove(&oldest);
                }
            }

            state.next_seq += 1;
            let seq = state.next_seq;
            state.latest.insert(
                operation_id.clone(),
                LatestEvent {
                    seq,
                    event: event.clone(),
                },
            );

            let targets = state
                .subscribers
                .get(&operation_id)
                .cloned()
                .unwrap_or_default();
            if targets.is_empty() {
                return;
            }
            state.enqueue(&operation_id, Delivery { targets, event })
        };

        if let Some(delivery) = delivery {
            self.drain(&operation_id, delivery);
        }
    }

    /// Subscribe to an operation, replaying its latest event first
    pub fn subscribe<F>(&self, operation_id: &str, callback: F) -> Subscription
    where
        F: Fn(&OperationEvent) + Send + Sync + 'static,
    {
        let callback: EventCallback = Arc::new(callback);

        let (subscription, replay) = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

            state.next_subscriber_id += 1;
            let subscriber = Subscriber {
                id: state.next_subscriber_id,
                active: Arc::new(AtomicBool::new(true)),
                callback,
            };
            state
                .subscribers
                .entry(operation_id.to_string())
                .or_default()
                .push(subscriber.clone());

            let replay = state.latest.get(operation_id).map(|latest| Delivery {
                targets: vec![subscriber.clone()],
                event: latest.event.clone(),
            });
            let replay = replay.and_then(|delivery| state.enqueue(operation_id, delivery));

            let subscription = Subscription {
                state: Arc::downgrade(&self.state),
                operation_id: operation_id.to_string(),
                id: subscriber.id,
                active: subscriber.active,
            };
            (subscription, replay)
        };

        if let Some(delivery) = replay {
            self.drain(operation_id, delivery);
        }
        subscription
    }

    /// Deliver `first`, then everything queued for the operation meanwhile
    fn drain(&self, operation_id: &str, first: Delivery) {
        let _claim = DrainClaim {
            state: &self.state,
            operation_id,
        };

        let mut next = Some(first);
        while let Some(delivery) = next {
            delivery.deliver();

            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            next = state
                .pending
                .get_mut(operation_id)
                .and_then(VecDeque::pop_front);
            if next.is_none() {
                state.pending.remove(operation_id);
            }
        }
    }

    /// Subscribe through a channel, for streaming transports
    pub fn subscribe_channel(
        &self,
        operation_id: &str,
    ) -> (Subscription, mpsc::UnboundedReceiver<OperationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(operation_id, move |event| {
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    /// Latest event published for an operation
    pub fn latest(&self, operation_id: &str) -> Option<OperationEvent> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.latest.get(operation_id).map(|l| l.event.clone())
    }

    /// Number of live subscribers for an operation
    pub fn subscriber_count(&self, operation_id: &str) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.subscribers.get(operation_id).map_or(0, Vec::len)
    }

    /// Number of operations with a retained latest event
    pub fn retained_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.latest.len()
    }
}

/// Releases the operation if a callback panics mid-drain
struct DrainClaim<'a> {
    state: &'a RwLock<BusState>,
    operation_id: &'a str,
}

impl Drop for DrainClaim<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.pending.remove(self.operation_id);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_LATEST_CAPACITY)
    }
}

/// Live subscription; dropping it unsubscribes
pub struct Subscription {
    state: Weak<RwLock<BusState>>,
    operation_id: String,
    id: u64,
    active: Arc<AtomicBool>,
}

impl Subscription {
    /// Stop receiving events
    pub fn unsubscribe(self) {
        drop(self);
    }

    fn remove(&self) {
        self.active.store(false, Ordering::Release);

        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = state.write().unwrap_or_else(|e| e.into_inner());

        if let Some(subscribers) = state.subscribers.get_mut(&self.operation_id) {
            subscribers.retain(|s| s.id != self.id);
            if subscribers.is_empty() {
                state.subscribers.remove(&self.operation_id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}
