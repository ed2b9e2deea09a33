use log::{debug, error, warn};
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{JoinHandle, ThreadId};

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, mpsc};

use crate::config::PinEventTypes;
use crate::gpio::{PinValueChangedEvent, epoch_millis};
use crate::wait::{EventWaiter, WaitCompletion};

pub type PinChangeEventHandler = Arc<dyn Fn(&PinValueChangedEvent) + Send + Sync>;

/// Returned by callback registration; pass it back to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle {
    pub pin_number: u32,
    pub(crate) id: u64,
}

pub(crate) enum DispatchMessage {
    Edge {
        event: PinValueChangedEvent,
        generation: u64,
    },
    Fault {
        pin_number: u32,
        generation: u64,
        reason: String,
    },
    Shutdown,
}

/// Where a backend delivers edges for one subscribed pin.
///
/// Sending never blocks, so backends may call it from interrupt-like
/// contexts such as listener threads. A sink is bound to one opening of its
/// pin: once the pin is closed, anything sent through it is discarded.
#[derive(Clone)]
pub struct EventSink {
    pin_number: u32,
    generation: u64,
    tx: mpsc::UnboundedSender<DispatchMessage>,
}

impl EventSink {
    pub(crate) fn new(
        pin_number: u32,
        generation: u64,
        tx: mpsc::UnboundedSender<DispatchMessage>,
    ) -> Self {
        Self {
            pin_number,
            generation,
            tx,
        }
    }

    pub fn pin_number(&self) -> u32 {
        self.pin_number
    }

    pub fn emit(&self, change_type: PinEventTypes, timestamp_ms: u64) {
        let event = PinValueChangedEvent {
            pin_number: self.pin_number,
            change_type,
            timestamp_ms,
        };
        let message = DispatchMessage::Edge {
            event,
            generation: self.generation,
        };
        if self.tx.send(message).is_err() {
            debug!("dropping edge for pin {}: dispatcher stopped", self.pin_number);
        }
    }

    pub fn emit_now(&self, change_type: PinEventTypes) {
        self.emit(change_type, epoch_millis());
    }

    /// Reports a hardware fault; pending waits on the pin fail with it.
    pub fn fault(&self, reason: impl Into<String>) {
        let message = DispatchMessage::Fault {
            pin_number: self.pin_number,
            generation: self.generation,
            reason: reason.into(),
        };
        if self.tx.send(message).is_err() {
            debug!("dropping fault for pin {}: dispatcher stopped", self.pin_number);
        }
    }
}

pub(crate) enum Subscriber {
    Callback(PinChangeEventHandler),
    Waiter(Arc<EventWaiter>),
}

pub(crate) struct Subscription {
    pub(crate) id: u64,
    event_types: PinEventTypes,
    subscriber: Subscriber,
    // held while the subscriber runs; re-entrant so a callback may retire itself
    active: ReentrantMutex<Cell<bool>>,
}

impl Subscription {
    fn deliver(&self, event: &PinValueChangedEvent) {
        if !self.event_types.matches(event.change_type) {
            return;
        }
        let active = self.active.lock();
        if !active.get() {
            return;
        }
        match &self.subscriber {
            Subscriber::Callback(callback) => {
                if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                    error!("callback for pin {} panicked", event.pin_number);
                }
            }
            Subscriber::Waiter(waiter) => {
                waiter.complete(WaitCompletion::Event(event.clone()));
            }
        }
    }

    fn fault(&self, pin_number: u32, reason: &str) {
        let active = self.active.lock();
        if !active.get() {
            return;
        }
        match &self.subscriber {
            Subscriber::Callback(_) => {}
            Subscriber::Waiter(waiter) => {
                waiter.complete(WaitCompletion::Fault(format!("pin {pin_number}: {reason}")));
            }
        }
    }

    /// Blocks until any in-flight delivery finishes; nothing is delivered afterwards.
    pub(crate) fn retire(&self) {
        {
            let active = self.active.lock();
            active.set(false);
        }
        if let Subscriber::Waiter(waiter) = &self.subscriber {
            waiter.complete(WaitCompletion::Cancelled);
        }
    }
}

/// Edge history of one opening of a pin.
#[derive(Default)]
struct PinHistory {
    generation: u64,
    events: VecDeque<PinValueChangedEvent>,
}

struct DispatchShared {
    table: RwLock<FxHashMap<u32, Vec<Arc<Subscription>>>>,
    history: RwLock<FxHashMap<u32, PinHistory>>,
    history_capacity: usize,
    event_tx: broadcast::Sender<PinValueChangedEvent>,
}

impl DispatchShared {
    fn snapshot(&self, pin_number: u32) -> Vec<Arc<Subscription>> {
        self.table
            .read()
            .get(&pin_number)
            .cloned()
            .unwrap_or_default()
    }

    fn is_current(&self, pin_number: u32, generation: u64) -> bool {
        self.history
            .read()
            .get(&pin_number)
            .is_some_and(|h| h.generation == generation)
    }

    fn dispatch(&self, event: PinValueChangedEvent, generation: u64) {
        {
            let mut history = self.history.write();
            // pin closed, or closed and reopened, while the edge was queued
            let Some(entries) = history
                .get_mut(&event.pin_number)
                .filter(|h| h.generation == generation)
            else {
                debug!("dropping stale edge for pin {}", event.pin_number);
                return;
            };
            while entries.events.len() >= self.history_capacity {
                entries.events.pop_front();
            }
            entries.events.push_back(event.clone());
        }
        let _ = self.event_tx.send(event.clone());

        for subscription in self.snapshot(event.pin_number) {
            subscription.deliver(&event);
        }
    }

    fn fault(&self, pin_number: u32, generation: u64, reason: &str) {
        if !self.is_current(pin_number, generation) {
            debug!("dropping stale fault for pin {pin_number}: {reason}");
            return;
        }
        warn!("backend fault on pin {pin_number}: {reason}");
        for subscription in self.snapshot(pin_number) {
            subscription.fault(pin_number, reason);
        }
    }
}

/// Subscription table plus the thread that fans backend events out to it.
pub(crate) struct EventDispatcher {
    shared: Arc<DispatchShared>,
    tx: mpsc::UnboundedSender<DispatchMessage>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl EventDispatcher {
    pub(crate) fn new(history_capacity: usize, broadcast_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(broadcast_capacity.max(1));
        let shared = Arc::new(DispatchShared {
            table: RwLock::new(FxHashMap::default()),
            history: RwLock::new(FxHashMap::default()),
            history_capacity: history_capacity.max(1),
            event_tx,
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let worker_shared = shared.clone();
        let worker = std::thread::spawn(move || {
            while let Some(message) = rx.blocking_recv() {
                match message {
                    DispatchMessage::Edge { event, generation } => {
                        worker_shared.dispatch(event, generation)
                    }
                    DispatchMessage::Fault {
                        pin_number,
                        generation,
                        reason,
                    } => worker_shared.fault(pin_number, generation, &reason),
                    DispatchMessage::Shutdown => break,
                }
            }
            debug!("event dispatcher stopped");
        });
        let worker_id = worker.thread().id();

        Self {
            shared,
            tx,
            next_id: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
            worker: Mutex::new(Some(worker)),
            worker_id,
        }
    }

    /// Sink for the current opening of a pin. Generation 0 never matches,
    /// so a sink for an untracked pin delivers nothing.
    pub(crate) fn sink(&self, pin_number: u32) -> EventSink {
        let generation = self
            .shared
            .history
            .read()
            .get(&pin_number)
            .map_or(0, |h| h.generation);
        EventSink::new(pin_number, generation, self.tx.clone())
    }

    /// Starts a fresh history for a newly opened pin.
    pub(crate) fn track_pin(&self, pin_number: u32) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.shared.history.write().insert(
            pin_number,
            PinHistory {
                generation,
                events: VecDeque::new(),
            },
        );
    }

    pub(crate) fn add(
        &self,
        pin_number: u32,
        event_types: PinEventTypes,
        subscriber: Subscriber,
    ) -> Arc<Subscription> {
        let subscription = Arc::new(Subscription {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            event_types,
            subscriber,
            active: ReentrantMutex::new(Cell::new(true)),
        });
        self.shared
            .table
            .write()
            .entry(pin_number)
            .or_default()
            .push(subscription.clone());
        subscription
    }

    /// Detaches one subscription from the table. The caller retires it once
    /// no controller lock is held.
    pub(crate) fn remove(&self, pin_number: u32, id: u64) -> Option<Arc<Subscription>> {
        let mut table = self.shared.table.write();
        let entries = table.get_mut(&pin_number)?;
        let index = entries.iter().position(|s| s.id == id)?;
        let removed = entries.remove(index);
        if entries.is_empty() {
            table.remove(&pin_number);
        }
        Some(removed)
    }

    /// Detaches every subscription on a pin, keeping its history.
    pub(crate) fn detach_subscriptions(&self, pin_number: u32) -> Vec<Arc<Subscription>> {
        self.shared
            .table
            .write()
            .remove(&pin_number)
            .unwrap_or_default()
    }

    /// Detaches a closed pin's subscriptions and drops its history.
    pub(crate) fn detach_pin(&self, pin_number: u32) -> Vec<Arc<Subscription>> {
        self.shared.history.write().remove(&pin_number);
        self.detach_subscriptions(pin_number)
    }

    pub(crate) fn detach_all(&self) -> Vec<Arc<Subscription>> {
        self.shared.history.write().clear();
        self.shared
            .table
            .write()
            .drain()
            .flat_map(|(_, entries)| entries)
            .collect()
    }

    pub(crate) fn retire(subscriptions: Vec<Arc<Subscription>>) {
        for subscription in subscriptions {
            subscription.retire();
        }
    }

    pub(crate) fn subscriber_count(&self, pin_number: u32) -> usize {
        self.shared
            .table
            .read()
            .get(&pin_number)
            .map_or(0, Vec::len)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PinValueChangedEvent> {
        self.shared.event_tx.subscribe()
    }

    pub(crate) fn events(&self, pin_number: u32, limit: Option<usize>) -> Vec<PinValueChangedEvent> {
        self.shared
            .history
            .read()
            .get(&pin_number)
            .map(|h| {
                let skip = limit.map_or(0, |lim| h.events.len().saturating_sub(lim));
                h.events.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn last_event(&self, pin_number: u32) -> Option<PinValueChangedEvent> {
        self.shared
            .history
            .read()
            .get(&pin_number)
            .and_then(|h| h.events.back().cloned())
    }

    /// Stops the worker. Called from inside a callback, the worker is left to
    /// exit on its own instead of being joined.
    pub(crate) fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = self.tx.send(DispatchMessage::Shutdown);
        if std::thread::current().id() == self.worker_id {
            return;
        }
        if worker.join().is_err() {
            error!("event dispatcher thread panicked");
        }
    }
}
