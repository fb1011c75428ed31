use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;

use crate::Record;

pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;
const INTAKE_QUEUE_CAPACITY: usize = 256;

/// Fans newly appended records out to live subscribers. Every queue in the
/// path is bounded and offered to with `try_send`: a slow subscriber loses
/// messages silently and reconciles later from the recorder's ring, and a
/// saturated intake drops rather than delaying the recorder.
pub struct SubscriptionHub {
    inner: Arc<HubInner>,
    intake_rx: Mutex<Option<mpsc::Receiver<Arc<str>>>>,
}

struct HubInner {
    subscribers: RwLock<HashMap<u64, mpsc::Sender<Arc<str>>>>,
    next_id: AtomicU64,
    intake_tx: mpsc::Sender<Arc<str>>,
    dropped_intake: AtomicU64,
    dropped_subscriber: AtomicU64,
}

pub struct Subscriber {
    pub id: u64,
    pub receiver: mpsc::Receiver<Arc<str>>,
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionHub {
    pub fn new() -> Self {
        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_QUEUE_CAPACITY);
        Self {
            inner: Arc::new(HubInner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                intake_tx,
                dropped_intake: AtomicU64::new(0),
                dropped_subscriber: AtomicU64::new(0),
            }),
            intake_rx: Mutex::new(Some(intake_rx)),
        }
    }

    pub fn subscribe(&self) -> Subscriber {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner
            .subscribers
            .write()
            .expect("hub lock poisoned")
            .insert(id, tx);
        Subscriber { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.inner
            .subscribers
            .write()
            .expect("hub lock poisoned")
            .remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .expect("hub lock poisoned")
            .len()
    }

    pub fn dropped_message_count(&self) -> u64 {
        self.inner.dropped_intake.load(Ordering::Relaxed)
            + self.inner.dropped_subscriber.load(Ordering::Relaxed)
    }

    /// Serialises once and offers the bytes to the dispatch task without
    /// blocking. Called from the recorder's broadcast callback.
    pub fn broadcast_record(&self, record: &Record) {
        let Ok(json) = serde_json::to_string(record) else {
            return;
        };
        self.broadcast_serialized(Arc::from(json.as_str()));
    }

    pub fn broadcast_serialized(&self, message: Arc<str>) {
        if self.inner.intake_tx.try_send(message).is_err() {
            self.inner.dropped_intake.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Dispatch loop: drains the intake queue and offers each message to
    /// every subscriber. Runs until the hub is dropped. Callable once.
    pub async fn run(&self) {
        let receiver = self
            .intake_rx
            .lock()
            .expect("hub lock poisoned")
            .take();
        let Some(mut receiver) = receiver else {
            return;
        };

        while let Some(message) = receiver.recv().await {
            let subscribers = self.inner.subscribers.read().expect("hub lock poisoned");
            for sender in subscribers.values() {
                if sender.try_send(Arc::clone(&message)).is_err() {
                    self.inner
                        .dropped_subscriber
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn handle(&self) -> SubscriptionHubHandle {
        SubscriptionHubHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Cheap clonable handle for broadcasting from recorder callbacks.
#[derive(Clone)]
pub struct SubscriptionHubHandle {
    inner: Arc<HubInner>,
}

impl SubscriptionHubHandle {
    pub fn broadcast_record(&self, record: &Record) {
        let Ok(json) = serde_json::to_string(record) else {
            return;
        };
        if self.inner.intake_tx.try_send(Arc::from(json.as_str())).is_err() {
            self.inner.dropped_intake.fetch_add(1, Ordering::Relaxed);
        }
    }
}
