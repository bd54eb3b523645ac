//! Sync State Publisher.
//!
//! Components never touch [`SyncState`] directly. They send [`SyncEvent`]s
//! through an [`EventSender`]; one event loop folds them into the snapshot
//! and calls every subscribed handler with the result.

use chartsync_engine::{SyncEvent, SyncState};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

type Handler = Arc<dyn Fn(&SyncState) + Send + Sync>;

enum Envelope {
    Event(SyncEvent),
    /// Register a handler and replay the current snapshot to it
    Subscribe {
        id: u64,
        handler: Handler,
        ack: oneshot::Sender<()>,
    },
    /// Acknowledged once every earlier event has been published
    Barrier(oneshot::Sender<()>),
}

struct Shared {
    state: Mutex<SyncState>,
    handlers: Mutex<BTreeMap<u64, Handler>>,
    next_id: AtomicU64,
}

impl Shared {
    fn handlers(&self) -> Vec<Handler> {
        self.handlers.lock().values().cloned().collect()
    }
}

/// Sends events to the publisher's event loop.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EventSender {
    pub fn send(&self, event: SyncEvent) {
        if self.tx.send(Envelope::Event(event)).is_err() {
            debug!("sync state publisher stopped; event dropped");
        }
    }

    /// Wait until every event sent before this call has been published.
    pub async fn barrier(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Envelope::Barrier(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Handle returned by [`SyncStatePublisher::subscribe`].
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
    active: AtomicBool,
}

impl Subscription {
    /// Stop receiving updates. Calling it again does nothing.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.handlers.lock().remove(&self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Owns the current [`SyncState`] and its subscribers.
pub struct SyncStatePublisher {
    shared: Arc<Shared>,
    events: EventSender,
}

impl SyncStatePublisher {
    /// Spawn the event loop. It ends once every [`EventSender`] is dropped.
    pub fn start() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(SyncState::default()),
            handlers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(Arc::downgrade(&shared), rx));

        Self {
            shared,
            events: EventSender { tx },
        }
    }

    pub fn events(&self) -> EventSender {
        self.events.clone()
    }

    /// Current snapshot.
    pub fn state(&self) -> SyncState {
        self.shared.state.lock().clone()
    }

    /// Register a handler. It is called with the current snapshot before
    /// this returns, then after every change.
    ///
    /// Registration goes through the event loop, so the replayed snapshot
    /// is never older than one the handler has already seen.
    pub async fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SyncState) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (ack, replayed) = oneshot::channel();
        if self
            .events
            .tx
            .send(Envelope::Subscribe { id, handler, ack })
            .is_ok()
        {
            let _ = replayed.await;
        }

        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
            active: AtomicBool::new(true),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.handlers.lock().len()
    }
}

async fn run(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        let Some(shared) = shared.upgrade() else { break };
        match envelope {
            Envelope::Event(event) => {
                trace!(?event, "sync event");
                let snapshot = {
                    let mut state = shared.state.lock();
                    let before = state.clone();
                    state.apply(event);
                    (*state != before).then(|| state.clone())
                };
                if let Some(snapshot) = snapshot {
                    for handler in shared.handlers() {
                        handler(&snapshot);
                    }
                }
            }
            Envelope::Subscribe { id, handler, ack } => {
                let snapshot = shared.state.lock().clone();
                shared.handlers.lock().insert(id, handler.clone());
                handler(&snapshot);
                let _ = ack.send(());
            }
            Envelope::Barrier(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("sync state publisher stopped");
}
