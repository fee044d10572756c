//! Progress signal bus
//!
//! Process-wide publish/subscribe channel for coarse processing lifecycle
//! events. Delivery is broadcast to the listeners registered at publish
//! time, at most once each. Nothing is buffered for listeners that
//! subscribe later and nothing is replayed.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, trace};
use uuid::Uuid;

/// Kind of lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// A capture entered the pipeline
    ProcessingStarted,
    /// A capture left the pipeline, successfully or not
    ProcessingEnded,
}

/// A lifecycle event with its emission time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSignal {
    /// What happened
    pub kind: SignalKind,
    /// When it was published
    pub emitted_at: SystemTime,
}

impl ProgressSignal {
    /// Create a signal stamped with the current time
    pub fn now(kind: SignalKind) -> Self {
        Self {
            kind,
            emitted_at: SystemTime::now(),
        }
    }
}

/// Identifier of one subscription
pub type SubscriptionId = Uuid;

#[derive(Default)]
struct BusInner {
    listeners: Mutex<HashMap<SubscriptionId, Sender<ProgressSignal>>>,
}

/// Broadcast bus for progress signals. Cloning shares the same bus.
#[derive(Clone, Default)]
pub struct SignalBus {
    inner: Arc<BusInner>,
}

impl SignalBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Dropping the returned subscription unregisters it.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = unbounded();
        let id = Uuid::new_v4();
        self.inner.listeners.lock().insert(id, tx);
        debug!("Signal listener {} subscribed", id);

        Subscription {
            id,
            receiver: rx,
            bus: self.clone(),
        }
    }

    /// Unregister a listener. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        if self.inner.listeners.lock().remove(&id).is_some() {
            debug!("Signal listener {} unsubscribed", id);
        }
    }

    /// Deliver a signal to every currently registered listener
    pub fn publish(&self, signal: ProgressSignal) {
        let mut listeners = self.inner.listeners.lock();
        // Listeners whose receiver is gone are pruned here
        listeners.retain(|_, tx| tx.send(signal).is_ok());
        trace!("Published {:?} to {} listener(s)", signal.kind, listeners.len());
    }

    /// Publish a signal of the given kind stamped with the current time
    pub fn publish_kind(&self, kind: SignalKind) {
        self.publish(ProgressSignal::now(kind));
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Publish `ProcessingStarted` and return the guard owning the matching end
    pub fn begin_processing(&self) -> ProcessingScope {
        self.publish_kind(SignalKind::ProcessingStarted);
        ProcessingScope {
            bus: Some(self.clone()),
        }
    }
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// A registered listener. Unsubscribes from the bus when dropped.
pub struct Subscription {
    id: SubscriptionId,
    receiver: Receiver<ProgressSignal>,
    bus: SignalBus,
}

impl Subscription {
    /// Subscription identifier
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next signal, if one has already arrived
    pub fn try_recv(&self) -> Option<ProgressSignal> {
        match self.receiver.try_recv() {
            Ok(signal) => Some(signal),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for the next signal
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ProgressSignal> {
        match self.receiver.recv_timeout(timeout) {
            Ok(signal) => Some(signal),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// All signals that have arrived so far
    pub fn drain(&self) -> Vec<ProgressSignal> {
        self.receiver.try_iter().collect()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

/// Owns one `ProcessingStarted`/`ProcessingEnded` pair.
///
/// `ProcessingEnded` is published exactly once: by `finish`, or on drop if
/// the scope is abandoned on a failure path.
#[derive(Debug)]
pub struct ProcessingScope {
    bus: Option<SignalBus>,
}

impl ProcessingScope {
    /// Publish `ProcessingEnded` now
    pub fn finish(mut self) {
        self.end();
    }

    fn end(&mut self) {
        if let Some(bus) = self.bus.take() {
            bus.publish_kind(SignalKind::ProcessingEnded);
        }
    }
}

impl Drop for ProcessingScope {
    fn drop(&mut self) {
        self.end();
    }
}
