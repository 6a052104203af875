//! Packet dispatch: fan an inbound packet out to every interested receiver.
//!
//! A [`MessageReceiver`] binds message ids to callbacks, optionally guarded by
//! a predicate. A [`Dispatcher`] holds an ordered receiver list and delivers
//! each packet to *every* receiver that accepts it, so a connection-level
//! receiver (heartbeat gauge refresh) and an application receiver can both
//! observe the same message.
//!
//! Receivers either run callbacks on the notifying task ("direct") or park the
//! packet in their own pending queue until the owner calls
//! [`MessageReceiver::drain`], typically once per game tick.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::packet::{MessageId, NotifierKind, Packet};
use crate::sync::{lock, read, write};

/// Callback invoked with each delivered packet.
pub type PacketCallback = Arc<dyn Fn(Packet) + Send + Sync>;

/// Extra acceptance test evaluated after the message id matched.
pub type PacketPredicate = Arc<dyn Fn(&Packet) -> bool + Send + Sync>;

struct Binding {
    predicate: Option<PacketPredicate>,
    callback: PacketCallback,
}

// ---------------------------------------------------------------------------
// MessageReceiver
// ---------------------------------------------------------------------------

/// A set of message-id bindings plus an optional pending queue.
pub struct MessageReceiver {
    name: String,
    handle_direct: AtomicBool,
    bindings: RwLock<HashMap<MessageId, Binding>>,
    pending: Mutex<VecDeque<Packet>>,
}

impl MessageReceiver {
    /// Create a receiver that queues packets until [`drain`](Self::drain).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handle_direct: AtomicBool::new(false),
            bindings: RwLock::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Create a receiver that runs callbacks on the notifying task.
    pub fn direct(name: impl Into<String>) -> Self {
        let receiver = Self::new(name);
        receiver.set_handle_direct(true);
        receiver
    }

    /// Receiver name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Switch between direct handling and queueing.
    pub fn set_handle_direct(&self, direct: bool) {
        self.handle_direct.store(direct, Ordering::Release);
    }

    /// Whether callbacks run on the notifying task.
    pub fn handles_direct(&self) -> bool {
        self.handle_direct.load(Ordering::Acquire)
    }

    /// Bind `callback` to `id`, replacing any previous binding.
    pub fn register_handler<F>(&self, id: MessageId, callback: F)
    where
        F: Fn(Packet) + Send + Sync + 'static,
    {
        self.insert(id, None, Arc::new(callback));
    }

    /// Bind `callback` to `id` for packets that also satisfy `predicate`.
    pub fn register_filtered<P, F>(&self, id: MessageId, predicate: P, callback: F)
    where
        P: Fn(&Packet) -> bool + Send + Sync + 'static,
        F: Fn(Packet) + Send + Sync + 'static,
    {
        self.insert(id, Some(Arc::new(predicate)), Arc::new(callback));
    }

    /// Bind an already shared callback.
    pub fn register_callback(&self, id: MessageId, callback: PacketCallback) {
        self.insert(id, None, callback);
    }

    fn insert(&self, id: MessageId, predicate: Option<PacketPredicate>, callback: PacketCallback) {
        let previous = write(&self.bindings).insert(
            id,
            Binding {
                predicate,
                callback,
            },
        );
        if previous.is_some() {
            tracing::warn!("{}: binding for {id} replaced", self.name);
        }
    }

    /// Remove the binding for `id`.
    pub fn unregister(&self, id: MessageId) -> bool {
        write(&self.bindings).remove(&id).is_some()
    }

    /// Whether a binding accepts `packet`.
    pub fn processable(&self, packet: &Packet) -> bool {
        read(&self.bindings)
            .get(&packet.message_id())
            .is_some_and(|b| b.predicate.as_ref().is_none_or(|p| p(packet)))
    }

    /// Deliver `packet`, directly or through the pending queue.
    pub fn handle_notify(&self, packet: Packet, direct: bool) {
        if direct || self.handles_direct() {
            self.dispatch(packet);
        } else {
            lock(&self.pending).push_back(packet);
        }
    }

    fn dispatch(&self, packet: Packet) {
        let callback = read(&self.bindings)
            .get(&packet.message_id())
            .map(|b| Arc::clone(&b.callback));
        match callback {
            Some(callback) => callback(packet),
            None => tracing::warn!(
                "{}: binding for {} removed before delivery",
                self.name,
                packet.message_id()
            ),
        }
    }

    /// Run callbacks for every pending packet in arrival order.
    ///
    /// Returns the number of packets delivered.
    pub fn drain(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = lock(&self.pending).pop_front();
            let Some(packet) = next else {
                return delivered;
            };
            self.dispatch(packet);
            delivered += 1;
        }
    }

    /// Number of queued, undelivered packets.
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Drop every queued, undelivered packet.
    pub fn clear_message_queue(&self) -> usize {
        let mut pending = lock(&self.pending);
        let dropped = pending.len();
        pending.clear();
        dropped
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Ordered list of receivers with fan-out delivery.
pub struct Dispatcher {
    kind: NotifierKind,
    name: String,
    receivers: RwLock<Vec<Arc<MessageReceiver>>>,
}

impl Dispatcher {
    /// Create an empty dispatcher that stamps `kind` on every packet.
    pub fn new(kind: NotifierKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            receivers: RwLock::new(Vec::new()),
        }
    }

    /// Kind stamped on delivered packets.
    pub fn kind(&self) -> NotifierKind {
        self.kind
    }

    /// Dispatcher name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deliver `packet` to every receiver that accepts it.
    ///
    /// Returns `true` if at least one receiver matched. An unmatched packet
    /// is a routing defect the caller should log.
    pub fn notify(&self, packet: Packet) -> bool {
        self.notify_with(packet, false)
    }

    /// Like [`notify`](Self::notify), but bypasses receiver queues.
    pub fn notify_direct(&self, packet: Packet) -> bool {
        self.notify_with(packet, true)
    }

    fn notify_with(&self, mut packet: Packet, direct: bool) -> bool {
        packet.set_notifier_kind(self.kind);

        // Snapshot so callbacks may add or remove receivers.
        let receivers = read(&self.receivers).clone();
        let mut notified = false;
        for receiver in &receivers {
            if receiver.processable(&packet) {
                tracing::trace!(
                    "{} -> {}: {}",
                    self.name,
                    receiver.name(),
                    packet.message_id()
                );
                receiver.handle_notify(packet.clone(), direct);
                notified = true;
            }
        }
        notified
    }

    /// Append a receiver. Adding the same receiver twice is ignored.
    pub fn add_receiver(&self, receiver: Arc<MessageReceiver>) {
        let mut receivers = write(&self.receivers);
        if receivers.iter().any(|r| Arc::ptr_eq(r, &receiver)) {
            tracing::debug!("{}: receiver {} already added", self.name, receiver.name());
            return;
        }
        receivers.push(receiver);
    }

    /// Remove a receiver by identity.
    pub fn remove_receiver(&self, receiver: &Arc<MessageReceiver>) -> bool {
        let mut receivers = write(&self.receivers);
        let before = receivers.len();
        receivers.retain(|r| !Arc::ptr_eq(r, receiver));
        receivers.len() != before
    }

    /// Number of registered receivers.
    pub fn receiver_count(&self) -> usize {
        read(&self.receivers).len()
    }

    /// Drop every packet still queued in any receiver.
    pub fn clear_message_queues(&self) {
        let receivers = read(&self.receivers).clone();
        let dropped: usize = receivers.iter().map(|r| r.clear_message_queue()).sum();
        if dropped > 0 {
            tracing::debug!("{}: dropped {dropped} queued packets", self.name);
        }
    }
}
