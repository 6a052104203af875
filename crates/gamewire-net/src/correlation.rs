//! Correlation registry: at most one in-flight handler per correlation id.
//!
//! A correlation id is *claimed* for the whole duration of a handler step and
//! *parked* while a handler is suspended. Claiming is a single locked
//! lookup-and-transition, so two packets with the same id can never both run
//! `process` or `process_resume` at the same time.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::handler::{HandlerState, MessageHandler};
use crate::sync::lock;

/// A handler parked while it waits for a follow-up packet.
pub struct SuspendedEntry {
    pub(crate) handler: Box<dyn MessageHandler>,
    pub(crate) state: HandlerState,
    pub(crate) processor: Option<Box<dyn MessageHandler>>,
    pub(crate) parked_at: Instant,
}

impl SuspendedEntry {
    pub(crate) fn new(
        handler: Box<dyn MessageHandler>,
        processor: Option<Box<dyn MessageHandler>>,
    ) -> Self {
        Self {
            handler,
            state: HandlerState::Suspended,
            processor,
            parked_at: Instant::now(),
        }
    }

    /// Current state of the parked handler.
    pub fn state(&self) -> HandlerState {
        self.state
    }
}

enum Slot {
    /// A handler step for this id is running right now.
    Busy,
    Parked(SuspendedEntry),
}

/// Result of [`CorrelationRegistry::claim`].
pub(crate) enum Claim {
    /// No entry existed; the id is now claimed for a fresh handler.
    Fresh,
    /// A parked handler was taken out; the id stays claimed until it is
    /// parked again or released.
    Parked(SuspendedEntry),
    /// The id is in use and was left untouched.
    Occupied,
}

/// Correlation id → in-flight handler.
#[derive(Default)]
pub struct CorrelationRegistry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl CorrelationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for one handler step.
    ///
    /// With `keep_parked` set, a parked entry is reported as
    /// [`Claim::Occupied`] instead of being taken out.
    pub(crate) fn claim(&self, id: &str, keep_parked: bool) -> Claim {
        let mut slots = lock(&self.slots);
        match slots.get_mut(id) {
            None => {
                slots.insert(id.to_owned(), Slot::Busy);
                Claim::Fresh
            }
            Some(Slot::Busy) => Claim::Occupied,
            Some(Slot::Parked(_)) if keep_parked => Claim::Occupied,
            Some(slot) => match std::mem::replace(slot, Slot::Busy) {
                Slot::Parked(entry) => Claim::Parked(entry),
                Slot::Busy => Claim::Occupied,
            },
        }
    }

    /// Park a handler under a claimed `id`.
    pub(crate) fn park(&self, id: &str, entry: SuspendedEntry) {
        let previous = lock(&self.slots).insert(id.to_owned(), Slot::Parked(entry));
        if matches!(previous, Some(Slot::Parked(_))) {
            tracing::error!("correlation {id} parked twice, previous handler dropped");
        }
    }

    /// Release a claimed `id` without parking anything.
    pub(crate) fn release(&self, id: &str) {
        let mut slots = lock(&self.slots);
        if matches!(slots.get(id), Some(Slot::Busy)) {
            slots.remove(id);
        }
    }

    /// Remove parked entries older than `ttl`, returning them for cleanup.
    pub(crate) fn take_expired(&self, ttl: Duration) -> Vec<(String, SuspendedEntry)> {
        let now = Instant::now();
        let mut slots = lock(&self.slots);
        let expired: Vec<String> = slots
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Parked(entry) if now.duration_since(entry.parked_at) >= ttl => {
                    Some(id.clone())
                }
                _ => None,
            })
            .collect();

        expired
            .into_iter()
            .filter_map(|id| match slots.remove(&id) {
                Some(Slot::Parked(entry)) => Some((id, entry)),
                _ => None,
            })
            .collect()
    }

    /// Whether any entry (running or parked) exists for `id`.
    pub fn contains(&self, id: &str) -> bool {
        lock(&self.slots).contains_key(id)
    }

    /// State of the handler parked under `id`, `None` if absent or running.
    pub fn handler_state(&self, id: &str) -> Option<HandlerState> {
        match lock(&self.slots).get(id) {
            Some(Slot::Parked(entry)) => Some(entry.state),
            _ => None,
        }
    }

    /// Number of claimed or parked ids.
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        lock(&self.slots).is_empty()
    }
}
