//! Process-wide networking state shared by every connection.

use std::sync::Arc;
use std::time::Duration;

use crate::connection::{ConnectionId, IdGenerator};
use crate::correlation::CorrelationRegistry;
use crate::dispatcher::Dispatcher;
use crate::packet::NotifierKind;
use crate::processor::HandlerTable;
use crate::timer::HeartbeatScheduler;

/// Correlation registry, in-process notifiers, and the heartbeat scheduler.
///
/// Create one per server or client process and hand it to every
/// [`ConnectionBuilder`](crate::ConnectionBuilder).
pub struct NetContext {
    registry: Arc<CorrelationRegistry>,
    internal: Dispatcher,
    local: Dispatcher,
    heartbeat: HeartbeatScheduler,
    ids: IdGenerator,
}

impl NetContext {
    /// Create a context whose heartbeat scheduler checks timers every `tick`.
    pub fn new(heartbeat_tick: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(CorrelationRegistry::new()),
            internal: Dispatcher::new(NotifierKind::Internal, "notifier.internal"),
            local: Dispatcher::new(NotifierKind::Internal, "notifier.local"),
            heartbeat: HeartbeatScheduler::new(heartbeat_tick),
            ids: IdGenerator::new(),
        })
    }

    /// Shared correlation registry.
    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }

    /// Dispatcher receiving packets sent on internal connections.
    pub fn internal_notifier(&self) -> &Dispatcher {
        &self.internal
    }

    /// Dispatcher receiving packets sent on local-logic connections.
    pub fn local_notifier(&self) -> &Dispatcher {
        &self.local
    }

    /// Shared heartbeat scheduler.
    pub fn heartbeat(&self) -> &HeartbeatScheduler {
        &self.heartbeat
    }

    /// Allocate a connection id.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.ids.next_id()
    }

    /// An empty handler table backed by this context's registry.
    pub fn handler_table(&self) -> HandlerTable {
        HandlerTable::new(Arc::clone(&self.registry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        let context = NetContext::new(Duration::from_secs(1));
        let a = context.next_connection_id();
        let b = context.next_connection_id();
        assert_ne!(a, b);
        assert_eq!(a.0 + 1, b.0);
    }

    #[test]
    fn test_notifiers_are_internal_kind() {
        let context = NetContext::new(Duration::from_secs(1));
        assert_eq!(context.internal_notifier().kind(), NotifierKind::Internal);
        assert_eq!(context.local_notifier().name(), "notifier.local");
        assert!(context.handler_table().is_empty());
    }
}
